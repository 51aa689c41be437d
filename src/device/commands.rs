//! Command decoding and single-shot acknowledgments.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::codec::{decode_object, request_id, synth_request_id, utc_now, PayloadError, SCHEMA_VERSION};
use crate::device::log_buffer::LogRingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Heartbeat,
    Blink,
    Off,
}

impl FromStr for LedPattern {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heartbeat" => Ok(LedPattern::Heartbeat),
            "blink" => Ok(LedPattern::Blink),
            "off" => Ok(LedPattern::Off),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LedPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedPattern::Heartbeat => write!(f, "heartbeat"),
            LedPattern::Blink => write!(f, "blink"),
            LedPattern::Off => write!(f, "off"),
        }
    }
}

/// Typed view of the `type` + `payload` pair of an inbound command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Led { pattern: Option<Value> },
    Camera,
    Unsupported(Option<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub req_id: String,
    pub kind: CommandKind,
}

impl Command {
    fn from_object(object: &Map<String, Value>) -> Self {
        let req_id = request_id(object.get("reqId")).unwrap_or_else(synth_request_id);

        let kind = match object.get("type") {
            Some(Value::String(kind)) if kind == "led" => CommandKind::Led {
                pattern: object
                    .get("payload")
                    .and_then(|payload| payload.get("pattern"))
                    .cloned(),
            },
            Some(Value::String(kind)) if kind == "camera" => CommandKind::Camera,
            other => CommandKind::Unsupported(other.cloned()),
        };

        Self { req_id, kind }
    }

    fn type_label(&self) -> String {
        match &self.kind {
            CommandKind::Led { .. } => "led".to_string(),
            CommandKind::Camera => "camera".to_string(),
            CommandKind::Unsupported(kind) => display_value(kind.as_ref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub schema: &'static str,
    #[serde(rename = "reqId")]
    pub req_id: String,
    pub ts: String,
    pub ok: bool,
    pub code: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Ack {
    fn success(req_id: &str, code: String, msg: String, data: Value) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            req_id: req_id.to_string(),
            ts: utc_now(),
            ok: true,
            code,
            msg,
            data: Some(data),
        }
    }

    fn failure(req_id: &str, code: &str, msg: String) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            req_id: req_id.to_string(),
            ts: utc_now(),
            ok: false,
            code: code.to_string(),
            msg,
            data: None,
        }
    }
}

pub struct CommandDispatcher {
    log: Arc<LogRingBuffer>,
}

impl CommandDispatcher {
    pub fn new(log: Arc<LogRingBuffer>) -> Self {
        Self { log }
    }

    /// Decodes one inbound command and builds its acknowledgment.
    ///
    /// Garbled or non-object payloads carry no request id to answer to, so
    /// they only leave a log entry and yield `None`.
    pub fn handle(&self, payload: &[u8]) -> Option<Ack> {
        let object = match decode_object(payload) {
            Ok(object) => object,
            Err(e @ PayloadError::Json(_)) => {
                warn!("Invalid command payload: {}", e);
                self.log.warn("cmd", &format!("parse error: {e}"));
                return None;
            }
            Err(e @ PayloadError::NotAnObject) => {
                warn!("Unsupported command format: {}", e);
                self.log.warn("cmd", "unsupported format: expected object");
                return None;
            }
        };

        let command = Command::from_object(&object);
        let ack = Self::execute(&command);

        self.log.info(
            "cmd",
            &format!(
                "cmd={} req={} ok={}",
                command.type_label(),
                command.req_id,
                ack.ok
            ),
        );
        info!(
            "Command {} ({}) -> {} {}",
            command.type_label(),
            command.req_id,
            ack.ok,
            ack.code
        );
        Some(ack)
    }

    fn execute(command: &Command) -> Ack {
        let req_id = command.req_id.as_str();
        match &command.kind {
            CommandKind::Led { pattern } => {
                let parsed = pattern
                    .as_ref()
                    .and_then(Value::as_str)
                    .and_then(|p| p.parse::<LedPattern>().ok());
                match parsed {
                    Some(pattern) => Ack::success(
                        req_id,
                        format!("led.{pattern}"),
                        format!("LED pattern set to {pattern}"),
                        json!({ "pattern": pattern.to_string() }),
                    ),
                    None => Ack::failure(
                        req_id,
                        "led.invalid_pattern",
                        format!("Unsupported LED pattern: {}", display_value(pattern.as_ref())),
                    ),
                }
            }
            CommandKind::Camera => Ack::success(
                req_id,
                "camera.snap".to_string(),
                "Camera snapshot scheduled".to_string(),
                json!({ "action": "snap" }),
            ),
            CommandKind::Unsupported(kind) => Ack::failure(
                req_id,
                "cmd.unsupported",
                format!("Unsupported command type: {}", display_value(kind.as_ref())),
            ),
        }
    }
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "none".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
