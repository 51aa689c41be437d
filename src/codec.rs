//! Shared JSON payload helpers used by every inbound and outbound message.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Schema tag carried by every outbound payload
pub const SCHEMA_VERSION: &str = "v1";

/// Errors while turning raw inbound bytes into a JSON object
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON object expected")]
    NotAnObject,
}

/// Current UTC time as ISO-8601 with second precision
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Decodes raw bytes as JSON. Invalid UTF-8 is replaced and a leading BOM is skipped.
pub fn decode_json(payload: &[u8]) -> Result<Value, PayloadError> {
    let raw = String::from_utf8_lossy(payload);
    let raw = raw.trim_start_matches('\u{feff}');
    Ok(serde_json::from_str(raw)?)
}

/// Decodes raw bytes and requires the top-level value to be an object.
pub fn decode_object(payload: &[u8]) -> Result<serde_json::Map<String, Value>, PayloadError> {
    match decode_json(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(PayloadError::NotAnObject),
    }
}

/// Compact JSON encoding used on the wire
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Fallback request id for inbound messages that carry none, unique per process
pub fn synth_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{}-{}", Utc::now().timestamp(), seq)
}

/// Caller supplied `reqId`: non-empty strings as they are, non-zero numbers in
/// their JSON form. Anything else counts as absent.
pub fn request_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) if n.as_f64().is_some_and(|f| f != 0.0) => Some(n.to_string()),
        _ => None,
    }
}
