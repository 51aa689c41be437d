//! Topic registry derived from the device id.
//!
//! ```text
//! skyfeeder/<id>/discovery    retained, QoS 1
//! skyfeeder/<id>/status       retained, QoS 1
//! skyfeeder/<id>/telemetry    QoS 0
//! skyfeeder/<id>/cmd[/+]      QoS 1 (inbound)
//! skyfeeder/<id>/ack          QoS 1
//! skyfeeder/<id>/cmd/ota      QoS 1 (inbound)
//! skyfeeder/<id>/event/ota    QoS 0
//! skyfeeder/<id>/cmd/logs     QoS 1 (inbound, logging capability only)
//! skyfeeder/<id>/event/log    QoS 0 (logging capability only)
//! ```

use rumqttc::QoS;
use serde::Serialize;

pub const TOPIC_ROOT: &str = "skyfeeder";

/// Logical channels a device talks on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Discovery,
    Status,
    Telemetry,
    Cmd,
    Ack,
    CmdOta,
    EventOta,
    CmdLogs,
    EventLog,
}

impl Channel {
    pub fn qos(self) -> QoS {
        match self {
            Channel::Discovery
            | Channel::Status
            | Channel::Cmd
            | Channel::Ack
            | Channel::CmdOta
            | Channel::CmdLogs => QoS::AtLeastOnce,
            Channel::Telemetry | Channel::EventOta | Channel::EventLog => QoS::AtMostOnce,
        }
    }

    pub fn retain(self) -> bool {
        matches!(self, Channel::Discovery | Channel::Status)
    }
}

/// Concrete topic names. The log channels exist only with the logging capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSet {
    pub discovery: String,
    pub status: String,
    pub telemetry: String,
    pub cmd: String,
    pub ack: String,
    pub cmd_ota: String,
    pub event_ota: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_logs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log: Option<String>,
}

impl TopicSet {
    pub fn new(device_id: &str, logs_enabled: bool) -> Self {
        let base = format!("{TOPIC_ROOT}/{device_id}");
        Self {
            discovery: format!("{base}/discovery"),
            status: format!("{base}/status"),
            telemetry: format!("{base}/telemetry"),
            cmd: format!("{base}/cmd"),
            ack: format!("{base}/ack"),
            cmd_ota: format!("{base}/cmd/ota"),
            event_ota: format!("{base}/event/ota"),
            cmd_logs: logs_enabled.then(|| format!("{base}/cmd/logs")),
            event_log: logs_enabled.then(|| format!("{base}/event/log")),
        }
    }

    pub fn logs_enabled(&self) -> bool {
        self.cmd_logs.is_some()
    }

    pub fn topic(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Discovery => Some(&self.discovery),
            Channel::Status => Some(&self.status),
            Channel::Telemetry => Some(&self.telemetry),
            Channel::Cmd => Some(&self.cmd),
            Channel::Ack => Some(&self.ack),
            Channel::CmdOta => Some(&self.cmd_ota),
            Channel::EventOta => Some(&self.event_ota),
            Channel::CmdLogs => self.cmd_logs.as_deref(),
            Channel::EventLog => self.event_log.as_deref(),
        }
    }

    /// QoS level per channel as advertised in the discovery descriptor
    pub fn qos_map(&self) -> QosMap {
        let level = |channel: Channel| channel.qos() as u8;
        let logs = self.logs_enabled();
        QosMap {
            discovery: level(Channel::Discovery),
            status: level(Channel::Status),
            telemetry: level(Channel::Telemetry),
            cmd: level(Channel::Cmd),
            ack: level(Channel::Ack),
            cmd_ota: level(Channel::CmdOta),
            event_ota: level(Channel::EventOta),
            cmd_logs: logs.then(|| level(Channel::CmdLogs)),
            event_log: logs.then(|| level(Channel::EventLog)),
        }
    }

    /// Filters the device subscribes to when it listens for commands
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        let mut subs = vec![
            (self.cmd.clone(), Channel::Cmd.qos()),
            (format!("{}/#", self.cmd), Channel::Cmd.qos()),
            (self.cmd_ota.clone(), Channel::CmdOta.qos()),
        ];
        if let Some(cmd_logs) = &self.cmd_logs {
            subs.push((cmd_logs.clone(), Channel::CmdLogs.qos()));
        }
        subs
    }

    /// Resolves the inbound topics into handler bindings once, ahead of any traffic.
    pub fn routes(&self) -> RouteTable {
        let mut bindings = Vec::new();
        if let Some(cmd_logs) = &self.cmd_logs {
            bindings.push((TopicMatch::Exact(cmd_logs.clone()), InboundRoute::LogRequest));
        }
        bindings.push((TopicMatch::Exact(self.cmd_ota.clone()), InboundRoute::OtaRequest));
        bindings.push((TopicMatch::Exact(self.cmd.clone()), InboundRoute::Command));
        bindings.push((
            TopicMatch::Subtree(format!("{}/", self.cmd)),
            InboundRoute::Command,
        ));
        RouteTable { bindings }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QosMap {
    pub discovery: u8,
    pub status: u8,
    pub telemetry: u8,
    pub cmd: u8,
    pub ack: u8,
    pub cmd_ota: u8,
    pub event_ota: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_logs: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log: Option<u8>,
}

/// Handler an inbound message is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    Command,
    OtaRequest,
    LogRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicMatch {
    Exact(String),
    Subtree(String),
}

impl TopicMatch {
    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatch::Exact(expected) => topic == expected,
            TopicMatch::Subtree(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    bindings: Vec<(TopicMatch, InboundRoute)>,
}

impl RouteTable {
    pub fn resolve(&self, topic: &str) -> Option<InboundRoute> {
        self.bindings
            .iter()
            .find(|(matcher, _)| matcher.matches(topic))
            .map(|(_, route)| *route)
    }
}
