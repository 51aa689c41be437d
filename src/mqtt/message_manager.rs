use chrono::NaiveDateTime;
use std::fmt;

/// Inbound publish handed from the MQTT event loop to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received: NaiveDateTime,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {} ({} bytes)",
            self.received.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len()
        )
    }
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received: chrono::Local::now().naive_local(),
        }
    }
}
