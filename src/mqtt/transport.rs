//! Transport seam between the device components and the broker.

use async_trait::async_trait;
use rumqttc::QoS;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("No broker acknowledgment for {topic} within {timeout_ms}ms")]
    AckTimeout { topic: String, timeout_ms: u64 },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publish/subscribe primitives the simulator needs from a broker connection.
///
/// Publishing must be callable from the telemetry loop and the inbound
/// router at the same time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues a message. Returns once the client accepted it.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Publishes and waits until the broker acknowledged the message.
    async fn publish_confirmed(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.publish(topic, qos, retain, payload).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    /// Number of reconnects since start, reported in the telemetry health block
    fn reconnect_count(&self) -> u64 {
        0
    }
}

/// Logs every payload instead of talking to a broker
#[derive(Debug, Default)]
pub struct DryRunTransport;

#[async_trait]
impl Transport for DryRunTransport {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        info!(
            "[dry-run] {} (qos={}, retain={}) {}",
            topic,
            qos as u8,
            retain,
            String::from_utf8_lossy(&payload)
        );
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        info!("[dry-run] subscribe {} qos={}", filter, qos as u8);
        Ok(())
    }
}
