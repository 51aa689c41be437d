use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{decode_object, encode};
use crate::device::commands::CommandDispatcher;
use crate::device::log_buffer::LogRingBuffer;
use crate::device::topics::{Channel, InboundRoute, RouteTable, TopicSet};
use crate::mqtt::message_manager::InboundMessage;
use crate::mqtt::transport::{Transport, TransportError};
use crate::ota::{OtaHandle, TransferOutcome};

/// Hands every inbound message to the component bound to its topic
pub struct Router<T: Transport> {
    transport: Arc<T>,
    topics: Arc<TopicSet>,
    routes: RouteTable,
    commands: CommandDispatcher,
    ota: OtaHandle,
    log: Arc<LogRingBuffer>,
}

impl<T: Transport> Router<T> {
    pub fn new(
        transport: Arc<T>,
        topics: Arc<TopicSet>,
        log: Arc<LogRingBuffer>,
        ota: OtaHandle,
    ) -> Self {
        Self {
            routes: topics.routes(),
            commands: CommandDispatcher::new(log.clone()),
            transport,
            topics,
            ota,
            log,
        }
    }

    pub async fn dispatch(&mut self, message: InboundMessage) -> Result<(), TransportError> {
        let Some(route) = self.routes.resolve(&message.topic) else {
            debug!("No route for {}", message.topic);
            return Ok(());
        };
        debug!("{} -> {:?}", message, route);

        match route {
            InboundRoute::Command => self.answer_command(&message.payload).await,
            InboundRoute::OtaRequest => {
                self.ota.submit(message.payload).await;
                Ok(())
            }
            InboundRoute::LogRequest => self.dump_logs(&message.payload).await,
        }
    }

    /// Routes messages until shutdown or until the inbound channel closes.
    ///
    /// Returns how the last OTA transfer ended, after waiting for it.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Option<TransferOutcome> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.dispatch(message).await {
                            warn!("Failed to answer inbound message: {}", e);
                        }
                    }
                    None => {
                        debug!("Inbound channel closed");
                        break;
                    }
                },
            }
        }
        self.ota.finish().await
    }

    async fn answer_command(&self, payload: &[u8]) -> Result<(), TransportError> {
        let Some(ack) = self.commands.handle(payload) else {
            return Ok(());
        };
        self.transport
            .publish(
                &self.topics.ack,
                Channel::Ack.qos(),
                Channel::Ack.retain(),
                encode(&ack)?,
            )
            .await
    }

    async fn dump_logs(&self, payload: &[u8]) -> Result<(), TransportError> {
        let Some(event_log) = self.topics.topic(Channel::EventLog) else {
            return Ok(());
        };
        let dump = self.log.dump(clear_requested(payload));
        self.transport
            .publish(
                event_log,
                Channel::EventLog.qos(),
                Channel::EventLog.retain(),
                encode(&dump)?,
            )
            .await?;
        info!("Log dump published ({} entries) -> {}", dump.count, event_log);
        Ok(())
    }
}

/// `clear` flag of a dump request; anything unreadable means keep the entries.
fn clear_requested(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    match decode_object(payload) {
        Ok(object) => object.get("clear").and_then(Value::as_bool).unwrap_or(false),
        Err(e) => {
            warn!("Invalid log command payload ({}); assuming clear=false", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OtaSettings;
    use crate::mqtt::transport::testing::RecordingTransport;
    use crate::ota::{OtaEvent, TransferContext};

    struct Fixture {
        router: Router<RecordingTransport>,
        transport: Arc<RecordingTransport>,
        topics: Arc<TopicSet>,
        log: Arc<LogRingBuffer>,
        ota_events: mpsc::Receiver<OtaEvent>,
    }

    fn fixture(logs: bool) -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let topics = Arc::new(TopicSet::new("dev1", logs));
        let log = Arc::new(LogRingBuffer::new("dev1"));
        let (tx, ota_events) = mpsc::channel(32);
        let context = TransferContext::new(
            &OtaSettings { pacing_ms: 0 },
            tx,
            log.clone(),
            CancellationToken::new(),
        );
        let router = Router::new(
            transport.clone(),
            topics.clone(),
            log.clone(),
            OtaHandle::new(context),
        );
        Fixture {
            router,
            transport,
            topics,
            log,
            ota_events,
        }
    }

    fn message(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage::from_topic(topic, payload.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn command_gets_exactly_one_ack() {
        let mut f = fixture(true);
        f.router
            .dispatch(message(
                "skyfeeder/dev1/cmd",
                r#"{"reqId":"r1","type":"led","payload":{"pattern":"blink"}}"#,
            ))
            .await
            .unwrap();

        let acks = f.transport.on_topic(&f.topics.ack);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].qos, rumqttc::QoS::AtLeastOnce);
        assert!(!acks[0].retain);
        let body = acks[0].json();
        assert_eq!(body["reqId"], "r1");
        assert_eq!(body["code"], "led.blink");
    }

    #[tokio::test]
    async fn command_subtopics_route_to_the_dispatcher() {
        let mut f = fixture(false);
        f.router
            .dispatch(message("skyfeeder/dev1/cmd/camera", r#"{"type":"camera"}"#))
            .await
            .unwrap();
        assert_eq!(f.transport.on_topic(&f.topics.ack)[0].json()["code"], "camera.snap");
    }

    #[tokio::test]
    async fn garbled_command_is_logged_without_ack() {
        let mut f = fixture(true);
        f.router
            .dispatch(message("skyfeeder/dev1/cmd", "{nope"))
            .await
            .unwrap();
        assert!(f.transport.published().is_empty());
        assert_eq!(f.log.len(), 1);
    }

    #[tokio::test]
    async fn ota_request_never_reaches_the_command_dispatcher() {
        let mut f = fixture(true);
        f.router
            .dispatch(message("skyfeeder/dev1/cmd/ota", r#"{"size":128}"#))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let outcome = f.router.run(rx, CancellationToken::new()).await;

        assert!(matches!(outcome, Some(TransferOutcome::Verified { .. })));
        assert!(f.transport.on_topic(&f.topics.ack).is_empty());
        let mut statuses = Vec::new();
        while let Ok(event) = f.ota_events.try_recv() {
            statuses.push(event.status);
        }
        assert_eq!(statuses.len(), 5);
    }

    #[tokio::test]
    async fn log_request_dumps_and_clears() {
        let mut f = fixture(true);
        f.log.info("test", "one");
        f.log.info("test", "two");
        f.router
            .dispatch(message("skyfeeder/dev1/cmd/logs", r#"{"clear":true}"#))
            .await
            .unwrap();

        let dumps = f.transport.on_topic("skyfeeder/dev1/event/log");
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].qos, rumqttc::QoS::AtMostOnce);
        let body = dumps[0].json();
        assert_eq!(body["device"], "dev1");
        assert_eq!(body["count"], 2);
        assert_eq!(body["entries"][1]["msg"], "two");
        assert!(f.log.is_empty());
        assert!(f.transport.on_topic(&f.topics.ack).is_empty());
    }

    #[tokio::test]
    async fn malformed_log_request_keeps_entries() {
        let mut f = fixture(true);
        f.log.info("test", "kept");
        f.router
            .dispatch(message("skyfeeder/dev1/cmd/logs", "garbage"))
            .await
            .unwrap();
        assert_eq!(f.transport.on_topic("skyfeeder/dev1/event/log")[0].json()["count"], 1);
        assert_eq!(f.log.len(), 1);
    }

    #[tokio::test]
    async fn without_logging_the_log_topic_is_a_plain_command() {
        let mut f = fixture(false);
        f.router
            .dispatch(message("skyfeeder/dev1/cmd/logs", r#"{"type":"logs"}"#))
            .await
            .unwrap();
        let acks = f.transport.on_topic(&f.topics.ack);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].json()["code"], "cmd.unsupported");
    }

    #[tokio::test]
    async fn unknown_topics_are_ignored() {
        let mut f = fixture(true);
        f.router
            .dispatch(message("skyfeeder/other/cmd", r#"{"type":"camera"}"#))
            .await
            .unwrap();
        assert!(f.transport.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_surfaces_as_error() {
        let mut f = fixture(true);
        f.transport.set_reject(true);
        let result = f
            .router
            .dispatch(message("skyfeeder/dev1/cmd", r#"{"type":"camera"}"#))
            .await;
        assert!(matches!(result, Err(TransportError::Publish { .. })));
    }
}
