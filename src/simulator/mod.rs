//! # Simulator
//!
//! Ties the device components to a transport and drives them until shutdown.
//!
//! ```text
//!                ┌──────────── Simulator::run ─────────────┐
//! broker ──RX──► router ──► commands ──► ack               │
//!                   │                                      │
//!                   └──► OtaHandle ──OtaEvent──► pump ──► event/ota
//!                                                          │
//! ticker ──► TelemetryGenerator ──────────────────────────► telemetry
//!                └─────────────────────────────────────────┘
//! ```
//!
//! Startup publishes the discovery descriptor and the online status, both
//! confirmed by the broker. Shutdown cancels the router and any running OTA
//! transfer, then publishes the offline status with reason `mock stopped`.

pub mod router;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::encode;
use crate::config::{Capabilities, OtaSettings, SimulatorConfig};
use crate::device::announce::{Announcer, DeviceState};
use crate::device::log_buffer::LogRingBuffer;
use crate::device::telemetry::TelemetryGenerator;
use crate::device::topics::{Channel, TopicSet};
use crate::mqtt::message_manager::InboundMessage;
use crate::mqtt::transport::{Transport, TransportError};
use crate::ota::{OtaEvent, OtaHandle, TransferContext, TransferOutcome};
use router::Router;

pub const BOOT_REASON: &str = "mock_start";
pub const STOP_REASON: &str = "mock stopped";
const OTA_EVENT_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a finished run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub telemetry_sent: u64,
    pub last_transfer: Option<TransferOutcome>,
}

/// Ring buffer for one device, opened with the boot marker when logging is on
pub fn device_log(device_id: &str, logs_enabled: bool) -> Arc<LogRingBuffer> {
    let log = Arc::new(LogRingBuffer::new(device_id));
    if logs_enabled {
        log.boot_marker(BOOT_REASON);
    }
    log
}

pub struct Simulator<T: Transport> {
    transport: Arc<T>,
    topics: Arc<TopicSet>,
    announcer: Announcer<T>,
    telemetry: TelemetryGenerator,
    interval: Duration,
    ota: OtaSettings,
    log: Arc<LogRingBuffer>,
}

impl<T: Transport> Simulator<T> {
    pub fn new(
        transport: Arc<T>,
        config: &SimulatorConfig,
        capabilities: Capabilities,
        topics: Arc<TopicSet>,
        log: Arc<LogRingBuffer>,
    ) -> Self {
        let announcer = Announcer::new(
            transport.clone(),
            topics.clone(),
            config.device.clone(),
            capabilities,
            log.clone(),
        );
        Self {
            transport,
            topics,
            announcer,
            telemetry: TelemetryGenerator::new(&config.telemetry),
            interval: Duration::from_secs(config.telemetry.interval_secs.max(1)),
            ota: config.ota.clone(),
            log,
        }
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Without an inbound channel (dry run) only the outbound side runs.
    pub async fn run(
        mut self,
        inbound: Option<mpsc::Receiver<InboundMessage>>,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, SimulatorError> {
        self.announcer.announce_discovery().await?;
        self.announcer.set_status(DeviceState::Online, None).await?;
        if inbound.is_some() {
            for (filter, qos) in self.topics.subscriptions() {
                self.transport.subscribe(&filter, qos).await?;
            }
        }

        let (event_tx, event_rx) = mpsc::channel(OTA_EVENT_CAPACITY);
        let pump = tokio::spawn(pump_ota_events(
            self.transport.clone(),
            self.topics.event_ota.clone(),
            event_rx,
        ));

        let router = match inbound {
            Some(inbound) => {
                let context =
                    TransferContext::new(&self.ota, event_tx, self.log.clone(), shutdown.clone());
                let router = Router::new(
                    self.transport.clone(),
                    self.topics.clone(),
                    self.log.clone(),
                    OtaHandle::new(context),
                );
                info!("Listening for commands on {}/#", self.topics.cmd);
                Some(tokio::spawn(router.run(inbound, shutdown.clone())))
            }
            None => {
                drop(event_tx);
                None
            }
        };

        let telemetry_sent = self.telemetry_loop(&shutdown).await;
        info!("Stopping after {} telemetry samples", telemetry_sent);

        let last_transfer = match router {
            Some(task) => task.await?,
            None => None,
        };
        pump.await?;

        self.announcer
            .set_status(DeviceState::Offline, Some(STOP_REASON))
            .await?;

        Ok(RunSummary {
            telemetry_sent,
            last_transfer,
        })
    }

    async fn telemetry_loop(&mut self, shutdown: &CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.publish_telemetry(seq).await {
                        Ok(()) => debug!("Telemetry {} sent -> {}", seq + 1, self.topics.telemetry),
                        Err(e) => warn!("Telemetry {} not sent: {}", seq + 1, e),
                    }
                    seq += 1;
                }
            }
        }
        seq
    }

    async fn publish_telemetry(&mut self, seq: u64) -> Result<(), TransportError> {
        let sample = self.telemetry.sample(seq, self.transport.reconnect_count());
        self.transport
            .publish(
                &self.topics.telemetry,
                Channel::Telemetry.qos(),
                Channel::Telemetry.retain(),
                encode(&sample)?,
            )
            .await?;
        if seq % 4 == 0 {
            self.log.info(
                "telemetry",
                &format!("power={}W weight={}g", sample.power.watts, sample.weight_g),
            );
        }
        Ok(())
    }
}

/// Publishes OTA lifecycle events until every transfer context is gone.
async fn pump_ota_events<T: Transport>(
    transport: Arc<T>,
    topic: String,
    mut events: mpsc::Receiver<OtaEvent>,
) {
    while let Some(event) = events.recv().await {
        let payload = match encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode OTA event: {}", e);
                continue;
            }
        };
        if let Err(e) = transport
            .publish(
                &topic,
                Channel::EventOta.qos(),
                Channel::EventOta.retain(),
                payload,
            )
            .await
        {
            warn!("OTA event not published: {}", e);
        }
    }
    debug!("OTA event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::transport::testing::RecordingTransport;
    use crate::device::log_buffer::LogLevel;

    fn config() -> SimulatorConfig {
        let mut config = SimulatorConfig::default();
        config.device.id = "dev1".to_string();
        config.telemetry.interval_secs = 60;
        config.ota.pacing_ms = 0;
        config
    }

    fn simulator(
        logs: bool,
    ) -> (
        Simulator<RecordingTransport>,
        Arc<RecordingTransport>,
        Arc<LogRingBuffer>,
    ) {
        let config = config();
        let transport = Arc::new(RecordingTransport::default());
        let topics = Arc::new(TopicSet::new(&config.device.id, logs));
        let log = device_log(&config.device.id, logs);
        let capabilities = Capabilities {
            logs,
            extra_services: Vec::new(),
        };
        let simulator = Simulator::new(transport.clone(), &config, capabilities, topics, log.clone());
        (simulator, transport, log)
    }

    #[test]
    fn boot_marker_only_with_logging() {
        let log = device_log("dev1", true);
        let dump = log.dump(false);
        assert_eq!(dump.count, 1);
        assert_eq!(dump.entries[0].level, LogLevel::Boot);
        assert_eq!(dump.entries[0].msg, "boot_reason=mock_start");

        assert!(device_log("dev1", false).is_empty());
    }

    #[tokio::test]
    async fn lifecycle_publishes_online_telemetry_offline() {
        let (simulator, transport, log) = simulator(true);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(simulator.run(None, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.telemetry_sent, 1);
        assert_eq!(summary.last_transfer, None);

        let topics: Vec<String> = transport.published().into_iter().map(|p| p.topic).collect();
        assert_eq!(
            topics,
            vec![
                "skyfeeder/dev1/discovery",
                "skyfeeder/dev1/status",
                "skyfeeder/dev1/telemetry",
                "skyfeeder/dev1/status",
            ]
        );

        let status = transport.on_topic("skyfeeder/dev1/status");
        assert!(status.iter().all(|p| p.retain && p.confirmed));
        assert_eq!(status[0].json()["state"], "online");
        assert_eq!(status[1].json()["state"], "offline");
        assert_eq!(status[1].json()["reason"], "mock stopped");

        let telemetry = &transport.on_topic("skyfeeder/dev1/telemetry")[0];
        assert!(!telemetry.retain);
        assert_eq!(telemetry.json()["health"]["telemetry_count"], 1);

        let messages: Vec<String> = log.dump(false).entries.into_iter().map(|e| e.msg).collect();
        assert_eq!(messages[0], "boot_reason=mock_start");
        assert_eq!(messages[1], "status=online");
        assert!(messages[2].starts_with("power="));
        assert_eq!(messages[3], "status=offline");
    }

    #[tokio::test]
    async fn ota_events_reach_the_event_topic() {
        let (simulator, transport, _) = simulator(false);
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(simulator.run(Some(rx), shutdown.clone()));

        tx.send(InboundMessage::from_topic(
            "skyfeeder/dev1/cmd/ota",
            br#"{"reqId":"u1","url":"mock.bin","size":4096}"#.to_vec(),
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let summary = task.await.unwrap().unwrap();

        assert!(matches!(
            summary.last_transfer,
            Some(TransferOutcome::Verified { ref crc, .. }) if crc == "37C401CD"
        ));
        let filters: Vec<String> = transport.subscriptions().into_iter().map(|(f, _)| f).collect();
        assert_eq!(
            filters,
            vec!["skyfeeder/dev1/cmd", "skyfeeder/dev1/cmd/#", "skyfeeder/dev1/cmd/ota"]
        );
        let events = transport.on_topic("skyfeeder/dev1/event/ota");
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.qos == rumqttc::QoS::AtMostOnce && !e.retain));
        assert_eq!(events[4].json()["status"], "verified");
        assert_eq!(events[4].json()["reqId"], "u1");
    }

    #[tokio::test]
    async fn dry_run_subscribes_to_nothing() {
        let (simulator, transport, _) = simulator(true);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        simulator.run(None, shutdown).await.unwrap();
        assert!(transport.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn rejected_telemetry_is_neither_recorded_nor_logged() {
        let (mut simulator, transport, log) = simulator(true);
        simulator.interval = Duration::from_millis(20);
        transport.set_reject(true);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(110)).await;
            stop.cancel();
        });
        let attempts = simulator.telemetry_loop(&shutdown).await;

        assert!(attempts >= 2);
        assert!(transport.on_topic("skyfeeder/dev1/telemetry").is_empty());
        let dump = log.dump(false);
        assert!(dump.entries.iter().all(|e| e.tag != "telemetry"));
    }

    #[tokio::test]
    async fn telemetry_sequence_keeps_counting_across_rejections() {
        let (mut simulator, transport, _) = simulator(false);
        simulator.interval = Duration::from_millis(20);
        transport.set_reject(true);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let broker = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            broker.set_reject(false);
            tokio::time::sleep(Duration::from_millis(60)).await;
            stop.cancel();
        });
        simulator.telemetry_loop(&shutdown).await;

        let sent = transport.on_topic("skyfeeder/dev1/telemetry");
        assert!(!sent.is_empty());
        assert!(sent[0].json()["health"]["telemetry_count"].as_u64().unwrap() > 1);
    }

    #[tokio::test]
    async fn rejected_discovery_stops_the_run() {
        let (simulator, transport, _) = simulator(false);
        transport.set_reject(true);
        let result = simulator.run(None, CancellationToken::new()).await;
        assert!(matches!(result, Err(SimulatorError::Transport(_))));
    }
}
