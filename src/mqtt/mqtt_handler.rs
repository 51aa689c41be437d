//! Broker connection built on rumqttc.
//!
//! `MqttHandler` is the publishing side handed to the simulator; the
//! `EventLoopWorker` owns the rumqttc event loop in its own task, tracks the
//! connection state, restores subscriptions after a reconnect and forwards
//! inbound publishes to the router channel.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, RetryPolicy};
use super::message_manager::InboundMessage;
use super::transport::{Transport, TransportError};
use crate::device::log_buffer::LogRingBuffer;

/// Upper bound for flushing the final status and DISCONNECT after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

/// Everything the handler needs before the first connect
pub struct ConnectSpec {
    pub client_id: String,
    pub last_will: LastWill,
}

/// Matches broker acknowledgments to the confirmed publishes waiting for them.
///
/// Every QoS 1/2 publish request takes the next request number. The event
/// loop writes publishes in request order, so the n-th fresh outgoing packet
/// id belongs to request n. Retransmits reuse an in-flight id and are skipped.
#[derive(Debug, Default)]
struct AckBook {
    next_request: u64,
    next_outgoing: u64,
    inflight: HashMap<u16, u64>,
    waiters: HashMap<u64, oneshot::Sender<()>>,
}

impl AckBook {
    fn request(&mut self) -> u64 {
        let seq = self.next_request;
        self.next_request += 1;
        seq
    }

    fn expect(&mut self, seq: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(seq, tx);
        rx
    }

    /// Gives back a request number the client never queued.
    fn withdraw(&mut self, seq: u64) {
        self.waiters.remove(&seq);
        if self.next_request == seq + 1 {
            self.next_request = seq;
        }
    }

    fn sent(&mut self, pkid: u16) {
        if pkid == 0 || self.inflight.contains_key(&pkid) {
            return;
        }
        self.inflight.insert(pkid, self.next_outgoing);
        self.next_outgoing += 1;
    }

    fn acked(&mut self, pkid: u16) -> bool {
        let Some(seq) = self.inflight.remove(&pkid) else {
            return false;
        };
        match self.waiters.remove(&seq) {
            Some(waiter) => waiter.send(()).is_ok(),
            None => false,
        }
    }

    /// Fails every pending wait; the loop that would deliver the acks is gone.
    fn abandon(&mut self) {
        self.waiters.clear();
    }
}

type SharedAckBook = Arc<Mutex<AckBook>>;
type SharedSubscriptions = Arc<Mutex<Vec<(String, QoS)>>>;

// Plain bookkeeping, a panic while holding the lock leaves nothing half written
fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MqttHandler {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    acks: SharedAckBook,
    request_order: tokio::sync::Mutex<()>,
    subscriptions: SharedSubscriptions,
    reconnects: Arc<AtomicU64>,
    ack_timeout: Duration,
}

impl MqttHandler {
    pub fn options(config: &MqttConfig, client_id: &str, last_will: LastWill) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqtt_options
            .set_credentials(config.username.clone(), config.password.clone())
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)))
            .set_clean_session(true)
            .set_last_will(last_will);
        mqtt_options
    }

    /// Creates the client and spawns the event loop task.
    ///
    /// The last will is registered in the connect options, so it is in place
    /// before the broker ever sees this client.
    pub fn spawn(
        config: &MqttConfig,
        spec: ConnectSpec,
        inbound: mpsc::Sender<InboundMessage>,
        log: Arc<LogRingBuffer>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let options = Self::options(config, &spec.client_id, spec.last_will);
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let acks = SharedAckBook::default();
        let subscriptions = SharedSubscriptions::default();
        let reconnects = Arc::new(AtomicU64::new(0));

        info!(
            "Connecting to {}:{} as {}",
            config.host, config.port, spec.client_id
        );

        let worker = EventLoopWorker {
            eventloop,
            client: client.clone(),
            subscriptions: subscriptions.clone(),
            connected_once: false,
            inbound,
            log,
            state: state_tx,
            acks: acks.clone(),
            reconnects: reconnects.clone(),
            retry: config.retry,
            shutdown,
        };
        let task = tokio::spawn(worker.run());

        let handler = MqttHandler {
            client,
            state: state_rx,
            acks,
            request_order: tokio::sync::Mutex::new(()),
            subscriptions,
            reconnects,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
        };
        (handler, task)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits at most `wait` for the first successful CONNACK.
    pub async fn wait_connected(&self, wait: Duration) -> bool {
        let mut state = self.state.clone();
        let outcome =
            tokio::time::timeout(wait, state.wait_for(|s| *s == ConnectionState::Connected)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Disconnect request failed: {}", e);
        }
    }

    /// Queues a publish. With `confirm` the returned receiver resolves on the
    /// broker's PUBACK/PUBCOMP for exactly this message.
    async fn enqueue(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
        confirm: bool,
    ) -> Result<Option<oneshot::Receiver<()>>, TransportError> {
        let publish_error = |e: rumqttc::ClientError| TransportError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        };
        if qos == QoS::AtMostOnce {
            self.client
                .publish(topic, qos, retain, payload)
                .await
                .map_err(publish_error)?;
            return Ok(None);
        }

        // Request numbers must follow the order the client queue sees
        let _order = self.request_order.lock().await;
        let (seq, ack) = {
            let mut book = lock(&self.acks);
            let seq = book.request();
            (seq, confirm.then(|| book.expect(seq)))
        };
        if let Err(e) = self.client.publish(topic, qos, retain, payload).await {
            lock(&self.acks).withdraw(seq);
            return Err(publish_error(e));
        }
        Ok(ack)
    }
}

#[async_trait]
impl Transport for MqttHandler {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.enqueue(topic, qos, retain, payload, false).await?;
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let Some(ack) = self.enqueue(topic, qos, retain, payload, true).await? else {
            return Ok(());
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => {
                debug!("Broker acknowledged publish to {}", topic);
                Ok(())
            }
            Ok(Err(_)) => Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "event loop stopped".to_string(),
            }),
            Err(_) => Err(TransportError::AckTimeout {
                topic: topic.to_string(),
                timeout_ms: self.ack_timeout.as_millis() as u64,
            }),
        }
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: filter.to_string(),
                reason: e.to_string(),
            })?;
        lock(&self.subscriptions).push((filter.to_string(), qos));
        info!("Subscribed {} qos={}", filter, qos as u8);
        Ok(())
    }

    fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

struct EventLoopWorker {
    eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: SharedSubscriptions,
    connected_once: bool,
    inbound: mpsc::Sender<InboundMessage>,
    log: Arc<LogRingBuffer>,
    state: watch::Sender<ConnectionState>,
    acks: SharedAckBook,
    reconnects: Arc<AtomicU64>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl EventLoopWorker {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Event loop keeps draining until disconnect completes");
                    // Let the final offline status and DISCONNECT go out
                    match tokio::time::timeout(DRAIN_TIMEOUT, self.drain()).await {
                        Ok(()) => debug!("Event loop drained"),
                        Err(_) => warn!("Event loop drain timed out"),
                    }
                    break;
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(event) => {
                    if failures > 0 && matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                        failures = 0;
                    }
                    self.handle_event(event);
                }
                Err(e) => {
                    failures += 1;
                    error!("MQTT connection error: {}", e);
                    self.log.warn("mqtt", &format!("disconnected: {e}"));
                    match self.retry.delay(failures) {
                        Some(delay) => {
                            self.state.send_replace(ConnectionState::Reconnecting);
                            self.reconnects.fetch_add(1, Ordering::Relaxed);
                            info!("Reconnecting in {:?} (attempt {})", delay, failures);
                            tokio::select! {
                                _ = self.shutdown.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            self.state.send_replace(ConnectionState::Failed);
                            warn!("Reconnect disabled, event loop stops");
                            break;
                        }
                    }
                }
            }
        }
        lock(&self.acks).abandon();
        self.state.send_replace(ConnectionState::Disconnected);
        info!("MQTT event loop finished");
    }

    /// Polls until the outgoing DISCONNECT was written or the connection closed.
    async fn drain(&mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
                Ok(event) => self.handle_event(event),
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to broker (session_present={})", ack.session_present);
                    self.log.info("mqtt", "connected");
                    self.state.send_replace(ConnectionState::Connected);
                    if self.connected_once {
                        self.resubscribe();
                    }
                    self.connected_once = true;
                } else {
                    error!("MQTT connect refused: {:?}", ack.code);
                    self.log.error("mqtt", &format!("connect refused: {:?}", ack.code));
                    self.state.send_replace(ConnectionState::Failed);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = InboundMessage::from_topic(publish.topic, publish.payload.to_vec());
                debug!("RX {}", message);
                if let Err(e) = self.inbound.try_send(message) {
                    warn!("Inbound message dropped: {}", e);
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => lock(&self.acks).sent(pkid),
            Event::Incoming(Packet::PubAck(ack)) => {
                lock(&self.acks).acked(ack.pkid);
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                lock(&self.acks).acked(comp.pkid);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!("Subscription acknowledged: pkid={} {:?}", ack.pkid, ack.return_codes);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT");
                self.log.warn("mqtt", "broker disconnect");
                self.state.send_replace(ConnectionState::Disconnected);
            }
            _ => {}
        }
    }

    // Runs inside the event loop task; the async variant would wait on the
    // very loop that has to drain the request queue.
    fn resubscribe(&self) {
        let subscriptions = lock(&self.subscriptions).clone();
        for (filter, qos) in subscriptions {
            match self.client.try_subscribe(filter.clone(), qos) {
                Ok(()) => info!("Resubscribed {} qos={}", filter, qos as u8),
                Err(e) => {
                    error!("Subscribe to {} failed: {}", filter, e);
                    self.log.error("mqtt", &format!("subscribe failed: {filter}"));
                }
            }
        }
    }
}
