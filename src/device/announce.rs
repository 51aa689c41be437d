//! Discovery descriptor and online/offline status records, both retained.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::codec::{encode, utc_now, SCHEMA_VERSION};
use crate::config::{Capabilities, DeviceConfig};
use crate::device::log_buffer::LogRingBuffer;
use crate::device::topics::{Channel, QosMap, TopicSet};
use crate::mqtt::transport::{Transport, TransportError};

/// Services every mock device advertises
pub const BASE_SERVICES: [&str; 6] = ["power", "weight", "motion", "led", "camera", "ota"];

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDescriptor {
    pub schema: &'static str,
    pub id: String,
    pub fw: String,
    pub hw: String,
    pub mac: String,
    pub ip: String,
    pub capabilities: Vec<String>,
    pub topics: TopicSet,
    pub qos: QosMap,
    pub ts: String,
    pub notes: String,
}

impl DiscoveryDescriptor {
    pub fn build(device: &DeviceConfig, capabilities: &Capabilities, topics: &TopicSet) -> Self {
        let mut caps: Vec<String> = Vec::new();
        let requested = BASE_SERVICES
            .iter()
            .map(|s| s.to_string())
            .chain(capabilities.extra_services.iter().cloned());
        for service in requested {
            if !caps.contains(&service) {
                caps.push(service);
            }
        }
        if capabilities.logs && !caps.iter().any(|c| c == "logs") {
            caps.push("logs".to_string());
        }

        Self {
            schema: SCHEMA_VERSION,
            id: device.id.clone(),
            fw: device.firmware.clone(),
            hw: device.hardware.clone(),
            mac: device.mac.clone(),
            ip: device.ip.clone(),
            capabilities: caps,
            topics: topics.clone(),
            qos: topics.qos_map(),
            ts: utc_now(),
            notes: device.notes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Offline,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Online => write!(f, "online"),
            DeviceState::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub schema: String,
    pub ts: String,
    pub state: DeviceState,
    pub fw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusRecord {
    pub fn new(state: DeviceState, firmware: &str, reason: Option<&str>) -> Self {
        Self {
            schema: SCHEMA_VERSION.to_string(),
            ts: utc_now(),
            state,
            fw: firmware.to_string(),
            reason: reason.filter(|r| !r.is_empty()).map(str::to_string),
        }
    }
}

pub struct Announcer<T: Transport> {
    transport: Arc<T>,
    topics: Arc<TopicSet>,
    device: DeviceConfig,
    capabilities: Capabilities,
    log: Arc<LogRingBuffer>,
}

impl<T: Transport> Announcer<T> {
    pub fn new(
        transport: Arc<T>,
        topics: Arc<TopicSet>,
        device: DeviceConfig,
        capabilities: Capabilities,
        log: Arc<LogRingBuffer>,
    ) -> Self {
        Self {
            transport,
            topics,
            device,
            capabilities,
            log,
        }
    }

    /// Publishes a fresh descriptor and waits for the broker acknowledgment.
    pub async fn announce_discovery(&self) -> Result<DiscoveryDescriptor, TransportError> {
        let descriptor = DiscoveryDescriptor::build(&self.device, &self.capabilities, &self.topics);
        self.transport
            .publish_confirmed(
                &self.topics.discovery,
                Channel::Discovery.qos(),
                Channel::Discovery.retain(),
                encode(&descriptor)?,
            )
            .await?;
        info!(
            "Published discovery for {} with capabilities {:?}",
            self.device.id, descriptor.capabilities
        );
        Ok(descriptor)
    }

    /// Publishes the current status, retained, and records the transition.
    pub async fn set_status(
        &self,
        state: DeviceState,
        reason: Option<&str>,
    ) -> Result<(), TransportError> {
        let record = StatusRecord::new(state, &self.device.firmware, reason);
        self.transport
            .publish_confirmed(
                &self.topics.status,
                Channel::Status.qos(),
                Channel::Status.retain(),
                encode(&record)?,
            )
            .await?;
        self.log.info("status", &format!("status={state}"));
        info!("Status for {} is now {}", self.device.id, state);
        Ok(())
    }
}

/// Offline record registered as last will before connecting
pub fn last_will_payload(firmware: &str) -> Result<Vec<u8>, serde_json::Error> {
    encode(&StatusRecord::new(
        DeviceState::Offline,
        firmware,
        Some("lost connection"),
    ))
}
