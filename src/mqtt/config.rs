use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u64,
    /// Bounded wait for the first CONNACK after connecting
    pub connect_wait_ms: u64,
    /// Bounded wait for the broker to acknowledge a confirmed publish
    pub ack_timeout_ms: u64,
    pub request_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "10.0.0.4".to_string(),
            port: 1883,
            username: "dev1".to_string(),
            password: "dev1pass".to_string(),
            keep_alive_secs: 30,
            connect_wait_ms: 5_000,
            ack_timeout_ms: 5_000,
            request_capacity: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// What the event loop does after the connection dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Single attempt; the event loop ends on the first connection error
    Never,
    Fixed { delay_ms: u64 },
    Backoff { initial_ms: u64, max_ms: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Backoff {
            initial_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before reconnect attempt number `attempt` (1 based), `None` to give up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Never => None,
            RetryPolicy::Fixed { delay_ms } => Some(Duration::from_millis(delay_ms)),
            RetryPolicy::Backoff { initial_ms, max_ms } => {
                let factor = 1u64 << attempt.saturating_sub(1).min(16);
                Some(Duration::from_millis(
                    initial_ms.saturating_mul(factor).min(max_ms),
                ))
            }
        }
    }
}
