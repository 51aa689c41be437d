//! # MQTT plumbing
//!
//! Everything that talks to the broker lives here; the device model only sees
//! the [`transport::Transport`] trait.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings and reconnect policy
//! ├── message_manager.rs  - Inbound publish representation
//! ├── mqtt_handler.rs     - rumqttc client and event loop task
//! └── transport.rs        - Publish/subscribe seam, plus the dry-run sink
//! ```
//!
//! The event loop owns reconnects. After every successful CONNACK it
//! re-issues the device subscriptions, so a broker restart does not leave the
//! simulated device deaf.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod transport;
