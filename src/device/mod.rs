//! # Simulated Device Components
//!
//! The pieces of the mock field device that do not depend on a live broker:
//!
//! ```text
//! device/
//! ├── topics.rs      - Topic names, QoS table and inbound routes per device id
//! ├── log_buffer.rs  - Bounded diagnostic log, dumpable over `cmd/logs`
//! ├── announce.rs    - Retained discovery descriptor and status records
//! ├── telemetry.rs   - Synthetic periodic samples with a health block
//! └── commands.rs    - `cmd` decoding and acknowledgments
//! ```
//!
//! Everything that publishes goes through [`crate::mqtt::transport::Transport`],
//! everything that instruments itself writes to the shared [`LogRingBuffer`].

pub mod announce;
pub mod commands;
pub mod log_buffer;
pub mod telemetry;
pub mod topics;

pub use announce::{Announcer, DeviceState};
pub use commands::{Ack, CommandDispatcher};
pub use log_buffer::{LogLevel, LogRingBuffer};
pub use telemetry::TelemetryGenerator;
pub use topics::{Channel, InboundRoute, RouteTable, TopicSet};
