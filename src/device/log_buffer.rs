//! Bounded diagnostic log kept on the simulated device.
//!
//! Every component appends short entries here. Remote callers can pull a
//! snapshot through the `cmd/logs` channel, optionally clearing the buffer in
//! the same critical section.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::codec::{utc_now, SCHEMA_VERSION};

pub const LOG_CAPACITY: usize = 64;
pub const MAX_TAG_LEN: usize = 12;
pub const MAX_MESSAGE_LEN: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Boot,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Boot => write!(f, "boot"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    pub level: LogLevel,
    pub tag: String,
    pub msg: String,
}

/// Snapshot returned by [`LogRingBuffer::dump`] and published on `event/log`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDump {
    pub schema: String,
    pub device: String,
    pub count: usize,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug)]
pub struct LogRingBuffer {
    device_id: String,
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRingBuffer {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_capacity(device_id, LOG_CAPACITY)
    }

    pub fn with_capacity(device_id: impl Into<String>, capacity: usize) -> Self {
        let device_id = device_id.into();
        Self {
            device_id: if device_id.is_empty() {
                "sf-mock".to_string()
            } else {
                device_id
            },
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Appends an entry, evicting the oldest once the buffer is full.
    pub fn append(&self, level: LogLevel, tag: &str, message: &str) {
        let tag = if tag.is_empty() { "log" } else { tag };
        let entry = LogEntry {
            ts: utc_now(),
            level,
            tag: truncate_chars(tag, MAX_TAG_LEN),
            msg: truncate_chars(message, MAX_MESSAGE_LEN),
        };
        debug!("[{}] {}: {}", entry.level, entry.tag, entry.msg);

        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn info(&self, tag: &str, message: &str) {
        self.append(LogLevel::Info, tag, message);
    }

    pub fn warn(&self, tag: &str, message: &str) {
        self.append(LogLevel::Warn, tag, message);
    }

    pub fn error(&self, tag: &str, message: &str) {
        self.append(LogLevel::Error, tag, message);
    }

    pub fn boot_marker(&self, reason: &str) {
        self.append(LogLevel::Boot, "boot", &format!("boot_reason={reason}"));
    }

    /// Snapshots all entries oldest first, clearing them in the same lock scope when asked.
    pub fn dump(&self, clear: bool) -> LogDump {
        let entries: Vec<LogEntry> = {
            let mut guard = self.lock();
            if clear {
                guard.drain(..).collect()
            } else {
                guard.iter().cloned().collect()
            }
        };
        LogDump {
            schema: SCHEMA_VERSION.to_string(),
            device: self.device_id.clone(),
            count: entries.len(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Entries are plain data, a panic mid-append cannot leave them inconsistent
    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
