use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::mqtt::config::MqttConfig;

const CONFIG_DIR: &str = "skyfeeder-mock";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Simulated IoT feeder publishing discovery, telemetry, acks and OTA events over MQTT
#[derive(Parser, Debug, Default)]
#[command(name = "skyfeeder-mock", version)]
pub struct Cli {
    /// TOML config file, defaults to <config dir>/skyfeeder-mock/config.toml
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// MQTT broker host
    #[arg(long)]
    pub host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Device id used in every topic name
    #[arg(long)]
    pub device_id: Option<String>,

    /// Seconds between telemetry publishes
    #[arg(long)]
    pub interval: Option<u64>,

    /// Base weight in grams for telemetry
    #[arg(long)]
    pub base_weight: Option<f64>,

    /// RSSI value to report
    #[arg(long, allow_hyphen_values = true)]
    pub rssi: Option<i32>,

    /// Comma separated services to advertise (e.g. logs,telemetry)
    #[arg(long)]
    pub services: Option<String>,

    /// Ensure the logging service is advertised
    #[arg(long)]
    pub enable_logs: bool,

    /// Print payloads instead of publishing
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, short)]
    pub verbose: bool,
}

/// Identity and hardware profile the mock advertises
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    pub firmware: String,
    pub hardware: String,
    pub mac: String,
    pub ip: String,
    pub notes: String,
    pub services: Vec<String>,
    pub enable_logs: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "sf-mock01".to_string(),
            firmware: "skyfeeder-esp32-1.4.0".to_string(),
            hardware: "revC".to_string(),
            mac: "24:6F:28:FA:1C:01".to_string(),
            ip: "10.0.0.231".to_string(),
            notes: "Mock device published by tools/mock-publisher".to_string(),
            services: Vec::new(),
            enable_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_secs: u64,
    pub base_weight_g: f64,
    pub rssi: i32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            base_weight_g: 1234.0,
            rssi: -62,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaSettings {
    /// Delay between progress milestones
    pub pacing_ms: u64,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self { pacing_ms: 50 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub telemetry: TelemetryConfig,
    pub ota: OtaSettings,
    pub dry_run: bool,
}

/// Which optional features the device advertises
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub logs: bool,
    pub extra_services: Vec<String>,
}

impl Capabilities {
    /// Normalizes the service list; no services at all turns logging on.
    pub fn resolve(services: &[String], enable_logs: bool) -> Self {
        let mut extra_services: Vec<String> = services
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let logs = enable_logs || extra_services.is_empty() || extra_services.iter().any(|s| s == "logs");
        if logs && !extra_services.iter().any(|s| s == "logs") {
            extra_services.push("logs".to_string());
        }
        Self {
            logs,
            extra_services,
        }
    }
}

impl SimulatorConfig {
    /// Reads the file named on the command line, else the per-user default if present.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let path = match &cli.config {
            Some(path) => Some(path.clone()),
            None => default_path().filter(|p| p.exists()),
        };
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file, using built-in defaults");
                Self::default()
            }
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.mqtt.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.mqtt.port = port;
        }
        if let Some(username) = &cli.username {
            self.mqtt.username = username.clone();
        }
        if let Some(password) = &cli.password {
            self.mqtt.password = password.clone();
        }
        if let Some(id) = &cli.device_id {
            self.device.id = id.clone();
        }
        if let Some(interval) = cli.interval {
            self.telemetry.interval_secs = interval;
        }
        if let Some(weight) = cli.base_weight {
            self.telemetry.base_weight_g = weight;
        }
        if let Some(rssi) = cli.rssi {
            self.telemetry.rssi = rssi;
        }
        if let Some(services) = &cli.services {
            self.device.services = services.split(',').map(str::to_string).collect();
        }
        self.device.enable_logs |= cli.enable_logs;
        self.dry_run |= cli.dry_run;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "telemetry.interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid {
                field: "mqtt.port",
                reason: "must not be 0".to_string(),
            });
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "mqtt.request_capacity",
                reason: "must not be 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::resolve(&self.device.services, self.device.enable_logs)
    }

    pub fn client_id(&self) -> String {
        format!("skyfeeder-mock-{}", self.device.id)
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}
