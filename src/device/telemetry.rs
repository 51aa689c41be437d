//! Synthetic telemetry samples.
//!
//! Each tick produces one sample as a noisy function of the sequence counter.
//! The nested `health` block is validated by external tooling: four
//! non-negative integer counters plus an optional RSSI in `[-120, 0]`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Instant;

use crate::codec::{utc_now, SCHEMA_VERSION};
use crate::config::TelemetryConfig;

pub const SOC_MIN: f64 = 12.0;
pub const SOC_MAX: f64 = 100.0;
pub const RSSI_MIN: i32 = -120;
pub const RSSI_MAX: i32 = 0;

#[derive(Debug, Clone, Serialize)]
pub struct PowerReading {
    pub volts: f64,
    pub amps: f64,
    pub watts: f64,
    pub soc_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthBlock {
    pub uptime_ms: u64,
    pub last_seen_ms: u64,
    pub telemetry_count: u64,
    pub mqtt_retries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    pub schema: &'static str,
    pub ts: String,
    pub rssi: i32,
    pub uptime_s: u64,
    pub power: PowerReading,
    pub weight_g: f64,
    pub motion: bool,
    pub temperature_c: f64,
    pub health: HealthBlock,
}

pub struct TelemetryGenerator {
    base_weight: f64,
    rssi: i32,
    started: Instant,
    rng: StdRng,
}

impl TelemetryGenerator {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: &TelemetryConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &TelemetryConfig, rng: StdRng) -> Self {
        Self {
            base_weight: config.base_weight_g,
            rssi: config.rssi,
            started: Instant::now(),
            rng,
        }
    }

    /// Builds the sample for tick `seq` (zero based).
    pub fn sample(&mut self, seq: u64, retries: u64) -> TelemetrySample {
        let t = seq as f64;
        let weight = self.base_weight + (t / 3.5).sin() * 4.0 + self.rng.gen_range(-0.6..=0.6);
        let soc = (76.0 - t * 0.05 + self.rng.gen_range(-0.3..=0.3)).clamp(SOC_MIN, SOC_MAX);
        let watts = 3.2 + (t / 4.0).sin() * 0.6;
        let amps = 0.28 + (t / 5.0).sin() * 0.04;
        let volts = if amps != 0.0 { watts / amps } else { 12.0 };
        let rssi = (self.rssi + self.rng.gen_range(-2..=2)).clamp(RSSI_MIN, RSSI_MAX);

        let uptime = self.started.elapsed();
        let last_seen_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

        TelemetrySample {
            schema: SCHEMA_VERSION,
            ts: utc_now(),
            rssi,
            uptime_s: uptime.as_secs(),
            power: PowerReading {
                volts: round_to(volts, 2),
                amps: round_to(amps, 3),
                watts: round_to(watts, 2),
                soc_pct: round_to(soc, 1),
            },
            weight_g: round_to(weight, 2),
            motion: self.rng.gen_bool(0.05),
            temperature_c: round_to(24.0 + (t / 6.0).sin() * 0.8, 1),
            health: HealthBlock {
                uptime_ms: uptime.as_millis() as u64,
                last_seen_ms,
                telemetry_count: seq + 1,
                mqtt_retries: retries,
                rssi: Some(rssi),
            },
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_weight_g: f64, rssi: i32) -> TelemetryConfig {
        TelemetryConfig {
            base_weight_g,
            rssi,
            ..TelemetryConfig::default()
        }
    }

    #[test]
    fn health_block_honors_its_contract() {
        let mut generator = TelemetryGenerator::with_seed(&config(1234.0, -62), 7);
        for seq in 0..50 {
            let sample = generator.sample(seq, 3);
            let health = serde_json::to_value(&sample.health).unwrap();
            for key in ["uptime_ms", "last_seen_ms", "telemetry_count", "mqtt_retries"] {
                assert!(health[key].is_u64(), "{key} must be a non-negative integer");
            }
            let rssi = health["rssi"].as_i64().unwrap();
            assert!((-120..=0).contains(&rssi));
            assert_eq!(sample.health.telemetry_count, seq + 1);
            assert_eq!(sample.health.mqtt_retries, 3);
        }
    }

    #[test]
    fn values_stay_within_bounds() {
        let mut generator = TelemetryGenerator::with_seed(&config(1234.0, -62), 11);
        for seq in [0, 10, 500, 5_000] {
            let sample = generator.sample(seq, 0);
            assert!((SOC_MIN..=SOC_MAX).contains(&sample.power.soc_pct));
            assert!((-64..=-60).contains(&sample.rssi));
            assert!((sample.weight_g - 1234.0).abs() <= 4.6 + 0.01);
        }
        // soc decays to the floor on long runs
        assert_eq!(generator.sample(100_000, 0).power.soc_pct, SOC_MIN);
    }

    #[test]
    fn rssi_is_clamped_to_valid_range() {
        let mut strong = TelemetryGenerator::with_seed(&config(0.0, 5), 1);
        let mut weak = TelemetryGenerator::with_seed(&config(0.0, -200), 1);
        for seq in 0..20 {
            assert!(strong.sample(seq, 0).rssi <= RSSI_MAX);
            assert_eq!(weak.sample(seq, 0).rssi, RSSI_MIN);
        }
    }

    #[test]
    fn sample_serializes_with_schema_and_nested_power() {
        let mut generator = TelemetryGenerator::with_seed(&config(1234.0, -62), 3);
        let json = serde_json::to_value(generator.sample(0, 0)).unwrap();
        assert_eq!(json["schema"], "v1");
        assert!(json["power"]["watts"].is_f64());
        assert!(json["motion"].is_boolean());
        assert_eq!(json["health"]["telemetry_count"], 1);
    }
}
