//! EDTwin configuration system.
//!
//! TOML-based configuration with environment variable override support.
//! Every field has a sensible default so a bare process starts without any
//! config file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub simulation: SimulationConfig,
    pub coordinator: CoordinatorConfig,
    pub predictor: PredictorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            simulation: SimulationConfig::default(),
            coordinator: CoordinatorConfig::default(),
            predictor: PredictorConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Sanity-check cross-field constraints before handing the config out.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation.speed < 0.1 {
            return Err(ConfigError::ValidationError(format!(
                "simulation.speed must be >= 0.1 (got {})",
                self.simulation.speed
            )));
        }
        if self.simulation.stats_interval_minutes <= 0.0 {
            return Err(ConfigError::ValidationError(
                "simulation.stats_interval_minutes must be positive".to_string(),
            ));
        }
        if self.coordinator.status_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "coordinator.status_interval_seconds must be positive".to_string(),
            ));
        }
        if self.predictor.train_interval_hours == 0 {
            return Err(ConfigError::ValidationError(
                "predictor.train_interval_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Event-bus client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker bootstrap identifier. The in-process broker ignores the
    /// address but it is kept in the payload metadata and logs.
    pub bootstrap: String,
    /// Default consumer group id.
    pub group_id: String,
    /// Partitions created by `ensure_topics` for missing topics.
    pub default_partitions: u32,
    /// Producer send timeout.
    pub send_timeout_seconds: u64,
    /// Bounded retry attempts for a failed produce.
    pub max_send_attempts: u32,
    /// Per-topic outbox bound; overflow drops the oldest entry.
    pub outbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bootstrap: "memory://local".to_string(),
            group_id: "edtwin".to_string(),
            default_partitions: 1,
            send_timeout_seconds: 10,
            max_send_attempts: 3,
            outbox_capacity: 10_000,
        }
    }
}

/// Simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulated minutes per wall-clock second. 1.0 means one real second
    /// advances the simulation by one minute.
    pub speed: f64,
    /// Total simulated duration in minutes; 0 = unbounded.
    pub duration_minutes: u64,
    /// Cadence of `hospital-stats` snapshots, in simulated minutes.
    pub stats_interval_minutes: f64,
    /// Cadence of `system-context` snapshots, in simulated minutes.
    pub context_interval_minutes: f64,
    /// Wall-clock tick of the realtime driver loop, in milliseconds.
    pub tick_millis: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            duration_minutes: 0,
            stats_interval_minutes: 2.0,
            context_interval_minutes: 60.0,
            tick_millis: 100,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Cadence of `coordinator-status` publications, wall-clock seconds.
    pub status_interval_seconds: u64,
    /// Size of the on-call doctor pool seeded at startup.
    pub on_call_pool_size: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            status_interval_seconds: 30,
            on_call_pool_size: 6,
        }
    }
}

/// Demand predictor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Re-training cadence in simulated hours (24 = once per simulated day).
    pub train_interval_hours: u64,
    /// Days of synthetic history generated when no real history exists.
    pub history_days: u32,
    /// Forecast horizon published on `prediction-updates`.
    pub horizon_hours: u32,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            train_interval_hours: 24,
            history_days: 90,
            horizon_hours: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_sub_minimum_speed() {
        let mut config = AppConfig::default();
        config.simulation.speed = 0.01;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [simulation]
            speed = 5.0

            [bus]
            group_id = "test-group"
            "#,
        )
        .unwrap();
        assert_eq!(config.simulation.speed, 5.0);
        assert_eq!(config.bus.group_id, "test-group");
        assert_eq!(config.bus.outbox_capacity, 10_000);
    }
}
