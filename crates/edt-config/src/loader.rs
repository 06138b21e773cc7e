//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &[
    "edtwin.toml",
    "config.toml",
    "./config/edtwin.toml",
    "/etc/edtwin/config.toml",
];

/// Configuration loader.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("EDTWIN_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Bus
        if let Ok(val) = env::var("BUS_BOOTSTRAP") {
            config.bus.bootstrap = val;
        }
        if let Ok(val) = env::var("BUS_GROUP_ID") {
            config.bus.group_id = val;
        }
        if let Ok(val) = env::var("EDTWIN_BUS_OUTBOX_CAPACITY") {
            if let Ok(cap) = val.parse() {
                config.bus.outbox_capacity = cap;
            }
        }

        // Simulation
        if let Ok(val) = env::var("SIMULATION_SPEED") {
            if let Ok(speed) = val.parse() {
                config.simulation.speed = speed;
            }
        }
        if let Ok(val) = env::var("SIMULATION_DURATION") {
            if let Ok(minutes) = val.parse() {
                config.simulation.duration_minutes = minutes;
            }
        }
        if let Ok(val) = env::var("EDTWIN_STATS_INTERVAL_MINUTES") {
            if let Ok(interval) = val.parse() {
                config.simulation.stats_interval_minutes = interval;
            }
        }
        if let Ok(val) = env::var("EDTWIN_TICK_MILLIS") {
            if let Ok(millis) = val.parse() {
                config.simulation.tick_millis = millis;
            }
        }

        // Coordinator
        if let Ok(val) = env::var("EDTWIN_STATUS_INTERVAL_SECONDS") {
            if let Ok(interval) = val.parse() {
                config.coordinator.status_interval_seconds = interval;
            }
        }
        if let Ok(val) = env::var("EDTWIN_ON_CALL_POOL_SIZE") {
            if let Ok(size) = val.parse() {
                config.coordinator.on_call_pool_size = size;
            }
        }

        // Predictor
        if let Ok(val) = env::var("EDTWIN_TRAIN_INTERVAL_HOURS") {
            if let Ok(hours) = val.parse() {
                config.predictor.train_interval_hours = hours;
            }
        }
        if let Ok(val) = env::var("EDTWIN_HISTORY_DAYS") {
            if let Ok(days) = val.parse() {
                config.predictor.history_days = days;
            }
        }
        if let Ok(val) = env::var("EDTWIN_HORIZON_HOURS") {
            if let Ok(hours) = val.parse() {
                config.predictor.horizon_hours = hours;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
