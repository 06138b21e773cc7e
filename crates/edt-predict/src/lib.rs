//! Demand predictor.
//!
//! Per-hospital arrival forecasting with anomaly detection. Models are
//! fitted to 90 days of deterministic synthetic history when no real
//! history is available; when a model cannot be fitted the predictor
//! degrades to a profile-only forecast built straight from the factor
//! tables.

pub mod anomaly;
pub mod history;
pub mod model;
pub mod profile;
pub mod service;

pub use anomaly::{anomaly_z, Z_THRESHOLD};
pub use history::{synthetic_history, HourlySample};
pub use model::{scenario_factor, Scenario, SeasonalModel};
pub use profile::{forecast_profile, ForecastProfile};
pub use service::{DemandPredictor, PredictorService};
