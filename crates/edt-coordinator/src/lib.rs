//! Cross-hospital coordinator.
//!
//! Reacts to live statistics on the bus: derives per-hospital saturation,
//! issues diversion directives, autoscales the reference center's consult
//! rooms from an on-call doctor pool and apportions incident casualties.

pub mod diversion;
pub mod incident;
pub mod saturation;
pub mod scaling;
pub mod service;

pub use diversion::DiversionManager;
pub use incident::IncidentDistributor;
pub use saturation::{SaturationLevel, SaturationMonitor};
pub use scaling::{OnCallDoctor, ScalingController, ScalingError, ScalingEvent};
pub use service::Coordinator;
