//! Shared types for the EDTwin emergency-department digital twin.
//!
//! Every bus payload, the hospital and triage catalogues and the logging
//! bootstrap live here so that producers and consumers agree on one wire
//! format.

pub mod hospitals;
pub mod logging;
pub mod schemas;
pub mod seed;
pub mod topics;
pub mod triage;

pub use hospitals::{HospitalConfig, HOSPITALS};
pub use schemas::*;
