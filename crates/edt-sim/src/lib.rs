//! Hospital flow simulation.
//!
//! One discrete-event engine per hospital advances patients through
//! reception, triage, consultation and observation under bounded resource
//! capacity and triage-priority rules. A per-hospital simulation binds a
//! generator and an engine to the simulated clock and publishes events;
//! the process-level orchestrator hosts all hospitals and the bus
//! consumers for incidents, staffing and control commands.

use thiserror::Error;

pub mod clock;
pub mod demand;
pub mod engine;
pub mod generator;
pub mod hospital;
pub mod orchestrator;

pub use clock::SimClock;
pub use demand::{ContextProvider, DemandSnapshot, ExternalFactors, NeutralContextProvider};
pub use engine::{DiversionPolicy, EngineEvent, EntryStage, FlowEngine, GravityToReference};
pub use generator::PatientGenerator;
pub use hospital::HospitalSimulation;
pub use orchestrator::{HospitalCommand, SimulatorOrchestrator};

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Unknown hospital: {0}")]
    UnknownHospital(String),

    #[error("Unknown consult room: {0}")]
    UnknownConsultRoom(u32),

    #[error("Doctor count out of range: {0} (expected 1..=4)")]
    InvalidDoctorCount(u32),

    #[error("Resource accounting violated: {0}")]
    InvariantViolation(String),

    #[error("Bus error: {0}")]
    Bus(#[from] edt_bus::BusError),
}

pub type Result<T> = std::result::Result<T, SimError>;
