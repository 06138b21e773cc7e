//! Bus topic names.
//!
//! Every producer and consumer references these constants; the schema
//! registry in `edt-bus` carries a validator for each entry in [`ALL`].

pub const PATIENT_ARRIVALS: &str = "patient-arrivals";
pub const TRIAGE_RESULTS: &str = "triage-results";
pub const CONSULTATION_EVENTS: &str = "consultation-events";
pub const DIVERSION_ALERTS: &str = "diversion-alerts";
pub const HOSPITAL_STATS: &str = "hospital-stats";
pub const DOCTOR_ASSIGNED: &str = "doctor-assigned";
pub const DOCTOR_UNASSIGNED: &str = "doctor-unassigned";
pub const CAPACITY_CHANGE: &str = "capacity-change";
pub const INCIDENT_PATIENTS: &str = "incident-patients";
pub const INCIDENT_DISTRIBUTION: &str = "incident-distribution";
pub const SIMULATION_CONTROL: &str = "simulation-control";
pub const COORDINATOR_ALERTS: &str = "coordinator-alerts";
pub const COORDINATOR_STATUS: &str = "coordinator-status";
pub const SYSTEM_CONTEXT: &str = "system-context";
pub const PREDICTION_UPDATES: &str = "prediction-updates";
pub const PREDICTION_ALERTS: &str = "prediction-alerts";

/// The complete recognized topic catalogue.
pub const ALL: &[&str] = &[
    PATIENT_ARRIVALS,
    TRIAGE_RESULTS,
    CONSULTATION_EVENTS,
    DIVERSION_ALERTS,
    HOSPITAL_STATS,
    DOCTOR_ASSIGNED,
    DOCTOR_UNASSIGNED,
    CAPACITY_CHANGE,
    INCIDENT_PATIENTS,
    INCIDENT_DISTRIBUTION,
    SIMULATION_CONTROL,
    COORDINATOR_ALERTS,
    COORDINATOR_STATUS,
    SYSTEM_CONTEXT,
    PREDICTION_UPDATES,
    PREDICTION_ALERTS,
];
