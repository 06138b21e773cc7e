//! Process-wide schema registry.
//!
//! Maps every recognized topic to a validator that parses the payload into
//! its typed schema and re-serializes it into the canonical record shape
//! (enumerations narrowed, unknown fields rejected, timestamps as UTC
//! RFC 3339). Topics without a registered schema validate as a no-op.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use edt_common::schemas::*;
use edt_common::topics;

use crate::{BusError, Result};

type Validator = fn(&Value) -> std::result::Result<Value, String>;

fn validate_as<T: DeserializeOwned + Serialize>(value: &Value) -> std::result::Result<Value, String> {
    let typed: T = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    serde_json::to_value(&typed).map_err(|e| e.to_string())
}

/// The topic → schema catalogue. One instance per process; obtain it via
/// [`SchemaRegistry::global`].
pub struct SchemaRegistry {
    validators: HashMap<&'static str, Validator>,
}

impl SchemaRegistry {
    pub fn global() -> &'static SchemaRegistry {
        static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();
        REGISTRY.get_or_init(SchemaRegistry::new)
    }

    fn new() -> Self {
        let mut validators: HashMap<&'static str, Validator> = HashMap::new();
        validators.insert(topics::PATIENT_ARRIVALS, validate_as::<PatientArrival>);
        validators.insert(topics::TRIAGE_RESULTS, validate_as::<TriageResult>);
        validators.insert(topics::CONSULTATION_EVENTS, validate_as::<ConsultationEvent>);
        validators.insert(topics::DIVERSION_ALERTS, validate_as::<DiversionAlert>);
        validators.insert(topics::HOSPITAL_STATS, validate_as::<HospitalStats>);
        validators.insert(topics::DOCTOR_ASSIGNED, validate_as::<DoctorAssigned>);
        validators.insert(topics::DOCTOR_UNASSIGNED, validate_as::<DoctorUnassigned>);
        validators.insert(topics::CAPACITY_CHANGE, validate_as::<CapacityChange>);
        validators.insert(topics::INCIDENT_PATIENTS, validate_as::<IncidentPatient>);
        validators.insert(topics::INCIDENT_DISTRIBUTION, validate_as::<IncidentDistribution>);
        validators.insert(topics::SIMULATION_CONTROL, validate_as::<SimulationControl>);
        validators.insert(topics::COORDINATOR_ALERTS, validate_as::<CoordinatorAlert>);
        validators.insert(topics::COORDINATOR_STATUS, validate_as::<CoordinatorStatus>);
        validators.insert(topics::SYSTEM_CONTEXT, validate_as::<SystemContext>);
        validators.insert(topics::PREDICTION_UPDATES, validate_as::<PredictionUpdate>);
        validators.insert(topics::PREDICTION_ALERTS, validate_as::<PredictionAlert>);
        Self { validators }
    }

    /// Validate a payload against the topic's schema, returning the
    /// canonical record. Unknown topics pass through unchanged.
    pub fn validate(&self, topic: &str, payload: &Value) -> Result<Value> {
        match self.validators.get(topic) {
            Some(validator) => validator(payload).map_err(|reason| BusError::InvalidPayload {
                topic: topic.to_string(),
                reason,
            }),
            None => Ok(payload.clone()),
        }
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.validators.contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_recognized_topic_has_a_schema() {
        let registry = SchemaRegistry::global();
        for topic in topics::ALL {
            assert!(registry.is_registered(topic), "missing schema for {topic}");
        }
    }

    #[test]
    fn valid_payload_is_canonicalized() {
        let registry = SchemaRegistry::global();
        let payload = json!({
            "command": "set_speed",
            "speed": 10.0,
        });
        let canonical = registry.validate(topics::SIMULATION_CONTROL, &payload).unwrap();
        assert_eq!(canonical["command"], "set_speed");
    }

    #[test]
    fn unknown_field_fails_validation() {
        let registry = SchemaRegistry::global();
        let payload = json!({
            "command": "stop",
            "who": "me",
        });
        let err = registry.validate(topics::SIMULATION_CONTROL, &payload).unwrap_err();
        assert!(matches!(err, BusError::InvalidPayload { .. }));
    }

    #[test]
    fn unknown_topic_is_a_no_op() {
        let registry = SchemaRegistry::global();
        let payload = json!({"anything": 1});
        let out = registry.validate("not-a-topic", &payload).unwrap();
        assert_eq!(out, payload);
    }
}
