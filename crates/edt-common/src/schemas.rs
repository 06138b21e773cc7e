//! Wire schemas for every recognized bus topic.
//!
//! All payloads are JSON with UTC timestamps. Field names match the wire
//! format consumed by the existing dashboards: English snake_case, except
//! the staffing and incident-distribution topics which retain their
//! original Spanish field names (mapped via `serde(rename)`).
//!
//! Every struct here denies unknown fields so that registry validation can
//! reject malformed payloads at publish time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::triage::TriageLevel;

// ============================================================================
// Core Enums
// ============================================================================

/// Closed set of the three simulated emergency departments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HospitalId {
    #[serde(rename = "chuac")]
    Chuac,
    #[serde(rename = "modelo")]
    Modelo,
    #[serde(rename = "san_rafael")]
    SanRafael,
}

impl HospitalId {
    pub const ALL: [HospitalId; 3] = [HospitalId::Chuac, HospitalId::Modelo, HospitalId::SanRafael];

    /// The single hospital that receives gravity-based diversions.
    pub fn reference_center() -> HospitalId {
        HospitalId::Chuac
    }

    pub fn is_reference_center(self) -> bool {
        self == Self::reference_center()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HospitalId::Chuac => "chuac",
            HospitalId::Modelo => "modelo",
            HospitalId::SanRafael => "san_rafael",
        }
    }

    pub fn parse(s: &str) -> Option<HospitalId> {
        match s {
            "chuac" => Some(HospitalId::Chuac),
            "modelo" => Some(HospitalId::Modelo),
            "san_rafael" => Some(HospitalId::SanRafael),
            _ => None,
        }
    }
}

impl std::fmt::Display for HospitalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    F,
    M,
}

/// Where a patient ended up once the flow engine was done with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatientOutcome {
    Discharge,
    Observation,
    Diverted,
    Error,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsultPhase {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiversionReason {
    Gravity,
    Saturation,
}

/// Severity attached to coordinator alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    Normal,
    Attention,
    Alert,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

// ============================================================================
// Simulator Topics
// ============================================================================

/// One patient presenting at an emergency department. Immutable once
/// published; the triage level is assigned later by the flow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatientArrival {
    pub patient_id: String,
    pub hospital_id: HospitalId,
    pub age: u8,
    pub sex: Sex,
    pub pathology: String,
    pub arrival_time: DateTime<Utc>,
    pub demand_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriageResult {
    pub patient_id: String,
    pub hospital_id: HospitalId,
    pub triage_level: TriageLevel,
    pub box_id: u32,
    pub triage_duration_minutes: f64,
    pub requires_diversion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsultationEvent {
    pub patient_id: String,
    pub hospital_id: HospitalId,
    pub consult_id: u32,
    pub phase: ConsultPhase,
    pub triage_level: TriageLevel,
    pub doctors_attending: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consult_duration_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PatientOutcome>,
}

/// Periodic per-hospital snapshot published every 2 simulated minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HospitalStats {
    pub hospital_id: HospitalId,
    pub desks_busy: u32,
    pub desks_total: u32,
    pub reception_queue: u32,
    pub triage_boxes_busy: u32,
    pub triage_boxes_total: u32,
    pub triage_queue: u32,
    pub consult_rooms_busy: u32,
    pub consult_rooms_total: u32,
    pub consult_queue: u32,
    pub observation_beds_busy: u32,
    pub observation_beds_total: u32,
    pub observation_queue: u32,
    pub mean_triage_wait: f64,
    pub mean_consult_wait: f64,
    pub mean_total_time: f64,
    pub arrivals_last_hour: u32,
    pub attended_last_hour: u32,
    pub diverts_sent: u32,
    pub diverts_received: u32,
    pub global_saturation: f64,
    pub emergency_active: bool,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the demand factors currently applied by a hospital's
/// generator, published every simulated hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemContext {
    pub hospital_id: HospitalId,
    pub temperature: f64,
    pub rain_mm: f64,
    pub condition: String,
    pub hour_factor: f64,
    pub weekday_factor: f64,
    pub month_factor: f64,
    pub weather_factor: f64,
    pub event_factor: f64,
    pub football_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_match: Option<String>,
    pub total_factor: f64,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Coordinator Topics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiversionAlert {
    pub patient_id: String,
    pub origin_hospital: HospitalId,
    pub destination_hospital: HospitalId,
    pub reason: DiversionReason,
    pub triage_level: TriageLevel,
    pub estimated_transfer_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorAlert {
    pub hospital_id: HospitalId,
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HospitalSaturationSummary {
    pub saturation: f64,
    pub is_warning: bool,
    pub is_high: bool,
    pub is_critical: bool,
    pub can_receive_diversions: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiversionCounters {
    pub total: u64,
    pub by_gravity: u64,
    pub by_saturation: u64,
    pub by_origin: BTreeMap<HospitalId, u64>,
    pub by_destination: BTreeMap<HospitalId, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsultRoomSummary {
    pub doctors: u32,
    pub speed_factor: f64,
    pub on_call_doctor_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnCallSummary {
    pub available: u32,
    pub attached: u32,
    pub total: u32,
}

/// Aggregate coordinator view, published every 30 seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorStatus {
    pub status: SystemStatus,
    pub mean_saturation: f64,
    pub critical_count: u32,
    pub saturated_count: u32,
    pub hospitals: BTreeMap<HospitalId, HospitalSaturationSummary>,
    pub diversions: DiversionCounters,
    pub consult_rooms: BTreeMap<u32, ConsultRoomSummary>,
    pub on_call: OnCallSummary,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Staffing Topics (Spanish wire names, consumed by external dashboards)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DoctorAssigned {
    #[serde(rename = "medico_id")]
    pub doctor_id: String,
    #[serde(rename = "medico_nombre")]
    pub doctor_name: String,
    pub hospital_id: HospitalId,
    #[serde(rename = "consulta_id")]
    pub consult_id: u32,
    #[serde(rename = "medicos_totales_consulta")]
    pub doctors_total: u32,
    #[serde(rename = "velocidad_factor")]
    pub speed_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DoctorUnassigned {
    #[serde(rename = "medico_id")]
    pub doctor_id: String,
    pub hospital_id: HospitalId,
    #[serde(rename = "consulta_id")]
    pub consult_id: u32,
    #[serde(rename = "medicos_restantes_consulta")]
    pub doctors_remaining: u32,
    #[serde(rename = "velocidad_factor")]
    pub speed_factor: f64,
    #[serde(rename = "motivo")]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapacityChange {
    pub hospital_id: HospitalId,
    #[serde(rename = "consulta_id")]
    pub consult_id: u32,
    #[serde(rename = "medicos_previos")]
    pub previous_doctors: u32,
    #[serde(rename = "medicos_nuevos")]
    pub new_doctors: u32,
    #[serde(rename = "velocidad_previa")]
    pub previous_speed: f64,
    #[serde(rename = "velocidad_nueva")]
    pub new_speed: f64,
    #[serde(rename = "motivo")]
    pub reason: String,
}

// ============================================================================
// Incident Topics
// ============================================================================

/// One casualty assigned to a hospital by the incident distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncidentPatient {
    pub patient_id: String,
    pub hospital_id: HospitalId,
    pub age: u8,
    pub sex: Sex,
    pub pathology: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncidentDistribution {
    #[serde(rename = "tipo_emergencia")]
    pub kind: String,
    #[serde(rename = "ubicacion", default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(rename = "total_pacientes")]
    pub total_patients: u32,
    #[serde(rename = "distribucion")]
    pub distribution: BTreeMap<HospitalId, u32>,
    #[serde(rename = "analisis")]
    pub analysis: Vec<String>,
}

/// Incident description handed to the distributor. Not itself a bus
/// payload; the distributor publishes [`IncidentDistribution`] and the
/// caller emits one [`IncidentPatient`] per casualty.
#[derive(Debug, Clone)]
pub struct Incident {
    pub incident_id: String,
    pub kind: String,
    pub triage_distribution: Vec<(TriageLevel, f64)>,
    pub total_patients: u32,
    pub location: Option<GeoPoint>,
}

// ============================================================================
// Control Topic
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationControl {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl SimulationControl {
    pub fn start() -> Self {
        Self { command: "start".into(), speed: None }
    }

    pub fn stop() -> Self {
        Self { command: "stop".into(), speed: None }
    }

    pub fn set_speed(speed: f64) -> Self {
        Self { command: "set_speed".into(), speed: Some(speed) }
    }
}

// ============================================================================
// Prediction Topics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionPoint {
    pub hour: u32,
    pub timestamp: DateTime<Utc>,
    pub expected_arrivals: f64,
    pub lower: f64,
    pub upper: f64,
    pub scenario_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionUpdate {
    pub hospital_id: HospitalId,
    pub horizon_hours: u32,
    pub points: Vec<PredictionPoint>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionAlert {
    pub hospital_id: HospitalId,
    pub hour_start: DateTime<Utc>,
    pub observed_arrivals: u32,
    pub expected_arrivals: f64,
    pub lower: f64,
    pub upper: f64,
    pub z_score: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
