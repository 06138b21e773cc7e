//! Saturation monitor.
//!
//! Keeps a derived state per hospital from `hospital-stats` snapshots and
//! fires alert callbacks on threshold crossings. Alerts are debounced: a
//! callback fires only when the classified level differs from the last
//! reported one for that hospital.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use tracing::error;

use edt_common::schemas::{
    AlertLevel, HospitalId, HospitalSaturationSummary, HospitalStats, SystemStatus,
};

pub const THRESHOLD_WARNING: f64 = 0.70;
pub const THRESHOLD_HIGH: f64 = 0.85;
pub const THRESHOLD_CRITICAL: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationLevel {
    Normal,
    Warning,
    High,
    Critical,
}

pub fn classify(saturation: f64) -> SaturationLevel {
    if saturation > THRESHOLD_CRITICAL {
        SaturationLevel::Critical
    } else if saturation > THRESHOLD_HIGH {
        SaturationLevel::High
    } else if saturation > THRESHOLD_WARNING {
        SaturationLevel::Warning
    } else {
        SaturationLevel::Normal
    }
}

/// Derived per-hospital state.
#[derive(Debug, Clone)]
pub struct HospitalState {
    pub hospital_id: HospitalId,
    pub saturation: f64,
    pub triage_boxes_busy: u32,
    pub triage_boxes_total: u32,
    pub consult_rooms_busy: u32,
    pub consult_rooms_total: u32,
    pub triage_queue: u32,
    pub consult_queue: u32,
    pub mean_triage_wait: f64,
    pub mean_consult_wait: f64,
    pub emergency_active: bool,
    pub last_update: DateTime<Utc>,
}

impl HospitalState {
    fn new(hospital_id: HospitalId) -> Self {
        let config = hospital_id.config();
        Self {
            hospital_id,
            saturation: 0.0,
            triage_boxes_busy: 0,
            triage_boxes_total: config.triage_boxes,
            consult_rooms_busy: 0,
            consult_rooms_total: config.consult_rooms,
            triage_queue: 0,
            consult_queue: 0,
            mean_triage_wait: 0.0,
            mean_consult_wait: 0.0,
            emergency_active: false,
            last_update: Utc::now(),
        }
    }

    pub fn is_warning(&self) -> bool {
        self.saturation > THRESHOLD_WARNING
    }

    pub fn is_high(&self) -> bool {
        self.saturation > THRESHOLD_HIGH
    }

    pub fn is_critical(&self) -> bool {
        self.saturation > THRESHOLD_CRITICAL
    }

    pub fn can_receive_diversions(&self) -> bool {
        self.saturation < THRESHOLD_WARNING
    }

    pub fn free_boxes_ratio(&self) -> f64 {
        if self.triage_boxes_total == 0 {
            return 0.0;
        }
        f64::from(self.triage_boxes_total - self.triage_boxes_busy)
            / f64::from(self.triage_boxes_total)
    }

    fn summary(&self) -> HospitalSaturationSummary {
        HospitalSaturationSummary {
            saturation: self.saturation,
            is_warning: self.is_warning(),
            is_high: self.is_high(),
            is_critical: self.is_critical(),
            can_receive_diversions: self.can_receive_diversions(),
        }
    }
}

/// Aggregate system view, composed into `coordinator-status`.
#[derive(Debug, Clone)]
pub struct SystemStatusSnapshot {
    pub status: SystemStatus,
    pub mean_saturation: f64,
    pub critical_count: u32,
    pub saturated_count: u32,
    pub hospitals: BTreeMap<HospitalId, HospitalSaturationSummary>,
}

type AlertCallback = Box<dyn Fn(HospitalId, AlertLevel, &str) + Send + Sync>;

pub struct SaturationMonitor {
    /// Insertion order doubles as the tie-break for `least_saturated`.
    states: IndexMap<HospitalId, HospitalState>,
    last_reported: HashMap<HospitalId, SaturationLevel>,
    callbacks: Vec<AlertCallback>,
}

impl SaturationMonitor {
    pub fn new() -> Self {
        let mut states = IndexMap::new();
        for hospital in HospitalId::ALL {
            states.insert(hospital, HospitalState::new(hospital));
        }
        Self {
            states,
            last_reported: HashMap::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn register_alert_callback<F>(&mut self, callback: F)
    where
        F: Fn(HospitalId, AlertLevel, &str) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Fold one stats snapshot into the derived state and fire alert
    /// callbacks on a level transition.
    pub fn update_from_stats(&mut self, stats: &HospitalStats) {
        let Some(state) = self.states.get_mut(&stats.hospital_id) else {
            return;
        };
        state.saturation = stats.global_saturation;
        state.triage_boxes_busy = stats.triage_boxes_busy;
        state.triage_boxes_total = stats.triage_boxes_total;
        state.consult_rooms_busy = stats.consult_rooms_busy;
        state.consult_rooms_total = stats.consult_rooms_total;
        state.triage_queue = stats.triage_queue;
        state.consult_queue = stats.consult_queue;
        state.mean_triage_wait = stats.mean_triage_wait;
        state.mean_consult_wait = stats.mean_consult_wait;
        state.emergency_active = stats.emergency_active;
        state.last_update = Utc::now();

        self.check_thresholds(stats.hospital_id);
    }

    fn check_thresholds(&mut self, hospital: HospitalId) {
        let Some(state) = self.states.get(&hospital) else {
            return;
        };
        let level = classify(state.saturation);
        let previous = self.last_reported.get(&hospital).copied();
        if previous == Some(level) || (previous.is_none() && level == SaturationLevel::Normal) {
            return;
        }
        self.last_reported.insert(hospital, level);

        let display = hospital.config().display_name;
        let pct = state.saturation * 100.0;
        let (alert_level, message) = match level {
            SaturationLevel::Critical => (
                AlertLevel::Critical,
                format!("CRITICAL: {display} at {pct:.0}% capacity"),
            ),
            SaturationLevel::High => (
                AlertLevel::Warning,
                format!("ALERT: {display} at {pct:.0}% capacity"),
            ),
            SaturationLevel::Warning => (
                AlertLevel::Info,
                format!("NOTICE: {display} at {pct:.0}% capacity"),
            ),
            SaturationLevel::Normal => (
                AlertLevel::Info,
                format!("{display} back to normal load ({pct:.0}%)"),
            ),
        };
        self.emit_alert(hospital, alert_level, &message);
    }

    fn emit_alert(&self, hospital: HospitalId, level: AlertLevel, message: &str) {
        for callback in &self.callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(hospital, level, message)
            }));
            if result.is_err() {
                error!(hospital = %hospital, "Alert callback panicked");
            }
        }
    }

    pub fn state(&self, hospital: HospitalId) -> Option<&HospitalState> {
        self.states.get(&hospital)
    }

    pub fn states(&self) -> impl Iterator<Item = &HospitalState> {
        self.states.values()
    }

    /// The hospital with the lowest saturation that can still receive
    /// diversions. Ties break by insertion order; none below the warning
    /// threshold means no candidate.
    pub fn least_saturated(&self, exclude: Option<HospitalId>) -> Option<HospitalId> {
        let mut best: Option<&HospitalState> = None;
        for state in self.states.values() {
            if Some(state.hospital_id) == exclude || !state.can_receive_diversions() {
                continue;
            }
            match best {
                Some(current) if state.saturation >= current.saturation => {}
                _ => best = Some(state),
            }
        }
        best.map(|s| s.hospital_id)
    }

    /// A hospital above the high threshold should shed non-urgent load.
    pub fn should_divert_from(&self, hospital: HospitalId) -> bool {
        self.states
            .get(&hospital)
            .map(|s| s.is_high())
            .unwrap_or(false)
    }

    pub fn system_status(&self) -> SystemStatusSnapshot {
        let count = self.states.len().max(1) as f64;
        let mean = self.states.values().map(|s| s.saturation).sum::<f64>() / count;
        let critical_count = self.states.values().filter(|s| s.is_critical()).count() as u32;
        let saturated_count = self.states.values().filter(|s| s.is_high()).count() as u32;

        let status = if critical_count > 0 {
            SystemStatus::Critical
        } else if saturated_count > 0 {
            SystemStatus::Alert
        } else if mean > THRESHOLD_WARNING {
            SystemStatus::Attention
        } else {
            SystemStatus::Normal
        };

        SystemStatusSnapshot {
            status,
            mean_saturation: (mean * 1000.0).round() / 1000.0,
            critical_count,
            saturated_count,
            hospitals: self
                .states
                .values()
                .map(|s| (s.hospital_id, s.summary()))
                .collect(),
        }
    }
}

impl Default for SaturationMonitor {
    fn default() -> Self {
        Self::new()
    }
}
