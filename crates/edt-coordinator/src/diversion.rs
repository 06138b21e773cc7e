//! Diversion manager.
//!
//! Maps triage results plus the live saturation picture to diversion
//! directives. Rules are evaluated in order; the first that fires wins:
//!
//! 1. Gravity: requires-reference level away from the reference center →
//!    reference center, if it can receive.
//! 2. Saturation: origin above the high threshold and a GREEN/BLUE
//!    patient → least saturated hospital able to receive.

use tracing::info;

use edt_common::schemas::{
    DiversionAlert, DiversionCounters, DiversionReason, HospitalId, TriageResult,
};
use edt_common::triage::TriageLevel;

use crate::saturation::SaturationMonitor;

const DEFAULT_TRANSFER_MINUTES: u32 = 12;

/// Static transfer-time estimates between the hospitals.
pub fn transfer_minutes(origin: HospitalId, destination: HospitalId) -> u32 {
    use HospitalId::*;
    match (origin, destination) {
        (Modelo, Chuac) | (Chuac, Modelo) => 8,
        (SanRafael, Chuac) | (Chuac, SanRafael) => 10,
        (Modelo, SanRafael) | (SanRafael, Modelo) => 15,
        _ => DEFAULT_TRANSFER_MINUTES,
    }
}

pub struct DiversionManager {
    counters: DiversionCounters,
}

impl DiversionManager {
    pub fn new() -> Self {
        Self {
            counters: DiversionCounters::default(),
        }
    }

    /// Decide whether this triage result warrants a diversion. The caller
    /// publishes the returned alert.
    pub fn evaluate(
        &mut self,
        result: &TriageResult,
        monitor: &SaturationMonitor,
    ) -> Option<DiversionAlert> {
        let origin = result.hospital_id;
        let level = result.triage_level;

        // Rule 1: gravity.
        if level.requires_reference() && !origin.is_reference_center() {
            let reference = HospitalId::reference_center();
            let can_receive = monitor
                .state(reference)
                .map(|s| s.can_receive_diversions())
                .unwrap_or(false);
            if can_receive {
                return Some(self.create(result, origin, reference, DiversionReason::Gravity));
            }
            return None;
        }

        // Rule 2: saturation shedding of non-urgent patients.
        if monitor.should_divert_from(origin)
            && matches!(level, TriageLevel::Green | TriageLevel::Blue)
        {
            if let Some(destination) = monitor.least_saturated(Some(origin)) {
                return Some(self.create(result, origin, destination, DiversionReason::Saturation));
            }
        }

        None
    }

    fn create(
        &mut self,
        result: &TriageResult,
        origin: HospitalId,
        destination: HospitalId,
        reason: DiversionReason,
    ) -> DiversionAlert {
        self.counters.total += 1;
        match reason {
            DiversionReason::Gravity => self.counters.by_gravity += 1,
            DiversionReason::Saturation => self.counters.by_saturation += 1,
        }
        *self.counters.by_origin.entry(origin).or_insert(0) += 1;
        *self.counters.by_destination.entry(destination).or_insert(0) += 1;

        info!(
            patient_id = %result.patient_id,
            origin = %origin,
            destination = %destination,
            reason = ?reason,
            level = %result.triage_level,
            "Diversion decided"
        );

        DiversionAlert {
            patient_id: result.patient_id.clone(),
            origin_hospital: origin,
            destination_hospital: destination,
            reason,
            triage_level: result.triage_level,
            estimated_transfer_minutes: transfer_minutes(origin, destination),
        }
    }

    pub fn counters(&self) -> &DiversionCounters {
        &self.counters
    }
}

impl Default for DiversionManager {
    fn default() -> Self {
        Self::new()
    }
}
