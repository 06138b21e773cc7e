//! Scaling controller for the reference center.
//!
//! Manages the on-call doctor pool and the per-consult-room doctor counts.
//! Scale-ups pop doctors from the pool head; scale-downs detach the most
//! recently attached doctor and return it to the pool tail. A scale-up
//! without enough on-call doctors fails whole; there is no partial
//! application.

use indexmap::IndexMap;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

use edt_common::schemas::{
    CapacityChange, ConsultRoomSummary, DoctorAssigned, DoctorUnassigned, HospitalId,
    OnCallSummary,
};

/// Autoscale thresholds on the reference center's saturation.
pub const THRESHOLD_SCALE_UP: f64 = 0.80;
pub const THRESHOLD_SCALE_DOWN: f64 = 0.50;

pub const MIN_DOCTORS: u32 = 1;
pub const MAX_DOCTORS: u32 = 4;

#[derive(Error, Debug)]
pub enum ScalingError {
    #[error("Insufficient on-call doctors: need {needed}, have {available}")]
    InsufficientOnCall { needed: u32, available: u32 },

    #[error("Unknown consult room: {0}")]
    UnknownConsultRoom(u32),

    #[error("Doctor count out of range: {0} (expected 1..=4)")]
    InvalidDoctorCount(u32),
}

#[derive(Debug, Clone)]
pub struct OnCallDoctor {
    pub id: String,
    pub name: String,
    pub available: bool,
}

/// Events produced by a scaling operation, in publish order: one per
/// doctor moved, then a single capacity change.
#[derive(Debug, Clone)]
pub enum ScalingEvent {
    Assigned(DoctorAssigned),
    Unassigned(DoctorUnassigned),
    Capacity(CapacityChange),
}

#[derive(Debug)]
struct ConsultRoom {
    doctors: u32,
    /// On-call doctors currently attached, oldest first.
    attached: Vec<OnCallDoctor>,
}

pub struct ScalingController {
    hospital: HospitalId,
    rooms: IndexMap<u32, ConsultRoom>,
    pool: VecDeque<OnCallDoctor>,
}

impl ScalingController {
    pub fn new() -> Self {
        let hospital = HospitalId::reference_center();
        let rooms = (1..=hospital.config().consult_rooms)
            .map(|id| {
                (
                    id,
                    ConsultRoom {
                        doctors: MIN_DOCTORS,
                        attached: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            hospital,
            rooms,
            pool: VecDeque::new(),
        }
    }

    /// Replace the free pool. Doctors already attached to a consult room
    /// are not disturbed; only unavailable entries are filtered out.
    pub fn set_on_call_pool(&mut self, entries: Vec<OnCallDoctor>) {
        self.pool = entries.into_iter().filter(|d| d.available).collect();
        info!(available = self.pool.len(), "On-call pool replaced");
    }

    pub fn doctors_assigned(&self, consult_id: u32) -> Option<u32> {
        self.rooms.get(&consult_id).map(|r| r.doctors)
    }

    pub fn available_on_call(&self) -> u32 {
        self.pool.len() as u32
    }

    pub fn attached_on_call(&self) -> u32 {
        self.rooms.values().map(|r| r.attached.len() as u32).sum()
    }

    /// Scale one consult room to a target doctor count, emitting the
    /// corresponding staffing events. No-op when already at target.
    pub fn scale_consult(
        &mut self,
        consult_id: u32,
        target: u32,
        reason: &str,
    ) -> Result<Vec<ScalingEvent>, ScalingError> {
        if !(MIN_DOCTORS..=MAX_DOCTORS).contains(&target) {
            return Err(ScalingError::InvalidDoctorCount(target));
        }
        let current = self
            .rooms
            .get(&consult_id)
            .map(|r| r.doctors)
            .ok_or(ScalingError::UnknownConsultRoom(consult_id))?;

        if target == current {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();

        if target > current {
            let needed = target - current;
            let available = self.pool.len() as u32;
            if available < needed {
                warn!(
                    consult_id = consult_id,
                    needed = needed,
                    available = available,
                    "Scale-up rejected, not enough on-call doctors"
                );
                return Err(ScalingError::InsufficientOnCall { needed, available });
            }

            let room = self.rooms.get_mut(&consult_id).expect("room checked");
            for _ in 0..needed {
                let doctor = self.pool.pop_front().expect("pool size checked");
                room.doctors += 1;
                events.push(ScalingEvent::Assigned(DoctorAssigned {
                    doctor_id: doctor.id.clone(),
                    doctor_name: doctor.name.clone(),
                    hospital_id: self.hospital,
                    consult_id,
                    doctors_total: room.doctors,
                    speed_factor: speed_factor(room.doctors),
                }));
                room.attached.push(doctor);
            }
        } else {
            let room = self.rooms.get_mut(&consult_id).expect("room checked");
            for _ in 0..(current - target) {
                // Youngest attachment goes back first, to the pool tail.
                let Some(doctor) = room.attached.pop() else {
                    // Base staffing is not detachable.
                    break;
                };
                room.doctors -= 1;
                events.push(ScalingEvent::Unassigned(DoctorUnassigned {
                    doctor_id: doctor.id.clone(),
                    hospital_id: self.hospital,
                    consult_id,
                    doctors_remaining: room.doctors,
                    speed_factor: speed_factor(room.doctors),
                    reason: "reduccion_carga".to_string(),
                }));
                self.pool.push_back(doctor);
            }
        }

        let new_doctors = self.rooms[&consult_id].doctors;
        events.push(ScalingEvent::Capacity(CapacityChange {
            hospital_id: self.hospital,
            consult_id,
            previous_doctors: current,
            new_doctors,
            previous_speed: speed_factor(current),
            new_speed: speed_factor(new_doctors),
            reason: reason.to_string(),
        }));

        info!(
            consult_id = consult_id,
            previous = current,
            new = new_doctors,
            reason = %reason,
            "Consult room scaled"
        );
        Ok(events)
    }

    /// Evaluate autoscaling against the reference center's saturation. At
    /// most one room changes per call.
    pub fn auto_scale(&mut self, saturation: f64) -> Vec<ScalingEvent> {
        if saturation >= THRESHOLD_SCALE_UP {
            let candidate = self
                .rooms
                .iter()
                .find(|(_, room)| room.doctors < MAX_DOCTORS)
                .map(|(id, room)| (*id, room.doctors + 1));
            if let Some((consult_id, target)) = candidate {
                match self.scale_consult(consult_id, target, "autoescalado") {
                    Ok(events) => return events,
                    Err(e) => debug!(error = %e, "Autoscale up skipped"),
                }
            }
        } else if saturation <= THRESHOLD_SCALE_DOWN {
            let candidate = self
                .rooms
                .iter()
                .find(|(_, room)| room.doctors > MIN_DOCTORS)
                .map(|(id, room)| (*id, room.doctors - 1));
            if let Some((consult_id, target)) = candidate {
                match self.scale_consult(consult_id, target, "autoescalado") {
                    Ok(events) => return events,
                    Err(e) => debug!(error = %e, "Autoscale down skipped"),
                }
            }
        }
        Vec::new()
    }

    pub fn room_summaries(&self) -> BTreeMap<u32, ConsultRoomSummary> {
        self.rooms
            .iter()
            .map(|(id, room)| {
                (
                    *id,
                    ConsultRoomSummary {
                        doctors: room.doctors,
                        speed_factor: speed_factor(room.doctors),
                        on_call_doctor_ids: room.attached.iter().map(|d| d.id.clone()).collect(),
                    },
                )
            })
            .collect()
    }

    pub fn on_call_summary(&self) -> OnCallSummary {
        let available = self.available_on_call();
        let attached = self.attached_on_call();
        OnCallSummary {
            available,
            attached,
            total: available + attached,
        }
    }
}

impl Default for ScalingController {
    fn default() -> Self {
        Self::new()
    }
}

/// Consult speed divisor; saturates at four doctors.
pub fn speed_factor(doctors: u32) -> f64 {
    f64::from(doctors.min(MAX_DOCTORS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u32) -> Vec<OnCallDoctor> {
        (1..=n)
            .map(|i| OnCallDoctor {
                id: format!("doc-{i}"),
                name: format!("On-call {i}"),
                available: true,
            })
            .collect()
    }

    #[test]
    fn scale_up_pops_pool_head_and_emits_events() {
        let mut controller = ScalingController::new();
        controller.set_on_call_pool(pool(3));

        let events = controller.scale_consult(2, 3, "escalado_manual").unwrap();
        assert_eq!(controller.doctors_assigned(2), Some(3));
        assert_eq!(controller.available_on_call(), 1);

        // Two assignments then one capacity change.
        assert_eq!(events.len(), 3);
        match (&events[0], &events[1], &events[2]) {
            (
                ScalingEvent::Assigned(a1),
                ScalingEvent::Assigned(a2),
                ScalingEvent::Capacity(change),
            ) => {
                assert_eq!(a1.doctor_id, "doc-1");
                assert_eq!(a2.doctor_id, "doc-2");
                assert_eq!(a1.doctors_total, 2);
                assert_eq!(a2.doctors_total, 3);
                assert_eq!(change.previous_doctors, 1);
                assert_eq!(change.new_doctors, 3);
                assert_eq!(change.new_speed, 3.0);
            }
            other => panic!("unexpected event shape: {other:?}"),
        }
    }

    #[test]
    fn scale_up_with_empty_pool_fails_whole() {
        let mut controller = ScalingController::new();
        let err = controller.scale_consult(3, 2, "escalado_manual").unwrap_err();
        assert!(matches!(
            err,
            ScalingError::InsufficientOnCall { needed: 1, available: 0 }
        ));
        // No partial application, no events, room untouched.
        assert_eq!(controller.doctors_assigned(3), Some(1));
    }

    #[test]
    fn scale_down_releases_youngest_to_pool_tail() {
        let mut controller = ScalingController::new();
        controller.set_on_call_pool(pool(3));
        controller.scale_consult(1, 4, "escalado_manual").unwrap();
        assert_eq!(controller.available_on_call(), 0);

        let events = controller.scale_consult(1, 3, "escalado_manual").unwrap();
        match &events[0] {
            ScalingEvent::Unassigned(u) => {
                // doc-3 attached last, detached first.
                assert_eq!(u.doctor_id, "doc-3");
                assert_eq!(u.doctors_remaining, 3);
            }
            other => panic!("expected unassignment, got {other:?}"),
        }
        // Released doctor goes to the tail.
        assert_eq!(controller.available_on_call(), 1);

        // Scaling back up reuses the released doctor from the head.
        let events = controller.scale_consult(1, 4, "escalado_manual").unwrap();
        match &events[0] {
            ScalingEvent::Assigned(a) => assert_eq!(a.doctor_id, "doc-3"),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn doctors_are_conserved_across_operations() {
        fn total(controller: &ScalingController) -> u32 {
            controller.available_on_call() + controller.attached_on_call()
        }

        let mut controller = ScalingController::new();
        controller.set_on_call_pool(pool(5));
        assert_eq!(total(&controller), 5);

        controller.scale_consult(1, 4, "m").unwrap();
        assert_eq!(total(&controller), 5);
        controller.scale_consult(2, 3, "m").unwrap();
        assert_eq!(total(&controller), 5);
        controller.scale_consult(1, 1, "m").unwrap();
        assert_eq!(total(&controller), 5);
        assert!(controller.scale_consult(3, 4, "m").is_ok());
        assert_eq!(total(&controller), 5);
    }

    #[test]
    fn no_op_when_already_at_target() {
        let mut controller = ScalingController::new();
        controller.set_on_call_pool(pool(1));
        let events = controller.scale_consult(1, 1, "m").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn capacity_change_matches_correlated_events() {
        let mut controller = ScalingController::new();
        controller.set_on_call_pool(pool(4));

        for (from, to) in [(1u32, 4u32), (4, 2), (2, 3)] {
            let events = controller.scale_consult(5, to, "m").unwrap();
            let moves = events
                .iter()
                .filter(|e| !matches!(e, ScalingEvent::Capacity(_)))
                .count() as u32;
            let change = events
                .iter()
                .find_map(|e| match e {
                    ScalingEvent::Capacity(c) => Some(c.clone()),
                    _ => None,
                })
                .unwrap();
            assert_eq!(change.previous_doctors, from);
            assert_eq!(change.new_doctors, to);
            assert!((1..=4).contains(&change.new_doctors));
            assert_eq!(change.new_doctors.abs_diff(change.previous_doctors), moves);
        }
    }

    #[test]
    fn autoscale_changes_at_most_one_room_per_event() {
        let mut controller = ScalingController::new();
        controller.set_on_call_pool(pool(6));

        let events = controller.auto_scale(0.85);
        let capacity_changes = events
            .iter()
            .filter(|e| matches!(e, ScalingEvent::Capacity(_)))
            .count();
        assert_eq!(capacity_changes, 1);
        assert_eq!(controller.doctors_assigned(1), Some(2));
        assert_eq!(controller.doctors_assigned(2), Some(1));

        // Mid-band saturation does nothing.
        assert!(controller.auto_scale(0.65).is_empty());

        // Low saturation releases one doctor from the first staffed room.
        let events = controller.auto_scale(0.40);
        assert_eq!(events.len(), 2);
        assert_eq!(controller.doctors_assigned(1), Some(1));
    }

    #[test]
    fn autoscale_with_empty_pool_is_quiet() {
        let mut controller = ScalingController::new();
        assert!(controller.auto_scale(0.95).is_empty());
    }

    #[test]
    fn pool_replacement_keeps_attached_doctors() {
        let mut controller = ScalingController::new();
        controller.set_on_call_pool(pool(2));
        controller.scale_consult(1, 3, "m").unwrap();
        assert_eq!(controller.attached_on_call(), 2);

        controller.set_on_call_pool(vec![OnCallDoctor {
            id: "fresh-1".into(),
            name: "Fresh".into(),
            available: true,
        }]);
        assert_eq!(controller.attached_on_call(), 2);
        assert_eq!(controller.available_on_call(), 1);
        assert_eq!(controller.doctors_assigned(1), Some(3));
    }

    #[test]
    fn unavailable_entries_are_filtered() {
        let mut controller = ScalingController::new();
        let mut entries = pool(2);
        entries[1].available = false;
        controller.set_on_call_pool(entries);
        assert_eq!(controller.available_on_call(), 1);
    }

    #[test]
    fn rejects_bad_rooms_and_counts() {
        let mut controller = ScalingController::new();
        assert!(matches!(
            controller.scale_consult(99, 2, "m"),
            Err(ScalingError::UnknownConsultRoom(99))
        ));
        assert!(matches!(
            controller.scale_consult(1, 0, "m"),
            Err(ScalingError::InvalidDoctorCount(0))
        ));
        assert!(matches!(
            controller.scale_consult(1, 5, "m"),
            Err(ScalingError::InvalidDoctorCount(5))
        ));
    }
}
