//! Patient generator.
//!
//! Synthesizes arrivals with realistic age, sex and pathology, at a rate
//! derived from the hospital's base rate and the current demand factors.
//! Each hospital owns its own seeded RNG so runs are reproducible.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use edt_common::schemas::{HospitalId, PatientArrival, Sex};
use edt_common::triage::TriageLevel;

use crate::demand::DemandSnapshot;

/// Presenting pathologies with their triage-level distributions.
pub const PATHOLOGY_TRIAGE: &[(&str, &[(TriageLevel, f64)])] = &[
    ("dolor_toracico", &[(TriageLevel::Red, 0.3), (TriageLevel::Orange, 0.4), (TriageLevel::Yellow, 0.2), (TriageLevel::Green, 0.1)]),
    ("traumatismo", &[(TriageLevel::Red, 0.1), (TriageLevel::Orange, 0.3), (TriageLevel::Yellow, 0.4), (TriageLevel::Green, 0.2)]),
    ("dolor_abdominal", &[(TriageLevel::Orange, 0.2), (TriageLevel::Yellow, 0.5), (TriageLevel::Green, 0.3)]),
    ("fiebre", &[(TriageLevel::Orange, 0.1), (TriageLevel::Yellow, 0.3), (TriageLevel::Green, 0.5), (TriageLevel::Blue, 0.1)]),
    ("cefalea", &[(TriageLevel::Orange, 0.15), (TriageLevel::Yellow, 0.35), (TriageLevel::Green, 0.4), (TriageLevel::Blue, 0.1)]),
    ("disnea", &[(TriageLevel::Red, 0.2), (TriageLevel::Orange, 0.4), (TriageLevel::Yellow, 0.3), (TriageLevel::Green, 0.1)]),
    ("mareo", &[(TriageLevel::Orange, 0.1), (TriageLevel::Yellow, 0.3), (TriageLevel::Green, 0.5), (TriageLevel::Blue, 0.1)]),
    ("herida", &[(TriageLevel::Orange, 0.1), (TriageLevel::Yellow, 0.3), (TriageLevel::Green, 0.5), (TriageLevel::Blue, 0.1)]),
    ("intoxicacion", &[(TriageLevel::Red, 0.1), (TriageLevel::Orange, 0.3), (TriageLevel::Yellow, 0.4), (TriageLevel::Green, 0.2)]),
    ("fractura", &[(TriageLevel::Orange, 0.3), (TriageLevel::Yellow, 0.5), (TriageLevel::Green, 0.2)]),
    ("quemadura", &[(TriageLevel::Red, 0.1), (TriageLevel::Orange, 0.3), (TriageLevel::Yellow, 0.4), (TriageLevel::Green, 0.2)]),
    ("alergia", &[(TriageLevel::Red, 0.1), (TriageLevel::Orange, 0.2), (TriageLevel::Yellow, 0.4), (TriageLevel::Green, 0.3)]),
    ("gastroenteritis", &[(TriageLevel::Yellow, 0.2), (TriageLevel::Green, 0.6), (TriageLevel::Blue, 0.2)]),
    ("lumbalgia", &[(TriageLevel::Yellow, 0.2), (TriageLevel::Green, 0.6), (TriageLevel::Blue, 0.2)]),
    ("ansiedad", &[(TriageLevel::Yellow, 0.1), (TriageLevel::Green, 0.5), (TriageLevel::Blue, 0.4)]),
    ("conjuntivitis", &[(TriageLevel::Green, 0.3), (TriageLevel::Blue, 0.7)]),
    ("otitis", &[(TriageLevel::Green, 0.4), (TriageLevel::Blue, 0.6)]),
    ("faringitis", &[(TriageLevel::Green, 0.5), (TriageLevel::Blue, 0.5)]),
];

/// Fallback distribution for pathologies outside the catalogue
/// (context-specific ones like "gripe" or incident casualties).
pub const DEFAULT_TRIAGE_WEIGHTS: &[(TriageLevel, f64)] = &[
    (TriageLevel::Yellow, 0.4),
    (TriageLevel::Green, 0.4),
    (TriageLevel::Blue, 0.2),
];

const COLD_PATHOLOGIES: &[&str] = &["gripe", "neumonia", "bronquitis", "hipotermia"];
const HEAT_PATHOLOGIES: &[&str] = &["golpe_calor", "deshidratacion", "quemadura_solar"];
const RAIN_PATHOLOGIES: &[&str] = &["traumatismo", "fractura"];
const EVENT_PATHOLOGIES: &[&str] = &["intoxicacion", "traumatismo", "herida"];
const SPORT_PATHOLOGIES: &[&str] = &["traumatismo", "fractura", "esguince", "contusion"];

/// Age buckets with their population weights.
const AGE_BUCKETS: [(u8, u8, f64); 7] = [
    (0, 5, 0.08),
    (6, 17, 0.12),
    (18, 35, 0.22),
    (36, 55, 0.25),
    (56, 70, 0.18),
    (71, 85, 0.12),
    (86, 100, 0.03),
];

pub fn triage_weights(pathology: &str) -> &'static [(TriageLevel, f64)] {
    PATHOLOGY_TRIAGE
        .iter()
        .find(|(name, _)| *name == pathology)
        .map(|(_, weights)| *weights)
        .unwrap_or(DEFAULT_TRIAGE_WEIGHTS)
}

pub struct PatientGenerator {
    hospital: HospitalId,
    rng: StdRng,
}

impl PatientGenerator {
    pub fn new(hospital: HospitalId, seed: u64) -> Self {
        Self {
            hospital,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Current arrival rate in patients/hour, with per-draw ±20% spread.
    /// The demand factor is already clamped, so the rate stays within
    /// [0.5, 3.0]× base before the spread.
    pub fn arrival_rate(&mut self, total_factor: f64) -> f64 {
        let base = self.hospital.config().base_hourly_arrivals;
        let spread = self.rng.gen_range(0.8..1.2);
        base * total_factor * spread
    }

    /// Minutes until the next arrival, exponentially distributed around
    /// `60 / rate`.
    pub fn next_interarrival_minutes(&mut self, rate_per_hour: f64) -> f64 {
        let rate = rate_per_hour.max(0.01);
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        -u.ln() * 60.0 / rate
    }

    pub fn generate(&mut self, snapshot: &DemandSnapshot, wall_time: DateTime<Utc>) -> PatientArrival {
        let age = self.sample_age();
        let sex = if self.rng.gen_bool(0.52) { Sex::F } else { Sex::M };
        let pathology = self.sample_pathology(snapshot);

        PatientArrival {
            patient_id: Uuid::new_v4().to_string(),
            hospital_id: self.hospital,
            age,
            sex,
            pathology,
            arrival_time: wall_time,
            demand_factor: snapshot.total_factor,
        }
    }

    fn sample_age(&mut self) -> u8 {
        let r: f64 = self.rng.gen();
        let mut cumulative = 0.0;
        for (min, max, weight) in AGE_BUCKETS {
            cumulative += weight;
            if r <= cumulative {
                return self.rng.gen_range(min..=max);
            }
        }
        self.rng.gen_range(30..=50)
    }

    /// Base catalogue plus context-weighted extensions: cold weather pulls
    /// in respiratory cases, events pull in trauma, and so on.
    fn sample_pathology(&mut self, snapshot: &DemandSnapshot) -> String {
        let mut candidates: Vec<&str> = PATHOLOGY_TRIAGE.iter().map(|(name, _)| *name).collect();

        if snapshot.is_cold() {
            for _ in 0..3 {
                candidates.extend_from_slice(COLD_PATHOLOGIES);
            }
        }
        if snapshot.is_hot() {
            for _ in 0..3 {
                candidates.extend_from_slice(HEAT_PATHOLOGIES);
            }
        }
        if snapshot.is_raining() {
            for _ in 0..2 {
                candidates.extend_from_slice(RAIN_PATHOLOGIES);
            }
        }
        if snapshot.active_event.is_some() {
            for _ in 0..2 {
                candidates.extend_from_slice(EVENT_PATHOLOGIES);
            }
        }
        if snapshot.active_match.is_some() {
            for _ in 0..2 {
                candidates.extend_from_slice(SPORT_PATHOLOGIES);
            }
        }

        let idx = self.rng.gen_range(0..candidates.len());
        candidates[idx].to_string()
    }
}
