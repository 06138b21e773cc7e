//! Incident distributor.
//!
//! Scores each hospital on distance, saturation, estimated wait and free
//! triage boxes, inverts the scores into apportionment weights and splits
//! the casualty count. The caller publishes the distribution and emits one
//! `incident-patients` record per casualty.

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::BTreeMap;
use uuid::Uuid;

use edt_common::schemas::{GeoPoint, HospitalId, Incident, IncidentDistribution, IncidentPatient, Sex};
use edt_common::triage::TriageLevel;

use crate::saturation::SaturationMonitor;

const WEIGHT_DISTANCE: f64 = 0.30;
const WEIGHT_SATURATION: f64 = 0.35;
const WEIGHT_WAIT: f64 = 0.25;
const WEIGHT_BOXES: f64 = 0.10;

/// Distance that saturates the distance component.
const DISTANCE_SCALE_KM: f64 = 10.0;
/// Wait that saturates the wait component.
const WAIT_SCALE_MINUTES: f64 = 120.0;
/// Tiebreaker added to the max score before inversion.
const EPSILON: f64 = 0.01;
/// Normalized weight below which a hospital receives nothing.
const MIN_SHARE: f64 = 0.1;

pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let r = 6371.0;
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * r * h.sqrt().asin()
}

/// Casualty pathologies by sampled triage level.
fn pathology_for(level: TriageLevel, rng: &mut StdRng) -> &'static str {
    let options: &[&str] = match level {
        TriageLevel::Red => &["traumatismo", "quemadura", "dolor_toracico"],
        TriageLevel::Orange => &["traumatismo", "fractura", "intoxicacion"],
        TriageLevel::Yellow => &["fractura", "herida", "traumatismo"],
        TriageLevel::Green => &["herida", "contusion", "esguince"],
        TriageLevel::Blue => &["contusion", "ansiedad"],
    };
    options[rng.gen_range(0..options.len())]
}

pub struct IncidentDistributor;

impl IncidentDistributor {
    pub fn new() -> Self {
        Self
    }

    /// Apportion the incident's casualties across hospitals, lower scores
    /// receiving more. Degenerate (all-equal) scores split evenly.
    pub fn distribute(
        &self,
        incident: &Incident,
        monitor: &SaturationMonitor,
    ) -> BTreeMap<HospitalId, u32> {
        let scores: Vec<(HospitalId, f64)> = monitor
            .states()
            .map(|state| {
                let config = state.hospital_id.config();
                let distance = match incident.location {
                    Some(location) => {
                        let km = haversine_km(
                            location,
                            GeoPoint {
                                lat: config.lat,
                                lon: config.lon,
                            },
                        );
                        (km / DISTANCE_SCALE_KM).clamp(0.0, 1.0)
                    }
                    None => 0.5,
                };
                let saturation = state.saturation.clamp(0.0, 1.0);
                let wait = (state.mean_consult_wait / WAIT_SCALE_MINUTES).clamp(0.0, 1.0);
                let busy_boxes = 1.0 - state.free_boxes_ratio();

                let score = distance * WEIGHT_DISTANCE
                    + saturation * WEIGHT_SATURATION
                    + wait * WEIGHT_WAIT
                    + busy_boxes * WEIGHT_BOXES;
                (state.hospital_id, score)
            })
            .collect();

        apportion(&scores, incident.total_patients)
    }

    /// Build the distribution payload for `incident-distribution`.
    pub fn distribution_payload(
        &self,
        incident: &Incident,
        distribution: &BTreeMap<HospitalId, u32>,
    ) -> IncidentDistribution {
        let analysis = distribution
            .iter()
            .map(|(hospital, count)| {
                format!("{}: {count} casualties", hospital.config().display_name)
            })
            .collect();
        IncidentDistribution {
            kind: incident.kind.clone(),
            location: incident.location,
            total_patients: incident.total_patients,
            distribution: distribution.clone(),
            analysis,
        }
    }

    /// Synthesize one casualty record per assigned slot, with pathologies
    /// drawn to match the incident's triage distribution.
    pub fn casualties(
        &self,
        incident: &Incident,
        distribution: &BTreeMap<HospitalId, u32>,
        rng: &mut StdRng,
    ) -> Vec<IncidentPatient> {
        let mut casualties = Vec::new();
        for (hospital, count) in distribution {
            for _ in 0..*count {
                let level = sample_level(&incident.triage_distribution, rng);
                casualties.push(IncidentPatient {
                    patient_id: Uuid::new_v4().to_string(),
                    hospital_id: *hospital,
                    age: rng.gen_range(16..=80),
                    sex: if rng.gen_bool(0.5) { Sex::F } else { Sex::M },
                    pathology: pathology_for(level, rng).to_string(),
                });
            }
        }
        casualties
    }
}

impl Default for IncidentDistributor {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_level(distribution: &[(TriageLevel, f64)], rng: &mut StdRng) -> TriageLevel {
    if distribution.is_empty() {
        return TriageLevel::Yellow;
    }
    let total: f64 = distribution.iter().map(|(_, w)| w).sum();
    let r: f64 = rng.gen_range(0.0..total.max(f64::EPSILON));
    let mut cumulative = 0.0;
    for (level, weight) in distribution {
        cumulative += weight;
        if r <= cumulative {
            return *level;
        }
    }
    distribution[distribution.len() - 1].0
}

fn apportion(scores: &[(HospitalId, f64)], total: u32) -> BTreeMap<HospitalId, u32> {
    if scores.is_empty() || total == 0 {
        return scores.iter().map(|(h, _)| (*h, 0)).collect();
    }

    let max_score = scores.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
    let min_score = scores.iter().map(|(_, s)| *s).fold(f64::MAX, f64::min);

    // Degenerate input: split evenly, remainder to the first hospitals.
    if (max_score - min_score).abs() < 1e-9 {
        let base = total / scores.len() as u32;
        let mut remainder = total % scores.len() as u32;
        return scores
            .iter()
            .map(|(hospital, _)| {
                let extra = if remainder > 0 {
                    remainder -= 1;
                    1
                } else {
                    0
                };
                (*hospital, base + extra)
            })
            .collect();
    }

    let inverted: Vec<(HospitalId, f64)> = scores
        .iter()
        .map(|(h, s)| (*h, (max_score + EPSILON) - s))
        .collect();
    let weight_sum: f64 = inverted.iter().map(|(_, w)| w).sum();

    let mut counts: BTreeMap<HospitalId, u32> = BTreeMap::new();
    let mut assigned = 0u32;
    let mut largest: Option<(HospitalId, f64)> = None;

    for (hospital, weight) in &inverted {
        let share = weight / weight_sum;
        let count = if share > MIN_SHARE {
            ((f64::from(total) * share).floor() as u32).max(1)
        } else {
            0
        };
        counts.insert(*hospital, count);
        assigned += count;
        if largest.map(|(_, w)| *weight > w).unwrap_or(true) {
            largest = Some((*hospital, *weight));
        }
    }

    // The largest weight absorbs the rounding remainder, never dropping
    // below its minimum-share floor.
    if let Some((hospital, share_weight)) = largest {
        let entry = counts.entry(hospital).or_insert(0);
        let floor = if share_weight / weight_sum > MIN_SHARE { 1 } else { 0 };
        let adjusted = i64::from(*entry) + i64::from(total) - i64::from(assigned);
        *entry = adjusted.max(i64::from(floor)) as u32;
    }

    // Minimum-share bumps can overshoot tiny totals; strip the excess from
    // the lightest hospitals first.
    let mut sum: u32 = counts.values().sum();
    if sum > total {
        let mut by_weight = inverted.clone();
        by_weight.sort_by(|a, b| a.1.total_cmp(&b.1));
        for (hospital, _) in by_weight {
            while sum > total {
                match counts.get_mut(&hospital) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        sum -= 1;
                    }
                    _ => break,
                }
            }
        }
    }

    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saturation::tests::stats_with_saturation;
    use rand::SeedableRng;

    fn incident(total: u32, location: Option<GeoPoint>) -> Incident {
        Incident {
            incident_id: Uuid::new_v4().to_string(),
            kind: "ACCIDENT".into(),
            triage_distribution: vec![
                (TriageLevel::Red, 0.1),
                (TriageLevel::Orange, 0.2),
                (TriageLevel::Yellow, 0.4),
                (TriageLevel::Green, 0.3),
            ],
            total_patients: total,
            location,
        }
    }

    #[test]
    fn saturated_nearby_hospital_receives_less() {
        let mut monitor = SaturationMonitor::new();
        monitor.update_from_stats(&stats_with_saturation(HospitalId::Chuac, 0.9));
        monitor.update_from_stats(&stats_with_saturation(HospitalId::Modelo, 0.3));
        monitor.update_from_stats(&stats_with_saturation(HospitalId::SanRafael, 0.3));

        let chuac = HospitalId::Chuac.config();
        let at_chuac = GeoPoint {
            lat: chuac.lat,
            lon: chuac.lon,
        };
        let distribution =
            IncidentDistributor::new().distribute(&incident(10, Some(at_chuac)), &monitor);

        let chuac_count = distribution[&HospitalId::Chuac];
        let others: u32 = distribution
            .iter()
            .filter(|(h, _)| **h != HospitalId::Chuac)
            .map(|(_, c)| c)
            .sum();
        assert_eq!(chuac_count + others, 10);
        assert!(
            chuac_count < others,
            "saturated CHUAC got {chuac_count} vs others {others}"
        );
    }

    #[test]
    fn degenerate_scores_split_evenly() {
        let monitor = SaturationMonitor::new(); // all zeros
        let distribution = IncidentDistributor::new().distribute(&incident(9, None), &monitor);
        for count in distribution.values() {
            assert_eq!(*count, 3);
        }
    }

    #[test]
    fn degenerate_remainder_goes_to_the_front() {
        let monitor = SaturationMonitor::new();
        let distribution = IncidentDistributor::new().distribute(&incident(10, None), &monitor);
        let total: u32 = distribution.values().sum();
        assert_eq!(total, 10);
        assert!(distribution.values().all(|c| *c == 3 || *c == 4));
    }

    #[test]
    fn counts_always_sum_to_total() {
        let mut monitor = SaturationMonitor::new();
        monitor.update_from_stats(&stats_with_saturation(HospitalId::Chuac, 0.55));
        monitor.update_from_stats(&stats_with_saturation(HospitalId::Modelo, 0.25));
        monitor.update_from_stats(&stats_with_saturation(HospitalId::SanRafael, 0.75));

        for total in [1, 3, 7, 10, 50, 137] {
            let distribution =
                IncidentDistributor::new().distribute(&incident(total, None), &monitor);
            let sum: u32 = distribution.values().sum();
            assert_eq!(sum, total, "total {total} apportioned to {sum}");
        }
    }

    #[test]
    fn casualties_match_the_distribution() {
        let mut monitor = SaturationMonitor::new();
        monitor.update_from_stats(&stats_with_saturation(HospitalId::Modelo, 0.2));
        let distributor = IncidentDistributor::new();
        let incident = incident(12, None);
        let distribution = distributor.distribute(&incident, &monitor);

        let mut rng = StdRng::seed_from_u64(9);
        let casualties = distributor.casualties(&incident, &distribution, &mut rng);
        assert_eq!(casualties.len(), 12);
        for (hospital, count) in &distribution {
            let assigned = casualties
                .iter()
                .filter(|c| c.hospital_id == *hospital)
                .count() as u32;
            assert_eq!(assigned, *count);
        }
    }

    #[test]
    fn haversine_is_sane() {
        let chuac = HospitalId::Chuac.config();
        let modelo = HospitalId::Modelo.config();
        let a = GeoPoint { lat: chuac.lat, lon: chuac.lon };
        let b = GeoPoint { lat: modelo.lat, lon: modelo.lon };
        let km = haversine_km(a, b);
        assert!(km > 0.5 && km < 5.0, "km = {km}");
        assert!(haversine_km(a, a) < 1e-9);
    }
}
