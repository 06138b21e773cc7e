//! Static catalogue of the simulated hospitals.

use crate::schemas::HospitalId;

/// Fixed per-hospital configuration. Resource counts bound the flow
/// engine's pools; the base arrival rate feeds the patient generator.
#[derive(Debug, Clone, Copy)]
pub struct HospitalConfig {
    pub id: HospitalId,
    pub display_name: &'static str,
    pub reception_desks: u32,
    pub triage_boxes: u32,
    pub consult_rooms: u32,
    pub observation_beds: u32,
    /// Patients per hour before demand factors.
    pub base_hourly_arrivals: f64,
    pub lat: f64,
    pub lon: f64,
    pub is_reference_center: bool,
}

pub const HOSPITALS: [HospitalConfig; 3] = [
    HospitalConfig {
        id: HospitalId::Chuac,
        display_name: "CHUAC",
        reception_desks: 4,
        triage_boxes: 5,
        consult_rooms: 10,
        observation_beds: 12,
        base_hourly_arrivals: 15.0,
        lat: 43.3472,
        lon: -8.3888,
        is_reference_center: true,
    },
    HospitalConfig {
        id: HospitalId::Modelo,
        display_name: "Modelo",
        reception_desks: 2,
        triage_boxes: 2,
        consult_rooms: 4,
        observation_beds: 6,
        base_hourly_arrivals: 6.0,
        lat: 43.3623,
        lon: -8.4115,
        is_reference_center: false,
    },
    HospitalConfig {
        id: HospitalId::SanRafael,
        display_name: "San Rafael",
        reception_desks: 2,
        triage_boxes: 2,
        consult_rooms: 3,
        observation_beds: 4,
        base_hourly_arrivals: 5.0,
        lat: 43.3531,
        lon: -8.4034,
        is_reference_center: false,
    },
];

impl HospitalId {
    pub fn config(self) -> &'static HospitalConfig {
        match self {
            HospitalId::Chuac => &HOSPITALS[0],
            HospitalId::Modelo => &HOSPITALS[1],
            HospitalId::SanRafael => &HOSPITALS[2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_is_consistent() {
        for config in &HOSPITALS {
            assert_eq!(config.id.config().display_name, config.display_name);
            assert!(config.base_hourly_arrivals > 0.0);
            assert!(config.reception_desks > 0);
            assert!(config.consult_rooms > 0);
        }
    }

    #[test]
    fn exactly_one_reference_center() {
        let count = HOSPITALS.iter().filter(|h| h.is_reference_center).count();
        assert_eq!(count, 1);
        assert!(HospitalId::reference_center().config().is_reference_center);
    }
}
