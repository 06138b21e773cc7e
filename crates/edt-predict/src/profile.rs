//! Per-hospital forecast profiles.
//!
//! Each hospital has its own demand shape: the university hospital peaks
//! late morning with busy weekends, the private clinic is quieter and
//! more predictable, the small district hospital is noisy.

use edt_common::schemas::HospitalId;

#[derive(Debug, Clone, Copy)]
pub struct ForecastProfile {
    /// Mean arrivals per hour at the profile's baseline.
    pub base_rate: f64,
    /// Relative noise of the hourly series.
    pub variability: f64,
    pub weekend_factor: f64,
    /// Multiplier applied in the dead of night.
    pub night_factor: f64,
    /// Hour of day with the highest load.
    pub peak_hour: u32,
}

pub fn forecast_profile(hospital: HospitalId) -> &'static ForecastProfile {
    match hospital {
        HospitalId::Chuac => &ForecastProfile {
            base_rate: 20.0,
            variability: 0.20,
            weekend_factor: 1.3,
            night_factor: 0.5,
            peak_hour: 11,
        },
        HospitalId::Modelo => &ForecastProfile {
            base_rate: 8.0,
            variability: 0.10,
            weekend_factor: 0.9,
            night_factor: 0.3,
            peak_hour: 10,
        },
        HospitalId::SanRafael => &ForecastProfile {
            base_rate: 5.0,
            variability: 0.25,
            weekend_factor: 1.1,
            night_factor: 0.6,
            peak_hour: 12,
        },
    }
}

/// Hourly load shape around the profile's peak; circular distance so the
/// shape wraps over midnight.
pub fn hourly_shape(hour: u32, peak_hour: u32, night_factor: f64) -> f64 {
    let hour = hour % 24;
    let distance = {
        let diff = hour.abs_diff(peak_hour);
        diff.min(24 - diff)
    };
    if distance == 0 {
        1.4
    } else if distance <= 2 {
        1.2
    } else if distance <= 4 {
        1.0
    } else if hour < 6 || hour >= 23 {
        night_factor
    } else {
        0.8
    }
}

/// Winter load vs. summer lull, matching the generator's month factor.
pub fn seasonal_factor(month: u32) -> f64 {
    match month {
        12 | 1 | 2 => 1.2,
        6 | 7 | 8 => 0.85,
        _ => 1.0,
    }
}
