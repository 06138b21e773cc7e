//! Seasonal forecasting model.
//!
//! A bucketed seasonal fit: mean and spread per (hour of day, weekend)
//! bucket. Small on purpose; the training data is synthetic or a rolling
//! in-memory window, and the consumers only need an expected value with a
//! confidence band.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use edt_common::schemas::PredictionPoint;

use crate::history::HourlySample;
use crate::profile::{hourly_shape, ForecastProfile};

/// What-if flags; each multiplies the forecast by a fixed factor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scenario {
    pub rain: bool,
    pub mass_event: bool,
    pub extreme_temp: bool,
    pub football_match: bool,
}

pub fn scenario_factor(scenario: Option<&Scenario>) -> f64 {
    let Some(scenario) = scenario else {
        return 1.0;
    };
    let mut factor = 1.0;
    if scenario.rain {
        factor *= 1.15;
    }
    if scenario.mass_event {
        factor *= 1.4;
    }
    if scenario.extreme_temp {
        factor *= 1.25;
    }
    if scenario.football_match {
        factor *= 1.2;
    }
    factor
}

const BUCKET_WEEKDAY: usize = 0;
const BUCKET_WEEKEND: usize = 1;

#[derive(Debug, Clone)]
pub struct SeasonalModel {
    mean: [[f64; 24]; 2],
    std_dev: [[f64; 24]; 2],
    pub trained_at: DateTime<Utc>,
    pub sample_count: usize,
}

impl SeasonalModel {
    /// Fit bucket means and spreads. Returns `None` when any bucket has no
    /// data (under a day of history).
    pub fn fit(history: &[HourlySample]) -> Option<Self> {
        let mut sums = [[0.0f64; 24]; 2];
        let mut squares = [[0.0f64; 24]; 2];
        let mut counts = [[0usize; 24]; 2];

        for sample in history {
            let bucket = bucket_of(sample.timestamp);
            let hour = sample.timestamp.hour() as usize;
            sums[bucket][hour] += sample.arrivals;
            squares[bucket][hour] += sample.arrivals * sample.arrivals;
            counts[bucket][hour] += 1;
        }

        let mut mean = [[0.0f64; 24]; 2];
        let mut std_dev = [[0.0f64; 24]; 2];
        for bucket in 0..2 {
            for hour in 0..24 {
                let n = counts[bucket][hour];
                if n == 0 {
                    return None;
                }
                let m = sums[bucket][hour] / n as f64;
                let variance = (squares[bucket][hour] / n as f64 - m * m).max(0.0);
                mean[bucket][hour] = m;
                std_dev[bucket][hour] = variance.sqrt();
            }
        }

        Some(Self {
            mean,
            std_dev,
            trained_at: Utc::now(),
            sample_count: history.len(),
        })
    }

    /// Expected arrivals and spread for one wall-clock hour.
    pub fn predict_hour(&self, at: DateTime<Utc>) -> (f64, f64) {
        let bucket = bucket_of(at);
        let hour = at.hour() as usize;
        (self.mean[bucket][hour], self.std_dev[bucket][hour])
    }

    /// Forecast the next `horizon_hours`, with a ±2σ confidence band and
    /// the scenario factor applied throughout.
    pub fn forecast(
        &self,
        from: DateTime<Utc>,
        horizon_hours: u32,
        scenario: Option<&Scenario>,
    ) -> Vec<PredictionPoint> {
        let factor = scenario_factor(scenario);
        (0..horizon_hours)
            .map(|offset| {
                let at = from + Duration::hours(i64::from(offset));
                let (mu, sigma) = self.predict_hour(at);
                let expected = mu * factor;
                PredictionPoint {
                    hour: at.hour(),
                    timestamp: at,
                    expected_arrivals: round1(expected.max(0.0)),
                    lower: round1((expected - 2.0 * sigma * factor).max(0.0)),
                    upper: round1(expected + 2.0 * sigma * factor),
                    scenario_factor: round2(factor),
                }
            })
            .collect()
    }
}

/// Profile-only forecast used when no trained model is available.
pub fn profile_forecast(
    profile: &ForecastProfile,
    from: DateTime<Utc>,
    horizon_hours: u32,
    scenario: Option<&Scenario>,
) -> Vec<PredictionPoint> {
    let factor = scenario_factor(scenario);
    (0..horizon_hours)
        .map(|offset| {
            let at = from + Duration::hours(i64::from(offset));
            let shape = hourly_shape(at.hour(), profile.peak_hour, profile.night_factor);
            let week = if at.weekday().num_days_from_monday() >= 5 {
                profile.weekend_factor
            } else {
                1.0
            };
            let expected = profile.base_rate * shape * week * factor;
            let margin = expected * profile.variability * 2.0;
            PredictionPoint {
                hour: at.hour(),
                timestamp: at,
                expected_arrivals: round1(expected),
                lower: round1((expected - margin).max(0.0)),
                upper: round1(expected + margin),
                scenario_factor: round2(factor),
            }
        })
        .collect()
}

fn bucket_of(at: DateTime<Utc>) -> usize {
    if at.weekday().num_days_from_monday() >= 5 {
        BUCKET_WEEKEND
    } else {
        BUCKET_WEEKDAY
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::synthetic_history;
    use crate::profile::forecast_profile;
    use edt_common::schemas::HospitalId;

    #[test]
    fn fit_on_synthetic_history_tracks_the_empirical_mean() {
        for hospital in HospitalId::ALL {
            let history = synthetic_history(hospital, 90, Utc::now());
            let empirical: f64 =
                history.iter().map(|s| s.arrivals).sum::<f64>() / history.len() as f64;

            let model = SeasonalModel::fit(&history).expect("fit");
            let forecast = model.forecast(Utc::now(), 24, None);
            let forecast_mean: f64 =
                forecast.iter().map(|p| p.expected_arrivals).sum::<f64>() / 24.0;

            // Weekday-only or weekend-only windows sit a little off the
            // blended mean; 15% covers that drift.
            let error = (forecast_mean - empirical).abs() / empirical;
            assert!(
                error < 0.15,
                "{hospital}: forecast {forecast_mean:.2} vs empirical {empirical:.2}"
            );
        }
    }

    #[test]
    fn scenario_flags_multiply() {
        assert_eq!(scenario_factor(None), 1.0);
        let all = Scenario {
            rain: true,
            mass_event: true,
            extreme_temp: true,
            football_match: true,
        };
        let expected = 1.15 * 1.4 * 1.25 * 1.2;
        assert!((scenario_factor(Some(&all)) - expected).abs() < 1e-9);

        let rain_only = Scenario {
            rain: true,
            ..Default::default()
        };
        assert!((scenario_factor(Some(&rain_only)) - 1.15).abs() < 1e-9);
    }

    #[test]
    fn forecast_band_contains_the_expectation() {
        let history = synthetic_history(HospitalId::Chuac, 30, Utc::now());
        let model = SeasonalModel::fit(&history).unwrap();
        for point in model.forecast(Utc::now(), 24, None) {
            assert!(point.lower <= point.expected_arrivals);
            assert!(point.expected_arrivals <= point.upper);
            assert!(point.lower >= 0.0);
        }
    }

    #[test]
    fn insufficient_history_fails_the_fit() {
        let history = synthetic_history(HospitalId::Chuac, 1, Utc::now());
        // One day cannot fill both weekday and weekend buckets.
        assert!(SeasonalModel::fit(&history).is_none());
    }

    #[test]
    fn profile_forecast_covers_the_horizon() {
        let profile = forecast_profile(HospitalId::Modelo);
        let forecast = profile_forecast(profile, Utc::now(), 48, None);
        assert_eq!(forecast.len(), 48);
        assert!(forecast.iter().all(|p| p.expected_arrivals > 0.0));
    }
}
