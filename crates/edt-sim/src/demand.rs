//! Demand factors.
//!
//! The effective arrival rate of a hospital is its base rate multiplied by
//! hour-of-day, weekday, month and external (weather/events/football)
//! factors, clamped to [0.5, 3.0]× base. External factors come from a
//! [`ContextProvider`]; the adapters behind it (weather API, city events,
//! fixtures) live outside this crate, and any provider failure degrades to
//! neutral factors.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Lower/upper clamp applied to the combined factor.
pub const MIN_TOTAL_FACTOR: f64 = 0.5;
pub const MAX_TOTAL_FACTOR: f64 = 3.0;

/// Typical emergency-department load profile by hour of day.
const HOURLY_FACTORS: [f64; 24] = [
    0.7, 0.5, 0.4, 0.3, 0.3, 0.4, // 00-05
    0.6, 0.8, 1.0, 1.2, 1.3, 1.4, // 06-11
    1.3, 1.2, 1.1, 1.0, 1.1, 1.2, // 12-17
    1.3, 1.4, 1.3, 1.2, 1.0, 0.8, // 18-23
];

/// Monday..Sunday. Monday and the weekend run hotter.
const WEEKDAY_FACTORS: [f64; 7] = [1.2, 1.0, 1.0, 1.0, 1.1, 1.3, 1.2];

pub fn hour_factor(hour: u32) -> f64 {
    HOURLY_FACTORS[(hour % 24) as usize]
}

pub fn weekday_factor(weekday_from_monday: u32) -> f64 {
    WEEKDAY_FACTORS[(weekday_from_monday % 7) as usize]
}

/// Winter respiratory season vs. the summer lull.
pub fn month_factor(month: u32) -> f64 {
    match month {
        12 | 1 | 2 => 1.2,
        6 | 7 | 8 => 0.85,
        _ => 1.0,
    }
}

/// Factors supplied by the external adapters.
#[derive(Debug, Clone)]
pub struct ExternalFactors {
    pub weather_factor: f64,
    pub event_factor: f64,
    pub football_factor: f64,
    pub temperature: f64,
    pub rain_mm: f64,
    pub condition: String,
    pub active_event: Option<String>,
    pub active_match: Option<String>,
}

impl Default for ExternalFactors {
    fn default() -> Self {
        Self {
            weather_factor: 1.0,
            event_factor: 1.0,
            football_factor: 1.0,
            temperature: 15.0,
            rain_mm: 0.0,
            condition: "normal".to_string(),
            active_event: None,
            active_match: None,
        }
    }
}

/// Read-only source of external demand factors.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn current_factors(&self, wall_time: DateTime<Utc>) -> anyhow::Result<ExternalFactors>;
}

/// Provider used when no external adapters are wired: everything neutral.
pub struct NeutralContextProvider;

#[async_trait]
impl ContextProvider for NeutralContextProvider {
    async fn current_factors(&self, _wall_time: DateTime<Utc>) -> anyhow::Result<ExternalFactors> {
        Ok(ExternalFactors::default())
    }
}

/// Combined demand picture at one instant, used by the generator to rate
/// arrivals and bias pathology selection.
#[derive(Debug, Clone)]
pub struct DemandSnapshot {
    pub hour_factor: f64,
    pub weekday_factor: f64,
    pub month_factor: f64,
    pub weather_factor: f64,
    pub event_factor: f64,
    pub football_factor: f64,
    /// Product of all factors, clamped to [0.5, 3.0].
    pub total_factor: f64,
    pub temperature: f64,
    pub rain_mm: f64,
    pub condition: String,
    pub active_event: Option<String>,
    pub active_match: Option<String>,
}

impl DemandSnapshot {
    pub fn compute(wall_time: DateTime<Utc>, external: &ExternalFactors) -> Self {
        let hour = hour_factor(wall_time.hour());
        let weekday = weekday_factor(wall_time.weekday().num_days_from_monday());
        let month = month_factor(wall_time.month());

        let raw = hour
            * weekday
            * month
            * external.weather_factor
            * external.event_factor
            * external.football_factor;
        let total = raw.clamp(MIN_TOTAL_FACTOR, MAX_TOTAL_FACTOR);

        Self {
            hour_factor: hour,
            weekday_factor: weekday,
            month_factor: month,
            weather_factor: external.weather_factor,
            event_factor: external.event_factor,
            football_factor: external.football_factor,
            total_factor: total,
            temperature: external.temperature,
            rain_mm: external.rain_mm,
            condition: external.condition.clone(),
            active_event: external.active_event.clone(),
            active_match: external.active_match.clone(),
        }
    }

    pub fn neutral(wall_time: DateTime<Utc>) -> Self {
        Self::compute(wall_time, &ExternalFactors::default())
    }

    pub fn is_cold(&self) -> bool {
        self.temperature < 8.0
    }

    pub fn is_hot(&self) -> bool {
        self.temperature > 30.0
    }

    pub fn is_raining(&self) -> bool {
        self.rain_mm > 0.5
    }
}
