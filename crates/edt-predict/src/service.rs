//! Predictor service.
//!
//! Owns one model per hospital. Consumes `patient-arrivals` to build
//! observed hourly counts, checks each closed hour for anomalies, and
//! retrains/publishes forecasts on a configurable cadence. Training is a
//! local computation and never blocks producers.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use edt_bus::{decode_payload, spawn_consumer_loop, BusClient};
use edt_common::schemas::{HospitalId, PatientArrival, PredictionAlert, PredictionUpdate};
use edt_common::topics;
use edt_config::PredictorConfig;

use crate::anomaly::{anomaly_z, is_anomalous};
use crate::history::{synthetic_history, HourlySample};
use crate::model::{profile_forecast, Scenario, SeasonalModel};
use crate::profile::forecast_profile;

/// Per-hospital forecaster registry with profile-only fallback.
pub struct DemandPredictor {
    models: HashMap<HospitalId, SeasonalModel>,
    history_days: u32,
    fallback_warned: HashSet<HospitalId>,
}

impl DemandPredictor {
    pub fn new(history_days: u32) -> Self {
        Self {
            models: HashMap::new(),
            history_days,
            fallback_warned: HashSet::new(),
        }
    }

    /// Train one hospital's model; synthetic history is generated when no
    /// real history is supplied.
    pub fn train(&mut self, hospital: HospitalId, history: Option<&[HourlySample]>) {
        let owned;
        let data: &[HourlySample] = match history {
            Some(history) => history,
            None => {
                owned = synthetic_history(hospital, self.history_days, Utc::now());
                &owned
            }
        };

        match SeasonalModel::fit(data) {
            Some(model) => {
                info!(
                    hospital = %hospital,
                    samples = model.sample_count,
                    "Forecast model trained"
                );
                self.models.insert(hospital, model);
            }
            None => {
                if self.fallback_warned.insert(hospital) {
                    warn!(
                        hospital = %hospital,
                        "Forecaster unavailable, falling back to profile-only forecasts"
                    );
                }
            }
        }
    }

    pub fn train_all(&mut self) {
        for hospital in HospitalId::ALL {
            self.train(hospital, None);
        }
    }

    pub fn is_trained(&self, hospital: HospitalId) -> bool {
        self.models.contains_key(&hospital)
    }

    /// Forecast the next hours. Trains on first use; degrades to the
    /// profile tables when fitting is impossible.
    pub fn predict(
        &mut self,
        hospital: HospitalId,
        horizon_hours: u32,
        scenario: Option<&Scenario>,
        from: DateTime<Utc>,
    ) -> Vec<edt_common::schemas::PredictionPoint> {
        if !self.models.contains_key(&hospital) {
            self.train(hospital, None);
        }
        match self.models.get(&hospital) {
            Some(model) => model.forecast(from, horizon_hours, scenario),
            None => profile_forecast(forecast_profile(hospital), from, horizon_hours, scenario),
        }
    }

    /// Score one closed hour of observed arrivals. Returns the alert to
    /// publish when the count sits outside the confidence band.
    pub fn check_anomaly(
        &mut self,
        hospital: HospitalId,
        hour_start: DateTime<Utc>,
        observed: u32,
    ) -> Option<PredictionAlert> {
        let prediction = self.predict(hospital, 1, None, hour_start);
        let point = prediction.first()?;
        let half_width = (point.upper - point.lower) / 2.0;
        let z = anomaly_z(f64::from(observed), point.expected_arrivals, half_width);
        if !is_anomalous(z) {
            return None;
        }

        let direction = if z > 0.0 { "above" } else { "below" };
        Some(PredictionAlert {
            hospital_id: hospital,
            hour_start,
            observed_arrivals: observed,
            expected_arrivals: point.expected_arrivals,
            lower: point.lower,
            upper: point.upper,
            z_score: (z * 100.0).round() / 100.0,
            message: format!(
                "{}: {observed} arrivals {direction} forecast {:.1} (z={z:.1})",
                hospital.config().display_name,
                point.expected_arrivals,
            ),
            timestamp: Utc::now(),
        })
    }
}

/// Bus-facing predictor: arrival bucketing, anomaly alerts and the
/// periodic train-and-publish loop.
pub struct PredictorService {
    bus: Arc<BusClient>,
    predictor: Arc<Mutex<DemandPredictor>>,
    shutdown_tx: broadcast::Sender<()>,
    horizon_hours: u32,
    train_interval: Duration,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl PredictorService {
    /// `sim_speed` is the simulator's simulated-minutes-per-second rate;
    /// the training cadence is expressed in simulated hours and converted
    /// to a wall interval here.
    pub fn new(bus: Arc<BusClient>, config: &PredictorConfig, sim_speed: f64) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let sim_minutes = config.train_interval_hours.max(1) * 60;
        let wall_seconds = (sim_minutes as f64 / sim_speed.max(0.1)).max(1.0);

        Self {
            bus,
            predictor: Arc::new(Mutex::new(DemandPredictor::new(config.history_days))),
            shutdown_tx,
            horizon_hours: config.horizon_hours,
            train_interval: Duration::from_secs_f64(wall_seconds),
            tasks: Vec::new(),
            started: false,
        }
    }

    pub fn predictor(&self) -> Arc<Mutex<DemandPredictor>> {
        Arc::clone(&self.predictor)
    }

    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.tasks.push(self.spawn_arrival_consumer());
        self.tasks.push(self.spawn_training_loop());
        info!(
            train_interval_secs = self.train_interval.as_secs(),
            "Predictor service started"
        );
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Predictor task panicked");
            }
        }
    }

    fn spawn_arrival_consumer(&self) -> JoinHandle<()> {
        let subscription = self.bus.subscribe(&[topics::PATIENT_ARRIVALS], "predictor");
        let predictor = Arc::clone(&self.predictor);
        let bus = Arc::clone(&self.bus);

        // Open hourly count per hospital; closed buckets get scored.
        let mut open: HashMap<HospitalId, (DateTime<Utc>, u32)> = HashMap::new();

        spawn_consumer_loop(
            subscription,
            self.shutdown_tx.subscribe(),
            "predictor-arrivals",
            move |msg| {
                let Some(arrival) = decode_payload::<PatientArrival>(&msg) else {
                    return;
                };
                let Ok(hour) = arrival
                    .arrival_time
                    .duration_trunc(ChronoDuration::hours(1))
                else {
                    return;
                };

                match open.get_mut(&arrival.hospital_id) {
                    Some((current_hour, count)) if *current_hour == hour => {
                        *count += 1;
                    }
                    Some((current_hour, count)) => {
                        let closed_hour = *current_hour;
                        let closed_count = *count;
                        *current_hour = hour;
                        *count = 1;

                        let alert = predictor.lock().check_anomaly(
                            arrival.hospital_id,
                            closed_hour,
                            closed_count,
                        );
                        if let Some(alert) = alert {
                            let bus = Arc::clone(&bus);
                            tokio::spawn(async move {
                                if let Err(e) =
                                    bus.produce(topics::PREDICTION_ALERTS, &alert, None).await
                                {
                                    error!(error = %e, "Failed to publish anomaly alert");
                                }
                            });
                        }
                    }
                    None => {
                        open.insert(arrival.hospital_id, (hour, 1));
                    }
                }
            },
        )
    }

    fn spawn_training_loop(&self) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let predictor = Arc::clone(&self.predictor);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.train_interval;
        let horizon = self.horizon_hours;

        tokio::spawn(async move {
            // First training happens immediately so predictions are live
            // from the start.
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        train_and_publish(&bus, &predictor, horizon).await;
                    }
                }
            }
        })
    }
}

async fn train_and_publish(
    bus: &Arc<BusClient>,
    predictor: &Arc<Mutex<DemandPredictor>>,
    horizon_hours: u32,
) {
    let now = Utc::now();
    let updates: Vec<PredictionUpdate> = {
        let mut predictor = predictor.lock();
        predictor.train_all();
        HospitalId::ALL
            .into_iter()
            .map(|hospital| PredictionUpdate {
                hospital_id: hospital,
                horizon_hours,
                points: predictor.predict(hospital, horizon_hours, None, now),
                generated_at: now,
            })
            .collect()
    };

    for update in updates {
        if let Err(e) = bus
            .produce(
                topics::PREDICTION_UPDATES,
                &update,
                Some(update.hospital_id.as_str()),
            )
            .await
        {
            error!(error = %e, "Failed to publish prediction update");
        }
    }
}
