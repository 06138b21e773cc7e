//! Per-hospital simulation.
//!
//! Owns the simulated clock for one hospital, drives the generator and the
//! flow engine, and publishes arrivals, triage results, consultation
//! events, stats snapshots and the demand-context snapshot.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use edt_bus::BusClient;
use edt_common::schemas::{HospitalId, PatientArrival, SystemContext};
use edt_common::topics;

use crate::clock::{SimClock, MAX_SLICE_MINUTES};
use crate::demand::{ContextProvider, DemandSnapshot, ExternalFactors};
use crate::engine::{EngineEvent, EntryStage, FlowEngine};
use crate::generator::PatientGenerator;
use crate::Result;

pub struct HospitalSimulation {
    hospital: HospitalId,
    clock: SimClock,
    engine: FlowEngine,
    generator: PatientGenerator,
    bus: Arc<BusClient>,
    context_provider: Arc<dyn ContextProvider>,
    snapshot: DemandSnapshot,
    sim_now: f64,
    next_arrival_at: f64,
    next_stats_at: f64,
    next_context_at: f64,
    stats_interval: f64,
    context_interval: f64,
    /// Simulated-minute horizon after which the clock pauses; None = unbounded.
    duration_limit: Option<f64>,
}

impl HospitalSimulation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hospital: HospitalId,
        speed: f64,
        bus: Arc<BusClient>,
        context_provider: Arc<dyn ContextProvider>,
        seed: u64,
        stats_interval: f64,
        context_interval: f64,
        duration_minutes: u64,
    ) -> Self {
        let mut generator = PatientGenerator::new(hospital, seed);
        let snapshot = DemandSnapshot::neutral(Utc::now());
        let rate = generator.arrival_rate(snapshot.total_factor);
        let first_arrival = generator.next_interarrival_minutes(rate);

        Self {
            hospital,
            clock: SimClock::new(speed),
            engine: FlowEngine::new(hospital, seed.wrapping_add(1)),
            generator,
            bus,
            context_provider,
            snapshot,
            sim_now: 0.0,
            next_arrival_at: first_arrival,
            next_stats_at: stats_interval,
            // Publish the initial context on the first tick.
            next_context_at: 0.0,
            stats_interval,
            context_interval,
            duration_limit: if duration_minutes == 0 {
                None
            } else {
                Some(duration_minutes as f64)
            },
        }
    }

    pub fn hospital(&self) -> HospitalId {
        self.hospital
    }

    pub fn sim_now(&self) -> f64 {
        self.sim_now
    }

    pub fn speed(&self) -> f64 {
        self.clock.speed()
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    /// Advance the simulation to the clock target, in slices of at most
    /// ten simulated minutes so commands take effect promptly.
    pub async fn tick(&mut self) -> Result<()> {
        let mut target = self.clock.target_now();
        if let Some(limit) = self.duration_limit {
            if target >= limit {
                target = limit;
                if !self.clock.is_paused() {
                    info!(hospital = %self.hospital, "Simulated duration reached, pausing");
                    self.clock.pause();
                }
            }
        }

        while self.sim_now < target {
            let slice_end = (self.sim_now + MAX_SLICE_MINUTES).min(target);

            loop {
                let next = self
                    .next_context_at
                    .min(self.next_arrival_at)
                    .min(self.next_stats_at);
                if next > slice_end {
                    break;
                }

                self.engine.advance_to(next);
                self.sim_now = next;
                self.publish_engine_events().await?;

                if self.next_context_at <= next {
                    self.refresh_context().await?;
                    self.next_context_at = next + self.context_interval;
                }
                if self.next_arrival_at <= next {
                    self.spawn_arrival().await?;
                }
                if self.next_stats_at <= next {
                    self.publish_stats().await?;
                    self.next_stats_at = next + self.stats_interval;
                }
            }

            self.engine.advance_to(slice_end);
            self.sim_now = slice_end;
            self.publish_engine_events().await?;
        }
        Ok(())
    }

    pub fn set_speed(&mut self, speed: f64) {
        let old = self.clock.speed();
        self.clock.set_speed(speed);
        info!(
            hospital = %self.hospital,
            old_speed = old,
            new_speed = self.clock.speed(),
            "Simulation speed changed"
        );
    }

    /// Idempotent pause/resume of the simulated clock.
    pub fn set_running(&mut self, running: bool) {
        if running {
            self.clock.resume();
        } else {
            self.clock.pause();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.clock.is_paused()
    }

    pub fn set_doctors(&mut self, consult_id: u32, doctors: u32) -> Result<()> {
        self.engine.set_doctors(consult_id, doctors)
    }

    /// Inject an externally sourced patient (incident casualty or received
    /// diversion); they enter the pipeline at triage.
    pub fn inject_patient(&mut self, arrival: &PatientArrival, is_diversion: bool) {
        debug!(
            hospital = %self.hospital,
            patient_id = %arrival.patient_id,
            is_diversion = is_diversion,
            "Injecting external patient at triage"
        );
        self.engine.inject(arrival, EntryStage::Triage, is_diversion);
    }

    /// Cancel the whole hospital; in-flight patients become ABANDONED.
    pub fn shutdown(&mut self) {
        self.engine.shutdown();
        // Abandonment events are internal bookkeeping, not bus traffic.
        let abandoned = self.engine.take_events().len();
        info!(hospital = %self.hospital, abandoned = abandoned, "Hospital simulation shut down");
    }

    async fn spawn_arrival(&mut self) -> Result<()> {
        let arrival = self.generator.generate(&self.snapshot, Utc::now());
        self.bus
            .produce(topics::PATIENT_ARRIVALS, &arrival, Some(self.hospital.as_str()))
            .await?;
        self.engine.inject(&arrival, EntryStage::Reception, false);
        self.publish_engine_events().await?;

        let rate = self.generator.arrival_rate(self.snapshot.total_factor);
        let gap = self.generator.next_interarrival_minutes(rate);
        // A strictly positive floor keeps the slice loop advancing even on
        // a degenerate exponential draw.
        self.next_arrival_at = self.sim_now + gap.max(1e-3);
        Ok(())
    }

    async fn publish_engine_events(&mut self) -> Result<()> {
        for event in self.engine.take_events() {
            match event {
                EngineEvent::Triage(result) => {
                    self.bus
                        .produce(topics::TRIAGE_RESULTS, &result, Some(self.hospital.as_str()))
                        .await?;
                }
                EngineEvent::Consultation(event) => {
                    self.bus
                        .produce(
                            topics::CONSULTATION_EVENTS,
                            &event,
                            Some(self.hospital.as_str()),
                        )
                        .await?;
                }
                EngineEvent::Completed {
                    patient_id,
                    outcome,
                    diverted_to,
                    ..
                } => {
                    debug!(
                        hospital = %self.hospital,
                        patient_id = %patient_id,
                        outcome = ?outcome,
                        diverted_to = ?diverted_to,
                        "Patient left the system"
                    );
                }
            }
        }
        Ok(())
    }

    async fn publish_stats(&mut self) -> Result<()> {
        let stats = self.engine.stats(Utc::now());
        self.bus
            .produce(topics::HOSPITAL_STATS, &stats, Some(self.hospital.as_str()))
            .await?;
        Ok(())
    }

    async fn refresh_context(&mut self) -> Result<()> {
        let wall = Utc::now();
        let external = match self.context_provider.current_factors(wall).await {
            Ok(factors) => factors,
            Err(e) => {
                warn!(
                    hospital = %self.hospital,
                    error = %e,
                    "Context provider failed, using neutral factors"
                );
                ExternalFactors::default()
            }
        };
        self.snapshot = DemandSnapshot::compute(wall, &external);

        let context = SystemContext {
            hospital_id: self.hospital,
            temperature: self.snapshot.temperature,
            rain_mm: self.snapshot.rain_mm,
            condition: self.snapshot.condition.clone(),
            hour_factor: self.snapshot.hour_factor,
            weekday_factor: self.snapshot.weekday_factor,
            month_factor: self.snapshot.month_factor,
            weather_factor: self.snapshot.weather_factor,
            event_factor: self.snapshot.event_factor,
            football_factor: self.snapshot.football_factor,
            active_event: self.snapshot.active_event.clone(),
            active_match: self.snapshot.active_match.clone(),
            total_factor: self.snapshot.total_factor,
            timestamp: wall,
        };
        self.bus
            .produce(topics::SYSTEM_CONTEXT, &context, Some(self.hospital.as_str()))
            .await?;
        Ok(())
    }
}
