//! Coordinator service.
//!
//! Consumes `hospital-stats` and `triage-results`, keeps the saturation
//! table and on-call pool (updated exclusively from the coordinator
//! consumer task), publishes diversion directives and staffing events, and
//! emits a periodic aggregate status.

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use edt_bus::{decode_payload, BusClient, BusMessage};
use edt_common::schemas::{
    CoordinatorAlert, CoordinatorStatus, HospitalStats, Incident, TriageResult,
};
use edt_common::topics;
use edt_config::CoordinatorConfig;

use crate::diversion::DiversionManager;
use crate::incident::IncidentDistributor;
use crate::saturation::SaturationMonitor;
use crate::scaling::{OnCallDoctor, ScalingController, ScalingEvent};

struct CoordinatorState {
    monitor: SaturationMonitor,
    diversion: DiversionManager,
    scaling: ScalingController,
    incident: IncidentDistributor,
    rng: StdRng,
}

pub struct Coordinator {
    bus: Arc<BusClient>,
    state: Arc<Mutex<CoordinatorState>>,
    alerts_outbox: Arc<Mutex<Vec<CoordinatorAlert>>>,
    shutdown_tx: broadcast::Sender<()>,
    status_interval: Duration,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Coordinator {
    pub fn new(bus: Arc<BusClient>, config: &CoordinatorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut monitor = SaturationMonitor::new();
        let alerts_outbox: Arc<Mutex<Vec<CoordinatorAlert>>> = Arc::new(Mutex::new(Vec::new()));
        let outbox_for_callback = Arc::clone(&alerts_outbox);
        monitor.register_alert_callback(move |hospital, level, message| {
            outbox_for_callback.lock().push(CoordinatorAlert {
                hospital_id: hospital,
                level,
                message: message.to_string(),
                timestamp: Utc::now(),
            });
        });

        let mut scaling = ScalingController::new();
        scaling.set_on_call_pool(default_pool(config.on_call_pool_size));

        Self {
            bus,
            state: Arc::new(Mutex::new(CoordinatorState {
                monitor,
                diversion: DiversionManager::new(),
                scaling,
                incident: IncidentDistributor::new(),
                rng: StdRng::from_entropy(),
            })),
            alerts_outbox,
            shutdown_tx,
            status_interval: Duration::from_secs(config.status_interval_seconds),
            tasks: Vec::new(),
            started: false,
        }
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Replace the free on-call pool (startup seed or list refresh).
    pub fn set_on_call_pool(&self, entries: Vec<OnCallDoctor>) {
        self.state.lock().scaling.set_on_call_pool(entries);
    }

    /// Manual scaling entry; publishes the resulting staffing events.
    pub async fn scale_consult(
        &self,
        consult_id: u32,
        target: u32,
    ) -> Result<(), crate::scaling::ScalingError> {
        let events = self
            .state
            .lock()
            .scaling
            .scale_consult(consult_id, target, "escalado_manual")?;
        self.publish_scaling_events(events).await;
        Ok(())
    }

    /// Apportion an incident and emit its casualty records.
    pub async fn distribute_incident(&self, incident: &Incident) {
        let (distribution, payload, casualties) = {
            let mut state = self.state.lock();
            let CoordinatorState {
                monitor,
                incident: distributor,
                rng,
                ..
            } = &mut *state;
            let distribution = distributor.distribute(incident, monitor);
            let payload = distributor.distribution_payload(incident, &distribution);
            let casualties = distributor.casualties(incident, &distribution, rng);
            (distribution, payload, casualties)
        };

        info!(
            kind = %incident.kind,
            total = incident.total_patients,
            distribution = ?distribution,
            "Incident apportioned"
        );

        if let Err(e) = self
            .bus
            .produce(topics::INCIDENT_DISTRIBUTION, &payload, None)
            .await
        {
            error!(error = %e, "Failed to publish incident distribution");
        }
        for casualty in casualties {
            if let Err(e) = self
                .bus
                .produce(
                    topics::INCIDENT_PATIENTS,
                    &casualty,
                    Some(casualty.hospital_id.as_str()),
                )
                .await
            {
                error!(error = %e, "Failed to publish incident casualty");
            }
        }
    }

    /// Spawn the consumer loop and the periodic status task. Idempotent.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.tasks.push(self.spawn_consumer());
        self.tasks.push(self.spawn_status_loop());
        info!("Coordinator started");
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Coordinator task panicked");
            }
        }
    }

    fn spawn_consumer(&self) -> JoinHandle<()> {
        let mut subscription = self.bus.subscribe(
            &[topics::HOSPITAL_STATS, topics::TRIAGE_RESULTS],
            "coordinator-group",
        );
        let bus = Arc::clone(&self.bus);
        let state = Arc::clone(&self.state);
        let alerts_outbox = Arc::clone(&self.alerts_outbox);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Coordinator consumer loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    msg = subscription.poll(Duration::from_millis(200)) => {
                        if let Some(msg) = msg {
                            handle_message(&bus, &state, &alerts_outbox, msg).await;
                        }
                    }
                }
            }
            info!("Coordinator consumer loop exited");
        })
    }

    fn spawn_status_loop(&self) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let state = Arc::clone(&self.state);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.status_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the first
            // published status reflects some consumed traffic.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let status = compose_status(&state);
                        if let Err(e) = bus.produce(topics::COORDINATOR_STATUS, &status, None).await {
                            error!(error = %e, "Failed to publish coordinator status");
                        }
                    }
                }
            }
        })
    }

    async fn publish_scaling_events(&self, events: Vec<ScalingEvent>) {
        publish_scaling(&self.bus, events).await;
    }
}

fn default_pool(size: u32) -> Vec<OnCallDoctor> {
    (1..=size)
        .map(|i| OnCallDoctor {
            id: format!("oncall-{i}"),
            name: format!("On-call doctor {i}"),
            available: true,
        })
        .collect()
}

async fn handle_message(
    bus: &Arc<BusClient>,
    state: &Arc<Mutex<CoordinatorState>>,
    alerts_outbox: &Arc<Mutex<Vec<CoordinatorAlert>>>,
    msg: BusMessage,
) {
    match msg.topic.as_str() {
        topics::HOSPITAL_STATS => {
            let Some(stats) = decode_payload::<HospitalStats>(&msg) else {
                return;
            };
            let scaling_events = {
                let mut state = state.lock();
                state.monitor.update_from_stats(&stats);
                if stats.hospital_id.is_reference_center() {
                    state.scaling.auto_scale(stats.global_saturation)
                } else {
                    Vec::new()
                }
            };

            // Threshold-crossing alerts collected by the monitor callback.
            let alerts: Vec<CoordinatorAlert> = std::mem::take(&mut *alerts_outbox.lock());
            for alert in alerts {
                if let Err(e) = bus.produce(topics::COORDINATOR_ALERTS, &alert, None).await {
                    error!(error = %e, "Failed to publish coordinator alert");
                }
            }
            publish_scaling(bus, scaling_events).await;
        }
        topics::TRIAGE_RESULTS => {
            let Some(result) = decode_payload::<TriageResult>(&msg) else {
                return;
            };
            let alert = {
                let mut state = state.lock();
                let CoordinatorState {
                    monitor, diversion, ..
                } = &mut *state;
                diversion.evaluate(&result, monitor)
            };
            if let Some(alert) = alert {
                if let Err(e) = bus
                    .produce(
                        topics::DIVERSION_ALERTS,
                        &alert,
                        Some(alert.origin_hospital.as_str()),
                    )
                    .await
                {
                    error!(error = %e, "Failed to publish diversion alert");
                }
            }
        }
        _ => {}
    }
}

async fn publish_scaling(bus: &Arc<BusClient>, events: Vec<ScalingEvent>) {
    for event in events {
        let result = match &event {
            ScalingEvent::Assigned(assigned) => {
                bus.produce(topics::DOCTOR_ASSIGNED, assigned, None).await
            }
            ScalingEvent::Unassigned(unassigned) => {
                bus.produce(topics::DOCTOR_UNASSIGNED, unassigned, None).await
            }
            ScalingEvent::Capacity(change) => {
                bus.produce(topics::CAPACITY_CHANGE, change, None).await
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to publish scaling event");
        }
    }
}

fn compose_status(state: &Arc<Mutex<CoordinatorState>>) -> CoordinatorStatus {
    let state = state.lock();
    let snapshot = state.monitor.system_status();
    CoordinatorStatus {
        status: snapshot.status,
        mean_saturation: snapshot.mean_saturation,
        critical_count: snapshot.critical_count,
        saturated_count: snapshot.saturated_count,
        hospitals: snapshot.hospitals,
        diversions: state.diversion.counters().clone(),
        consult_rooms: state.scaling.room_summaries(),
        on_call: state.scaling.on_call_summary(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saturation::tests::stats_with_saturation;
    use edt_bus::MemoryBroker;
    use edt_common::schemas::HospitalId;
    use edt_common::triage::TriageLevel;

    fn coordinator_with_interval(seconds: u64) -> (Coordinator, Arc<BusClient>) {
        let broker = MemoryBroker::new();
        let bus = Arc::new(BusClient::new(broker, "coordinator"));
        let config = CoordinatorConfig {
            status_interval_seconds: seconds,
            on_call_pool_size: 4,
        };
        (Coordinator::new(Arc::clone(&bus), &config), bus)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    #[tokio::test]
    async fn gravity_diversion_flows_to_alert_topic() {
        let (mut coordinator, bus) = coordinator_with_interval(600);
        coordinator.start();

        // Reference center nearly idle.
        bus.produce(
            topics::HOSPITAL_STATS,
            &stats_with_saturation(HospitalId::Chuac, 0.20),
            None,
        )
        .await
        .unwrap();

        let triage = TriageResult {
            patient_id: "red-1".into(),
            hospital_id: HospitalId::Modelo,
            triage_level: TriageLevel::Red,
            box_id: 1,
            triage_duration_minutes: 5.2,
            requires_diversion: true,
        };
        bus.produce(topics::TRIAGE_RESULTS, &triage, None).await.unwrap();

        settle().await;
        coordinator.stop();
        coordinator.join().await;

        let mut sub = bus.subscribe(&[topics::DIVERSION_ALERTS], "test-check");
        let msg = sub.try_next().expect("diversion alert expected");
        assert_eq!(msg.payload["patient_id"], "red-1");
        assert_eq!(msg.payload["origin_hospital"], "modelo");
        assert_eq!(msg.payload["destination_hospital"], "chuac");
        assert_eq!(msg.payload["reason"], "GRAVITY");
    }

    #[tokio::test]
    async fn saturation_diversion_picks_least_saturated() {
        let (mut coordinator, bus) = coordinator_with_interval(600);
        coordinator.start();

        bus.produce(topics::HOSPITAL_STATS, &stats_with_saturation(HospitalId::Chuac, 0.90), None)
            .await
            .unwrap();
        bus.produce(
            topics::HOSPITAL_STATS,
            &stats_with_saturation(HospitalId::SanRafael, 0.30),
            None,
        )
        .await
        .unwrap();
        bus.produce(
            topics::HOSPITAL_STATS,
            &stats_with_saturation(HospitalId::Modelo, 0.60),
            None,
        )
        .await
        .unwrap();

        let triage = TriageResult {
            patient_id: "green-1".into(),
            hospital_id: HospitalId::Chuac,
            triage_level: TriageLevel::Green,
            box_id: 2,
            triage_duration_minutes: 4.8,
            requires_diversion: false,
        };
        bus.produce(topics::TRIAGE_RESULTS, &triage, None).await.unwrap();

        settle().await;
        coordinator.stop();
        coordinator.join().await;

        let mut sub = bus.subscribe(&[topics::DIVERSION_ALERTS], "test-check");
        let msg = sub.try_next().expect("diversion alert expected");
        assert_eq!(msg.payload["destination_hospital"], "san_rafael");
        assert_eq!(msg.payload["reason"], "SATURATION");
    }

    #[tokio::test]
    async fn reference_stats_drive_autoscaling_events() {
        let (mut coordinator, bus) = coordinator_with_interval(600);
        coordinator.start();

        bus.produce(topics::HOSPITAL_STATS, &stats_with_saturation(HospitalId::Chuac, 0.85), None)
            .await
            .unwrap();

        settle().await;
        coordinator.stop();
        coordinator.join().await;

        let mut assigned = bus.subscribe(&[topics::DOCTOR_ASSIGNED], "test-check");
        let msg = assigned.try_next().expect("doctor assignment expected");
        assert_eq!(msg.payload["medico_id"], "oncall-1");

        let mut capacity = bus.subscribe(&[topics::CAPACITY_CHANGE], "test-check");
        let msg = capacity.try_next().expect("capacity change expected");
        assert_eq!(msg.payload["medicos_previos"], 1);
        assert_eq!(msg.payload["medicos_nuevos"], 2);
    }

    #[tokio::test]
    async fn threshold_crossings_publish_alerts() {
        let (mut coordinator, bus) = coordinator_with_interval(600);
        coordinator.start();

        bus.produce(
            topics::HOSPITAL_STATS,
            &stats_with_saturation(HospitalId::Modelo, 0.97),
            None,
        )
        .await
        .unwrap();
        bus.produce(
            topics::HOSPITAL_STATS,
            &stats_with_saturation(HospitalId::Modelo, 0.97),
            None,
        )
        .await
        .unwrap();

        settle().await;
        coordinator.stop();
        coordinator.join().await;

        let mut sub = bus.subscribe(&[topics::COORDINATOR_ALERTS], "test-check");
        let msg = sub.try_next().expect("alert expected");
        assert_eq!(msg.payload["hospital_id"], "modelo");
        assert_eq!(msg.payload["level"], "critical");
        // Debounced: the identical second snapshot produced no new alert.
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn status_loop_publishes_aggregate() {
        let (mut coordinator, bus) = coordinator_with_interval(1);
        coordinator.start();

        bus.produce(topics::HOSPITAL_STATS, &stats_with_saturation(HospitalId::Chuac, 0.40), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1400)).await;
        coordinator.stop();
        coordinator.join().await;

        let mut sub = bus.subscribe(&[topics::COORDINATOR_STATUS], "test-check");
        let msg = sub.try_next().expect("status expected");
        assert_eq!(msg.payload["status"], "NORMAL");
        assert!(msg.payload["hospitals"]["chuac"]["saturation"].as_f64().unwrap() > 0.0);
        assert_eq!(msg.payload["on_call"]["total"], 4);
    }

    #[tokio::test]
    async fn incident_distribution_is_published_with_casualties() {
        let (mut coordinator, bus) = coordinator_with_interval(600);
        coordinator.start();

        let incident = Incident {
            incident_id: "inc-1".into(),
            kind: "ACCIDENT".into(),
            triage_distribution: vec![(TriageLevel::Yellow, 0.6), (TriageLevel::Green, 0.4)],
            total_patients: 6,
            location: None,
        };
        coordinator.distribute_incident(&incident).await;

        coordinator.stop();
        coordinator.join().await;

        let mut dist = bus.subscribe(&[topics::INCIDENT_DISTRIBUTION], "test-check");
        let msg = dist.try_next().expect("distribution expected");
        assert_eq!(msg.payload["tipo_emergencia"], "ACCIDENT");
        assert_eq!(msg.payload["total_pacientes"], 6);

        let mut casualties = bus.subscribe(&[topics::INCIDENT_PATIENTS], "test-check");
        let mut count = 0;
        while casualties.try_next().is_some() {
            count += 1;
        }
        assert_eq!(count, 6);
    }
}
