//! End-to-end system tests.
//!
//! Simulator and coordinator run against one shared broker, the way the
//! all-in-one server wires them. Assertions are invariant-based rather
//! than schedule-based so they hold for any RNG outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use edt_bus::{BusClient, MemoryBroker};
use edt_common::topics;
use edt_config::{CoordinatorConfig, SimulationConfig};
use edt_coordinator::Coordinator;
use edt_sim::{NeutralContextProvider, SimulatorOrchestrator};

#[tokio::test]
async fn simulator_and_coordinator_share_one_bus() {
    let broker = MemoryBroker::new();
    broker.ensure_topics(topics::ALL, 1);

    let sim_bus = Arc::new(BusClient::new(Arc::clone(&broker), "simulator"));
    let coord_bus = Arc::new(BusClient::new(Arc::clone(&broker), "coordinator"));

    let sim_config = SimulationConfig {
        speed: 1200.0, // 20 simulated hours per wall second
        tick_millis: 20,
        ..Default::default()
    };
    let coord_config = CoordinatorConfig {
        status_interval_seconds: 1,
        on_call_pool_size: 6,
    };

    let mut simulator = SimulatorOrchestrator::new(
        Arc::clone(&sim_bus),
        sim_config,
        Arc::new(NeutralContextProvider),
    );
    let mut coordinator = Coordinator::new(Arc::clone(&coord_bus), &coord_config);

    simulator.start();
    coordinator.start();

    tokio::time::sleep(Duration::from_millis(1800)).await;

    simulator.stop();
    coordinator.stop();
    simulator.join().await;
    coordinator.join().await;

    let check_bus = BusClient::new(Arc::clone(&broker), "checker");

    // Traffic flowed end to end.
    assert!(broker.topic_len(topics::PATIENT_ARRIVALS) > 0, "no arrivals");
    assert!(broker.topic_len(topics::TRIAGE_RESULTS) > 0, "no triage results");
    assert!(broker.topic_len(topics::HOSPITAL_STATS) > 0, "no stats");

    // Stats snapshots: capacities respected and per-hospital timestamps
    // monotonic.
    let mut sub = check_bus.subscribe(&[topics::HOSPITAL_STATS], "check-stats");
    let mut last_ts: HashMap<String, chrono::DateTime<chrono::Utc>> = HashMap::new();
    let mut snapshots = 0;
    while let Some(msg) = sub.try_next() {
        snapshots += 1;
        let hospital = msg.payload["hospital_id"].as_str().unwrap().to_string();
        let busy = msg.payload["consult_rooms_busy"].as_u64().unwrap();
        let total = msg.payload["consult_rooms_total"].as_u64().unwrap();
        assert!(busy <= total, "{hospital}: {busy} busy of {total} rooms");

        let saturation = msg.payload["global_saturation"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&saturation));

        let ts: chrono::DateTime<chrono::Utc> =
            serde_json::from_value(msg.payload["timestamp"].clone()).unwrap();
        if let Some(previous) = last_ts.get(&hospital) {
            assert!(*previous <= ts, "{hospital}: stats timestamps went backwards");
        }
        last_ts.insert(hospital, ts);
    }
    assert!(snapshots > 3, "too few stats snapshots ({snapshots})");

    // Every diversion the coordinator issued satisfies the rules: origin
    // differs from destination, and gravity diversions target the
    // reference center.
    let mut sub = check_bus.subscribe(&[topics::DIVERSION_ALERTS], "check-diversions");
    while let Some(msg) = sub.try_next() {
        let origin = msg.payload["origin_hospital"].as_str().unwrap();
        let destination = msg.payload["destination_hospital"].as_str().unwrap();
        assert_ne!(origin, destination);
        if msg.payload["reason"] == "GRAVITY" {
            assert_eq!(destination, "chuac");
        }
    }

    // The coordinator published at least one aggregate status with a
    // sane shape.
    let mut sub = check_bus.subscribe(&[topics::COORDINATOR_STATUS], "check-status");
    let status = sub.try_next().expect("no coordinator status published");
    let mean = status.payload["mean_saturation"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&mean));
    assert_eq!(status.payload["on_call"]["total"], 6);
    for hospital in ["chuac", "modelo", "san_rafael"] {
        assert!(status.payload["hospitals"][hospital].is_object());
    }

    // Any capacity change kept the doctor bounds.
    let mut sub = check_bus.subscribe(&[topics::CAPACITY_CHANGE], "check-capacity");
    while let Some(msg) = sub.try_next() {
        let new_doctors = msg.payload["medicos_nuevos"].as_u64().unwrap();
        assert!((1..=4).contains(&new_doctors));
    }
}
