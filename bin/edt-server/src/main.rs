//! EDTwin all-in-one server.
//!
//! Hosts the three hospital simulations, the cross-hospital coordinator
//! and the demand predictor over a single in-process bus, and accepts the
//! control commands on stdin:
//!
//! ```text
//! start | stop | speed <float> | inject-incident <kind> [lat lon] <count> | quit
//! ```
//!
//! Configuration comes from `edtwin.toml` (if present) with environment
//! overrides (`BUS_BOOTSTRAP`, `BUS_GROUP_ID`, `SIMULATION_SPEED`,
//! `SIMULATION_DURATION`, `EDTWIN_*`).

use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

use edt_bus::{BusClient, BusClientConfig, MemoryBroker};
use edt_common::schemas::{GeoPoint, Incident, SimulationControl};
use edt_common::topics;
use edt_common::triage::TriageLevel;
use edt_config::ConfigLoader;
use edt_coordinator::Coordinator;
use edt_predict::PredictorService;
use edt_sim::{NeutralContextProvider, SimulatorOrchestrator};

/// EDTwin development server.
#[derive(Parser, Debug)]
#[command(name = "edt-server")]
#[command(about = "Emergency-department digital twin - all services in one binary")]
struct Args {
    /// Configuration file path (falls back to the standard search paths)
    #[arg(long, env = "EDTWIN_CONFIG")]
    config: Option<String>,

    /// Simulation speed override (simulated minutes per wall second)
    #[arg(long)]
    speed: Option<f64>,

    /// Simulated duration override in minutes (0 = unbounded)
    #[arg(long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    edt_common::logging::init_logging("edt-server");

    let args = Args::parse();
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;
    if let Some(speed) = args.speed {
        config.simulation.speed = speed;
    }
    if let Some(duration) = args.duration {
        config.simulation.duration_minutes = duration;
    }
    config.validate()?;

    info!(
        bootstrap = %config.bus.bootstrap,
        speed = config.simulation.speed,
        duration_minutes = config.simulation.duration_minutes,
        "Starting EDTwin server"
    );

    // One in-process broker shared by every service.
    let broker = MemoryBroker::new();
    broker.ensure_topics(topics::ALL, config.bus.default_partitions);

    let client_config = BusClientConfig {
        send_timeout: std::time::Duration::from_secs(config.bus.send_timeout_seconds),
        max_send_attempts: config.bus.max_send_attempts,
        outbox_capacity: config.bus.outbox_capacity,
    };

    let simulator_bus = Arc::new(BusClient::with_config(
        Arc::clone(&broker),
        "simulator",
        client_config.clone(),
    ));
    let coordinator_bus = Arc::new(BusClient::with_config(
        Arc::clone(&broker),
        "coordinator",
        client_config.clone(),
    ));
    let predictor_bus = Arc::new(BusClient::with_config(
        Arc::clone(&broker),
        "predictor",
        client_config.clone(),
    ));
    let control_bus = Arc::new(BusClient::with_config(
        Arc::clone(&broker),
        "control-cli",
        client_config,
    ));

    let mut simulator = SimulatorOrchestrator::new(
        Arc::clone(&simulator_bus),
        config.simulation.clone(),
        Arc::new(NeutralContextProvider),
    );
    let mut coordinator = Coordinator::new(Arc::clone(&coordinator_bus), &config.coordinator);
    let mut predictor = PredictorService::new(
        Arc::clone(&predictor_bus),
        &config.predictor,
        config.simulation.speed,
    );

    simulator.start();
    coordinator.start();
    predictor.start();
    info!("All services running; type 'start', 'stop', 'speed <f>', 'inject-incident <kind> [lat lon] <count>' or 'quit'");

    // Drive the control interface until quit/ctrl-c.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(line.trim(), &control_bus, &coordinator).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        // stdin closed (e.g. running detached); wait for ctrl-c.
                        signal::ctrl_c().await?;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read control input");
                        break;
                    }
                }
            }
        }
    }

    simulator.stop();
    coordinator.stop();
    predictor.stop();
    simulator.join().await;
    coordinator.join().await;
    predictor.join().await;

    // Anything still queued in producer outboxes gets a final chance.
    for bus in [&simulator_bus, &coordinator_bus, &predictor_bus, &control_bus] {
        let pending = bus.flush().await;
        if pending > 0 {
            warn!(client = bus.client_id(), pending = pending, "Outbox not fully drained");
        }
    }

    info!("EDTwin server stopped");
    Ok(())
}

/// Returns false when the server should exit.
async fn handle_command(
    line: &str,
    control_bus: &Arc<BusClient>,
    coordinator: &Coordinator,
) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => true,
        ["quit"] | ["exit"] => false,
        ["start"] => {
            publish_control(control_bus, SimulationControl::start()).await;
            true
        }
        ["stop"] => {
            publish_control(control_bus, SimulationControl::stop()).await;
            true
        }
        ["speed", value] => {
            match value.parse::<f64>() {
                Ok(speed) if speed >= 0.1 => {
                    publish_control(control_bus, SimulationControl::set_speed(speed)).await;
                }
                _ => warn!(value = %value, "speed expects a float >= 0.1"),
            }
            true
        }
        ["inject-incident", kind, count] => {
            inject_incident(coordinator, kind, None, count).await;
            true
        }
        ["inject-incident", kind, lat, lon, count] => {
            let location = match (lat.parse::<f64>(), lon.parse::<f64>()) {
                (Ok(lat), Ok(lon)) => Some(GeoPoint { lat, lon }),
                _ => {
                    warn!("inject-incident expects numeric lat/lon");
                    return true;
                }
            };
            inject_incident(coordinator, kind, location, count).await;
            true
        }
        _ => {
            warn!(input = %line, "Unknown command");
            true
        }
    }
}

async fn publish_control(bus: &Arc<BusClient>, control: SimulationControl) {
    if let Err(e) = bus.produce(topics::SIMULATION_CONTROL, &control, None).await {
        error!(error = %e, "Failed to publish control command");
    }
}

async fn inject_incident(
    coordinator: &Coordinator,
    kind: &str,
    location: Option<GeoPoint>,
    count: &str,
) {
    let Ok(total) = count.parse::<u32>() else {
        warn!(value = %count, "inject-incident expects an integer casualty count");
        return;
    };
    if total == 0 {
        warn!("inject-incident needs at least one casualty");
        return;
    }

    let incident = Incident {
        incident_id: Uuid::new_v4().to_string(),
        kind: kind.to_uppercase(),
        triage_distribution: triage_distribution_for(kind),
        total_patients: total,
        location,
    };
    coordinator.distribute_incident(&incident).await;
}

/// Casualty severity mix per incident kind.
fn triage_distribution_for(kind: &str) -> Vec<(TriageLevel, f64)> {
    match kind.to_uppercase().as_str() {
        "ACCIDENT" | "COLLAPSE" => vec![
            (TriageLevel::Red, 0.15),
            (TriageLevel::Orange, 0.25),
            (TriageLevel::Yellow, 0.35),
            (TriageLevel::Green, 0.25),
        ],
        "FIRE" => vec![
            (TriageLevel::Red, 0.20),
            (TriageLevel::Orange, 0.30),
            (TriageLevel::Yellow, 0.30),
            (TriageLevel::Green, 0.20),
        ],
        "INTOXICATION" => vec![
            (TriageLevel::Orange, 0.20),
            (TriageLevel::Yellow, 0.40),
            (TriageLevel::Green, 0.40),
        ],
        _ => vec![
            (TriageLevel::Orange, 0.15),
            (TriageLevel::Yellow, 0.35),
            (TriageLevel::Green, 0.35),
            (TriageLevel::Blue, 0.15),
        ],
    }
}
