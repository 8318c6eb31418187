//! Cell coordinator - event fusion and coordination for the lab cell
//!
//! Fuses raw sensor and NFC events into part-level events and drives the
//! station and corner state machines of a two-station, four-corner loop.
//!
//! Module structure:
//! - `domain/` - Event model, cell topology, parts
//! - `io/` - Queues, producers, actuators, telemetry, MQTT, Prometheus
//! - `services/` - Fusion, CEP consumer, controllers, collision manager, KPIs
//! - `infra/` - Infrastructure (Config, Metrics)

use cell_coordinator::domain::part::new_uuid_v7;
use cell_coordinator::domain::RawSource;
use cell_coordinator::infra::{Config, Metrics};
use cell_coordinator::io::{
    create_telemetry_channel, spawn_sensor_producer, spawn_tag_producer, ActuatorSink, EventLog,
    IdleSource, MqttPublisher, QueueSet, SimulatedActuators,
};
use cell_coordinator::services::{
    Cell, CepConsumer, CepSettings, CollisionManager, FusionEngine, HealthMonitor, TelemetryWorker,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Cell coordinator - CEP event fusion for the lab conveyor cell
#[derive(Parser, Debug)]
#[command(name = "cell-coordinator", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/cell.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

/// Producers block on hardware reads for at most this long between shutdown checks
const PRODUCER_POLL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Default: INFO, use RUST_LOG=debug for per-event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    }

    info!(git_hash = %env!("GIT_HASH"), "cell-coordinator starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let run_id = new_uuid_v7();

    info!(
        config_file = %config.config_file(),
        cell = %config.cell_id(),
        run_id = %run_id,
        simulation = %config.simulation(),
        stations = %config.topology().stations().len(),
        corners = %config.topology().corners().len(),
        identification_window_ms = %config.identification_window().as_millis(),
        process_window_ms = %config.process_window().as_millis(),
        overflow_policy = ?config.overflow_policy(),
        mqtt_enabled = %config.mqtt_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Telemetry worker owns every file and network write
    let (telemetry, telemetry_rx) =
        create_telemetry_channel(config.telemetry_capacity(), config.cell_id().to_string());
    let telemetry = telemetry.with_metrics(metrics.clone());
    let mut worker = TelemetryWorker::new(
        telemetry_rx,
        config.cell_id(),
        EventLog::new(config.event_log_file(), &run_id),
        Duration::from_secs(config.kpi_interval_secs()),
    )
    .with_drain_timeout(config.shutdown_grace() + Duration::from_secs(1));
    if config.mqtt_enabled() {
        worker = worker.with_mqtt(MqttPublisher::new(&config));
    }
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    let queues = QueueSet::from_config(&config, metrics.clone());
    let collision = Arc::new(CollisionManager::new(
        config.topology().corners(),
        config.mutually_exclusive(),
        config.min_reuse_interval(),
    ));

    if !config.simulation() {
        warn!("hardware drivers not linked into this build, using simulated I/O");
    }
    let actuators: Arc<dyn ActuatorSink> = Arc::new(SimulatedActuators::new());

    // One producer per sensor class, one per NFC reader
    let mut producers = Vec::new();
    let mut started_classes: Vec<RawSource> = Vec::new();
    for channel in config.topology().channels() {
        let Some(queue) = queues.queue_for(channel) else {
            continue;
        };
        match channel.source {
            RawSource::Tag => producers.push(spawn_tag_producer(
                Box::new(IdleSource),
                channel.id.clone(),
                queue,
                PRODUCER_POLL,
                shutdown_rx.clone(),
            )),
            class if !started_classes.contains(&class) => {
                started_classes.push(class);
                producers.push(spawn_sensor_producer(
                    Box::new(IdleSource),
                    class,
                    queue,
                    PRODUCER_POLL,
                    shutdown_rx.clone(),
                ));
            }
            _ => {}
        }
    }
    info!(producers = %producers.len(), "producers_started");

    let health = HealthMonitor::new(
        queues.clone(),
        collision.clone(),
        metrics.clone(),
        config.topology().conveyors(),
        Duration::from_secs(config.metrics_interval_secs().max(1)),
    )
    .with_telemetry(telemetry.clone());
    tokio::spawn(health.run(shutdown_rx.clone()));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_cell = config.cell_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = cell_coordinator::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_cell,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    let topology = Arc::new(config.topology().clone());
    let fusion =
        FusionEngine::new(topology, config.identification_window(), config.process_window())
            .with_metrics(metrics.clone());
    let cell = Cell::new(
        &config,
        collision.clone(),
        actuators.clone(),
        telemetry.clone(),
        metrics.clone(),
    );
    let consumer = CepConsumer::new(
        queues,
        fusion,
        cell,
        collision,
        actuators,
        telemetry,
        metrics,
        CepSettings::from_config(&config),
    );
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));
    info!("cep_consumer_started");

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let stats = consumer_handle.await?;
    for producer in producers {
        if let Err(e) = producer.await {
            warn!(error = %e, "producer_join_failed");
        }
    }
    // Channel closes once the consumer and producers are gone
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "telemetry_worker_join_failed");
    }

    info!(
        delivered = %stats.delivered,
        rejected = %stats.rejected,
        discarded = %stats.discarded,
        forced_reset = %stats.forced_reset,
        "cell-coordinator shutdown complete"
    );
    Ok(())
}
