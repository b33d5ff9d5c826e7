//! Controller entry point: config, wiring, and graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use derms_ctl::config::Config;
use derms_ctl::control::{ControlLoop, LoopState};
use derms_ctl::ingest::{Heartbeats, LatestMarkers, TelemetryHandler};
use derms_ctl::mqtt::MqttTransport;
use derms_ctl::observe::{Health, Metrics};
use derms_ctl::repo::memory::MemoryStore;
use derms_ctl::repo::Repositories;
use derms_ctl::safety::{LastCommands, Readiness, SafetyPolicy, SafetyState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; a missing file is not an error.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (config, config_errors) = Config::from_env();
    for e in &config_errors {
        warn!(key = %e.key, value = %e.value, "malformed environment value, using default");
    }
    let violations = config.validate();
    if !violations.is_empty() {
        for v in &violations {
            error!("{v}");
        }
        anyhow::bail!("configuration invalid ({} violation(s))", violations.len());
    }
    info!(%config, "starting controller");

    // Components, leaves first.
    let metrics = Metrics::new().context("metrics registry")?;
    metrics.up.set(1.0);

    let policy = SafetyPolicy::from_config(&config);
    let safety = Arc::new(SafetyState::new(policy.clone()));
    let readiness = Arc::new(Readiness::new());
    let last_commands = Arc::new(LastCommands::new());
    let latest = Arc::new(LatestMarkers::new());
    let heartbeats = Arc::new(Heartbeats::new());
    let loop_state = Arc::new(LoopState::new());

    // The in-memory store backs the standalone binary; a relational
    // implementation of the same traits replaces it in deployment.
    let store = MemoryStore::new();
    let repos = Repositories {
        devices: Arc::new(store.clone()),
        telemetry: Arc::new(store.clone()),
        events: Arc::new(store.clone()),
        dr_programs: Arc::new(store.clone()),
        decisions: Arc::new(store),
    };
    readiness.set_db_ready(true, None);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Ingest path: handler plus its single flusher.
    let (handler, flusher) = TelemetryHandler::new(
        &config,
        &policy,
        metrics.clone(),
        Arc::clone(&latest),
        Arc::clone(&heartbeats),
        Arc::clone(&repos.telemetry),
        Arc::clone(&repos.devices),
    );
    let flusher_task = tokio::spawn(flusher.run(shutdown_rx.clone()));

    // Transport; never blocks startup on the broker.
    let (transport, transport_task) = MqttTransport::start(
        config.mqtt.clone(),
        handler,
        Arc::clone(&readiness),
        Arc::clone(&safety),
        metrics.clone(),
        shutdown_rx.clone(),
    );

    let health = Health::new(
        Arc::clone(&readiness),
        Arc::clone(&safety),
        Arc::clone(&loop_state),
        Arc::clone(&heartbeats),
        config.control.heartbeat_timeout_seconds,
        config.control.stall_threshold_seconds,
    );

    let control = ControlLoop::new(
        config.clone(),
        repos,
        transport,
        Arc::clone(&safety),
        Arc::clone(&readiness),
        last_commands,
        Arc::clone(&heartbeats),
        Arc::clone(&loop_state),
        metrics.clone(),
    );
    let control_task = tokio::spawn(Arc::clone(&control).run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!(
        status = ?health.snapshot().status,
        "shutdown signal received, stopping"
    );

    // Ordered shutdown: stop the timer, let the in-flight cycle finish,
    // drain the telemetry queue, then close the bus.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(policy.shutdown_grace, control_task)
        .await
        .is_err()
    {
        warn!("control loop did not stop within the grace period");
    }
    if tokio::time::timeout(policy.shutdown_grace, flusher_task)
        .await
        .is_err()
    {
        warn!("telemetry flusher did not drain within the grace period");
    }
    if tokio::time::timeout(policy.shutdown_grace, transport_task)
        .await
        .is_err()
    {
        warn!("transport did not close within the grace period");
    }
    metrics.up.set(0.0);
    info!("controller stopped");
    Ok(())
}
