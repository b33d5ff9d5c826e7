//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use derms_ctl::config::Config;
use derms_ctl::contracts::SetpointMessage;
use derms_ctl::control::{ControlLoop, LoopState, PublishError, SetpointPublisher};
use derms_ctl::ingest::{Heartbeats, LatestMarkers, TelemetryHandler};
use derms_ctl::model::{Device, DeviceType, FeederInfo, TelemetryRow};
use derms_ctl::observe::Metrics;
use derms_ctl::repo::memory::MemoryStore;
use derms_ctl::repo::{DeviceRepo, RepoError, Repositories};
use derms_ctl::safety::{LastCommands, Readiness, SafetyPolicy, SafetyState};

/// Publisher that records every accepted message and can be told to fail.
/// Mirrors the transport's safety contract: successes close the breaker,
/// failures feed it.
pub struct RecordingPublisher {
    sent: Mutex<Vec<SetpointMessage>>,
    fail: AtomicBool,
    safety: Mutex<Option<Arc<SafetyState>>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            safety: Mutex::new(None),
        })
    }

    pub fn attach_safety(&self, safety: Arc<SafetyState>) {
        *self.safety.lock() = Some(safety);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SetpointMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Latest accepted target for one device.
    pub fn last_target_for(&self, device_id: &str) -> Option<f64> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|m| m.envelope.device_id == device_id)
            .map(|m| m.payload.command.target_power_kw)
    }
}

#[async_trait]
impl SetpointPublisher for RecordingPublisher {
    async fn publish_setpoint(&self, msg: &SetpointMessage) -> Result<(), PublishError> {
        let safety = self.safety.lock().clone();
        if self.fail.load(Ordering::SeqCst) {
            if let Some(safety) = safety {
                safety.note_mqtt_failure("broker unavailable", derms_ctl::clock::now_ms());
            }
            return Err(PublishError::Transport("broker unavailable".to_string()));
        }
        if let Some(safety) = safety {
            safety.note_mqtt_success();
        }
        self.sent.lock().push(msg.clone());
        Ok(())
    }
}

/// Device repository that can be switched into a failing state, for
/// exercising DB_ERROR_BEHAVIOR paths.
pub struct FlakyDevices {
    inner: MemoryStore,
    fail: AtomicBool,
}

impl FlakyDevices {
    pub fn new(inner: MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RepoError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(RepoError::Storage("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceRepo for FlakyDevices {
    async fn list(&self) -> Result<Vec<Device>, RepoError> {
        self.check()?;
        self.inner.list().await
    }

    async fn upsert(&self, device: Device) -> Result<(), RepoError> {
        self.check()?;
        DeviceRepo::upsert(&self.inner, device).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Device>, RepoError> {
        self.check()?;
        self.inner.get_by_id(id).await
    }

    async fn list_feeders(&self) -> Result<Vec<FeederInfo>, RepoError> {
        self.check()?;
        self.inner.list_feeders().await
    }
}

/// Everything a control-cycle test needs to poke at.
pub struct ControlHarness {
    pub control: Arc<ControlLoop>,
    pub store: MemoryStore,
    pub devices: Arc<FlakyDevices>,
    pub publisher: Arc<RecordingPublisher>,
    pub safety: Arc<SafetyState>,
    pub readiness: Arc<Readiness>,
    pub heartbeats: Arc<Heartbeats>,
    pub last_commands: Arc<LastCommands>,
    pub metrics: Metrics,
    pub config: Config,
}

/// Builds a ready control loop over an in-memory store and a recording
/// publisher. Both readiness bits start raised.
pub fn control_harness(config: Config) -> ControlHarness {
    let store = MemoryStore::new();
    let devices = FlakyDevices::new(store.clone());
    let repos = Repositories {
        devices: devices.clone(),
        telemetry: Arc::new(store.clone()),
        events: Arc::new(store.clone()),
        dr_programs: Arc::new(store.clone()),
        decisions: Arc::new(store.clone()),
    };

    let publisher = RecordingPublisher::new();
    let safety = Arc::new(SafetyState::new(SafetyPolicy::from_config(&config)));
    publisher.attach_safety(Arc::clone(&safety));
    let readiness = Arc::new(Readiness::new());
    readiness.set_db_ready(true, None);
    readiness.set_bus_ready(true, None);
    let heartbeats = Arc::new(Heartbeats::new());
    let last_commands = Arc::new(LastCommands::new());
    let metrics = Metrics::new().expect("metrics registry");

    let control = ControlLoop::new(
        config.clone(),
        repos,
        publisher.clone(),
        Arc::clone(&safety),
        Arc::clone(&readiness),
        Arc::clone(&last_commands),
        Arc::clone(&heartbeats),
        Arc::new(LoopState::new()),
        metrics.clone(),
    );

    ControlHarness {
        control,
        store,
        devices,
        publisher,
        safety,
        readiness,
        heartbeats,
        last_commands,
        metrics,
        config,
    }
}

/// Config tuned for tests: 10 kW default feeder limit, 60 s cadence.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.control.feeder_default_limit_kw = 10.0;
    config.control.interval_ms = 60_000;
    config
}

/// Builds an EV device on feeder `f1`.
pub fn ev_device(id: &str, p_max_kw: f64, priority: u32) -> Device {
    Device::new(id, DeviceType::Ev, "s1", "f1", p_max_kw, priority)
}

/// Builds a PV device on feeder `f1`.
pub fn pv_device(id: &str, p_max_kw: f64) -> Device {
    Device::new(id, DeviceType::Pv, "s1", "f1", p_max_kw, 1)
}

/// Builds a persisted telemetry row on feeder `f1`.
pub fn telemetry_row(
    device_id: &str,
    device_type: DeviceType,
    ts_ms: i64,
    power_kw: f64,
    soc: Option<f64>,
) -> TelemetryRow {
    TelemetryRow {
        message_id: Uuid::new_v4(),
        device_id: device_id.to_string(),
        device_type,
        ts_ms,
        sent_at_ms: None,
        power_kw,
        soc,
        capabilities: None,
        site_id: "s1".to_string(),
        feeder_id: "f1".to_string(),
        source: "test".to_string(),
        message_version: 1,
        online: true,
    }
}

/// Raw telemetry v1 wire bytes for the ingest pipeline.
pub fn telemetry_bytes(
    device_id: &str,
    message_id: &str,
    ts_ms: i64,
    sent_at_ms: Option<i64>,
    power_kw: f64,
) -> Vec<u8> {
    let mut msg = json!({
        "v": 1,
        "messageType": "telemetry",
        "messageId": message_id,
        "deviceId": device_id,
        "deviceType": "ev",
        "timestampMs": ts_ms,
        "payload": {
            "readings": { "powerKw": power_kw, "soc": 0.4 },
            "status": { "online": true },
            "feederId": "f1"
        }
    });
    if let Some(sent) = sent_at_ms {
        msg["sentAtMs"] = json!(sent);
    }
    serde_json::to_vec(&msg).expect("fixture serializes")
}

/// Raw telemetry v1 wire bytes with an explicit device type and
/// capability caps block.
pub fn telemetry_bytes_with_caps(
    device_id: &str,
    message_id: &str,
    device_type: &str,
    ts_ms: i64,
    power_kw: f64,
    capabilities: serde_json::Value,
) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "v": 1,
        "messageType": "telemetry",
        "messageId": message_id,
        "deviceId": device_id,
        "deviceType": device_type,
        "timestampMs": ts_ms,
        "payload": {
            "readings": { "powerKw": power_kw },
            "capabilities": capabilities,
            "status": { "online": true },
            "feederId": "f1"
        }
    }))
    .expect("fixture serializes")
}

/// Everything an ingest test needs: the handler, its backing store, and
/// control of the flusher lifecycle.
pub struct IngestHarness {
    pub handler: Arc<TelemetryHandler>,
    pub store: MemoryStore,
    pub latest: Arc<LatestMarkers>,
    pub heartbeats: Arc<Heartbeats>,
    pub metrics: Metrics,
    shutdown_tx: watch::Sender<bool>,
}

impl IngestHarness {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Builds the ingest pipeline. With `spawn_flusher` false the queue backs
/// up, which is how the backpressure boundary is exercised.
pub fn ingest_harness(config: Config, spawn_flusher: bool) -> IngestHarness {
    let store = MemoryStore::new();
    let policy = SafetyPolicy::from_config(&config);
    let metrics = Metrics::new().expect("metrics registry");
    let latest = Arc::new(LatestMarkers::new());
    let heartbeats = Arc::new(Heartbeats::new());

    let (handler, flusher) = TelemetryHandler::new(
        &config,
        &policy,
        metrics.clone(),
        Arc::clone(&latest),
        Arc::clone(&heartbeats),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if spawn_flusher {
        tokio::spawn(flusher.run(shutdown_rx));
    } else {
        // Keep the receiver alive without draining so producers see a
        // full queue.
        std::mem::forget(flusher);
    }

    IngestHarness {
        handler,
        store,
        latest,
        heartbeats,
        metrics,
        shutdown_tx,
    }
}
