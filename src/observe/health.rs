//! Aggregate health snapshot for the external HTTP layer.

use std::sync::Arc;

use serde::Serialize;

use crate::clock;
use crate::control::{LoopState, LoopStatus};
use crate::ingest::Heartbeats;
use crate::safety::{Readiness, SafetyState};

/// Top-level health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbHealth {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusHealth {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLoopHealth {
    pub status: LoopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_iteration_iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub offline_devices: Vec<String>,
    pub offline_count: usize,
    pub heartbeat_timeout_seconds: u64,
    pub stall_threshold_seconds: u64,
}

/// The shape consumed by the external health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: OverallStatus,
    pub db: DbHealth,
    pub bus: BusHealth,
    pub control_loop: ControlLoopHealth,
}

/// Assembles health snapshots from the live components.
pub struct Health {
    readiness: Arc<Readiness>,
    safety: Arc<SafetyState>,
    loop_state: Arc<LoopState>,
    heartbeats: Arc<Heartbeats>,
    heartbeat_timeout_seconds: u64,
    stall_threshold_seconds: u64,
}

impl Health {
    pub fn new(
        readiness: Arc<Readiness>,
        safety: Arc<SafetyState>,
        loop_state: Arc<LoopState>,
        heartbeats: Arc<Heartbeats>,
        heartbeat_timeout_seconds: u64,
        stall_threshold_seconds: u64,
    ) -> Self {
        Self {
            readiness,
            safety,
            loop_state,
            heartbeats,
            heartbeat_timeout_seconds,
            stall_threshold_seconds,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_at(clock::now_ms())
    }

    /// Snapshot at an explicit instant (deterministic in tests).
    pub fn snapshot_at(&self, now_ms: i64) -> HealthSnapshot {
        let readiness = self.readiness.snapshot();
        let safety = self.safety.snapshot();
        let loop_snap = self.loop_state.snapshot();

        let stall_threshold_ms = self.stall_threshold_seconds as i64 * 1_000;
        let stalled = match (loop_snap.last_finished_ms, loop_snap.last_started_ms) {
            (Some(finished), _) => now_ms - finished > stall_threshold_ms,
            (None, Some(started)) => now_ms - started > stall_threshold_ms,
            (None, None) => false,
        };

        let loop_status = if stalled {
            LoopStatus::Stalled
        } else {
            loop_snap.status
        };

        let status = if safety.stopped_reason.is_some() || loop_status == LoopStatus::Error {
            OverallStatus::Error
        } else if !readiness.db_ready
            || !readiness.bus_ready
            || safety.degraded_reason.is_some()
            || stalled
        {
            OverallStatus::Degraded
        } else {
            OverallStatus::Ok
        };

        let offline_devices = self
            .heartbeats
            .offline(now_ms, self.heartbeat_timeout_seconds as i64 * 1_000);

        HealthSnapshot {
            status,
            db: DbHealth {
                ok: readiness.db_ready,
                reason: readiness.db_reason,
            },
            bus: BusHealth {
                connected: readiness.bus_ready,
                last_error: readiness.bus_last_error,
            },
            control_loop: ControlLoopHealth {
                status: loop_status,
                last_iteration_iso: loop_snap.last_finished_ms.and_then(clock::ms_to_iso),
                last_duration_ms: loop_snap.last_duration_ms,
                last_error: loop_snap
                    .last_error
                    .or(safety.degraded_reason)
                    .or(safety.stopped_reason),
                offline_count: offline_devices.len(),
                offline_devices,
                heartbeat_timeout_seconds: self.heartbeat_timeout_seconds,
                stall_threshold_seconds: self.stall_threshold_seconds,
            },
        }
    }
}
