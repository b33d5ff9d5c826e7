//! Closed-loop dispatch: allocator, DR policy, decision records, and the
//! periodic control cycle.

pub mod allocator;
pub mod cycle;
pub mod decision;
pub mod dr;

pub use allocator::{allocate, Allocation, DispatchDevice};
pub use cycle::ControlLoop;
pub use decision::{DecisionRecord, DeviceDecision, FeederDecision, PublishOutcome};

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::contracts::SetpointMessage;

/// Publish failure surfaced to the control loop.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PublishError {
    /// The breaker is open; the bus was not contacted.
    #[error("mqtt breaker open, retry in {remaining_ms}ms")]
    BreakerOpen { remaining_ms: i64 },
    #[error("publish timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Outbound port the control loop publishes setpoints through.
///
/// The MQTT transport is the production implementation; tests substitute a
/// recording fake.
#[async_trait]
pub trait SetpointPublisher: Send + Sync {
    async fn publish_setpoint(&self, msg: &SetpointMessage) -> Result<(), PublishError>;
}

/// Control-loop status surfaced in the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    /// No cycle has run yet.
    Idle,
    Ok,
    Degraded,
    Error,
    /// No cycle has completed within the stall threshold.
    Stalled,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Stalled => "stalled",
        }
    }
}

/// Read-only view of the loop runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSnapshot {
    pub status: LoopStatus,
    pub last_started_ms: Option<i64>,
    pub last_finished_ms: Option<i64>,
    pub last_duration_ms: Option<i64>,
    pub last_error: Option<String>,
}

struct LoopStateInner {
    status: LoopStatus,
    last_started_ms: Option<i64>,
    last_finished_ms: Option<i64>,
    last_duration_ms: Option<i64>,
    last_error: Option<String>,
    last_alert_ms: HashMap<&'static str, i64>,
}

/// Runtime health of the control loop, shared with the health snapshot.
pub struct LoopState {
    inner: Mutex<LoopStateInner>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LoopStateInner {
                status: LoopStatus::Idle,
                last_started_ms: None,
                last_finished_ms: None,
                last_duration_ms: None,
                last_error: None,
                last_alert_ms: HashMap::new(),
            }),
        }
    }

    pub fn cycle_started(&self, now_ms: i64) {
        self.inner.lock().last_started_ms = Some(now_ms);
    }

    pub fn cycle_finished(
        &self,
        now_ms: i64,
        duration_ms: i64,
        status: LoopStatus,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock();
        inner.last_finished_ms = Some(now_ms);
        inner.last_duration_ms = Some(duration_ms);
        inner.status = status;
        inner.last_error = error;
    }

    /// Marks a cycle that was refused (readiness gate) without running.
    pub fn cycle_refused(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.status = LoopStatus::Degraded;
        inner.last_error = Some(reason.to_string());
    }

    /// Cooldown-gated alert check; returns `true` when the alert should
    /// fire and stamps the cooldown window.
    pub fn should_alert(&self, kind: &'static str, now_ms: i64, cooldown_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        match inner.last_alert_ms.get(kind) {
            Some(last) if now_ms - last < cooldown_ms => false,
            _ => {
                inner.last_alert_ms.insert(kind, now_ms);
                true
            }
        }
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        let inner = self.inner.lock();
        LoopSnapshot {
            status: inner.status,
            last_started_ms: inner.last_started_ms,
            last_finished_ms: inner.last_finished_ms,
            last_duration_ms: inner.last_duration_ms,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_state_starts_idle() {
        let state = LoopState::new();
        let snap = state.snapshot();
        assert_eq!(snap.status, LoopStatus::Idle);
        assert_eq!(snap.last_finished_ms, None);
    }

    #[test]
    fn cycle_bookkeeping_updates_snapshot() {
        let state = LoopState::new();
        state.cycle_started(1_000);
        state.cycle_finished(1_250, 250, LoopStatus::Ok, None);
        let snap = state.snapshot();
        assert_eq!(snap.status, LoopStatus::Ok);
        assert_eq!(snap.last_started_ms, Some(1_000));
        assert_eq!(snap.last_finished_ms, Some(1_250));
        assert_eq!(snap.last_duration_ms, Some(250));
    }

    #[test]
    fn alerts_respect_the_cooldown() {
        let state = LoopState::new();
        assert!(state.should_alert("offline_devices", 0, 1_000));
        assert!(!state.should_alert("offline_devices", 500, 1_000));
        assert!(state.should_alert("offline_devices", 1_500, 1_000));
        // Independent cooldown per alert kind.
        assert!(state.should_alert("control_loop_stalled", 500, 1_000));
    }
}
