//! Mutable safety state: failure counters, stop/degrade reasons, the MQTT
//! circuit breaker, and the last-command map.
//!
//! All mutation goes through the documented mutators; each shared map holds
//! its own mutex and no lock is ever taken while another is held.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::SafetyPolicy;
use crate::model::DeviceType;

/// What the publisher is allowed to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Publish normally.
    Closed,
    /// Cooldown elapsed; exactly one probe publish may be attempted.
    HalfOpen,
    /// Fail fast without touching the bus.
    Open {
        /// Milliseconds until a probe becomes allowed.
        remaining_ms: i64,
    },
}

/// Read-only view of the safety state for health reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetySnapshot {
    pub consecutive_failures: u32,
    pub stopped_reason: Option<String>,
    pub degraded_reason: Option<String>,
    pub breaker_open: bool,
}

#[derive(Default)]
struct Inner {
    consecutive_failures: u32,
    stopped_reason: Option<String>,
    degraded_reason: Option<String>,
    mqtt_failures: u32,
    breaker_open_until_ms: Option<i64>,
}

/// Process-wide safety state.
pub struct SafetyState {
    policy: SafetyPolicy,
    inner: Mutex<Inner>,
}

impl SafetyState {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A cycle completed cleanly: failure counters reset, degraded and
    /// stopped reasons clear, and the breaker closes.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.stopped_reason = None;
        inner.degraded_reason = None;
        inner.mqtt_failures = 0;
        inner.breaker_open_until_ms = None;
    }

    /// A cycle (or one of its stages) failed. Returns the new consecutive
    /// failure count; at the configured budget the loop enters the stopped
    /// state and refuses publishes until a successful cycle.
    pub fn record_failure(&self, subsystem: &str, reason: &str) -> u32 {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let detail = format!("{subsystem}:{reason}");
        inner.degraded_reason = Some(detail.clone());
        if inner.consecutive_failures >= self.policy.max_consecutive_failures {
            inner.stopped_reason = Some(detail);
        }
        inner.consecutive_failures
    }

    /// Immediately enters the stopped state (DB_ERROR_BEHAVIOR=STOP_LOOP).
    pub fn stop(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.stopped_reason = Some(reason.to_string());
        inner.degraded_reason = Some(reason.to_string());
    }

    /// A publish attempt failed. Once failures cross the breaker threshold
    /// the breaker opens for the cooldown window.
    pub fn note_mqtt_failure(&self, reason: &str, now_ms: i64) {
        let mut inner = self.inner.lock();
        inner.mqtt_failures += 1;
        inner.degraded_reason = Some(format!("mqtt:{reason}"));
        if inner.mqtt_failures >= self.policy.mqtt_breaker_threshold {
            inner.breaker_open_until_ms =
                Some(now_ms + self.policy.mqtt_breaker_cooldown.as_millis() as i64);
        }
    }

    /// A publish succeeded: the failure streak ends and the breaker closes.
    pub fn note_mqtt_success(&self) {
        let mut inner = self.inner.lock();
        inner.mqtt_failures = 0;
        inner.breaker_open_until_ms = None;
    }

    /// What the breaker currently allows.
    pub fn breaker_decision(&self, now_ms: i64) -> BreakerDecision {
        let inner = self.inner.lock();
        match inner.breaker_open_until_ms {
            None => BreakerDecision::Closed,
            Some(until) if now_ms < until => BreakerDecision::Open {
                remaining_ms: until - now_ms,
            },
            Some(_) => BreakerDecision::HalfOpen,
        }
    }

    /// True while the consecutive-failure budget is exhausted.
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped_reason.is_some()
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        let inner = self.inner.lock();
        SafetySnapshot {
            consecutive_failures: inner.consecutive_failures,
            stopped_reason: inner.stopped_reason.clone(),
            degraded_reason: inner.degraded_reason.clone(),
            breaker_open: inner.breaker_open_until_ms.is_some(),
        }
    }

    /// Marks the process degraded without counting a failure (e.g. the
    /// readiness gate refusing a cycle).
    pub fn set_degraded(&self, reason: &str) {
        self.inner.lock().degraded_reason = Some(reason.to_string());
    }
}

/// The most recent acknowledged command for one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandRecord {
    pub target_kw: f64,
    /// When the command was acknowledged, epoch ms.
    pub at_ms: i64,
    /// TTL carried by the command.
    pub valid_until_ms: i64,
    /// Needed to rebuild an envelope when only the command survives a
    /// repository outage.
    pub device_type: DeviceType,
}

/// Last acknowledged command per device, updated only on publish ACK.
#[derive(Default)]
pub struct LastCommands {
    map: Mutex<HashMap<String, CommandRecord>>,
}

impl LastCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<CommandRecord> {
        self.map.lock().get(device_id).copied()
    }

    pub fn record(&self, device_id: &str, record: CommandRecord) {
        self.map.lock().insert(device_id.to_string(), record);
    }

    /// Devices that have ever been commanded, sorted for determinism.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
