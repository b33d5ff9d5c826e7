//! Safety envelope: process-wide tunables, mutable safety state, and the
//! readiness registry consulted before every control cycle.

pub mod readiness;
pub mod state;

pub use readiness::{Readiness, ReadinessSnapshot};
pub use state::{
    BreakerDecision, CommandRecord, LastCommands, SafetySnapshot, SafetyState,
};

use std::time::Duration;

use crate::config::Config;

/// Process-wide safety tunables, frozen at startup.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    /// Consecutive cycle failures before the loop refuses to publish.
    pub max_consecutive_failures: u32,
    /// Consecutive publish failures before the MQTT breaker opens.
    pub mqtt_breaker_threshold: u32,
    /// How long the breaker stays open before a probe is allowed.
    pub mqtt_breaker_cooldown: Duration,
    /// Deadline applied to every repository query.
    pub db_query_timeout: Duration,
    /// Telemetry older than this is stale at read time.
    pub telemetry_stale: Duration,
    /// Upper bound on HOLD_LAST reuse.
    pub hold_last_max: Duration,
    /// How long shutdown waits for the in-flight cycle.
    pub shutdown_grace: Duration,
}

impl SafetyPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_consecutive_failures: cfg.control.max_consecutive_failures,
            mqtt_breaker_threshold: cfg.mqtt.breaker_threshold,
            mqtt_breaker_cooldown: Duration::from_millis(cfg.mqtt.breaker_cooldown_ms),
            db_query_timeout: cfg.db.query_timeout(),
            telemetry_stale: Duration::from_millis(cfg.telemetry.stale_ms),
            hold_last_max: Duration::from_millis(cfg.telemetry.hold_last_max_ms),
            shutdown_grace: Duration::from_millis(cfg.control.shutdown_grace_ms),
        }
    }
}
