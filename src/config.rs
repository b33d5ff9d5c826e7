//! Environment-driven runtime configuration with safe defaults.
//!
//! Every tunable the controller consumes is read from the environment once
//! at startup. Absent keys fall back to documented defaults; malformed
//! values are collected and reported rather than silently replaced.

use std::fmt;
use std::time::Duration;

/// How the control loop treats a device whose telemetry is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingTelemetryBehavior {
    /// Assume 0 kW actual, exclude from allocation, command zero.
    SafeZero,
    /// Reuse the last known value up to `hold_last_max_ms`.
    HoldLast,
    /// Drop the device from the cycle entirely.
    ExcludeDevice,
}

impl MissingTelemetryBehavior {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "SAFE_ZERO" => Some(Self::SafeZero),
            "HOLD_LAST" => Some(Self::HoldLast),
            "EXCLUDE_DEVICE" => Some(Self::ExcludeDevice),
            _ => None,
        }
    }
}

/// How the control loop reacts to a repository failure mid-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorBehavior {
    /// Publish zero setpoints to every previously commanded device.
    SafeZeroAll,
    /// Leave prior commands untouched and let TTLs run down.
    HoldLast,
    /// Enter the stopped state immediately.
    StopLoop,
}

impl DbErrorBehavior {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "SAFE_ZERO_ALL" => Some(Self::SafeZeroAll),
            "HOLD_LAST" => Some(Self::HoldLast),
            "STOP_LOOP" => Some(Self::StopLoop),
            _ => None,
        }
    }
}

/// What the controller publishes on startup, before the first cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartBehavior {
    /// Issue a global safe-zero to all known dispatchables.
    SafeZero,
    /// Publish nothing; reuse whatever the devices last received.
    HoldLast,
}

impl RestartBehavior {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "SAFE_ZERO" => Some(Self::SafeZero),
            "HOLD_LAST" => Some(Self::HoldLast),
            _ => None,
        }
    }
}

/// Allocation strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Score-weighted proportional split with slack redistribution.
    Heuristic,
    /// SOC-gated greedy fill (solver-shaped objective).
    Optimizer,
}

impl AllocationMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "heuristic" => Some(Self::Heuristic),
            "optimizer" => Some(Self::Optimizer),
            _ => None,
        }
    }

    /// Name recorded in setpoint reasons and decision records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::Optimizer => "optimizer",
        }
    }
}

/// Optimizer-mode switches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerParams {
    /// Gate devices at or above target SOC to zero allocation.
    pub enforce_target_soc: bool,
    /// Whether an external solver may be used when one is linked in.
    pub solver_enabled: bool,
}

/// Parameters consumed by the allocator each cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlParams {
    /// Optional global cap applied on top of per-feeder headroom (kW).
    pub global_kw_limit: Option<f64>,
    /// SOC floor below which devices receive a scoring bonus.
    pub min_soc_reserve: f64,
    /// SOC the allocator steers devices toward.
    pub target_soc: f64,
    /// Multiply priority weight by 1.5 when set.
    pub respect_priority: bool,
    /// Weight of the SOC deficit term in device scoring.
    pub soc_weight: f64,
    pub allocation_mode: AllocationMode,
    pub optimizer: OptimizerParams,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            global_kw_limit: None,
            min_soc_reserve: 0.2,
            target_soc: 0.8,
            respect_priority: true,
            soc_weight: 1.0,
            allocation_mode: AllocationMode::Heuristic,
            optimizer: OptimizerParams {
                enforce_target_soc: true,
                solver_enabled: false,
            },
        }
    }
}

/// Control loop cadence and failure policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    /// Cycle cadence in ms.
    pub interval_ms: u64,
    /// Fallback feeder limit when no event is active (kW).
    pub feeder_default_limit_kw: f64,
    /// Feeder assigned to telemetry that names neither feeder nor site.
    pub default_feeder_id: String,
    pub params: ControlParams,
    pub db_error_behavior: DbErrorBehavior,
    pub restart_behavior: RestartBehavior,
    /// Consecutive-failure budget before the loop refuses to publish.
    pub max_consecutive_failures: u32,
    pub stall_threshold_seconds: u64,
    pub alert_cooldown_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    /// How long shutdown waits for an in-flight cycle.
    pub shutdown_grace_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            feeder_default_limit_kw: 100.0,
            default_feeder_id: "feeder-1".to_string(),
            params: ControlParams::default(),
            db_error_behavior: DbErrorBehavior::SafeZeroAll,
            restart_behavior: RestartBehavior::SafeZero,
            max_consecutive_failures: 5,
            stall_threshold_seconds: 300,
            alert_cooldown_seconds: 300,
            heartbeat_timeout_seconds: 120,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl ControlConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Telemetry ingest freshness and batching.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Samples older than this are stale at read time (ms).
    pub stale_ms: u64,
    pub missing_behavior: MissingTelemetryBehavior,
    /// Upper bound on HOLD_LAST reuse (ms).
    pub hold_last_max_ms: u64,
    /// Samples stamped further in the future than this are rejected (ms).
    pub allowed_future_skew_ms: u64,
    pub batch_size: usize,
    pub batch_flush_ms: u64,
    pub max_queue_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stale_ms: 30_000,
            missing_behavior: MissingTelemetryBehavior::SafeZero,
            hold_last_max_ms: 120_000,
            allowed_future_skew_ms: 30_000,
            batch_size: 100,
            batch_flush_ms: 500,
            max_queue_size: 5_000,
        }
    }
}

/// Message-bus connection and resilience settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    /// Prefix for both `{prefix}/telemetry/#` and `{prefix}/control/{id}`.
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Inbound payloads above this size are dropped undecoded.
    pub max_payload_bytes: usize,
    /// Deadline for one inbound message's full processing (ms).
    pub processing_timeout_ms: u64,
    /// Per-attempt publish deadline (ms).
    pub publish_timeout_ms: u64,
    pub max_retries: u32,
    /// Base backoff; attempt n waits `backoff * 2^n`.
    pub retry_backoff_ms: u64,
    /// Consecutive publish failures before the breaker opens.
    pub breaker_threshold: u32,
    /// How long the breaker stays open (ms).
    pub breaker_cooldown_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "derms-ctl".to_string(),
            topic_prefix: "derms".to_string(),
            username: None,
            password: None,
            max_payload_bytes: 64 * 1024,
            processing_timeout_ms: 5_000,
            publish_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 250,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

/// Repository query policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    pub query_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 5_000,
        }
    }
}

impl DbConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Demand-response price-elastic coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct DrConfig {
    /// Gain on `incentive_per_kwh` in the elastic response.
    pub k_boost: f64,
    /// Gain on `penalty_per_kwh` in the elastic response.
    pub k_shed: f64,
}

impl Default for DrConfig {
    fn default() -> Self {
        Self {
            k_boost: 0.05,
            k_shed: 0.05,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub control: ControlConfig,
    pub telemetry: TelemetryConfig,
    pub mqtt: MqttConfig,
    pub db: DbConfig,
    pub dr: DrConfig,
}

/// A malformed environment value, reported with its key and raw text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
}

fn read_parsed<T: std::str::FromStr>(key: &str, default: T, errors: &mut Vec<ConfigError>) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                errors.push(ConfigError {
                    key: key.to_string(),
                    value: raw,
                });
                default
            }
        },
        Err(_) => default,
    }
}

fn read_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn read_opt_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn read_bool(key: &str, default: bool, errors: &mut Vec<ConfigError>) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                errors.push(ConfigError {
                    key: key.to_string(),
                    value: raw,
                });
                default
            }
        },
        Err(_) => default,
    }
}

fn read_enum<T>(
    key: &str,
    default: T,
    parse: fn(&str) -> Option<T>,
    errors: &mut Vec<ConfigError>,
) -> T {
    match std::env::var(key) {
        Ok(raw) => match parse(raw.trim()) {
            Some(v) => v,
            None => {
                errors.push(ConfigError {
                    key: key.to_string(),
                    value: raw,
                });
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    /// Reads the full configuration from the environment.
    ///
    /// Returns the config alongside every malformed value encountered;
    /// malformed keys keep their defaults so the caller can decide whether
    /// to start anyway.
    pub fn from_env() -> (Self, Vec<ConfigError>) {
        let mut errors = Vec::new();
        let d = Config::default();

        let params = ControlParams {
            global_kw_limit: read_opt_string("CONTROL_GLOBAL_KW_LIMIT").and_then(|raw| {
                match raw.trim().parse::<f64>() {
                    Ok(v) => Some(v),
                    Err(_) => {
                        errors.push(ConfigError {
                            key: "CONTROL_GLOBAL_KW_LIMIT".to_string(),
                            value: raw,
                        });
                        None
                    }
                }
            }),
            min_soc_reserve: read_parsed(
                "CONTROL_MIN_SOC_RESERVE",
                d.control.params.min_soc_reserve,
                &mut errors,
            ),
            target_soc: read_parsed(
                "CONTROL_TARGET_SOC",
                d.control.params.target_soc,
                &mut errors,
            ),
            respect_priority: read_bool(
                "CONTROL_RESPECT_PRIORITY",
                d.control.params.respect_priority,
                &mut errors,
            ),
            soc_weight: read_parsed(
                "CONTROL_SOC_WEIGHT",
                d.control.params.soc_weight,
                &mut errors,
            ),
            allocation_mode: read_enum(
                "CONTROL_ALLOCATION_MODE",
                d.control.params.allocation_mode,
                AllocationMode::parse,
                &mut errors,
            ),
            optimizer: OptimizerParams {
                enforce_target_soc: read_bool(
                    "CONTROL_OPTIMIZER_ENFORCE_TARGET_SOC",
                    d.control.params.optimizer.enforce_target_soc,
                    &mut errors,
                ),
                solver_enabled: read_bool(
                    "CONTROL_OPTIMIZER_SOLVER_ENABLED",
                    d.control.params.optimizer.solver_enabled,
                    &mut errors,
                ),
            },
        };

        let control = ControlConfig {
            interval_ms: read_parsed("CONTROL_INTERVAL_MS", d.control.interval_ms, &mut errors),
            feeder_default_limit_kw: read_parsed(
                "FEEDER_DEFAULT_LIMIT_KW",
                d.control.feeder_default_limit_kw,
                &mut errors,
            ),
            default_feeder_id: read_string("DEFAULT_FEEDER_ID", &d.control.default_feeder_id),
            params,
            db_error_behavior: read_enum(
                "DB_ERROR_BEHAVIOR",
                d.control.db_error_behavior,
                DbErrorBehavior::parse,
                &mut errors,
            ),
            restart_behavior: read_enum(
                "RESTART_BEHAVIOR",
                d.control.restart_behavior,
                RestartBehavior::parse,
                &mut errors,
            ),
            max_consecutive_failures: read_parsed(
                "MAX_CONSECUTIVE_FAILURES",
                d.control.max_consecutive_failures,
                &mut errors,
            ),
            stall_threshold_seconds: read_parsed(
                "CONTROL_LOOP_STALL_THRESHOLD_SECONDS",
                d.control.stall_threshold_seconds,
                &mut errors,
            ),
            alert_cooldown_seconds: read_parsed(
                "ALERT_COOLDOWN_SECONDS",
                d.control.alert_cooldown_seconds,
                &mut errors,
            ),
            heartbeat_timeout_seconds: read_parsed(
                "DEVICE_HEARTBEAT_TIMEOUT_SECONDS",
                d.control.heartbeat_timeout_seconds,
                &mut errors,
            ),
            shutdown_grace_ms: read_parsed(
                "SHUTDOWN_GRACE_MS",
                d.control.shutdown_grace_ms,
                &mut errors,
            ),
        };

        let telemetry = TelemetryConfig {
            stale_ms: read_parsed("TELEMETRY_STALE_MS", d.telemetry.stale_ms, &mut errors),
            missing_behavior: read_enum(
                "TELEMETRY_MISSING_BEHAVIOR",
                d.telemetry.missing_behavior,
                MissingTelemetryBehavior::parse,
                &mut errors,
            ),
            hold_last_max_ms: read_parsed(
                "HOLD_LAST_MAX_MS",
                d.telemetry.hold_last_max_ms,
                &mut errors,
            ),
            allowed_future_skew_ms: read_parsed(
                "TELEMETRY_ALLOWED_FUTURE_SKEW_MS",
                d.telemetry.allowed_future_skew_ms,
                &mut errors,
            ),
            batch_size: read_parsed("TELEMETRY_BATCH_SIZE", d.telemetry.batch_size, &mut errors),
            batch_flush_ms: read_parsed(
                "TELEMETRY_BATCH_FLUSH_MS",
                d.telemetry.batch_flush_ms,
                &mut errors,
            ),
            max_queue_size: read_parsed(
                "TELEMETRY_MAX_QUEUE_SIZE",
                d.telemetry.max_queue_size,
                &mut errors,
            ),
        };

        let mqtt = MqttConfig {
            broker_host: read_string("MQTT_BROKER_HOST", &d.mqtt.broker_host),
            broker_port: read_parsed("MQTT_BROKER_PORT", d.mqtt.broker_port, &mut errors),
            client_id: read_string("MQTT_CLIENT_ID", &d.mqtt.client_id),
            topic_prefix: read_string("MQTT_TOPIC_PREFIX", &d.mqtt.topic_prefix)
                .trim_end_matches('/')
                .to_string(),
            username: read_opt_string("MQTT_USERNAME"),
            password: read_opt_string("MQTT_PASSWORD"),
            max_payload_bytes: read_parsed(
                "MQTT_MAX_PAYLOAD_BYTES",
                d.mqtt.max_payload_bytes,
                &mut errors,
            ),
            processing_timeout_ms: read_parsed(
                "MQTT_PROCESSING_TIMEOUT_MS",
                d.mqtt.processing_timeout_ms,
                &mut errors,
            ),
            publish_timeout_ms: read_parsed(
                "MQTT_PUBLISH_TIMEOUT_MS",
                d.mqtt.publish_timeout_ms,
                &mut errors,
            ),
            max_retries: read_parsed("MQTT_MAX_RETRIES", d.mqtt.max_retries, &mut errors),
            retry_backoff_ms: read_parsed(
                "MQTT_RETRY_BACKOFF_MS",
                d.mqtt.retry_backoff_ms,
                &mut errors,
            ),
            breaker_threshold: read_parsed(
                "MQTT_BREAKER_THRESHOLD",
                d.mqtt.breaker_threshold,
                &mut errors,
            ),
            breaker_cooldown_ms: read_parsed(
                "MQTT_BREAKER_COOLDOWN_MS",
                d.mqtt.breaker_cooldown_ms,
                &mut errors,
            ),
        };

        let db = DbConfig {
            query_timeout_ms: read_parsed(
                "DB_QUERY_TIMEOUT_MS",
                d.db.query_timeout_ms,
                &mut errors,
            ),
        };

        let dr = DrConfig {
            k_boost: read_parsed("DR_K_BOOST", d.dr.k_boost, &mut errors),
            k_shed: read_parsed("DR_K_SHED", d.dr.k_shed, &mut errors),
        };

        (
            Self {
                control,
                telemetry,
                mqtt,
                db,
                dr,
            },
            errors,
        )
    }

    /// Semantic validation; returns every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let p = &self.control.params;

        if self.control.interval_ms == 0 {
            errors.push("CONTROL_INTERVAL_MS must be > 0".to_string());
        }
        if self.control.feeder_default_limit_kw < 0.0 {
            errors.push("FEEDER_DEFAULT_LIMIT_KW must be >= 0".to_string());
        }
        if self.control.default_feeder_id.is_empty() {
            errors.push("DEFAULT_FEEDER_ID must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&p.min_soc_reserve) {
            errors.push("CONTROL_MIN_SOC_RESERVE must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&p.target_soc) {
            errors.push("CONTROL_TARGET_SOC must be in [0, 1]".to_string());
        }
        if p.soc_weight < 0.0 {
            errors.push("CONTROL_SOC_WEIGHT must be >= 0".to_string());
        }
        if let Some(limit) = p.global_kw_limit {
            if limit < 0.0 {
                errors.push("CONTROL_GLOBAL_KW_LIMIT must be >= 0".to_string());
            }
        }
        if self.control.max_consecutive_failures == 0 {
            errors.push("MAX_CONSECUTIVE_FAILURES must be > 0".to_string());
        }
        if self.telemetry.batch_size == 0 {
            errors.push("TELEMETRY_BATCH_SIZE must be > 0".to_string());
        }
        if self.telemetry.max_queue_size == 0 {
            errors.push("TELEMETRY_MAX_QUEUE_SIZE must be > 0".to_string());
        }
        if self.mqtt.topic_prefix.is_empty() {
            errors.push("MQTT_TOPIC_PREFIX must not be empty".to_string());
        }
        if self.mqtt.max_payload_bytes == 0 {
            errors.push("MQTT_MAX_PAYLOAD_BYTES must be > 0".to_string());
        }
        if self.mqtt.breaker_threshold == 0 {
            errors.push("MQTT_BREAKER_THRESHOLD must be > 0".to_string());
        }
        if self.db.query_timeout_ms == 0 {
            errors.push("DB_QUERY_TIMEOUT_MS must be > 0".to_string());
        }
        if self.dr.k_boost < 0.0 || self.dr.k_shed < 0.0 {
            errors.push("DR_K_BOOST and DR_K_SHED must be >= 0".to_string());
        }

        errors
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interval={}ms feeder_default={}kW mode={} stale={}ms broker={}:{}",
            self.control.interval_ms,
            self.control.feeder_default_limit_kw,
            self.control.params.allocation_mode.as_str(),
            self.telemetry.stale_ms,
            self.mqtt.broker_host,
            self.mqtt.broker_port,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let cfg = Config::default();
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn default_values_match_documented_safe_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.control.interval_ms, 60_000);
        assert_eq!(cfg.telemetry.stale_ms, 30_000);
        assert_eq!(cfg.telemetry.allowed_future_skew_ms, 30_000);
        assert_eq!(cfg.control.max_consecutive_failures, 5);
        assert_eq!(
            cfg.telemetry.missing_behavior,
            MissingTelemetryBehavior::SafeZero
        );
    }

    #[test]
    fn validate_flags_bad_soc_bounds() {
        let mut cfg = Config::default();
        cfg.control.params.target_soc = 1.5;
        cfg.control.params.min_soc_reserve = -0.1;
        let errors = cfg.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn validate_flags_zero_interval_and_queue() {
        let mut cfg = Config::default();
        cfg.control.interval_ms = 0;
        cfg.telemetry.max_queue_size = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("CONTROL_INTERVAL_MS")));
        assert!(
            errors
                .iter()
                .any(|e| e.contains("TELEMETRY_MAX_QUEUE_SIZE"))
        );
    }

    #[test]
    fn behavior_enums_parse_wire_values() {
        assert_eq!(
            MissingTelemetryBehavior::parse("HOLD_LAST"),
            Some(MissingTelemetryBehavior::HoldLast)
        );
        assert_eq!(
            DbErrorBehavior::parse("STOP_LOOP"),
            Some(DbErrorBehavior::StopLoop)
        );
        assert_eq!(
            RestartBehavior::parse("SAFE_ZERO"),
            Some(RestartBehavior::SafeZero)
        );
        assert_eq!(
            AllocationMode::parse("optimizer"),
            Some(AllocationMode::Optimizer)
        );
        assert_eq!(AllocationMode::parse("lp"), None);
    }
}
