//! Structured decision records: one audit entry per control cycle.
//!
//! A record is emitted for every cycle, including failed ones, and is
//! never mutated after the cycle finishes.

use serde::Serialize;
use uuid::Uuid;

use crate::model::{DeviceType, ReasonCode};

/// How the cycle ended; doubles as the `result` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleResult {
    Ok,
    Degraded,
    Error,
}

impl CycleResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

/// What happened to one device's setpoint this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Sent and accepted by the transport.
    Published,
    /// Diff below epsilon and TTL not near expiry; nothing sent.
    Unchanged,
    /// Attempted and failed.
    Failed,
    /// Not attempted: breaker open or loop stopped.
    Suppressed,
    /// Device observed only (non-dispatchable or excluded from the cycle).
    NotApplicable,
}

/// Per-device detail inside a feeder decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDecision {
    pub device_id: String,
    pub device_type: DeviceType,
    /// Age of the newest sample at cycle time; `None` when none exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_age_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    /// Actual draw assumed for this cycle (post stale handling).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_kw: Option<f64>,
    pub allocated_kw: f64,
    /// Commanded setpoint; only present when a publish was accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setpoint_kw: Option<f64>,
    pub publish: PublishOutcome,
    pub reason_codes: Vec<ReasonCode>,
}

/// Per-feeder summary inside a decision record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeederDecision {
    pub feeder_id: String,
    /// Limit in force this cycle (active event, else the default).
    pub limit_kw: f64,
    pub raw_headroom_kw: f64,
    pub effective_headroom_kw: f64,
    pub allocated_kw: f64,
    pub unused_kw: f64,
    pub fresh_devices: u32,
    pub stale_devices: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dr_program_id: Option<String>,
    pub devices: Vec<DeviceDecision>,
}

/// One control cycle, from snapshot to publish, as persisted and logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub cycle_id: Uuid,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    /// Always `finished_at_ms - started_at_ms`, never negative.
    pub duration_ms: i64,
    pub result: CycleResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub feeders: Vec<FeederDecision>,
    pub published: u32,
    pub publish_failures: u32,
}

impl DecisionRecord {
    /// Total kW allocated across all feeders.
    pub fn total_allocated_kw(&self) -> f64 {
        self.feeders.iter().map(|f| f.allocated_kw).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DecisionRecord {
        DecisionRecord {
            cycle_id: Uuid::nil(),
            started_at_ms: 1_000,
            finished_at_ms: 1_200,
            duration_ms: 200,
            result: CycleResult::Ok,
            error: None,
            feeders: vec![FeederDecision {
                feeder_id: "f1".to_string(),
                limit_kw: 10.0,
                raw_headroom_kw: 10.0,
                effective_headroom_kw: 6.0,
                allocated_kw: 6.0,
                unused_kw: 0.0,
                fresh_devices: 2,
                stale_devices: 0,
                dr_program_id: Some("p1".to_string()),
                devices: vec![DeviceDecision {
                    device_id: "ev-1".to_string(),
                    device_type: DeviceType::Ev,
                    telemetry_age_ms: Some(1_500),
                    soc: Some(0.3),
                    actual_kw: Some(6.0),
                    allocated_kw: 4.0,
                    setpoint_kw: Some(4.0),
                    publish: PublishOutcome::Published,
                    reason_codes: vec![ReasonCode::DrShed, ReasonCode::HeadroomLimit],
                }],
            }],
            published: 1,
            publish_failures: 0,
        }
    }

    #[test]
    fn serializes_with_camel_case_and_screaming_reasons() {
        let json = serde_json::to_value(record()).expect("serializes");
        assert_eq!(json["cycleId"], serde_json::json!(Uuid::nil().to_string()));
        assert_eq!(json["feeders"][0]["effectiveHeadroomKw"], 6.0);
        assert_eq!(
            json["feeders"][0]["devices"][0]["reasonCodes"][0],
            "DR_SHED"
        );
        assert_eq!(json["feeders"][0]["devices"][0]["publish"], "published");
    }

    #[test]
    fn duration_is_finished_minus_started() {
        let r = record();
        assert_eq!(r.duration_ms, r.finished_at_ms - r.started_at_ms);
        assert!(r.duration_ms >= 0);
    }

    #[test]
    fn total_allocated_sums_feeders() {
        assert_eq!(record().total_allocated_kw(), 6.0);
    }
}
