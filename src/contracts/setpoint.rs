//! Setpoint v1 payload schema, validator, and builder.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Checker, ContractError, ContractViolation, Envelope, ValidationMode, CONTRACT_VERSION};
use crate::model::DeviceType;

/// Commanded operating mode for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetpointMode {
    Charge,
    Discharge,
    Idle,
    Import,
    Export,
    Limit,
}

impl SetpointMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "charge" => Some(Self::Charge),
            "discharge" => Some(Self::Discharge),
            "idle" => Some(Self::Idle),
            "import" => Some(Self::Import),
            "export" => Some(Self::Export),
            "limit" => Some(Self::Limit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Charge => "charge",
            Self::Discharge => "discharge",
            Self::Idle => "idle",
            Self::Import => "import",
            Self::Export => "export",
            Self::Limit => "limit",
        }
    }
}

/// The command block of a setpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Commanded power in kW.
    pub target_power_kw: f64,
    pub mode: SetpointMode,
    /// Epoch ms after which the device reverts to its safe default.
    pub valid_until_ms: i64,
}

/// Optional ramp constraints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramp_rate_kw_per_s: Option<f64>,
}

/// Why this command was issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    /// Name of the allocator that produced the value.
    pub allocator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Setpoint v1 payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetpointPayload {
    pub command: Command,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    pub reason: Reason,
}

/// A fully validated setpoint message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetpointMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub payload: SetpointPayload,
}

impl SetpointMessage {
    /// Builds an outbound setpoint with a fresh message id.
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        device_id: impl Into<String>,
        device_type: DeviceType,
        target_power_kw: f64,
        mode: SetpointMode,
        now_ms: i64,
        valid_until_ms: i64,
        allocator: impl Into<String>,
        notes: Option<String>,
    ) -> Self {
        Self {
            envelope: Envelope {
                v: CONTRACT_VERSION,
                message_type: "setpoint".to_string(),
                message_id: Uuid::new_v4(),
                device_id: device_id.into(),
                device_type,
                timestamp_ms: now_ms,
                sent_at_ms: Some(now_ms),
                correlation_id: None,
                source: Some("derms-ctl".to_string()),
            },
            payload: SetpointPayload {
                command: Command {
                    target_power_kw,
                    mode,
                    valid_until_ms,
                },
                constraints: None,
                reason: Reason {
                    allocator: allocator.into(),
                    notes,
                },
            },
        }
    }

    /// Serializes back to the wire representation.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Serializes to UTF-8 JSON bytes for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

const PAYLOAD_KEYS: &[&str] = &["command", "constraints", "reason"];
const COMMAND_KEYS: &[&str] = &["targetPowerKw", "mode", "validUntilMs"];
const CONSTRAINTS_KEYS: &[&str] = &["rampRateKwPerS"];
const REASON_KEYS: &[&str] = &["allocator", "notes"];

/// Decodes raw bytes and validates them as setpoint v1.
pub fn parse_setpoint(bytes: &[u8], mode: ValidationMode) -> Result<SetpointMessage, ContractError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ContractError::Json(e.to_string()))?;
    validate_setpoint(&value, mode)
}

/// Validates a decoded JSON value as setpoint v1.
pub fn validate_setpoint(
    value: &Value,
    mode: ValidationMode,
) -> Result<SetpointMessage, ContractError> {
    let root = value.as_object().ok_or_else(|| {
        ContractError::Invalid(vec![ContractViolation {
            path: String::new(),
            message: "message must be a JSON object".to_string(),
        }])
    })?;
    super::check_version(root)?;

    let mut c = Checker::new(mode);
    let envelope = super::validate_envelope(&mut c, root, "setpoint");
    let payload = validate_payload(&mut c, root);
    c.into_result()?;

    match (envelope, payload) {
        (Some(envelope), Some(payload)) => Ok(SetpointMessage { envelope, payload }),
        _ => Err(ContractError::Invalid(vec![ContractViolation {
            path: String::new(),
            message: "message incomplete".to_string(),
        }])),
    }
}

fn validate_payload(c: &mut Checker, root: &Map<String, Value>) -> Option<SetpointPayload> {
    let payload = c.require_object(root, "", "payload")?;
    c.unknown_keys(payload, "payload", PAYLOAD_KEYS);

    let command = validate_command(c, payload);
    let constraints = validate_constraints(c, payload);
    let reason = validate_reason(c, payload);

    Some(SetpointPayload {
        command: command?,
        constraints,
        reason: reason?,
    })
}

fn validate_command(c: &mut Checker, payload: &Map<String, Value>) -> Option<Command> {
    let command = c.require_object(payload, "payload", "command")?;
    c.unknown_keys(command, "payload.command", COMMAND_KEYS);

    let target_power_kw = c.require_finite_f64(command, "payload.command", "targetPowerKw");
    let mode = c
        .require_string(command, "payload.command", "mode")
        .and_then(|raw| match SetpointMode::parse(&raw) {
            Some(m) => Some(m),
            None => {
                c.push("payload.command.mode", "unknown mode");
                None
            }
        });
    let valid_until_ms = c.require_i64_min(command, "payload.command", "validUntilMs", 0);

    Some(Command {
        target_power_kw: target_power_kw?,
        mode: mode?,
        valid_until_ms: valid_until_ms?,
    })
}

fn validate_constraints(c: &mut Checker, payload: &Map<String, Value>) -> Option<Constraints> {
    let constraints = match payload.get("constraints") {
        Some(Value::Object(obj)) => obj,
        Some(Value::Null) | None => return None,
        Some(_) => {
            c.push("payload.constraints", "must be an object");
            return None;
        }
    };
    c.unknown_keys(constraints, "payload.constraints", CONSTRAINTS_KEYS);
    let ramp = c.optional_f64_min(constraints, "payload.constraints", "rampRateKwPerS", 0.0);
    ramp.map(|r| Constraints {
        ramp_rate_kw_per_s: Some(r),
    })
}

fn validate_reason(c: &mut Checker, payload: &Map<String, Value>) -> Option<Reason> {
    let reason = c.require_object(payload, "payload", "reason")?;
    c.unknown_keys(reason, "payload.reason", REASON_KEYS);
    let allocator = c.require_string(reason, "payload.reason", "allocator");
    let notes = c.optional_string(reason, "payload.reason", "notes");
    Some(Reason {
        allocator: allocator?,
        notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "v": 1,
            "messageType": "setpoint",
            "messageId": "22222222-2222-4222-8222-222222222222",
            "deviceId": "batt-1",
            "deviceType": "battery",
            "timestampMs": 1_700_000_000_000i64,
            "payload": {
                "command": {
                    "targetPowerKw": 3.5,
                    "mode": "charge",
                    "validUntilMs": 1_700_000_120_000i64
                },
                "reason": { "allocator": "heuristic" }
            }
        })
    }

    #[test]
    fn accepts_valid_setpoint() {
        let msg = validate_setpoint(&sample(), ValidationMode::Strict).expect("valid");
        assert_eq!(msg.payload.command.target_power_kw, 3.5);
        assert_eq!(msg.payload.command.mode, SetpointMode::Charge);
        assert_eq!(msg.payload.reason.allocator, "heuristic");
    }

    #[test]
    fn round_trips_through_serialization() {
        let msg = validate_setpoint(&sample(), ValidationMode::Strict).expect("valid");
        let reparsed =
            validate_setpoint(&msg.to_value(), ValidationMode::Strict).expect("round trip");
        assert_eq!(msg, reparsed);
    }

    #[test]
    fn builder_output_passes_strict_validation() {
        let msg = SetpointMessage::new(
            "ev-1",
            DeviceType::Ev,
            4.2,
            SetpointMode::Charge,
            1_700_000_000_000,
            1_700_000_120_000,
            "heuristic",
            None,
        );
        let reparsed =
            validate_setpoint(&msg.to_value(), ValidationMode::Strict).expect("builder is valid");
        assert_eq!(reparsed.payload.command.target_power_kw, 4.2);
    }

    #[test]
    fn rejects_unknown_mode_and_missing_allocator() {
        let mut v = sample();
        v["payload"]["command"]["mode"] = json!("sprint");
        v["payload"]["reason"]
            .as_object_mut()
            .expect("reason object")
            .remove("allocator");
        let err = validate_setpoint(&v, ValidationMode::Strict).unwrap_err();
        let ContractError::Invalid(violations) = err else {
            panic!("expected Invalid");
        };
        let paths: Vec<&str> = violations.iter().map(|x| x.path.as_str()).collect();
        assert!(paths.contains(&"payload.command.mode"));
        assert!(paths.contains(&"payload.reason.allocator"));
    }

    #[test]
    fn rejects_negative_ramp_rate() {
        let mut v = sample();
        v["payload"]["constraints"] = json!({ "rampRateKwPerS": -0.5 });
        assert!(validate_setpoint(&v, ValidationMode::Strict).is_err());
    }

    #[test]
    fn rejects_negative_valid_until() {
        let mut v = sample();
        v["payload"]["command"]["validUntilMs"] = json!(-1);
        assert!(validate_setpoint(&v, ValidationMode::Strict).is_err());
    }
}
