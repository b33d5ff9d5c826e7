//! Telemetry v1 payload schema and validator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Checker, ContractError, ContractViolation, Envelope, ValidationMode};
use crate::model::Capabilities;

/// Instantaneous readings reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readings {
    /// Signed power in kW (positive = consumption).
    pub power_kw: f64,
    /// State of charge in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    /// Cumulative energy in kWh (>= 0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_kwh: Option<f64>,
    /// Terminal voltage in V (>= 0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_v: Option<f64>,
}

/// Online/offline status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub online: bool,
}

/// Telemetry v1 payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub readings: Readings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feeder_id: Option<String>,
}

/// A fully validated telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub payload: TelemetryPayload,
}

impl TelemetryMessage {
    /// Serializes back to the wire representation.
    pub fn to_value(&self) -> Value {
        // Serialization of these plain data types cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

const PAYLOAD_KEYS: &[&str] = &["readings", "capabilities", "status", "siteId", "feederId"];
const READINGS_KEYS: &[&str] = &["powerKw", "soc", "energyKwh", "voltageV"];
const CAPABILITIES_KEYS: &[&str] = &[
    "maxChargeKw",
    "maxDischargeKw",
    "maxImportKw",
    "maxExportKw",
];
const STATUS_KEYS: &[&str] = &["online"];

/// Decodes raw bytes and validates them as telemetry v1.
pub fn parse_telemetry(bytes: &[u8], mode: ValidationMode) -> Result<TelemetryMessage, ContractError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ContractError::Json(e.to_string()))?;
    validate_telemetry(&value, mode)
}

/// Validates a decoded JSON value as telemetry v1.
///
/// Collects every violation path before failing; a version mismatch short-
/// circuits with its own error kind.
pub fn validate_telemetry(
    value: &Value,
    mode: ValidationMode,
) -> Result<TelemetryMessage, ContractError> {
    let root = value.as_object().ok_or_else(|| {
        ContractError::Invalid(vec![ContractViolation {
            path: String::new(),
            message: "message must be a JSON object".to_string(),
        }])
    })?;
    super::check_version(root)?;

    let mut c = Checker::new(mode);
    let envelope = super::validate_envelope(&mut c, root, "telemetry");
    let payload = validate_payload(&mut c, root);
    c.into_result()?;

    // Both are present whenever no violation was recorded.
    match (envelope, payload) {
        (Some(envelope), Some(payload)) => Ok(TelemetryMessage { envelope, payload }),
        _ => Err(ContractError::Invalid(vec![ContractViolation {
            path: String::new(),
            message: "message incomplete".to_string(),
        }])),
    }
}

fn validate_payload(c: &mut Checker, root: &Map<String, Value>) -> Option<TelemetryPayload> {
    let payload = c.require_object(root, "", "payload")?;
    c.unknown_keys(payload, "payload", PAYLOAD_KEYS);

    let readings = validate_readings(c, payload);
    let capabilities = validate_capabilities(c, payload);
    let status = validate_status(c, payload);
    let site_id = c.optional_string(payload, "payload", "siteId");
    let feeder_id = c.optional_string(payload, "payload", "feederId");

    Some(TelemetryPayload {
        readings: readings?,
        capabilities,
        status: status?,
        site_id,
        feeder_id,
    })
}

fn validate_readings(c: &mut Checker, payload: &Map<String, Value>) -> Option<Readings> {
    let readings = c.require_object(payload, "payload", "readings")?;
    c.unknown_keys(readings, "payload.readings", READINGS_KEYS);

    let power_kw = c.require_finite_f64(readings, "payload.readings", "powerKw");
    let soc = c.optional_f64_range(readings, "payload.readings", "soc", 0.0, 1.0);
    let energy_kwh = c.optional_f64_min(readings, "payload.readings", "energyKwh", 0.0);
    let voltage_v = c.optional_f64_min(readings, "payload.readings", "voltageV", 0.0);

    Some(Readings {
        power_kw: power_kw?,
        soc,
        energy_kwh,
        voltage_v,
    })
}

fn validate_capabilities(c: &mut Checker, payload: &Map<String, Value>) -> Option<Capabilities> {
    let caps = match payload.get("capabilities") {
        Some(Value::Object(obj)) => obj,
        Some(Value::Null) | None => return None,
        Some(_) => {
            c.push("payload.capabilities", "must be an object");
            return None;
        }
    };
    c.unknown_keys(caps, "payload.capabilities", CAPABILITIES_KEYS);

    let parsed = Capabilities {
        max_charge_kw: c.optional_f64_min(caps, "payload.capabilities", "maxChargeKw", 0.0),
        max_discharge_kw: c.optional_f64_min(caps, "payload.capabilities", "maxDischargeKw", 0.0),
        max_import_kw: c.optional_f64_min(caps, "payload.capabilities", "maxImportKw", 0.0),
        max_export_kw: c.optional_f64_min(caps, "payload.capabilities", "maxExportKw", 0.0),
    };
    if parsed.is_empty() { None } else { Some(parsed) }
}

fn validate_status(c: &mut Checker, payload: &Map<String, Value>) -> Option<DeviceStatus> {
    let status = c.require_object(payload, "payload", "status")?;
    c.unknown_keys(status, "payload.status", STATUS_KEYS);
    let online = c.require_bool(status, "payload.status", "online");
    Some(DeviceStatus { online: online? })
}
