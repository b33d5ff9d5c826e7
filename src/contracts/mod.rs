//! Wire contracts: envelope plus typed payload validators.
//!
//! Every message crossing the bus shares one envelope and carries a typed
//! payload selected by `messageType`. Validation is hand-walked over the
//! decoded JSON so a single pass can report every violation path at once;
//! serialization goes through serde derives on the same types, so an
//! accepted message round-trips bit-identically.

pub mod setpoint;
pub mod telemetry;

pub use setpoint::{SetpointMessage, SetpointMode, SetpointPayload};
pub use telemetry::{TelemetryMessage, TelemetryPayload};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::DeviceType;

/// The only contract version this controller speaks.
pub const CONTRACT_VERSION: u32 = 1;

/// How strictly unknown fields are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Unknown fields are violations.
    #[default]
    Strict,
    /// Unknown fields are ignored; numeric and enum constraints still hold.
    Lenient,
}

/// One field-level contract violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractViolation {
    /// JSON path of the offending field, e.g. `payload.readings.powerKw`.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Contract-layer rejection. Carries every violation found in one pass.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractError {
    /// Message declared a version this controller does not speak.
    #[error("unsupported contract version {found}, expected {CONTRACT_VERSION}")]
    VersionMismatch { found: i64 },
    /// Payload was not parseable JSON at all.
    #[error("malformed json: {0}")]
    Json(String),
    /// Structurally valid JSON violating the schema.
    #[error("contract validation failed: {}", format_violations(.0))]
    Invalid(Vec<ContractViolation>),
}

impl ContractError {
    /// Closed-set label for the validation-failure counter.
    pub fn reason_label(&self) -> &'static str {
        match self {
            Self::VersionMismatch { .. } => "version",
            Self::Json(_) => "json",
            Self::Invalid(_) => "schema",
        }
    }

    /// True for version rejections, which are counted separately.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}

fn format_violations(violations: &[ContractViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fields common to every wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub v: u32,
    pub message_type: String,
    pub message_id: Uuid,
    pub device_id: String,
    pub device_type: DeviceType,
    /// Event time in epoch ms.
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Accumulates violations while walking a decoded message.
pub(crate) struct Checker {
    mode: ValidationMode,
    violations: Vec<ContractViolation>,
}

impl Checker {
    pub(crate) fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            violations: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(ContractViolation {
            path: path.into(),
            message: message.into(),
        });
    }

    /// Rejects keys outside `allowed` in strict mode.
    pub(crate) fn unknown_keys(&mut self, obj: &Map<String, Value>, base: &str, allowed: &[&str]) {
        if self.mode == ValidationMode::Lenient {
            return;
        }
        for key in obj.keys() {
            if !allowed.contains(&key.as_str()) {
                self.push(join(base, key), "unknown field");
            }
        }
    }

    pub(crate) fn require_object<'a>(
        &mut self,
        obj: &'a Map<String, Value>,
        base: &str,
        key: &str,
    ) -> Option<&'a Map<String, Value>> {
        match obj.get(key) {
            Some(Value::Object(inner)) => Some(inner),
            Some(_) => {
                self.push(join(base, key), "must be an object");
                None
            }
            None => {
                self.push(join(base, key), "is required");
                None
            }
        }
    }

    pub(crate) fn require_string(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
    ) -> Option<String> {
        match obj.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::String(_)) => {
                self.push(join(base, key), "must not be empty");
                None
            }
            Some(_) => {
                self.push(join(base, key), "must be a string");
                None
            }
            None => {
                self.push(join(base, key), "is required");
                None
            }
        }
    }

    pub(crate) fn optional_string(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
    ) -> Option<String> {
        match obj.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::String(_)) => {
                self.push(join(base, key), "must not be empty when present");
                None
            }
            Some(Value::Null) | None => None,
            Some(_) => {
                self.push(join(base, key), "must be a string");
                None
            }
        }
    }

    pub(crate) fn require_finite_f64(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
    ) -> Option<f64> {
        match obj.get(key).and_then(Value::as_f64) {
            Some(v) if v.is_finite() => Some(v),
            Some(_) => {
                self.push(join(base, key), "must be finite");
                None
            }
            None => {
                self.push(join(base, key), "is required and must be a number");
                None
            }
        }
    }

    /// Optional number with an inclusive lower bound.
    pub(crate) fn optional_f64_min(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
        min: f64,
    ) -> Option<f64> {
        match obj.get(key) {
            Some(Value::Null) | None => None,
            Some(v) => match v.as_f64() {
                Some(n) if n.is_finite() && n >= min => Some(n),
                Some(_) => {
                    self.push(join(base, key), format!("must be a finite number >= {min}"));
                    None
                }
                None => {
                    self.push(join(base, key), "must be a number");
                    None
                }
            },
        }
    }

    /// Optional number constrained to an inclusive range.
    pub(crate) fn optional_f64_range(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
        min: f64,
        max: f64,
    ) -> Option<f64> {
        match obj.get(key) {
            Some(Value::Null) | None => None,
            Some(v) => match v.as_f64() {
                Some(n) if n.is_finite() && n >= min && n <= max => Some(n),
                Some(_) => {
                    self.push(join(base, key), format!("must be in [{min}, {max}]"));
                    None
                }
                None => {
                    self.push(join(base, key), "must be a number");
                    None
                }
            },
        }
    }

    pub(crate) fn require_i64_min(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
        min: i64,
    ) -> Option<i64> {
        match obj.get(key).and_then(Value::as_i64) {
            Some(v) if v >= min => Some(v),
            Some(_) => {
                self.push(join(base, key), format!("must be an integer >= {min}"));
                None
            }
            None => {
                self.push(join(base, key), "is required and must be an integer");
                None
            }
        }
    }

    pub(crate) fn optional_i64(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
    ) -> Option<i64> {
        match obj.get(key) {
            Some(Value::Null) | None => None,
            Some(v) => match v.as_i64() {
                Some(n) => Some(n),
                None => {
                    self.push(join(base, key), "must be an integer");
                    None
                }
            },
        }
    }

    pub(crate) fn require_bool(
        &mut self,
        obj: &Map<String, Value>,
        base: &str,
        key: &str,
    ) -> Option<bool> {
        match obj.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => {
                self.push(join(base, key), "must be a boolean");
                None
            }
            None => {
                self.push(join(base, key), "is required");
                None
            }
        }
    }

    pub(crate) fn into_result(self) -> Result<(), ContractError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ContractError::Invalid(self.violations))
        }
    }
}

fn join(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

/// Keys the envelope owns at the message root (payload included).
const ENVELOPE_KEYS: &[&str] = &[
    "v",
    "messageType",
    "messageId",
    "deviceId",
    "deviceType",
    "timestampMs",
    "sentAtMs",
    "correlationId",
    "source",
    "payload",
];

/// Rejects unknown versions before any schema walking happens.
pub(crate) fn check_version(root: &Map<String, Value>) -> Result<(), ContractError> {
    match root.get("v") {
        Some(v) => match v.as_i64() {
            Some(n) if n == CONTRACT_VERSION as i64 => Ok(()),
            Some(other) => Err(ContractError::VersionMismatch { found: other }),
            None => Err(ContractError::Invalid(vec![ContractViolation {
                path: "v".to_string(),
                message: "must be an integer".to_string(),
            }])),
        },
        None => Err(ContractError::Invalid(vec![ContractViolation {
            path: "v".to_string(),
            message: "is required".to_string(),
        }])),
    }
}

/// Walks the shared envelope fields, expecting `messageType == expected`.
pub(crate) fn validate_envelope(
    c: &mut Checker,
    root: &Map<String, Value>,
    expected_type: &str,
) -> Option<Envelope> {
    c.unknown_keys(root, "", ENVELOPE_KEYS);

    let message_type = c.require_string(root, "", "messageType");
    if let Some(ref mt) = message_type {
        if mt != expected_type {
            c.push("messageType", format!("expected {expected_type:?}, got {mt:?}"));
        }
    }

    let message_id = c
        .require_string(root, "", "messageId")
        .and_then(|raw| match Uuid::parse_str(&raw) {
            Ok(id) => Some(id),
            Err(_) => {
                c.push("messageId", "must be a UUID");
                None
            }
        });

    let device_id = c.require_string(root, "", "deviceId");
    let device_type = c
        .require_string(root, "", "deviceType")
        .and_then(|raw| match DeviceType::parse(&raw) {
            Some(ty) => Some(ty),
            None => {
                c.push("deviceType", "must be one of pv, battery, ev");
                None
            }
        });
    let timestamp_ms = c.require_i64_min(root, "", "timestampMs", 0);
    let sent_at_ms = c.optional_i64(root, "", "sentAtMs");
    let correlation_id = c.optional_string(root, "", "correlationId");
    let source = c.optional_string(root, "", "source");

    Some(Envelope {
        v: CONTRACT_VERSION,
        message_type: message_type?,
        message_id: message_id?,
        device_id: device_id?,
        device_type: device_type?,
        timestamp_ms: timestamp_ms?,
        sent_at_ms,
        correlation_id,
        source,
    })
}
