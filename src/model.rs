//! Core domain entities: devices, telemetry rows, limit events, and DR programs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device ids carrying this prefix denote physical hardware and are always
/// treated as dispatchable regardless of declared type.
pub const PHYSICAL_DEVICE_PREFIX: &str = "pi-";

/// Kind of distributed energy resource behind a device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Photovoltaic inverter (generation, not dispatchable).
    Pv,
    /// Stationary battery storage.
    Battery,
    /// Electric-vehicle charger.
    Ev,
}

impl DeviceType {
    /// Parses the wire representation (`"pv"`, `"battery"`, `"ev"`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pv" => Some(Self::Pv),
            "battery" => Some(Self::Battery),
            "ev" => Some(Self::Ev),
            _ => None,
        }
    }

    /// Wire representation used in topics, labels, and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pv => "pv",
            Self::Battery => "battery",
            Self::Ev => "ev",
        }
    }
}

/// A dispatchable or observable endpoint attached to exactly one feeder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Unique device identifier.
    pub id: String,
    /// Resource kind.
    pub device_type: DeviceType,
    /// Site the device belongs to.
    pub site_id: String,
    /// Feeder the device draws from.
    pub feeder_id: String,
    /// Upstream feeder, when the topology is hierarchical.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_feeder_id: Option<String>,
    /// Nameplate power bound in kW (>= 0).
    pub p_max_kw: f64,
    /// Allocation priority weight (>= 1).
    pub priority: u32,
    /// Physical hardware flag; forced true for `pi-` ids.
    pub is_physical: bool,
}

impl Device {
    /// Builds a device, normalizing the physical flag from the id prefix and
    /// clamping `p_max_kw` and `priority` into their valid ranges.
    pub fn new(
        id: impl Into<String>,
        device_type: DeviceType,
        site_id: impl Into<String>,
        feeder_id: impl Into<String>,
        p_max_kw: f64,
        priority: u32,
    ) -> Self {
        let id = id.into();
        let is_physical = id.starts_with(PHYSICAL_DEVICE_PREFIX);
        Self {
            id,
            device_type,
            site_id: site_id.into(),
            feeder_id: feeder_id.into(),
            parent_feeder_id: None,
            p_max_kw: p_max_kw.max(0.0),
            priority: priority.max(1),
            is_physical,
        }
    }

    /// Whether the control loop may command this device.
    ///
    /// Batteries, EV chargers, and physical devices are dispatchable;
    /// PV inverters are observed only.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.device_type, DeviceType::Battery | DeviceType::Ev) || self.is_physical
    }
}

/// Capability caps reported by a device alongside its readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_charge_kw: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_discharge_kw: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_import_kw: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_export_kw: Option<f64>,
}

impl Capabilities {
    /// True when no cap is present at all.
    pub fn is_empty(&self) -> bool {
        self.max_charge_kw.is_none()
            && self.max_discharge_kw.is_none()
            && self.max_import_kw.is_none()
            && self.max_export_kw.is_none()
    }
}

/// One persisted telemetry reading, projected from a validated wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRow {
    /// Wire message id; unique across all persisted rows.
    pub message_id: Uuid,
    pub device_id: String,
    pub device_type: DeviceType,
    /// Event time in epoch ms.
    pub ts_ms: i64,
    /// Sender-side send time, when provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at_ms: Option<i64>,
    /// Signed power in kW (positive = consumption).
    pub power_kw: f64,
    /// State of charge in [0, 1], when the device reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    pub site_id: String,
    pub feeder_id: String,
    pub source: String,
    /// Contract version the message was validated against.
    pub message_version: u32,
    /// Online flag from the message status block.
    pub online: bool,
}

/// Time-bounded feeder power cap created by an operator or market signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitEvent {
    pub id: String,
    pub feeder_id: String,
    /// Window start, epoch ms (inclusive).
    pub ts_start: i64,
    /// Window end, epoch ms (exclusive). Always after `ts_start`.
    pub ts_end: i64,
    pub limit_kw: f64,
    /// Free-form event classification (e.g. `"planned"`, `"emergency"`).
    pub event_type: String,
}

impl LimitEvent {
    /// Returns `true` when `now_ms` falls within `[ts_start, ts_end)`.
    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms >= self.ts_start && now_ms < self.ts_end
    }
}

/// Demand-response program mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrMode {
    /// Subtract a fixed shed target from raw headroom.
    FixedCap,
    /// Scale headroom by a clipped linear price response.
    PriceElastic,
}

/// Demand-response program modifying effective headroom while active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrProgram {
    pub id: String,
    pub name: String,
    pub mode: DrMode,
    /// Window start, epoch ms (inclusive).
    pub ts_start: i64,
    /// Window end, epoch ms (exclusive).
    pub ts_end: i64,
    /// Requested shed in kW (>= 0); used by `fixed_cap`.
    pub target_shed_kw: f64,
    /// Incentive paid per kWh; positive values boost headroom.
    pub incentive_per_kwh: f64,
    /// Penalty charged per kWh; positive values shed headroom.
    pub penalty_per_kwh: f64,
    /// Administrative activation flag.
    pub is_active: bool,
}

impl DrProgram {
    /// A program only modifies headroom when administratively active and
    /// inside its time window.
    pub fn is_active_at(&self, now_ms: i64) -> bool {
        self.is_active && now_ms >= self.ts_start && now_ms < self.ts_end
    }
}

/// Aggregate information about one feeder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeederInfo {
    pub feeder_id: String,
    /// Number of devices currently attached.
    pub device_count: usize,
    /// Number of dispatchable devices among them.
    pub dispatchable_count: usize,
}

/// Why a device's allocation came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Feeder headroom bounded the allocation before the device cap did.
    HeadroomLimit,
    /// The device's own `p_max_kw` clamped its share.
    PmaxClamp,
    /// SOC already at or above target; optimizer gated the device to zero.
    SocAtTarget,
    /// Telemetry older than the freshness threshold.
    StaleTelemetry,
    /// A demand-response program reduced effective headroom.
    DrShed,
    /// A demand-response program boosted effective headroom.
    DrBoost,
}

impl ReasonCode {
    /// Stable wire/label representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeadroomLimit => "HEADROOM_LIMIT",
            Self::PmaxClamp => "PMAX_CLAMP",
            Self::SocAtTarget => "SOC_AT_TARGET",
            Self::StaleTelemetry => "STALE_TELEMETRY",
            Self::DrShed => "DR_SHED",
            Self::DrBoost => "DR_BOOST",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_prefix_forces_is_physical() {
        let d = Device::new("pi-batt-1", DeviceType::Battery, "s1", "f1", 5.0, 1);
        assert!(d.is_physical);
        let d = Device::new("batt-1", DeviceType::Battery, "s1", "f1", 5.0, 1);
        assert!(!d.is_physical);
    }

    #[test]
    fn pv_is_not_dispatchable_unless_physical() {
        let pv = Device::new("pv-1", DeviceType::Pv, "s1", "f1", 8.0, 1);
        assert!(!pv.is_dispatchable());
        let physical_pv = Device::new("pi-pv-1", DeviceType::Pv, "s1", "f1", 8.0, 1);
        assert!(physical_pv.is_dispatchable());
    }

    #[test]
    fn device_new_clamps_invalid_ranges() {
        let d = Device::new("ev-1", DeviceType::Ev, "s1", "f1", -3.0, 0);
        assert_eq!(d.p_max_kw, 0.0);
        assert_eq!(d.priority, 1);
    }

    #[test]
    fn limit_event_window_is_half_open() {
        let e = LimitEvent {
            id: "e1".into(),
            feeder_id: "f1".into(),
            ts_start: 100,
            ts_end: 200,
            limit_kw: 50.0,
            event_type: "planned".into(),
        };
        assert!(!e.is_active(99));
        assert!(e.is_active(100));
        assert!(e.is_active(199));
        assert!(!e.is_active(200));
    }

    #[test]
    fn dr_program_requires_active_flag_and_window() {
        let p = DrProgram {
            id: "p1".into(),
            name: "evening shed".into(),
            mode: DrMode::FixedCap,
            ts_start: 100,
            ts_end: 200,
            target_shed_kw: 4.0,
            incentive_per_kwh: 0.0,
            penalty_per_kwh: 0.0,
            is_active: true,
        };
        assert!(p.is_active_at(150));
        assert!(!p.is_active_at(250));
        let inactive = DrProgram {
            is_active: false,
            ..p
        };
        assert!(!inactive.is_active_at(150));
    }

    #[test]
    fn device_type_parse_round_trips() {
        for ty in [DeviceType::Pv, DeviceType::Battery, DeviceType::Ev] {
            assert_eq!(DeviceType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(DeviceType::parse("hvac"), None);
    }
}
