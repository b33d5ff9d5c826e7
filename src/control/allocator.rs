//! SOC-aware priority allocation.
//!
//! Pure functions: identical inputs produce bit-identical outputs, with
//! ties broken by ascending device id. The heuristic mode splits headroom
//! proportionally to a SOC/priority score and redistributes clamp slack;
//! the optimizer mode gates devices at target SOC and fills greedily in
//! score order, carrying a deficit memory for devices that went unserved.

use std::collections::BTreeMap;

use crate::config::{AllocationMode, ControlParams};
use crate::model::{DeviceType, ReasonCode};

/// Loop-termination epsilon for slack redistribution.
const SLACK_EPSILON_KW: f64 = 1e-9;

/// A dispatchable device as the allocator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchDevice {
    pub device_id: String,
    pub device_type: DeviceType,
    /// Nameplate cap in kW (>= 0).
    pub p_max_kw: f64,
    /// Priority weight (>= 1).
    pub priority: u32,
    /// State of charge; `None` counts as maximum deficit.
    pub soc: Option<f64>,
}

/// Result of one allocation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    /// kW per device; every input device has an entry in `[0, p_max_kw]`.
    pub allocated_kw: BTreeMap<String, f64>,
    /// Reason codes per device.
    pub reasons: BTreeMap<String, Vec<ReasonCode>>,
    /// Demand the device wanted but did not receive; feeds the deficit
    /// memory in optimizer mode.
    pub unmet_kw: BTreeMap<String, f64>,
}

impl Allocation {
    pub fn total_kw(&self) -> f64 {
        self.allocated_kw.values().sum()
    }

    fn push_reason(&mut self, device_id: &str, code: ReasonCode) {
        let reasons = self.reasons.entry(device_id.to_string()).or_default();
        if !reasons.contains(&code) {
            reasons.push(code);
        }
    }
}

/// Splits `available_kw` among `devices` according to `params`.
///
/// `deficits` carries prior unmet demand per device (optimizer mode only);
/// pass an empty map when no memory is kept.
pub fn allocate(
    devices: &[DispatchDevice],
    available_kw: f64,
    params: &ControlParams,
    deficits: &BTreeMap<String, f64>,
) -> Allocation {
    let mut result = Allocation::default();
    if devices.is_empty() {
        return result;
    }

    // Deterministic processing order.
    let mut sorted: Vec<&DispatchDevice> = devices.iter().collect();
    sorted.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    for d in &sorted {
        result.allocated_kw.insert(d.device_id.clone(), 0.0);
        result.reasons.insert(d.device_id.clone(), Vec::new());
        result.unmet_kw.insert(d.device_id.clone(), 0.0);
    }

    let available = params
        .global_kw_limit
        .map_or(available_kw, |g| available_kw.min(g));

    if available <= 0.0 {
        for d in &sorted {
            result.push_reason(&d.device_id, ReasonCode::HeadroomLimit);
            result.unmet_kw.insert(d.device_id.clone(), d.p_max_kw.max(0.0));
        }
        return result;
    }

    match params.allocation_mode {
        AllocationMode::Heuristic => heuristic_fill(&sorted, available, params, &mut result),
        AllocationMode::Optimizer => greedy_fill(&sorted, available, params, deficits, &mut result),
    }

    result
}

/// Scoring shared by both modes: SOC deficit times priority.
fn device_score(d: &DispatchDevice, params: &ControlParams) -> f64 {
    // Unknown SOC counts as the worst case so the device is preferred
    // for charging.
    let soc = d.soc.unwrap_or(0.0);
    let deficit = (params.target_soc - soc).max(0.0);
    let reserve_bonus = if soc < params.min_soc_reserve { 0.5 } else { 0.0 };
    let soc_component = 1.0 + params.soc_weight * (deficit + reserve_bonus);

    let priority = f64::from(d.priority);
    let priority_component = if params.respect_priority {
        priority * 1.5
    } else {
        priority
    };

    soc_component * priority_component
}

/// Proportional split over `score * max(p_max, 0.1)`, clamped to each
/// device's cap, with clamp slack redistributed over uncapped devices.
fn heuristic_fill(
    sorted: &[&DispatchDevice],
    available: f64,
    params: &ControlParams,
    result: &mut Allocation,
) {
    let weights: Vec<f64> = sorted
        .iter()
        .map(|d| device_score(d, params) * d.p_max_kw.max(0.1))
        .collect();
    let mut allocated = vec![0.0f64; sorted.len()];
    let mut open: Vec<usize> = (0..sorted.len()).collect();
    let mut remaining = available;

    while remaining > SLACK_EPSILON_KW && !open.is_empty() {
        let total_weight: f64 = open.iter().map(|&i| weights[i]).sum();
        if total_weight <= 0.0 {
            break;
        }

        let mut slack = 0.0;
        let mut still_open = Vec::with_capacity(open.len());
        for &i in &open {
            let share = remaining * weights[i] / total_weight;
            let room = sorted[i].p_max_kw - allocated[i];
            if share >= room - SLACK_EPSILON_KW {
                slack += share - room;
                allocated[i] = sorted[i].p_max_kw;
                result.push_reason(&sorted[i].device_id, ReasonCode::PmaxClamp);
            } else {
                allocated[i] += share;
                still_open.push(i);
            }
        }

        if still_open.len() == open.len() {
            // Nobody capped this pass; everything was distributed.
            remaining = 0.0;
        } else {
            remaining = slack;
        }
        open = still_open;
    }

    // Uncapped devices that wanted more were bounded by headroom.
    let total: f64 = allocated.iter().sum();
    let capacity: f64 = sorted.iter().map(|d| d.p_max_kw).sum();
    let headroom_bound = total + SLACK_EPSILON_KW < capacity;

    for (i, d) in sorted.iter().enumerate() {
        result.allocated_kw.insert(d.device_id.clone(), allocated[i]);
        let unmet = (d.p_max_kw - allocated[i]).max(0.0);
        result.unmet_kw.insert(d.device_id.clone(), unmet);
        if headroom_bound && unmet > SLACK_EPSILON_KW {
            result.push_reason(&d.device_id, ReasonCode::HeadroomLimit);
        }
    }
}

/// Greedy stand-in for the linear program: fill in weight order subject to
/// SOC gating, caps, and the shared headroom budget.
///
/// The deficit boost remembers prior unmet demand so chronically unserved
/// devices climb the order over successive cycles.
fn greedy_fill(
    sorted: &[&DispatchDevice],
    available: f64,
    params: &ControlParams,
    deficits: &BTreeMap<String, f64>,
    result: &mut Allocation,
) {
    struct Candidate<'a> {
        index: usize,
        device: &'a DispatchDevice,
        cap: f64,
        rank: f64,
    }

    let mut candidates: Vec<Candidate> = sorted
        .iter()
        .enumerate()
        .map(|(index, d)| {
            let gated = params.optimizer.enforce_target_soc
                && d.soc.is_some_and(|s| s >= params.target_soc);
            let cap = if gated { 0.0 } else { d.p_max_kw.max(0.0) };
            if gated {
                result.push_reason(&d.device_id, ReasonCode::SocAtTarget);
            }
            let boost = deficits.get(&d.device_id).copied().unwrap_or(0.0);
            Candidate {
                index,
                device: d,
                cap,
                rank: device_score(d, params) + boost,
            }
        })
        .collect();

    // Highest rank first; device id ascending on ties for determinism.
    candidates.sort_by(|a, b| {
        b.rank
            .partial_cmp(&a.rank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.device.device_id.cmp(&b.device.device_id))
    });

    let mut allocated = vec![0.0f64; sorted.len()];
    let mut remaining = available;
    for c in &candidates {
        let grant = remaining.min(c.cap);
        allocated[c.index] = grant;
        remaining -= grant;

        if c.cap > 0.0 {
            if grant >= c.cap - SLACK_EPSILON_KW {
                result.push_reason(&c.device.device_id, ReasonCode::PmaxClamp);
            } else {
                result.push_reason(&c.device.device_id, ReasonCode::HeadroomLimit);
            }
        }
    }

    for (i, d) in sorted.iter().enumerate() {
        result.allocated_kw.insert(d.device_id.clone(), allocated[i]);
        let gated_cap = candidates
            .iter()
            .find(|c| c.index == i)
            .map_or(0.0, |c| c.cap);
        result
            .unmet_kw
            .insert(d.device_id.clone(), (gated_cap - allocated[i]).max(0.0));
    }
}
