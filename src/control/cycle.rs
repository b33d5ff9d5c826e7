//! The periodic control cycle: snapshot, resolve, allocate, publish, record.
//!
//! At most one cycle runs at a time. A tick that finds the previous cycle
//! still in flight observes the lag and skips. Every cycle that gets past
//! the readiness gate produces a decision record, including failed ones.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::allocator::{allocate, DispatchDevice};
use super::decision::{
    CycleResult, DecisionRecord, DeviceDecision, FeederDecision, PublishOutcome,
};
use super::dr::apply_dr_policy;
use super::{LoopState, LoopStatus, SetpointPublisher};
use crate::clock;
use crate::config::{Config, DbErrorBehavior, MissingTelemetryBehavior, RestartBehavior};
use crate::contracts::setpoint::{SetpointMessage, SetpointMode};
use crate::ingest::Heartbeats;
use crate::model::{Device, DeviceType, DrProgram, ReasonCode, TelemetryRow};
use crate::observe::Metrics;
use crate::repo::{self, Repositories};
use crate::safety::{BreakerDecision, CommandRecord, LastCommands, Readiness, SafetyState};

/// Minimum change worth re-publishing (kW).
const DIFF_EPSILON_KW: f64 = 1e-3;

/// Telemetry usability after stale handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// Within the stale threshold.
    Fresh,
    /// Stale but held under HOLD_LAST within the hold window.
    Held,
    /// Stale; assumed 0 kW and commanded to zero.
    Stale,
    /// Stale under EXCLUDE_DEVICE; dropped from the cycle.
    Excluded,
}

struct Assessed<'a> {
    device: &'a Device,
    row: Option<&'a TelemetryRow>,
    age_ms: Option<i64>,
    freshness: Freshness,
}

/// One planned outbound setpoint, positioned back into the record.
struct PublishPlan {
    device_id: String,
    device_type: DeviceType,
    target_kw: f64,
    mode: SetpointMode,
    valid_until_ms: i64,
    notes: Option<String>,
    feeder_idx: usize,
    device_idx: usize,
}

struct CycleOutput {
    feeders: Vec<FeederDecision>,
    published: u32,
    publish_failures: u32,
    degraded: Option<String>,
}

/// The periodic orchestrator.
pub struct ControlLoop {
    config: Config,
    repos: Repositories,
    publisher: Arc<dyn SetpointPublisher>,
    safety: Arc<SafetyState>,
    readiness: Arc<Readiness>,
    last_commands: Arc<LastCommands>,
    heartbeats: Arc<Heartbeats>,
    loop_state: Arc<LoopState>,
    metrics: Metrics,
    /// Unmet-demand memory for the optimizer's deficit boost.
    deficits: Mutex<BTreeMap<String, f64>>,
    /// Guarantees at most one cycle in flight.
    cycle_gate: tokio::sync::Mutex<()>,
}

impl ControlLoop {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        repos: Repositories,
        publisher: Arc<dyn SetpointPublisher>,
        safety: Arc<SafetyState>,
        readiness: Arc<Readiness>,
        last_commands: Arc<LastCommands>,
        heartbeats: Arc<Heartbeats>,
        loop_state: Arc<LoopState>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            repos,
            publisher,
            safety,
            readiness,
            last_commands,
            heartbeats,
            loop_state,
            metrics,
            deficits: Mutex::new(BTreeMap::new()),
            cycle_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Runs the timer loop until shutdown fires. The first cycle runs
    /// immediately after the startup publish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.startup_publish().await;

        let mut interval = tokio::time::interval(self.config.control.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    debug!("control loop shutting down");
                    break;
                }
            }
        }
    }

    /// One timer tick: run a cycle, or record the lag and skip when the
    /// previous cycle still holds the gate.
    pub async fn tick(&self) {
        let now_ms = clock::now_ms();
        match self.cycle_gate.try_lock() {
            Ok(_guard) => {
                self.metrics.cycle_in_flight.set(1);
                self.run_cycle_inner(now_ms).await;
                self.metrics.cycle_in_flight.set(0);
                self.post_cycle_housekeeping(now_ms);
            }
            Err(_) => {
                let interval_ms = self.config.control.interval_ms as i64;
                let lag_ms = self
                    .loop_state
                    .snapshot()
                    .last_started_ms
                    .map_or(0, |started| (now_ms - started - interval_ms).max(0));
                self.metrics.interval_lag.observe(lag_ms as f64 / 1_000.0);
                warn!(lag_ms, "control tick skipped; previous cycle still running");
                self.check_stall(now_ms);
            }
        }
    }

    /// Runs one cycle at an explicit timestamp, holding the cycle gate.
    pub async fn run_cycle_at(&self, now_ms: i64) -> Option<DecisionRecord> {
        let _guard = self.cycle_gate.lock().await;
        self.run_cycle_inner(now_ms).await
    }

    async fn run_cycle_inner(&self, now_ms: i64) -> Option<DecisionRecord> {
        // 1. Readiness gate: return without reading or writing anything.
        if !self.readiness.is_ready() {
            let reason = self
                .readiness
                .not_ready_reason()
                .unwrap_or_else(|| "not ready".to_string());
            warn!(%reason, "control cycle refused");
            self.safety.set_degraded(&reason);
            self.loop_state.cycle_refused(&reason);
            return None;
        }

        let cycle_id = Uuid::new_v4();
        let started = Instant::now();
        self.loop_state.cycle_started(now_ms);

        let outcome = self.execute(now_ms).await;

        let (feeders, published, publish_failures, degraded, cycle_error) = match outcome {
            Ok(out) => (
                out.feeders,
                out.published,
                out.publish_failures,
                out.degraded,
                None,
            ),
            Err((stage, message)) => {
                error!(stage, error = %message, "control cycle repository failure");
                self.safety.record_failure(stage, &message);
                let (zeros_published, zeros_failed) =
                    self.handle_repo_failure(now_ms, stage, &message).await;
                (
                    Vec::new(),
                    zeros_published,
                    zeros_failed,
                    None,
                    Some(format!("{stage}:{message}")),
                )
            }
        };

        if publish_failures > 0 && cycle_error.is_none() {
            self.safety
                .record_failure("publish", &format!("{publish_failures} setpoint(s) failed"));
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        let finished_at_ms = now_ms + duration_ms;
        let result = if cycle_error.is_some() {
            CycleResult::Error
        } else if degraded.is_some() || publish_failures > 0 {
            CycleResult::Degraded
        } else {
            CycleResult::Ok
        };

        let record = DecisionRecord {
            cycle_id,
            started_at_ms: now_ms,
            finished_at_ms,
            duration_ms,
            result,
            error: cycle_error.clone().or_else(|| degraded.clone()),
            feeders,
            published,
            publish_failures,
        };

        // 5. Persist and log the record, even on partial failure.
        let db = self.config.db.query_timeout();
        if let Err(e) = repo::with_timeout(db, self.repos.decisions.write(&record)).await {
            warn!(error = %e, "failed to persist decision record");
        }
        match serde_json::to_string(&record) {
            Ok(json) => info!(
                cycle = %cycle_id,
                result = record.result.as_str(),
                decision = %json,
                "control cycle finished"
            ),
            Err(e) => warn!(error = %e, "decision record did not serialize"),
        }

        // 6. Metrics and safety bookkeeping.
        self.metrics
            .control_cycle
            .with_label_values(&[record.result.as_str()])
            .inc();
        self.metrics
            .control_cycle_duration
            .observe(duration_ms as f64 / 1_000.0);

        let status = match record.result {
            CycleResult::Ok => LoopStatus::Ok,
            CycleResult::Degraded => LoopStatus::Degraded,
            CycleResult::Error => LoopStatus::Error,
        };
        self.loop_state
            .cycle_finished(finished_at_ms, duration_ms, status, record.error.clone());

        if record.result == CycleResult::Ok {
            self.safety.record_success();
        }

        Some(record)
    }

    /// The read/allocate/publish body; any repository error aborts with
    /// the failing stage.
    async fn execute(&self, now_ms: i64) -> Result<CycleOutput, (&'static str, String)> {
        let db = self.config.db.query_timeout();

        // 2. Snapshot: all devices in one query.
        let devices = repo::with_timeout(db, self.repos.devices.list())
            .await
            .map_err(|e| ("devices", e.to_string()))?;

        let mut by_feeder: BTreeMap<String, Vec<Device>> = BTreeMap::new();
        for device in devices {
            by_feeder
                .entry(device.feeder_id.clone())
                .or_default()
                .push(device);
        }

        // Latest telemetry per feeder, one query per feeder in parallel.
        let mut telemetry: HashMap<String, Vec<TelemetryRow>> = HashMap::new();
        let mut queries = JoinSet::new();
        for feeder_id in by_feeder.keys().cloned() {
            let telemetry_repo = Arc::clone(&self.repos.telemetry);
            queries.spawn(async move {
                let rows =
                    repo::with_timeout(db, telemetry_repo.latest_per_device(Some(&feeder_id)))
                        .await;
                (feeder_id, rows)
            });
        }
        while let Some(joined) = queries.join_next().await {
            let (feeder_id, rows) = joined.map_err(|e| ("telemetry", e.to_string()))?;
            telemetry.insert(feeder_id, rows.map_err(|e| ("telemetry", e.to_string()))?);
        }

        // At most one DR program is active across the fleet.
        let program = repo::with_timeout(db, self.repos.dr_programs.active_program(now_ms))
            .await
            .map_err(|e| ("dr_program", e.to_string()))?;

        // 3. Per-feeder resolution and allocation.
        let mut feeders = Vec::with_capacity(by_feeder.len());
        let mut plans = Vec::new();
        for (feeder_idx, (feeder_id, feeder_devices)) in by_feeder.iter().enumerate() {
            let event = repo::with_timeout(db, self.repos.events.active_event(now_ms, feeder_id))
                .await
                .map_err(|e| ("limit_event", e.to_string()))?;
            let limit_kw = event
                .as_ref()
                .map_or(self.config.control.feeder_default_limit_kw, |e| e.limit_kw);

            let rows = telemetry.remove(feeder_id.as_str()).unwrap_or_default();
            let (decision, feeder_plans) = self.process_feeder(
                now_ms,
                feeder_id,
                feeder_devices,
                &rows,
                program.as_ref(),
                limit_kw,
                feeder_idx,
            );
            feeders.push(decision);
            plans.extend(feeder_plans);
        }

        // 4. Publish fan-out.
        let (published, publish_failures, degraded) =
            self.publish_phase(now_ms, plans, &mut feeders).await;

        Ok(CycleOutput {
            feeders,
            published,
            publish_failures,
            degraded,
        })
    }

    /// Resolves one feeder: stale partition, headroom, DR, allocation, and
    /// the diff against last commands.
    #[expect(clippy::too_many_arguments)]
    fn process_feeder(
        &self,
        now_ms: i64,
        feeder_id: &str,
        devices: &[Device],
        rows: &[TelemetryRow],
        program: Option<&DrProgram>,
        limit_kw: f64,
        feeder_idx: usize,
    ) -> (FeederDecision, Vec<PublishPlan>) {
        let stale_ms = self.config.telemetry.stale_ms as i64;
        let hold_max_ms = self.config.telemetry.hold_last_max_ms as i64;
        let behavior = self.config.telemetry.missing_behavior;

        let row_by_device: HashMap<&str, &TelemetryRow> =
            rows.iter().map(|r| (r.device_id.as_str(), r)).collect();

        let mut sorted_devices: Vec<&Device> = devices.iter().collect();
        sorted_devices.sort_by(|a, b| a.id.cmp(&b.id));

        // b. Partition fresh vs stale.
        let mut assessed = Vec::with_capacity(sorted_devices.len());
        for device in sorted_devices {
            let row = row_by_device.get(device.id.as_str()).copied();
            let age_ms = row.map(|r| now_ms - r.ts_ms);
            let freshness = match age_ms {
                Some(age) if age <= stale_ms => Freshness::Fresh,
                _ => match behavior {
                    MissingTelemetryBehavior::SafeZero => Freshness::Stale,
                    MissingTelemetryBehavior::HoldLast => match age_ms {
                        Some(age) if age <= hold_max_ms => Freshness::Held,
                        _ => Freshness::Stale,
                    },
                    MissingTelemetryBehavior::ExcludeDevice => Freshness::Excluded,
                },
            };
            assessed.push(Assessed {
                device,
                row,
                age_ms,
                freshness,
            });
        }

        // c/d. Actual draw from usable samples; non-dispatchable load
        // comes off the limit first.
        let mut non_dispatchable_actual_kw = 0.0;
        let mut fresh_count = 0u32;
        let mut stale_count = 0u32;
        for a in &assessed {
            match a.freshness {
                Freshness::Fresh => fresh_count += 1,
                Freshness::Held | Freshness::Stale | Freshness::Excluded => stale_count += 1,
            }
            if matches!(a.freshness, Freshness::Fresh | Freshness::Held)
                && !a.device.is_dispatchable()
            {
                if let Some(row) = a.row {
                    non_dispatchable_actual_kw += row.power_kw;
                }
            }
        }

        let raw_headroom_kw = limit_kw - non_dispatchable_actual_kw;

        // e. DR policy; the resolved feeder limit still binds afterwards.
        let dr = apply_dr_policy(program, raw_headroom_kw, now_ms, &self.config.dr);
        let effective_headroom_kw = dr.effective_headroom_kw.min(raw_headroom_kw.max(0.0));

        // f. Allocate over eligible dispatchables.
        let eligible: Vec<DispatchDevice> = assessed
            .iter()
            .filter(|a| {
                a.device.is_dispatchable()
                    && matches!(a.freshness, Freshness::Fresh | Freshness::Held)
            })
            .map(|a| DispatchDevice {
                device_id: a.device.id.clone(),
                device_type: a.device.device_type,
                p_max_kw: a.device.p_max_kw,
                priority: a.device.priority,
                soc: a.row.and_then(|r| r.soc),
            })
            .collect();

        let deficit_snapshot: BTreeMap<String, f64> = {
            let map = self.deficits.lock();
            eligible
                .iter()
                .filter_map(|d| map.get(&d.device_id).map(|v| (d.device_id.clone(), *v)))
                .collect()
        };

        let allocation = allocate(
            &eligible,
            effective_headroom_kw,
            &self.config.control.params,
            &deficit_snapshot,
        );

        {
            // Deficit memory: entries reset when a device leaves the
            // eligible set, otherwise carry this cycle's unmet demand.
            let mut map = self.deficits.lock();
            for a in &assessed {
                if a.device.is_dispatchable()
                    && !eligible.iter().any(|e| e.device_id == a.device.id)
                {
                    map.remove(&a.device.id);
                }
            }
            for (id, unmet) in &allocation.unmet_kw {
                map.insert(id.clone(), *unmet);
            }
        }

        // g/h. Diff against last commands and build publish plans.
        let valid_until_ms = now_ms + 2 * self.config.control.interval_ms as i64;
        let republish_window_ms = self.config.control.interval_ms as i64;

        let mut device_decisions: Vec<DeviceDecision> = Vec::with_capacity(assessed.len());
        let mut plans = Vec::new();
        let mut allocated_total = 0.0;

        for a in &assessed {
            let mut reason_codes = Vec::new();
            let mut allocated_kw = 0.0;
            let mut actual_kw = None;
            let mut publish = PublishOutcome::NotApplicable;
            let mut target: Option<(f64, Option<String>)> = None;

            match a.freshness {
                Freshness::Excluded => {
                    reason_codes.push(ReasonCode::StaleTelemetry);
                }
                Freshness::Stale => {
                    reason_codes.push(ReasonCode::StaleTelemetry);
                    actual_kw = Some(0.0);
                    if a.device.is_dispatchable() {
                        target = Some((0.0, Some("stale telemetry".to_string())));
                    }
                }
                Freshness::Fresh | Freshness::Held => {
                    if a.freshness == Freshness::Held {
                        reason_codes.push(ReasonCode::StaleTelemetry);
                    }
                    actual_kw = a.row.map(|r| r.power_kw);
                    if a.device.is_dispatchable() {
                        allocated_kw = allocation
                            .allocated_kw
                            .get(&a.device.id)
                            .copied()
                            .unwrap_or(0.0);
                        if let Some(codes) = allocation.reasons.get(&a.device.id) {
                            for code in codes {
                                if !reason_codes.contains(code) {
                                    reason_codes.push(*code);
                                }
                            }
                        }
                        if let Some(code) = dr.reason {
                            reason_codes.push(code);
                        }
                        self.metrics
                            .device_allocated_kw
                            .with_label_values(&[a.device.device_type.as_str()])
                            .observe(allocated_kw);
                        target = Some((allocated_kw, None));
                    }
                }
            }
            allocated_total += allocated_kw;

            if let Some((target_kw, notes)) = target {
                let prev = self.last_commands.get(&a.device.id);
                let needs_publish = match prev {
                    None => true,
                    Some(p) => {
                        (target_kw - p.target_kw).abs() > DIFF_EPSILON_KW
                            || (p.valid_until_ms - now_ms) <= republish_window_ms
                    }
                };
                if needs_publish {
                    publish = PublishOutcome::Suppressed;
                    plans.push(PublishPlan {
                        device_id: a.device.id.clone(),
                        device_type: a.device.device_type,
                        target_kw,
                        mode: setpoint_mode(a.device, target_kw),
                        valid_until_ms,
                        notes,
                        feeder_idx,
                        device_idx: device_decisions.len(),
                    });
                } else {
                    publish = PublishOutcome::Unchanged;
                }
            }

            device_decisions.push(DeviceDecision {
                device_id: a.device.id.clone(),
                device_type: a.device.device_type,
                telemetry_age_ms: a.age_ms,
                soc: a.row.and_then(|r| r.soc),
                actual_kw,
                allocated_kw,
                setpoint_kw: None,
                publish,
                reason_codes,
            });
        }

        self.metrics
            .feeder_fresh_devices
            .with_label_values(&[feeder_id])
            .set(i64::from(fresh_count));
        self.metrics
            .feeder_stale_devices
            .with_label_values(&[feeder_id])
            .set(i64::from(stale_count));
        self.metrics
            .feeder_headroom_available_kw
            .with_label_values(&[feeder_id])
            .set(effective_headroom_kw);
        self.metrics
            .feeder_headroom_allocated_kw
            .with_label_values(&[feeder_id])
            .set(allocated_total);
        self.metrics
            .feeder_headroom_unused_kw
            .with_label_values(&[feeder_id])
            .set((effective_headroom_kw - allocated_total).max(0.0));

        let decision = FeederDecision {
            feeder_id: feeder_id.to_string(),
            limit_kw,
            raw_headroom_kw,
            effective_headroom_kw,
            allocated_kw: allocated_total,
            unused_kw: (effective_headroom_kw - allocated_total).max(0.0),
            fresh_devices: fresh_count,
            stale_devices: stale_count,
            dr_program_id: dr.program_id,
            devices: device_decisions,
        };

        (decision, plans)
    }

    /// Fans publishes out through the transport. Failures are collected
    /// per device and never abort the cycle.
    async fn publish_phase(
        &self,
        now_ms: i64,
        plans: Vec<PublishPlan>,
        feeders: &mut [FeederDecision],
    ) -> (u32, u32, Option<String>) {
        if plans.is_empty() {
            return (0, 0, None);
        }

        if self.safety.is_stopped() {
            let reason = self
                .safety
                .snapshot()
                .stopped_reason
                .unwrap_or_else(|| "stopped".to_string());
            for plan in &plans {
                feeders[plan.feeder_idx].devices[plan.device_idx].publish =
                    PublishOutcome::Suppressed;
            }
            warn!(%reason, suppressed = plans.len(), "publishes refused: loop stopped");
            return (0, 0, Some(format!("stopped:{reason}")));
        }

        let mut published = 0u32;
        let mut failures = 0u32;
        let mut degraded = None;

        match self.safety.breaker_decision(now_ms) {
            BreakerDecision::Open { remaining_ms } => {
                for plan in &plans {
                    feeders[plan.feeder_idx].devices[plan.device_idx].publish =
                        PublishOutcome::Suppressed;
                }
                warn!(remaining_ms, suppressed = plans.len(), "publishes skipped: breaker open");
                degraded = Some(format!("mqtt:breaker open ({remaining_ms}ms remaining)"));
            }
            BreakerDecision::HalfOpen => {
                // One probe at a time: publish sequentially so a failed
                // probe re-opens the breaker before the next attempt.
                for plan in plans {
                    let msg = self.build_message(&plan, now_ms);
                    let result = self.publisher.publish_setpoint(&msg).await;
                    self.apply_publish_result(
                        feeders,
                        &plan,
                        result,
                        now_ms,
                        &mut published,
                        &mut failures,
                    );
                }
            }
            BreakerDecision::Closed => {
                // Concurrent fan-out; one in-flight publish per device.
                let mut join = JoinSet::new();
                for plan in plans {
                    let publisher = Arc::clone(&self.publisher);
                    let msg = self.build_message(&plan, now_ms);
                    join.spawn(async move {
                        let result = publisher.publish_setpoint(&msg).await;
                        (plan, result)
                    });
                }
                while let Some(joined) = join.join_next().await {
                    let Ok((plan, result)) = joined else {
                        failures += 1;
                        continue;
                    };
                    self.apply_publish_result(
                        feeders,
                        &plan,
                        result,
                        now_ms,
                        &mut published,
                        &mut failures,
                    );
                }
            }
        }

        if failures > 0 && degraded.is_none() {
            degraded = Some(format!("publish:{failures} setpoint(s) failed"));
        }
        (published, failures, degraded)
    }

    fn build_message(&self, plan: &PublishPlan, now_ms: i64) -> SetpointMessage {
        SetpointMessage::new(
            plan.device_id.clone(),
            plan.device_type,
            plan.target_kw,
            plan.mode,
            now_ms,
            plan.valid_until_ms,
            self.config.control.params.allocation_mode.as_str(),
            plan.notes.clone(),
        )
    }

    fn apply_publish_result(
        &self,
        feeders: &mut [FeederDecision],
        plan: &PublishPlan,
        result: Result<(), super::PublishError>,
        now_ms: i64,
        published: &mut u32,
        failures: &mut u32,
    ) {
        let slot = &mut feeders[plan.feeder_idx].devices[plan.device_idx];
        match result {
            Ok(()) => {
                // ACKed: the command is now the device's last known state.
                self.last_commands.record(
                    &plan.device_id,
                    CommandRecord {
                        target_kw: plan.target_kw,
                        at_ms: now_ms,
                        valid_until_ms: plan.valid_until_ms,
                        device_type: plan.device_type,
                    },
                );
                slot.publish = PublishOutcome::Published;
                slot.setpoint_kw = Some(plan.target_kw);
                *published += 1;
            }
            Err(e) => {
                warn!(device = %plan.device_id, error = %e, "setpoint publish failed");
                slot.publish = PublishOutcome::Failed;
                *failures += 1;
            }
        }
    }

    /// Applies DB_ERROR_BEHAVIOR after a failed snapshot. Returns publish
    /// counts from the safe-zero path.
    async fn handle_repo_failure(
        &self,
        now_ms: i64,
        stage: &str,
        message: &str,
    ) -> (u32, u32) {
        match self.config.control.db_error_behavior {
            DbErrorBehavior::StopLoop => {
                self.safety.stop(&format!("{stage}:{message}"));
                (0, 0)
            }
            DbErrorBehavior::HoldLast => {
                debug!("repository failure under HOLD_LAST; commands left untouched");
                (0, 0)
            }
            DbErrorBehavior::SafeZeroAll => self.safe_zero_all(now_ms).await,
        }
    }

    /// Publishes a zero setpoint to every previously commanded device.
    async fn safe_zero_all(&self, now_ms: i64) -> (u32, u32) {
        let valid_until_ms = now_ms + 2 * self.config.control.interval_ms as i64;
        let mut published = 0u32;
        let mut failures = 0u32;

        for device_id in self.last_commands.device_ids() {
            let Some(prev) = self.last_commands.get(&device_id) else {
                continue;
            };
            let msg = SetpointMessage::new(
                device_id.clone(),
                prev.device_type,
                0.0,
                SetpointMode::Idle,
                now_ms,
                valid_until_ms,
                self.config.control.params.allocation_mode.as_str(),
                Some("safe zero after repository failure".to_string()),
            );
            match self.publisher.publish_setpoint(&msg).await {
                Ok(()) => {
                    self.last_commands.record(
                        &device_id,
                        CommandRecord {
                            target_kw: 0.0,
                            at_ms: now_ms,
                            valid_until_ms,
                            device_type: prev.device_type,
                        },
                    );
                    published += 1;
                }
                Err(e) => {
                    warn!(device = %device_id, error = %e, "safe-zero publish failed");
                    failures += 1;
                }
            }
        }

        if published > 0 || failures > 0 {
            info!(published, failures, "issued safe-zero setpoints after repository failure");
        }
        (published, failures)
    }

    /// Startup publish per RESTART_BEHAVIOR, before the first cycle.
    pub async fn startup_publish(&self) {
        match self.config.control.restart_behavior {
            RestartBehavior::HoldLast => {
                debug!("restart behavior HOLD_LAST; deliberately not publishing");
            }
            RestartBehavior::SafeZero => {
                let db = self.config.db.query_timeout();
                let devices = match repo::with_timeout(db, self.repos.devices.list()).await {
                    Ok(devices) => devices,
                    Err(e) => {
                        warn!(error = %e, "startup safe-zero skipped: device list failed");
                        return;
                    }
                };

                let now_ms = clock::now_ms();
                let valid_until_ms = now_ms + 2 * self.config.control.interval_ms as i64;
                let mut published = 0u32;
                for device in devices.iter().filter(|d| d.is_dispatchable()) {
                    let msg = SetpointMessage::new(
                        device.id.clone(),
                        device.device_type,
                        0.0,
                        SetpointMode::Idle,
                        now_ms,
                        valid_until_ms,
                        self.config.control.params.allocation_mode.as_str(),
                        Some("safe zero on restart".to_string()),
                    );
                    match self.publisher.publish_setpoint(&msg).await {
                        Ok(()) => {
                            self.last_commands.record(
                                &device.id,
                                CommandRecord {
                                    target_kw: 0.0,
                                    at_ms: now_ms,
                                    valid_until_ms,
                                    device_type: device.device_type,
                                },
                            );
                            published += 1;
                        }
                        Err(e) => {
                            warn!(device = %device.id, error = %e, "startup safe-zero failed");
                        }
                    }
                }
                if published > 0 {
                    info!(published, "published safe-zero setpoints on restart");
                }
            }
        }
    }

    /// Heartbeat-based offline alerting and map trimming.
    fn post_cycle_housekeeping(&self, now_ms: i64) {
        let timeout_ms = self.config.control.heartbeat_timeout_seconds as i64 * 1_000;
        let cooldown_ms = self.config.control.alert_cooldown_seconds as i64 * 1_000;

        let offline = self.heartbeats.offline(now_ms, timeout_ms);
        if !offline.is_empty()
            && self
                .loop_state
                .should_alert("offline_devices", now_ms, cooldown_ms)
        {
            warn!(count = offline.len(), devices = ?offline, "devices offline past heartbeat timeout");
            self.metrics
                .alert_total
                .with_label_values(&["offline_devices"])
                .inc();
        }
        self.heartbeats.trim(now_ms, timeout_ms * 10);
        self.check_stall(now_ms);
    }

    fn check_stall(&self, now_ms: i64) {
        let threshold_ms = self.config.control.stall_threshold_seconds as i64 * 1_000;
        let cooldown_ms = self.config.control.alert_cooldown_seconds as i64 * 1_000;
        let snap = self.loop_state.snapshot();

        let stalled = match (snap.last_finished_ms, snap.last_started_ms) {
            (Some(finished), _) => now_ms - finished > threshold_ms,
            (None, Some(started)) => now_ms - started > threshold_ms,
            (None, None) => false,
        };
        if stalled
            && self
                .loop_state
                .should_alert("control_loop_stalled", now_ms, cooldown_ms)
        {
            warn!(threshold_ms, "no control cycle has completed within the stall threshold");
            self.metrics
                .alert_total
                .with_label_values(&["control_loop_stalled"])
                .inc();
        }
    }
}

/// Maps an allocation to a command mode: physical PV is curtailed via
/// `limit`, a zero target idles, anything else charges.
fn setpoint_mode(device: &Device, target_kw: f64) -> SetpointMode {
    if device.is_physical && device.device_type == DeviceType::Pv {
        SetpointMode::Limit
    } else if target_kw.abs() <= DIFF_EPSILON_KW {
        SetpointMode::Idle
    } else {
        SetpointMode::Charge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::Config;
    use crate::contracts::SetpointMessage;
    use crate::control::PublishError;
    use crate::repo::memory::MemoryStore;
    use crate::repo::{Repositories, TelemetryRepo};
    use crate::safety::SafetyPolicy;

    /// Recording publisher; optionally fails every publish.
    struct FakePublisher {
        sent: Mutex<Vec<SetpointMessage>>,
        fail: bool,
    }

    impl FakePublisher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn sent(&self) -> Vec<SetpointMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl SetpointPublisher for FakePublisher {
        async fn publish_setpoint(&self, msg: &SetpointMessage) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Transport("broker unavailable".to_string()));
            }
            self.sent.lock().push(msg.clone());
            Ok(())
        }
    }

    fn harness(config: Config, publisher: Arc<FakePublisher>) -> (Arc<ControlLoop>, MemoryStore) {
        let store = MemoryStore::new();
        let repos = Repositories {
            devices: Arc::new(store.clone()),
            telemetry: Arc::new(store.clone()),
            events: Arc::new(store.clone()),
            dr_programs: Arc::new(store.clone()),
            decisions: Arc::new(store.clone()),
        };
        let policy = SafetyPolicy::from_config(&config);
        let safety = Arc::new(SafetyState::new(policy));
        let readiness = Arc::new(Readiness::new());
        readiness.set_db_ready(true, None);
        readiness.set_bus_ready(true, None);
        let metrics = Metrics::new().expect("metrics");
        let control = ControlLoop::new(
            config,
            repos,
            publisher,
            safety,
            readiness,
            Arc::new(LastCommands::new()),
            Arc::new(Heartbeats::new()),
            Arc::new(LoopState::new()),
            metrics,
        );
        (control, store)
    }

    #[tokio::test]
    async fn readiness_gate_refuses_without_touching_storage() {
        let publisher = FakePublisher::new(false);
        let (control, store) = harness(Config::default(), Arc::clone(&publisher));
        control.readiness.set_bus_ready(false, Some("disconnected".to_string()));

        let record = control.run_cycle_at(clock::now_ms()).await;
        assert!(record.is_none());
        assert!(publisher.sent().is_empty());
        assert_eq!(store.telemetry_len(), 0);
        assert_eq!(
            control.loop_state.snapshot().status,
            LoopStatus::Degraded
        );
    }

    #[tokio::test]
    async fn empty_fleet_produces_an_ok_record_with_no_publishes() {
        let publisher = FakePublisher::new(false);
        let (control, _store) = harness(Config::default(), Arc::clone(&publisher));

        let record = control
            .run_cycle_at(clock::now_ms())
            .await
            .expect("record emitted");
        assert_eq!(record.result, CycleResult::Ok);
        assert!(record.feeders.is_empty());
        assert_eq!(record.published, 0);
        assert!(publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn unchanged_allocation_is_not_republished_until_ttl_nears() {
        let publisher = FakePublisher::new(false);
        let mut config = Config::default();
        config.control.feeder_default_limit_kw = 10.0;
        let (control, store) = harness(config, Arc::clone(&publisher));

        let now = clock::now_ms();
        crate::repo::DeviceRepo::upsert(
            &store,
            Device::new("ev-1", DeviceType::Ev, "s1", "f1", 5.0, 1),
        )
        .await
        .expect("seed device");
        store
            .insert_batch(&[TelemetryRow {
                message_id: Uuid::new_v4(),
                device_id: "ev-1".to_string(),
                device_type: DeviceType::Ev,
                ts_ms: now - 1_000,
                sent_at_ms: None,
                power_kw: 2.0,
                soc: Some(0.3),
                capabilities: None,
                site_id: "s1".to_string(),
                feeder_id: "f1".to_string(),
                source: "test".to_string(),
                message_version: 1,
                online: true,
            }])
            .await
            .expect("seed telemetry");

        let first = control.run_cycle_at(now).await.expect("first cycle");
        assert_eq!(first.published, 1);

        // Second cycle right away: same allocation, TTL far from expiry.
        let second = control.run_cycle_at(now + 1_000).await.expect("second cycle");
        assert_eq!(second.published, 0);
        let device = &second.feeders[0].devices[0];
        assert_eq!(device.publish, PublishOutcome::Unchanged);

        // By now ev-1's telemetry is stale and its command TTL is near
        // expiry, so a zero setpoint replaces the old command.
        let near_ttl = now + control.config.control.interval_ms as i64 + 5_000;
        let third = control.run_cycle_at(near_ttl).await.expect("third cycle");
        assert_eq!(third.published, 1);
    }

    #[tokio::test]
    async fn publish_failures_degrade_the_cycle_and_count_against_safety() {
        let publisher = FakePublisher::new(true);
        let mut config = Config::default();
        config.control.feeder_default_limit_kw = 10.0;
        let (control, store) = harness(config, Arc::clone(&publisher));

        let now = clock::now_ms();
        crate::repo::DeviceRepo::upsert(
            &store,
            Device::new("ev-1", DeviceType::Ev, "s1", "f1", 5.0, 1),
        )
        .await
        .expect("seed device");
        store
            .insert_batch(&[TelemetryRow {
                message_id: Uuid::new_v4(),
                device_id: "ev-1".to_string(),
                device_type: DeviceType::Ev,
                ts_ms: now,
                sent_at_ms: None,
                power_kw: 1.0,
                soc: Some(0.5),
                capabilities: None,
                site_id: "s1".to_string(),
                feeder_id: "f1".to_string(),
                source: "test".to_string(),
                message_version: 1,
                online: true,
            }])
            .await
            .expect("seed telemetry");

        let record = control.run_cycle_at(now).await.expect("record");
        assert_eq!(record.result, CycleResult::Degraded);
        assert_eq!(record.publish_failures, 1);
        assert_eq!(record.feeders[0].devices[0].publish, PublishOutcome::Failed);
        assert_eq!(control.safety.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn setpoint_mode_maps_device_kinds() {
        let ev = Device::new("ev-1", DeviceType::Ev, "s", "f", 5.0, 1);
        assert_eq!(setpoint_mode(&ev, 3.0), SetpointMode::Charge);
        assert_eq!(setpoint_mode(&ev, 0.0), SetpointMode::Idle);
        let pv = Device::new("pi-pv-1", DeviceType::Pv, "s", "f", 5.0, 1);
        assert_eq!(setpoint_mode(&pv, 2.0), SetpointMode::Limit);
    }
}
