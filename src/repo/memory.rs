//! In-memory repository implementation.
//!
//! Backs the standalone binary and the test suite. Mirrors the relational
//! schema's uniqueness rules: telemetry rows are unique by `message_id`,
//! devices by id, and at most one DR program is active at a time.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    DecisionRepo, DeviceRepo, DrProgramRepo, InsertOutcome, LimitEventRepo, RepoError,
    TelemetryRepo,
};
use crate::clock;
use crate::control::decision::DecisionRecord;
use crate::model::{Device, DrProgram, FeederInfo, LimitEvent, TelemetryRow};

/// How many decision records the in-memory store retains.
const DECISION_CAPACITY: usize = 1_000;

#[derive(Default)]
struct Inner {
    devices: BTreeMap<String, Device>,
    telemetry: Vec<TelemetryRow>,
    seen_message_ids: HashSet<Uuid>,
    limit_events: Vec<LimitEvent>,
    dr_programs: Vec<DrProgram>,
    decisions: VecDeque<DecisionRecord>,
}

/// Shared in-memory store implementing every repository trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a limit event (events are created by the admin surface in
    /// production; tests and the standalone binary seed them directly).
    pub fn insert_limit_event(&self, event: LimitEvent) {
        self.inner.write().limit_events.push(event);
    }

    /// Number of telemetry rows currently persisted.
    pub fn telemetry_len(&self) -> usize {
        self.inner.read().telemetry.len()
    }
}

#[async_trait]
impl DeviceRepo for MemoryStore {
    async fn list(&self) -> Result<Vec<Device>, RepoError> {
        Ok(self.inner.read().devices.values().cloned().collect())
    }

    async fn upsert(&self, device: Device) -> Result<(), RepoError> {
        self.inner.write().devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Device>, RepoError> {
        Ok(self.inner.read().devices.get(id).cloned())
    }

    async fn list_feeders(&self) -> Result<Vec<FeederInfo>, RepoError> {
        let inner = self.inner.read();
        let mut by_feeder: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for device in inner.devices.values() {
            let entry = by_feeder.entry(device.feeder_id.clone()).or_default();
            entry.0 += 1;
            if device.is_dispatchable() {
                entry.1 += 1;
            }
        }
        Ok(by_feeder
            .into_iter()
            .map(|(feeder_id, (device_count, dispatchable_count))| FeederInfo {
                feeder_id,
                device_count,
                dispatchable_count,
            })
            .collect())
    }
}

#[async_trait]
impl TelemetryRepo for MemoryStore {
    async fn insert_batch(&self, rows: &[TelemetryRow]) -> Result<Vec<InsertOutcome>, RepoError> {
        let mut inner = self.inner.write();
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            if inner.seen_message_ids.insert(row.message_id) {
                inner.telemetry.push(row.clone());
                outcomes.push(InsertOutcome::Inserted);
            } else {
                outcomes.push(InsertOutcome::Duplicate);
            }
        }
        Ok(outcomes)
    }

    async fn latest_per_device(
        &self,
        feeder_id: Option<&str>,
    ) -> Result<Vec<TelemetryRow>, RepoError> {
        let inner = self.inner.read();
        let mut latest: BTreeMap<&str, &TelemetryRow> = BTreeMap::new();
        for row in &inner.telemetry {
            if let Some(feeder) = feeder_id {
                if row.feeder_id != feeder {
                    continue;
                }
            }
            let newer = match latest.get(row.device_id.as_str()) {
                Some(existing) => (existing.ts_ms, existing.sent_at_ms) < (row.ts_ms, row.sent_at_ms),
                None => true,
            };
            if newer {
                latest.insert(row.device_id.as_str(), row);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetryRow>, RepoError> {
        let inner = self.inner.read();
        let mut rows: Vec<TelemetryRow> = inner
            .telemetry
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse((r.ts_ms, r.sent_at_ms)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn tracking_error_window(
        &self,
        minutes: u32,
        feeder_id: Option<&str>,
    ) -> Result<Option<f64>, RepoError> {
        let inner = self.inner.read();
        let from_ms = clock::now_ms() - i64::from(minutes) * 60_000;

        // Commanded setpoints per device, in decision order.
        let mut commanded: BTreeMap<&str, Vec<(i64, f64)>> = BTreeMap::new();
        for record in &inner.decisions {
            for feeder in &record.feeders {
                for device in &feeder.devices {
                    if let Some(setpoint) = device.setpoint_kw {
                        commanded
                            .entry(device.device_id.as_str())
                            .or_default()
                            .push((record.finished_at_ms, setpoint));
                    }
                }
            }
        }

        let mut sum = 0.0;
        let mut count = 0usize;
        for row in &inner.telemetry {
            if row.ts_ms < from_ms {
                continue;
            }
            if let Some(feeder) = feeder_id {
                if row.feeder_id != feeder {
                    continue;
                }
            }
            let Some(history) = commanded.get(row.device_id.as_str()) else {
                continue;
            };
            // Latest command issued at or before the sample.
            let setpoint = history
                .iter()
                .rev()
                .find(|(ts, _)| *ts <= row.ts_ms)
                .map(|(_, kw)| *kw);
            if let Some(setpoint) = setpoint {
                sum += (row.power_kw - setpoint).abs();
                count += 1;
            }
        }

        Ok(if count > 0 {
            Some(sum / count as f64)
        } else {
            None
        })
    }

    async fn feeder_history(
        &self,
        feeder_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<TelemetryRow>, RepoError> {
        let inner = self.inner.read();
        let mut rows: Vec<TelemetryRow> = inner
            .telemetry
            .iter()
            .filter(|r| r.feeder_id == feeder_id && r.ts_ms >= from_ms && r.ts_ms < to_ms)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.ts_ms, r.sent_at_ms));
        Ok(rows)
    }
}

#[async_trait]
impl LimitEventRepo for MemoryStore {
    async fn current_limit(&self, now_ms: i64, feeder_id: &str) -> Result<Option<f64>, RepoError> {
        Ok(self
            .active_event(now_ms, feeder_id)
            .await?
            .map(|e| e.limit_kw))
    }

    async fn active_event(
        &self,
        now_ms: i64,
        feeder_id: &str,
    ) -> Result<Option<LimitEvent>, RepoError> {
        let inner = self.inner.read();
        Ok(inner
            .limit_events
            .iter()
            .filter(|e| e.feeder_id == feeder_id && e.is_active(now_ms))
            .max_by_key(|e| e.ts_start)
            .cloned())
    }
}

#[async_trait]
impl DrProgramRepo for MemoryStore {
    async fn active_program(&self, now_ms: i64) -> Result<Option<DrProgram>, RepoError> {
        let inner = self.inner.read();
        Ok(inner
            .dr_programs
            .iter()
            .find(|p| p.is_active_at(now_ms))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<DrProgram>, RepoError> {
        Ok(self.inner.read().dr_programs.clone())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DrProgram>, RepoError> {
        Ok(self
            .inner
            .read()
            .dr_programs
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn upsert(&self, program: DrProgram) -> Result<(), RepoError> {
        let mut inner = self.inner.write();
        if program.is_active {
            for existing in &mut inner.dr_programs {
                existing.is_active = false;
            }
        }
        if let Some(existing) = inner.dr_programs.iter_mut().find(|p| p.id == program.id) {
            *existing = program;
        } else {
            inner.dr_programs.push(program);
        }
        Ok(())
    }
}

#[async_trait]
impl DecisionRepo for MemoryStore {
    async fn write(&self, record: &DecisionRecord) -> Result<(), RepoError> {
        let mut inner = self.inner.write();
        if inner.decisions.len() >= DECISION_CAPACITY {
            inner.decisions.pop_front();
        }
        inner.decisions.push_back(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DecisionRecord>, RepoError> {
        let inner = self.inner.read();
        Ok(inner.decisions.iter().rev().take(limit).cloned().collect())
    }
}
