//! Abstract persistence consumed by the core.
//!
//! The control loop and telemetry handler depend only on these traits; the
//! relational implementation lives outside this crate. Every call site
//! wraps its query in [`with_timeout`] using the configured DB deadline.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::control::decision::DecisionRecord;
use crate::model::{Device, DrProgram, FeederInfo, LimitEvent, TelemetryRow};

/// Repository-boundary failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepoError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-row result of a batch insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row persisted for the first time.
    Inserted,
    /// A row with the same `message_id` already existed.
    Duplicate,
}

/// Devices known to the controller.
#[async_trait]
pub trait DeviceRepo: Send + Sync {
    async fn list(&self) -> Result<Vec<Device>, RepoError>;
    async fn upsert(&self, device: Device) -> Result<(), RepoError>;
    async fn get_by_id(&self, id: &str) -> Result<Option<Device>, RepoError>;
    async fn list_feeders(&self) -> Result<Vec<FeederInfo>, RepoError>;
}

/// Telemetry history and freshness queries.
#[async_trait]
pub trait TelemetryRepo: Send + Sync {
    /// Persists rows in order; returns one outcome per input row.
    /// Rows whose `message_id` already exists come back as `Duplicate`.
    async fn insert_batch(&self, rows: &[TelemetryRow]) -> Result<Vec<InsertOutcome>, RepoError>;

    /// The newest row per device, optionally restricted to one feeder.
    async fn latest_per_device(
        &self,
        feeder_id: Option<&str>,
    ) -> Result<Vec<TelemetryRow>, RepoError>;

    /// Most recent rows for one device, newest first.
    async fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetryRow>, RepoError>;

    /// Mean |actual − commanded| over the trailing window, when any pairs
    /// of telemetry and decision setpoints exist in it.
    async fn tracking_error_window(
        &self,
        minutes: u32,
        feeder_id: Option<&str>,
    ) -> Result<Option<f64>, RepoError>;

    /// Raw rows for a feeder within `[from_ms, to_ms)`, oldest first.
    async fn feeder_history(
        &self,
        feeder_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<TelemetryRow>, RepoError>;
}

/// Time-bounded feeder limit events, consumed read-only.
#[async_trait]
pub trait LimitEventRepo: Send + Sync {
    /// The limit of the currently active event, if one is active.
    async fn current_limit(&self, now_ms: i64, feeder_id: &str) -> Result<Option<f64>, RepoError>;

    /// The active event itself; ties broken by latest `ts_start`.
    async fn active_event(
        &self,
        now_ms: i64,
        feeder_id: &str,
    ) -> Result<Option<LimitEvent>, RepoError>;
}

/// Demand-response programs.
#[async_trait]
pub trait DrProgramRepo: Send + Sync {
    /// The single program that is both administratively active and inside
    /// its window at `now_ms`.
    async fn active_program(&self, now_ms: i64) -> Result<Option<DrProgram>, RepoError>;

    async fn list(&self) -> Result<Vec<DrProgram>, RepoError>;
    async fn get_by_id(&self, id: &str) -> Result<Option<DrProgram>, RepoError>;

    /// Inserts or replaces a program. Activating a program deactivates any
    /// previously active one.
    async fn upsert(&self, program: DrProgram) -> Result<(), RepoError>;
}

/// Audit log of control cycles.
#[async_trait]
pub trait DecisionRepo: Send + Sync {
    async fn write(&self, record: &DecisionRecord) -> Result<(), RepoError>;
    async fn recent(&self, limit: usize) -> Result<Vec<DecisionRecord>, RepoError>;
}

/// The repository bundle handed to the core components.
#[derive(Clone)]
pub struct Repositories {
    pub devices: Arc<dyn DeviceRepo>,
    pub telemetry: Arc<dyn TelemetryRepo>,
    pub events: Arc<dyn LimitEventRepo>,
    pub dr_programs: Arc<dyn DrProgramRepo>,
    pub decisions: Arc<dyn DecisionRepo>,
}

/// Applies the configured per-query deadline to a repository call.
pub async fn with_timeout<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, RepoError>>,
) -> Result<T, RepoError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(RepoError::Timeout(deadline)),
    }
}
