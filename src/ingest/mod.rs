//! Telemetry ingest: validation, idempotent persistence, and freshness.
//!
//! One process-wide [`TelemetryHandler`] turns a raw wire message into
//! at-most-one persisted row. Deduplication happens at the repository via
//! `message_id`; ordering is preserved per device by the single queue; the
//! latest-per-device marker is monotone even when older duplicates land.

pub mod latest;
pub mod queue;

pub use latest::{Heartbeats, LatestMarkers};
pub use queue::BatchFlusher;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::clock;
use crate::config::Config;
use crate::contracts::telemetry::{parse_telemetry, TelemetryMessage};
use crate::contracts::{ContractError, ValidationMode, CONTRACT_VERSION};
use crate::model::TelemetryRow;
use crate::observe::Metrics;
use crate::repo::{DeviceRepo, InsertOutcome, TelemetryRepo};
use crate::safety::SafetyPolicy;

use queue::PendingRow;

/// Ingest failure kinds surfaced to the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("timestamp {ts_ms} is more than {skew_ms}ms in the future")]
    FutureTimestamp { ts_ms: i64, skew_ms: i64 },
    /// Queue full. Not retryable: the caller must drop the message.
    #[error("ingest queue full (capacity {capacity})")]
    Backpressure { capacity: usize },
    #[error("repository failure: {0}")]
    Repo(String),
    #[error("ingest pipeline shut down")]
    Closed,
}

/// Whether the repository persisted the row or already had it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Inserted,
    Duplicate,
}

/// Result of one handled telemetry message.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub status: IngestStatus,
    /// Whether the sample was strictly newer than the device's marker at
    /// handling time.
    pub newest: bool,
    pub parsed: TelemetryMessage,
}

/// The single process-wide telemetry handler.
pub struct TelemetryHandler {
    mode: ValidationMode,
    default_feeder_id: String,
    allowed_future_skew_ms: i64,
    queue_capacity: usize,
    tx: mpsc::Sender<PendingRow>,
    latest: Arc<LatestMarkers>,
    metrics: Metrics,
}

impl TelemetryHandler {
    /// Builds the handler plus its flusher. The caller spawns
    /// [`BatchFlusher::run`] on the runtime.
    pub fn new(
        config: &Config,
        policy: &SafetyPolicy,
        metrics: Metrics,
        latest: Arc<LatestMarkers>,
        heartbeats: Arc<Heartbeats>,
        telemetry_repo: Arc<dyn TelemetryRepo>,
        device_repo: Arc<dyn DeviceRepo>,
    ) -> (Arc<Self>, BatchFlusher) {
        let capacity = config.telemetry.max_queue_size;
        let (tx, rx) = mpsc::channel(capacity);
        let flusher = BatchFlusher::new(
            rx,
            telemetry_repo,
            device_repo,
            Arc::clone(&latest),
            heartbeats,
            metrics.clone(),
            config.telemetry.batch_size,
            std::time::Duration::from_millis(config.telemetry.batch_flush_ms),
            policy,
        );
        let handler = Arc::new(Self {
            mode: ValidationMode::Strict,
            default_feeder_id: config.control.default_feeder_id.clone(),
            allowed_future_skew_ms: config.telemetry.allowed_future_skew_ms as i64,
            queue_capacity: capacity,
            tx,
            latest,
            metrics,
        });
        (handler, flusher)
    }

    /// Validates, projects, enqueues, and waits for the row's outcome.
    pub async fn handle(&self, raw: &[u8]) -> Result<IngestOutcome, IngestError> {
        // 1. Contract validation.
        let msg = match parse_telemetry(raw, self.mode) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics
                    .contract_validation_fail
                    .with_label_values(&[e.reason_label()])
                    .inc();
                if e.is_version_mismatch() {
                    self.metrics.contract_version_reject.inc();
                }
                return Err(e.into());
            }
        };

        // 2. Future-skew bound.
        let now_ms = clock::now_ms();
        if msg.envelope.timestamp_ms > now_ms + self.allowed_future_skew_ms {
            self.metrics
                .telemetry_dropped
                .with_label_values(&["future_skew"])
                .inc();
            return Err(IngestError::FutureTimestamp {
                ts_ms: msg.envelope.timestamp_ms,
                skew_ms: self.allowed_future_skew_ms,
            });
        }

        // 3. Newness against the in-memory marker. Non-newest samples are
        //    still persisted for history completeness.
        let newest = self.latest.is_newer(
            &msg.envelope.device_id,
            msg.envelope.timestamp_ms,
            msg.envelope.sent_at_ms,
        );
        if !newest {
            self.metrics
                .out_of_order
                .with_label_values(&["telemetry"])
                .inc();
        }

        // 4. Projection into the persistence row.
        let row = project_row(&msg, &self.default_feeder_id);

        // 5. Bounded enqueue; full queue fails fast.
        let (respond_tx, respond_rx) = oneshot::channel();
        let pending = PendingRow {
            row,
            respond: respond_tx,
        };
        match self.tx.try_send(pending) {
            Ok(()) => {
                self.metrics.telemetry_queue_depth.inc();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics
                    .telemetry_dropped
                    .with_label_values(&["backpressure"])
                    .inc();
                return Err(IngestError::Backpressure {
                    capacity: self.queue_capacity,
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(IngestError::Closed);
            }
        }

        // 6/7. The flusher resolves the waiter with the row's outcome.
        let outcome = respond_rx.await.map_err(|_| IngestError::Closed)??;
        let status = match outcome {
            InsertOutcome::Inserted => IngestStatus::Inserted,
            InsertOutcome::Duplicate => IngestStatus::Duplicate,
        };

        Ok(IngestOutcome {
            status,
            newest,
            parsed: msg,
        })
    }
}

/// Projects a validated message into its persistence row.
///
/// Identity fallback order is fixed: `feederId` then `siteId` then the
/// configured default, applied symmetrically for both fields.
pub fn project_row(msg: &TelemetryMessage, default_feeder_id: &str) -> TelemetryRow {
    let payload = &msg.payload;
    let feeder_id = payload
        .feeder_id
        .clone()
        .or_else(|| payload.site_id.clone())
        .unwrap_or_else(|| default_feeder_id.to_string());
    let site_id = payload
        .site_id
        .clone()
        .or_else(|| payload.feeder_id.clone())
        .unwrap_or_else(|| default_feeder_id.to_string());

    TelemetryRow {
        message_id: msg.envelope.message_id,
        device_id: msg.envelope.device_id.clone(),
        device_type: msg.envelope.device_type,
        ts_ms: msg.envelope.timestamp_ms,
        sent_at_ms: msg.envelope.sent_at_ms,
        power_kw: payload.readings.power_kw,
        soc: payload.readings.soc,
        capabilities: payload.capabilities,
        site_id,
        feeder_id,
        source: msg
            .envelope
            .source
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        message_version: CONTRACT_VERSION,
        online: payload.status.online,
    }
}
