//! Bounded batch queue and the single flusher draining it.
//!
//! Producers enqueue a row together with a oneshot responder; the flusher
//! drains up to `batch_size` rows or waits out the flush interval, writes
//! the batch in one repository call, and resolves every responder with its
//! row's outcome. A repository error fails the whole batch: every waiter
//! receives the same error and nothing is retried here.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::IngestError;
use crate::clock;
use crate::model::{Device, DeviceType, TelemetryRow};
use crate::observe::Metrics;
use crate::repo::{self, DeviceRepo, InsertOutcome, TelemetryRepo};
use crate::safety::SafetyPolicy;

use super::latest::{Heartbeats, LatestMarkers};

/// One queued row plus the channel its producer is waiting on.
pub(crate) struct PendingRow {
    pub row: TelemetryRow,
    pub respond: oneshot::Sender<Result<InsertOutcome, IngestError>>,
}

/// The single consumer of the ingest queue.
pub struct BatchFlusher {
    rx: mpsc::Receiver<PendingRow>,
    telemetry: Arc<dyn TelemetryRepo>,
    devices: Arc<dyn DeviceRepo>,
    latest: Arc<LatestMarkers>,
    heartbeats: Arc<Heartbeats>,
    metrics: Metrics,
    batch_size: usize,
    flush_interval: std::time::Duration,
    db_timeout: std::time::Duration,
}

impl BatchFlusher {
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn new(
        rx: mpsc::Receiver<PendingRow>,
        telemetry: Arc<dyn TelemetryRepo>,
        devices: Arc<dyn DeviceRepo>,
        latest: Arc<LatestMarkers>,
        heartbeats: Arc<Heartbeats>,
        metrics: Metrics,
        batch_size: usize,
        flush_interval: std::time::Duration,
        policy: &SafetyPolicy,
    ) -> Self {
        Self {
            rx,
            telemetry,
            devices,
            latest,
            heartbeats,
            metrics,
            batch_size,
            flush_interval,
            db_timeout: policy.db_query_timeout,
        }
    }

    /// Runs until the queue closes or shutdown fires, then drains whatever
    /// is still queued with a final flush.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let first = tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.drain_remaining().await;
                    return;
                }
            };

            let mut batch = vec![first];
            let deadline = tokio::time::sleep(self.flush_interval);
            tokio::pin!(deadline);
            while batch.len() < self.batch_size {
                tokio::select! {
                    _ = &mut deadline => break,
                    item = self.rx.recv() => match item {
                        Some(item) => batch.push(item),
                        None => break,
                    },
                }
            }

            self.flush(batch).await;
        }
        self.drain_remaining().await;
    }

    /// Final flush on shutdown: everything still queued is written out.
    async fn drain_remaining(&mut self) {
        loop {
            let mut batch = Vec::new();
            while batch.len() < self.batch_size {
                match self.rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                return;
            }
            debug!(rows = batch.len(), "final telemetry flush");
            self.flush(batch).await;
        }
    }

    async fn flush(&self, batch: Vec<PendingRow>) {
        self.metrics.telemetry_queue_depth.sub(batch.len() as i64);
        let rows: Vec<TelemetryRow> = batch.iter().map(|p| p.row.clone()).collect();

        let outcomes =
            repo::with_timeout(self.db_timeout, self.telemetry.insert_batch(&rows)).await;

        match outcomes {
            Ok(outcomes) => {
                let now_ms = clock::now_ms();
                for (pending, outcome) in batch.into_iter().zip(outcomes) {
                    match outcome {
                        InsertOutcome::Inserted => {
                            let row = &pending.row;
                            self.latest.advance(&row.device_id, row.ts_ms, row.sent_at_ms);
                            self.heartbeats.note(&row.device_id, now_ms);
                            self.ensure_device(row).await;
                        }
                        InsertOutcome::Duplicate => {
                            self.metrics
                                .duplicate_message
                                .with_label_values(&["telemetry"])
                                .inc();
                        }
                    }
                    let _ = pending.respond.send(Ok(outcome));
                }
            }
            Err(e) => {
                warn!(error = %e, rows = rows.len(), "telemetry batch insert failed");
                let shared = IngestError::Repo(e.to_string());
                for pending in batch {
                    let _ = pending.respond.send(Err(shared.clone()));
                }
            }
        }
    }

    /// Upserts a device the first time telemetry names it.
    async fn ensure_device(&self, row: &TelemetryRow) {
        let known = match repo::with_timeout(self.db_timeout, self.devices.get_by_id(&row.device_id))
            .await
        {
            Ok(known) => known,
            Err(e) => {
                warn!(device = %row.device_id, error = %e, "device lookup failed");
                return;
            }
        };
        if known.is_some() {
            return;
        }

        let device = Device::new(
            row.device_id.clone(),
            row.device_type,
            row.site_id.clone(),
            row.feeder_id.clone(),
            nameplate_kw(row),
            1,
        );
        if let Err(e) = repo::with_timeout(self.db_timeout, self.devices.upsert(device)).await {
            warn!(device = %row.device_id, error = %e, "device upsert failed");
        }
    }
}

/// Nameplate bound from the reported capability caps.
///
/// Generators advertise their rating on the export/discharge side,
/// storage and chargers on the charge/import side; the first populated
/// cap in that order wins. No capabilities means no known bound.
fn nameplate_kw(row: &TelemetryRow) -> f64 {
    let Some(caps) = row.capabilities else {
        return 0.0;
    };
    let preference = match row.device_type {
        DeviceType::Pv => [
            caps.max_export_kw,
            caps.max_discharge_kw,
            caps.max_charge_kw,
            caps.max_import_kw,
        ],
        DeviceType::Battery => [
            caps.max_charge_kw,
            caps.max_discharge_kw,
            caps.max_import_kw,
            caps.max_export_kw,
        ],
        DeviceType::Ev => [
            caps.max_charge_kw,
            caps.max_import_kw,
            caps.max_discharge_kw,
            caps.max_export_kw,
        ],
    };
    preference.into_iter().flatten().next().unwrap_or(0.0)
}
