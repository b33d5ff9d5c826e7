//! Integration tests for the telemetry ingest path: idempotency,
//! ordering, freshness markers, and backpressure.

mod common;

use derms_ctl::clock;
use derms_ctl::contracts::ContractError;
use derms_ctl::ingest::{IngestError, IngestStatus};

const MSG_A: &str = "11111111-1111-4111-8111-111111111111";
const MSG_B: &str = "22222222-2222-4222-8222-222222222222";
const MSG_C: &str = "33333333-3333-4333-8333-333333333333";

fn fast_config() -> derms_ctl::config::Config {
    let mut config = common::test_config();
    config.telemetry.batch_flush_ms = 20;
    config.telemetry.batch_size = 10;
    config
}

#[tokio::test]
async fn duplicate_message_id_inserts_once() {
    let h = common::ingest_harness(fast_config(), true);
    let now = clock::now_ms();

    let first = h
        .handler
        .handle(&common::telemetry_bytes("ev-1", MSG_A, now - 1_000, None, 3.0))
        .await
        .expect("first submit");
    assert_eq!(first.status, IngestStatus::Inserted);
    assert!(first.newest);

    // Same message id again, across a different batch.
    let second = h
        .handler
        .handle(&common::telemetry_bytes("ev-1", MSG_A, now - 1_000, None, 3.0))
        .await
        .expect("second submit");
    assert_eq!(second.status, IngestStatus::Duplicate);

    assert_eq!(h.store.telemetry_len(), 1);
    assert_eq!(
        h.metrics
            .duplicate_message
            .with_label_values(&["telemetry"])
            .get(),
        1
    );
    h.shutdown();
}

#[tokio::test]
async fn out_of_order_sample_persists_without_moving_the_marker() {
    let h = common::ingest_harness(fast_config(), true);
    let t = clock::now_ms() - 1_000;

    let newer = h
        .handler
        .handle(&common::telemetry_bytes("ev-1", MSG_A, t, None, 3.0))
        .await
        .expect("newer sample");
    assert!(newer.newest);

    let older = h
        .handler
        .handle(&common::telemetry_bytes("ev-1", MSG_B, t - 10_000, None, 2.0))
        .await
        .expect("older sample");
    assert_eq!(older.status, IngestStatus::Inserted);
    assert!(!older.newest);

    // Both persisted; marker still at T.
    assert_eq!(h.store.telemetry_len(), 2);
    assert_eq!(h.latest.get("ev-1"), Some((t, None)));
    assert_eq!(
        h.metrics
            .out_of_order
            .with_label_values(&["telemetry"])
            .get(),
        1
    );
    h.shutdown();
}

#[tokio::test]
async fn marker_orders_by_sent_at_within_the_same_event_time() {
    let h = common::ingest_harness(fast_config(), true);
    let t = clock::now_ms() - 1_000;

    h.handler
        .handle(&common::telemetry_bytes("ev-1", MSG_A, t, Some(t + 5), 3.0))
        .await
        .expect("first");
    let replay = h
        .handler
        .handle(&common::telemetry_bytes("ev-1", MSG_B, t, Some(t + 1), 2.5))
        .await
        .expect("replay");
    assert!(!replay.newest);
    assert_eq!(h.latest.get("ev-1"), Some((t, Some(t + 5))));
    h.shutdown();
}

#[tokio::test]
async fn future_skewed_sample_is_rejected() {
    let h = common::ingest_harness(fast_config(), true);
    let far_future = clock::now_ms() + 120_000;

    let err = h
        .handler
        .handle(&common::telemetry_bytes("ev-1", MSG_A, far_future, None, 3.0))
        .await
        .expect_err("future sample must be rejected");
    assert!(matches!(err, IngestError::FutureTimestamp { .. }));
    assert_eq!(
        h.metrics
            .telemetry_dropped
            .with_label_values(&["future_skew"])
            .get(),
        1
    );
    assert_eq!(h.store.telemetry_len(), 0);
    h.shutdown();
}

#[tokio::test]
async fn malformed_and_versioned_messages_are_counted_separately() {
    let h = common::ingest_harness(fast_config(), true);

    let err = h.handler.handle(b"{ not json").await.expect_err("malformed");
    assert!(matches!(err, IngestError::Contract(ContractError::Json(_))));

    let mut wrong_version = serde_json::from_slice::<serde_json::Value>(
        &common::telemetry_bytes("ev-1", MSG_A, clock::now_ms(), None, 1.0),
    )
    .expect("fixture parses");
    wrong_version["v"] = serde_json::json!(3);
    let err = h
        .handler
        .handle(&serde_json::to_vec(&wrong_version).expect("serializes"))
        .await
        .expect_err("version mismatch");
    assert!(matches!(
        err,
        IngestError::Contract(ContractError::VersionMismatch { found: 3 })
    ));

    assert_eq!(
        h.metrics
            .contract_validation_fail
            .with_label_values(&["json"])
            .get(),
        1
    );
    assert_eq!(h.metrics.contract_version_reject.get(), 1);
    h.shutdown();
}

#[tokio::test]
async fn full_queue_fails_fast_with_backpressure() {
    let mut config = fast_config();
    config.telemetry.max_queue_size = 1;
    // No flusher: the single queue slot stays occupied.
    let h = common::ingest_harness(config, false);
    let now = clock::now_ms();

    let handler = h.handler.clone();
    let first = tokio::spawn(async move {
        handler
            .handle(&common::telemetry_bytes("ev-1", MSG_A, now - 2_000, None, 1.0))
            .await
    });
    // Let the first submission take the queue slot.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = h
        .handler
        .handle(&common::telemetry_bytes("ev-1", MSG_B, now - 1_000, None, 2.0))
        .await
        .expect_err("queue is at capacity");
    assert!(matches!(err, IngestError::Backpressure { capacity: 1 }));
    assert_eq!(
        h.metrics
            .telemetry_dropped
            .with_label_values(&["backpressure"])
            .get(),
        1
    );

    first.abort();
    h.shutdown();
}

#[tokio::test]
async fn batches_preserve_per_device_enqueue_order() {
    let mut config = fast_config();
    config.telemetry.batch_flush_ms = 100;
    let h = common::ingest_harness(config, true);
    let t = clock::now_ms() - 5_000;

    let bytes_a = common::telemetry_bytes("ev-1", MSG_A, t, None, 1.0);
    let bytes_b = common::telemetry_bytes("ev-1", MSG_B, t + 1_000, None, 2.0);
    let bytes_c = common::telemetry_bytes("ev-1", MSG_C, t + 2_000, None, 3.0);
    let (a, b, c) = tokio::join!(
        h.handler.handle(&bytes_a),
        h.handler.handle(&bytes_b),
        h.handler.handle(&bytes_c),
    );
    a.expect("a");
    b.expect("b");
    c.expect("c");

    use derms_ctl::repo::TelemetryRepo;
    let recent = h.store.recent("ev-1", 10).await.expect("query");
    let ts: Vec<i64> = recent.iter().map(|r| r.ts_ms).collect();
    assert_eq!(ts, vec![t + 2_000, t + 1_000, t]);
    assert_eq!(h.latest.get("ev-1"), Some((t + 2_000, None)));
    h.shutdown();
}

#[tokio::test]
async fn first_telemetry_upserts_the_device_and_heartbeat() {
    let h = common::ingest_harness(fast_config(), true);
    let now = clock::now_ms();

    // A physical PV inverter reports its nameplate on the export side.
    h.handler
        .handle(&common::telemetry_bytes_with_caps(
            "pi-pv-7",
            MSG_A,
            "pv",
            now - 1_000,
            -6.0,
            serde_json::json!({ "maxExportKw": 8.0 }),
        ))
        .await
        .expect("submit pv");
    // An EV charger reports it on the charge side.
    h.handler
        .handle(&common::telemetry_bytes_with_caps(
            "ev-9",
            MSG_B,
            "ev",
            now - 1_000,
            2.0,
            serde_json::json!({ "maxChargeKw": 11.0 }),
        ))
        .await
        .expect("submit ev");

    use derms_ctl::repo::DeviceRepo;
    let pv = h
        .store
        .get_by_id("pi-pv-7")
        .await
        .expect("query")
        .expect("device upserted on first telemetry");
    assert!(pv.is_physical);
    assert_eq!(pv.feeder_id, "f1");
    assert_eq!(pv.p_max_kw, 8.0);

    let ev = h
        .store
        .get_by_id("ev-9")
        .await
        .expect("query")
        .expect("device upserted on first telemetry");
    assert_eq!(ev.p_max_kw, 11.0);

    assert_eq!(h.heartbeats.len(), 2);
    h.shutdown();
}
