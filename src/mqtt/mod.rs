//! MQTT transport: connection lifecycle, telemetry subscription, and
//! at-least-once setpoint publishing behind the circuit breaker.
//!
//! The event loop owns reconnection: poll errors mark the bus not ready,
//! back off exponentially, and let rumqttc re-establish the session.
//! Publishing is retried per attempt with its own deadline; persistent
//! failures open the breaker via the safety state, after which publishes
//! fail fast without touching the bus until the cooldown elapses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::MqttConfig;
use crate::contracts::SetpointMessage;
use crate::control::{PublishError, SetpointPublisher};
use crate::ingest::{IngestError, TelemetryHandler};
use crate::observe::Metrics;
use crate::safety::{BreakerDecision, Readiness, SafetyState};

/// Reconnect backoff bounds for the event loop.
const RECONNECT_BACKOFF_MIN_MS: u64 = 500;
const RECONNECT_BACKOFF_MAX_MS: u64 = 30_000;

/// Connection state exposed through `status()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStatus {
    pub connected: bool,
    pub last_error: Option<String>,
}

/// The controller's bus endpoint.
pub struct MqttTransport {
    client: AsyncClient,
    cfg: MqttConfig,
    safety: Arc<SafetyState>,
    metrics: Metrics,
    status: Mutex<TransportStatus>,
}

impl MqttTransport {
    /// Connects in the background and returns immediately; startup is
    /// never blocked on the broker.
    pub fn start(
        cfg: MqttConfig,
        handler: Arc<TelemetryHandler>,
        readiness: Arc<Readiness>,
        safety: Arc<SafetyState>,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let mut opts = MqttOptions::new(&cfg.client_id, &cfg.broker_host, cfg.broker_port);
        opts.set_keep_alive(Duration::from_secs(30));
        opts.set_clean_session(true);
        // Our own payload bound is enforced per message; give the session
        // enough room that rumqttc does not reject first.
        let packet_cap = cfg.max_payload_bytes.max(64 * 1024) * 2;
        opts.set_max_packet_size(packet_cap, packet_cap);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(opts, 64);
        let transport = Arc::new(Self {
            client,
            cfg,
            safety,
            metrics,
            status: Mutex::new(TransportStatus::default()),
        });

        let task = tokio::spawn(Self::event_loop(
            Arc::clone(&transport),
            eventloop,
            handler,
            readiness,
            shutdown,
        ));
        (transport, task)
    }

    async fn event_loop(
        transport: Arc<Self>,
        mut eventloop: EventLoop,
        handler: Arc<TelemetryHandler>,
        readiness: Arc<Readiness>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let telemetry_filter = format!("{}/telemetry/#", transport.cfg.topic_prefix);
        let mut backoff_ms = RECONNECT_BACKOFF_MIN_MS;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("transport shutting down");
                    let _ = transport.client.disconnect().await;
                    readiness.set_bus_ready(false, Some("shutdown".to_string()));
                    transport.metrics.bus_connected.set(0);
                    return;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(filter = %telemetry_filter, "broker session up, subscribing");
                        backoff_ms = RECONNECT_BACKOFF_MIN_MS;
                        if let Err(e) = transport
                            .client
                            .subscribe(telemetry_filter.clone(), QoS::AtLeastOnce)
                            .await
                        {
                            warn!(error = %e, "telemetry subscribe failed");
                        }
                        readiness.set_bus_ready(true, None);
                        transport.metrics.bus_connected.set(1);
                        transport.status.lock().connected = true;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        transport.handle_inbound(&handler, &publish).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = e.to_string();
                        warn!(error = %reason, backoff_ms, "broker connection lost");
                        transport.metrics.mqtt_disconnect.inc();
                        transport.metrics.bus_connected.set(0);
                        readiness.set_bus_ready(false, Some(reason.clone()));
                        {
                            let mut status = transport.status.lock();
                            status.connected = false;
                            status.last_error = Some(reason);
                        }
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(RECONNECT_BACKOFF_MAX_MS);
                    }
                }
            }
        }
    }

    /// Bounds and dispatches one inbound telemetry message.
    async fn handle_inbound(&self, handler: &TelemetryHandler, publish: &rumqttc::Publish) {
        if publish.payload.len() > self.cfg.max_payload_bytes {
            self.metrics.mqtt_oversize_drop.inc();
            warn!(
                topic = %publish.topic,
                bytes = publish.payload.len(),
                limit = self.cfg.max_payload_bytes,
                "oversize payload dropped"
            );
            return;
        }

        let Some(device_id) = device_id_from_topic(&publish.topic, &self.cfg.topic_prefix) else {
            debug!(topic = %publish.topic, "ignoring message outside the telemetry topic");
            return;
        };

        let deadline = Duration::from_millis(self.cfg.processing_timeout_ms);
        match tokio::time::timeout(deadline, handler.handle(&publish.payload)).await {
            Ok(Ok(outcome)) => {
                debug!(
                    device = device_id,
                    status = ?outcome.status,
                    newest = outcome.newest,
                    "telemetry ingested"
                );
            }
            Ok(Err(IngestError::Contract(e))) => {
                debug!(device = device_id, error = %e, "telemetry rejected by contract");
            }
            Ok(Err(e)) => {
                warn!(device = device_id, error = %e, "telemetry ingest failed");
            }
            Err(_) => {
                self.metrics.mqtt_processing_timeout.inc();
                warn!(
                    device = device_id,
                    timeout_ms = self.cfg.processing_timeout_ms,
                    "inbound processing exceeded its deadline"
                );
            }
        }
    }

    pub fn status(&self) -> TransportStatus {
        self.status.lock().clone()
    }
}

#[async_trait]
impl SetpointPublisher for MqttTransport {
    /// Publishes QoS1 with per-attempt deadline and exponential backoff.
    /// Success is an accepted, non-timed-out publish; rumqttc's QoS1
    /// redelivery owns broker-level re-sends after that point.
    async fn publish_setpoint(&self, msg: &SetpointMessage) -> Result<(), PublishError> {
        match self.safety.breaker_decision(clock::now_ms()) {
            BreakerDecision::Open { remaining_ms } => {
                self.metrics
                    .mqtt_publish
                    .with_label_values(&["breaker_open"])
                    .inc();
                return Err(PublishError::BreakerOpen { remaining_ms });
            }
            BreakerDecision::HalfOpen => {
                debug!(device = %msg.envelope.device_id, "breaker half-open, probe publish");
            }
            BreakerDecision::Closed => {}
        }

        let payload = msg
            .to_bytes()
            .map_err(|e| PublishError::Serialize(e.to_string()))?;
        let topic = format!(
            "{}/control/{}",
            self.cfg.topic_prefix, msg.envelope.device_id
        );
        let attempt_deadline = Duration::from_millis(self.cfg.publish_timeout_ms);

        let mut last_error = PublishError::Timeout;
        for attempt in 0..=self.cfg.max_retries {
            if attempt > 0 {
                let backoff = self.cfg.retry_backoff_ms * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                // The breaker may have opened while we were backing off.
                if let BreakerDecision::Open { remaining_ms } =
                    self.safety.breaker_decision(clock::now_ms())
                {
                    self.metrics
                        .mqtt_publish
                        .with_label_values(&["breaker_open"])
                        .inc();
                    return Err(PublishError::BreakerOpen { remaining_ms });
                }
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(
                attempt_deadline,
                self.client
                    .publish(topic.clone(), QoS::AtLeastOnce, false, payload.clone()),
            )
            .await;
            self.metrics
                .mqtt_publish_latency
                .observe(started.elapsed().as_secs_f64());

            match outcome {
                Ok(Ok(())) => {
                    self.metrics.mqtt_publish.with_label_values(&["ok"]).inc();
                    self.safety.note_mqtt_success();
                    return Ok(());
                }
                Ok(Err(e)) => {
                    last_error = PublishError::Transport(e.to_string());
                }
                Err(_) => {
                    last_error = PublishError::Timeout;
                }
            }

            self.metrics.mqtt_publish.with_label_values(&["error"]).inc();
            self.safety
                .note_mqtt_failure(&last_error.to_string(), clock::now_ms());
            warn!(
                device = %msg.envelope.device_id,
                attempt,
                error = %last_error,
                "setpoint publish attempt failed"
            );
        }

        Err(last_error)
    }
}

/// Extracts the device id from `{prefix}/telemetry/{deviceId}[/...]`.
/// Trailing segments are ignored.
fn device_id_from_topic<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let rest = rest.strip_prefix("telemetry")?.strip_prefix('/')?;
    let device_id = rest.split('/').next()?;
    (!device_id.is_empty()).then_some(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::contracts::setpoint::SetpointMode;
    use crate::ingest::{Heartbeats, LatestMarkers};
    use crate::model::DeviceType;
    use crate::repo::memory::MemoryStore;
    use crate::safety::SafetyPolicy;

    /// Transport over a client whose event loop is never polled; publishes
    /// enqueue locally, which is enough to exercise the guard paths.
    fn offline_transport(cfg: MqttConfig) -> (MqttTransport, rumqttc::EventLoop, Arc<SafetyState>) {
        let mut config = Config::default();
        config.mqtt = cfg.clone();
        let safety = Arc::new(SafetyState::new(SafetyPolicy::from_config(&config)));
        let opts = MqttOptions::new(&cfg.client_id, &cfg.broker_host, cfg.broker_port);
        let (client, eventloop) = AsyncClient::new(opts, 16);
        let transport = MqttTransport {
            client,
            cfg,
            safety: Arc::clone(&safety),
            metrics: Metrics::new().expect("metrics registry"),
            status: Mutex::new(TransportStatus::default()),
        };
        (transport, eventloop, safety)
    }

    fn ingest_handler(store: &MemoryStore) -> Arc<TelemetryHandler> {
        let config = Config::default();
        let policy = SafetyPolicy::from_config(&config);
        let (handler, flusher) = TelemetryHandler::new(
            &config,
            &policy,
            Metrics::new().expect("metrics registry"),
            Arc::new(LatestMarkers::new()),
            Arc::new(Heartbeats::new()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(flusher.run(rx));
        std::mem::forget(_tx);
        handler
    }

    #[tokio::test]
    async fn payload_at_the_size_bound_passes_and_one_over_drops() {
        let store = MemoryStore::new();
        let handler = ingest_handler(&store);
        let now = crate::clock::now_ms();
        let payload = serde_json::to_vec(&serde_json::json!({
            "v": 1,
            "messageType": "telemetry",
            "messageId": "11111111-1111-4111-8111-111111111111",
            "deviceId": "ev-1",
            "deviceType": "ev",
            "timestampMs": now - 1_000,
            "payload": {
                "readings": { "powerKw": 1.0 },
                "status": { "online": true }
            }
        }))
        .expect("fixture serializes");

        let mut cfg = MqttConfig::default();
        cfg.max_payload_bytes = payload.len();
        let (transport, _eventloop, _safety) = offline_transport(cfg);

        // Exactly at the bound: decoded and persisted.
        let publish = rumqttc::Publish::new(
            "derms/telemetry/ev-1",
            QoS::AtLeastOnce,
            payload.clone(),
        );
        transport.handle_inbound(&handler, &publish).await;
        assert_eq!(store.telemetry_len(), 1);
        assert_eq!(transport.metrics.mqtt_oversize_drop.get(), 0);

        // One byte over: dropped undecoded.
        let mut oversize = payload;
        oversize.push(b' ');
        let publish = rumqttc::Publish::new("derms/telemetry/ev-1", QoS::AtLeastOnce, oversize);
        transport.handle_inbound(&handler, &publish).await;
        assert_eq!(store.telemetry_len(), 1);
        assert_eq!(transport.metrics.mqtt_oversize_drop.get(), 1);
    }

    #[tokio::test]
    async fn open_breaker_fails_publish_without_bus_io() {
        let mut cfg = MqttConfig::default();
        cfg.breaker_threshold = 1;
        let (transport, _eventloop, safety) = offline_transport(cfg);

        let now = clock::now_ms();
        safety.note_mqtt_failure("timeout", now);
        assert!(matches!(
            safety.breaker_decision(now + 1),
            BreakerDecision::Open { .. }
        ));

        let msg = SetpointMessage::new(
            "ev-1",
            DeviceType::Ev,
            2.0,
            SetpointMode::Charge,
            now,
            now + 120_000,
            "heuristic",
            None,
        );
        let err = transport
            .publish_setpoint(&msg)
            .await
            .expect_err("breaker must fail fast");
        assert!(matches!(err, PublishError::BreakerOpen { .. }));
        assert_eq!(
            transport
                .metrics
                .mqtt_publish
                .with_label_values(&["breaker_open"])
                .get(),
            1
        );
        // Nothing reached the client, so nothing was queued either.
        assert_eq!(
            transport
                .metrics
                .mqtt_publish
                .with_label_values(&["ok"])
                .get(),
            0
        );
    }

    #[test]
    fn device_id_parses_with_and_without_trailing_segments() {
        assert_eq!(
            device_id_from_topic("derms/telemetry/ev-1", "derms"),
            Some("ev-1")
        );
        assert_eq!(
            device_id_from_topic("derms/telemetry/ev-1/readings/power", "derms"),
            Some("ev-1")
        );
        assert_eq!(
            device_id_from_topic("site-9/telemetry/pi-batt-2", "site-9"),
            Some("pi-batt-2")
        );
    }

    #[test]
    fn foreign_topics_are_ignored() {
        assert_eq!(device_id_from_topic("derms/control/ev-1", "derms"), None);
        assert_eq!(device_id_from_topic("other/telemetry/ev-1", "derms"), None);
        assert_eq!(device_id_from_topic("derms/telemetry/", "derms"), None);
        assert_eq!(device_id_from_topic("derms/telemetry", "derms"), None);
    }
}
