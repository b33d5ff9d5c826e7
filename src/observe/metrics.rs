//! Prometheus registry and the controller's full metric set.
//!
//! Gauges carry live state, counters carry events, histograms carry
//! durations and allocation sizes. Labels come from a closed set:
//! `message_type`, `device_type`, `reason`, `stage`, `feeder_id`, `result`.

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// All metrics the controller emits, registered on one registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Ingest path.
    pub contract_validation_fail: IntCounterVec,
    pub contract_version_reject: IntCounter,
    pub out_of_order: IntCounterVec,
    pub duplicate_message: IntCounterVec,
    pub telemetry_dropped: IntCounterVec,
    pub telemetry_queue_depth: IntGauge,

    // Messaging transport.
    pub mqtt_oversize_drop: IntCounter,
    pub mqtt_processing_timeout: IntCounter,
    pub mqtt_disconnect: IntCounter,
    pub mqtt_publish: IntCounterVec,
    pub mqtt_publish_latency: Histogram,
    pub bus_connected: IntGauge,

    // Control loop.
    pub control_cycle: IntCounterVec,
    pub control_cycle_duration: Histogram,
    pub interval_lag: Histogram,
    pub cycle_in_flight: IntGauge,
    pub feeder_fresh_devices: IntGaugeVec,
    pub feeder_stale_devices: IntGaugeVec,
    pub feeder_headroom_allocated_kw: GaugeVec,
    pub feeder_headroom_unused_kw: GaugeVec,
    pub feeder_headroom_available_kw: GaugeVec,
    pub device_allocated_kw: HistogramVec,

    // Alerts and overall liveness.
    pub alert_total: IntCounterVec,
    pub up: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let contract_validation_fail = IntCounterVec::new(
            Opts::new(
                "contract_validation_fail_total",
                "Wire messages rejected by contract validation",
            ),
            &["reason"],
        )?;
        let contract_version_reject = IntCounter::new(
            "contract_version_reject_total",
            "Wire messages rejected for an unsupported contract version",
        )?;
        let out_of_order = IntCounterVec::new(
            Opts::new(
                "out_of_order_total",
                "Samples older than the latest marker for their device",
            ),
            &["message_type"],
        )?;
        let duplicate_message = IntCounterVec::new(
            Opts::new(
                "duplicate_message_total",
                "Messages whose message id was already persisted",
            ),
            &["message_type"],
        )?;
        let telemetry_dropped = IntCounterVec::new(
            Opts::new("telemetry_dropped_total", "Telemetry dropped before persistence"),
            &["reason"],
        )?;
        let telemetry_queue_depth = IntGauge::new(
            "telemetry_queue_depth",
            "Rows waiting in the ingest batch queue",
        )?;

        let mqtt_oversize_drop = IntCounter::new(
            "mqtt_oversize_drop_total",
            "Inbound payloads dropped for exceeding the size bound",
        )?;
        let mqtt_processing_timeout = IntCounter::new(
            "mqtt_processing_timeout_total",
            "Inbound messages whose processing exceeded the deadline",
        )?;
        let mqtt_disconnect = IntCounter::new(
            "mqtt_disconnect_total",
            "Broker connection losses",
        )?;
        let mqtt_publish = IntCounterVec::new(
            Opts::new("mqtt_publish_total", "Setpoint publish attempts by result"),
            &["result"],
        )?;
        let mqtt_publish_latency = Histogram::with_opts(
            HistogramOpts::new(
                "mqtt_publish_latency_seconds",
                "Per-attempt publish latency including the ACK wait",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let bus_connected = IntGauge::new("bus_connected", "1 while the broker session is up")?;

        let control_cycle = IntCounterVec::new(
            Opts::new("control_cycle_total", "Completed control cycles by result"),
            &["result"],
        )?;
        let control_cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "control_cycle_duration_seconds",
                "Wall-clock duration of one control cycle",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let interval_lag = Histogram::with_opts(
            HistogramOpts::new(
                "interval_lag_seconds",
                "Lag observed when a tick fires while the previous cycle is still running",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
        )?;
        let cycle_in_flight = IntGauge::new("cycle_in_flight", "1 while a control cycle runs")?;

        let feeder_fresh_devices = IntGaugeVec::new(
            Opts::new("feeder_fresh_devices", "Devices with fresh telemetry last cycle"),
            &["feeder_id"],
        )?;
        let feeder_stale_devices = IntGaugeVec::new(
            Opts::new("feeder_stale_devices", "Devices with stale telemetry last cycle"),
            &["feeder_id"],
        )?;
        let feeder_headroom_allocated_kw = GaugeVec::new(
            Opts::new("feeder_headroom_allocated_kw", "Headroom allocated last cycle"),
            &["feeder_id"],
        )?;
        let feeder_headroom_unused_kw = GaugeVec::new(
            Opts::new("feeder_headroom_unused_kw", "Headroom left unallocated last cycle"),
            &["feeder_id"],
        )?;
        let feeder_headroom_available_kw = GaugeVec::new(
            Opts::new(
                "feeder_headroom_available_kw",
                "Effective headroom entering allocation last cycle",
            ),
            &["feeder_id"],
        )?;
        let device_allocated_kw = HistogramVec::new(
            HistogramOpts::new("device_allocated_kw", "Distribution of per-device allocations")
                .buckets(vec![0.0, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]),
            &["device_type"],
        )?;

        let alert_total = IntCounterVec::new(
            Opts::new("alert_total", "Operator alerts emitted, by reason"),
            &["reason"],
        )?;
        let up = Gauge::new("up", "1 while the controller process is running")?;

        for collector in [
            Box::new(contract_validation_fail.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(contract_version_reject.clone()),
            Box::new(out_of_order.clone()),
            Box::new(duplicate_message.clone()),
            Box::new(telemetry_dropped.clone()),
            Box::new(telemetry_queue_depth.clone()),
            Box::new(mqtt_oversize_drop.clone()),
            Box::new(mqtt_processing_timeout.clone()),
            Box::new(mqtt_disconnect.clone()),
            Box::new(mqtt_publish.clone()),
            Box::new(mqtt_publish_latency.clone()),
            Box::new(bus_connected.clone()),
            Box::new(control_cycle.clone()),
            Box::new(control_cycle_duration.clone()),
            Box::new(interval_lag.clone()),
            Box::new(cycle_in_flight.clone()),
            Box::new(feeder_fresh_devices.clone()),
            Box::new(feeder_stale_devices.clone()),
            Box::new(feeder_headroom_allocated_kw.clone()),
            Box::new(feeder_headroom_unused_kw.clone()),
            Box::new(feeder_headroom_available_kw.clone()),
            Box::new(device_allocated_kw.clone()),
            Box::new(alert_total.clone()),
            Box::new(up.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            contract_validation_fail,
            contract_version_reject,
            out_of_order,
            duplicate_message,
            telemetry_dropped,
            telemetry_queue_depth,
            mqtt_oversize_drop,
            mqtt_processing_timeout,
            mqtt_disconnect,
            mqtt_publish,
            mqtt_publish_latency,
            bus_connected,
            control_cycle,
            control_cycle_duration,
            interval_lag,
            cycle_in_flight,
            feeder_fresh_devices,
            feeder_stale_devices,
            feeder_headroom_allocated_kw,
            feeder_headroom_unused_kw,
            feeder_headroom_available_kw,
            device_allocated_kw,
            alert_total,
            up,
        })
    }

    /// Text exposition for the external metrics endpoint.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_without_collision() {
        let metrics = Metrics::new().expect("registry builds");
        metrics
            .duplicate_message
            .with_label_values(&["telemetry"])
            .inc();
        metrics.bus_connected.set(1);
        let text = metrics.render();
        assert!(text.contains("duplicate_message_total"));
        assert!(text.contains("bus_connected 1"));
    }

    #[test]
    fn counters_accumulate_by_label() {
        let metrics = Metrics::new().expect("registry builds");
        let c = metrics.telemetry_dropped.with_label_values(&["backpressure"]);
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
        assert_eq!(
            metrics
                .telemetry_dropped
                .with_label_values(&["future_skew"])
                .get(),
            0
        );
    }
}
