//! Prometheus metrics registration, wired to `GET /metrics` (§6). Uses the
//! `metrics` facade + `metrics-exporter-prometheus`, drawn from the pack's
//! `slavalslutkovsky-nx-playground` repo, since the teacher surfaces its
//! operational state through `sysinfo` + a dashboard rather than Prometheus.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Registers descriptions for every metric named in §6's metrics table and
/// returns a handle whose `render()` backs the `/metrics` endpoint.
pub fn install() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    describe_counter!("ingest_frames_total", "Frames received, by source (mqtt|http)");
    describe_counter!("ingest_rejected_total", "Frames rejected, by reason (decode|auth)");
    describe_gauge!("pipeline_queue_depth", "Pending items per pipeline shard");
    describe_gauge!("durable_wab_depth", "Entries currently buffered in the write-ahead buffer");
    describe_histogram!("durable_flush_latency_seconds", "Durable sink flush latency");
    describe_gauge!("subscribers_connected", "Currently connected WebSocket subscribers");
    describe_counter!("subscriber_dropped_frames_total", "Frames dropped per subscriber");
    describe_gauge!("alerts_open", "Currently firing alerts, by severity");
    describe_counter!("shutdown_lost_readings_total", "Readings lost during graceful shutdown");
    describe_counter!("readings_invalid_total", "Readings stored with quality=invalid");

    handle
}

pub fn record_ingest_frame(source: &'static str) {
    counter!("ingest_frames_total", "source" => source).increment(1);
}

pub fn record_ingest_rejected(reason: &'static str) {
    counter!("ingest_rejected_total", "reason" => reason).increment(1);
}

pub fn set_pipeline_queue_depth(shard: usize, depth: i64) {
    gauge!("pipeline_queue_depth", "shard" => shard.to_string()).set(depth as f64);
}

pub fn set_durable_wab_depth(depth: i64) {
    gauge!("durable_wab_depth").set(depth as f64);
}

pub fn record_flush_latency_seconds(seconds: f64) {
    histogram!("durable_flush_latency_seconds").record(seconds);
}

pub fn set_subscribers_connected(count: u64) {
    gauge!("subscribers_connected").set(count as f64);
}

pub fn record_subscriber_dropped(subscriber_id: u64) {
    counter!("subscriber_dropped_frames_total", "subscriber_id" => subscriber_id.to_string())
        .increment(1);
}

pub fn set_alerts_open(severity: &'static str, count: u64) {
    gauge!("alerts_open", "severity" => severity).set(count as f64);
}

pub fn record_shutdown_lost_readings(count: u64) {
    counter!("shutdown_lost_readings_total").increment(count);
}

pub fn record_readings_invalid() {
    counter!("readings_invalid_total").increment(1);
}
