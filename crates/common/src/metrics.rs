//! Metric registration and the sink the delivery pipeline records into.
//!
//! Uses the metrics-rs facade so any recorder can collect these metrics;
//! the binaries install the Prometheus exporter.

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::types::{ChannelType, Priority};

pub const NOTIFICATIONS_CREATED_TOTAL: &str = "notifications_created_total";
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "notifications_delivered_total";
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "notifications_failed_total";
pub const ACTIVE_CONNECTIONS: &str = "active_connections";
pub const PENDING_NOTIFICATIONS: &str = "pending_notifications";
pub const DELIVERY_LATENCY_SECONDS: &str = "delivery_latency_seconds";

/// Histogram buckets for `delivery_latency_seconds`.
pub const LATENCY_BUCKETS: [f64; 8] = [0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Destination for delivery-pipeline counters, gauges and histograms.
pub trait MetricsSink: Send + Sync {
    fn notification_created(&self, priority: Priority, channel: ChannelType);

    /// Records the delivered counter and one latency observation.
    fn notification_delivered(&self, priority: Priority, channel: ChannelType, latency_secs: f64);

    fn notification_failed(&self, priority: Priority, reason: &str);

    fn connection_opened(&self);

    fn connection_closed(&self);

    fn set_pending_notifications(&self, count: u64);
}

/// `MetricsSink` backed by the global metrics-rs recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn notification_created(&self, priority: Priority, channel: ChannelType) {
        metrics::counter!(
            NOTIFICATIONS_CREATED_TOTAL,
            "priority" => priority.as_str(),
            "channel" => channel.as_str()
        )
        .increment(1);
    }

    fn notification_delivered(&self, priority: Priority, channel: ChannelType, latency_secs: f64) {
        metrics::counter!(
            NOTIFICATIONS_DELIVERED_TOTAL,
            "priority" => priority.as_str(),
            "channel" => channel.as_str()
        )
        .increment(1);
        metrics::histogram!(DELIVERY_LATENCY_SECONDS, "priority" => priority.as_str())
            .record(latency_secs);
    }

    fn notification_failed(&self, priority: Priority, reason: &str) {
        metrics::counter!(
            NOTIFICATIONS_FAILED_TOTAL,
            "priority" => priority.as_str(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    fn connection_opened(&self) {
        metrics::gauge!(ACTIVE_CONNECTIONS).increment(1.0);
    }

    fn connection_closed(&self) {
        metrics::gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
    }

    fn set_pending_notifications(&self, count: u64) {
        metrics::gauge!(PENDING_NOTIFICATIONS).set(count as f64);
    }
}

/// Register all metric descriptions.
///
/// Called once at startup after the recorder is installed.
pub fn register_metrics() {
    describe_counter!(
        NOTIFICATIONS_CREATED_TOTAL,
        "Total number of notifications created"
    );
    describe_counter!(
        NOTIFICATIONS_DELIVERED_TOTAL,
        "Total number of notifications successfully delivered"
    );
    describe_counter!(
        NOTIFICATIONS_FAILED_TOTAL,
        "Total number of failed notification deliveries"
    );
    describe_gauge!(ACTIVE_CONNECTIONS, "Number of active WebSocket connections");
    describe_gauge!(PENDING_NOTIFICATIONS, "Number of pending notifications");
    describe_histogram!(
        DELIVERY_LATENCY_SECONDS,
        "Time taken to deliver notifications"
    );
}

fn builder() -> anyhow::Result<PrometheusBuilder> {
    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(DELIVERY_LATENCY_SECONDS.to_string()),
        &LATENCY_BUCKETS,
    )?;
    Ok(builder)
}

/// Install the Prometheus recorder and return a handle for rendering `/metrics`.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = builder()?.install_recorder()?;
    register_metrics();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Install the Prometheus recorder with its own scrape listener.
pub fn install_prometheus_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    builder()?.with_http_listener(addr).install()?;
    register_metrics();
    tracing::info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}
