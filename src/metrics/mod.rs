//! Prometheus metrics.

use std::sync::Arc;
use std::time::Duration;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Gateway metrics collector.
///
/// Cloneable handle around the installed Prometheus recorder. Tests use
/// [`GatewayMetrics::disabled`] since a process can only install one
/// recorder.
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the recorder and register metric descriptions.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        Self::register_metrics();

        Self {
            handle: Some(Arc::new(handle)),
        }
    }

    /// A collector that records through the global facade but renders
    /// nothing. Used in tests and embedded scenarios.
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total events received from the gateway"
        );
        describe_counter!(
            "gateway_events_published_total",
            Unit::Count,
            "Total events published to the bus"
        );
        describe_counter!(
            "gateway_events_dropped_total",
            Unit::Count,
            "Events dropped by blacklist or state update"
        );
        describe_counter!(
            "gateway_publish_failures_total",
            Unit::Count,
            "Failed publishes to the bus"
        );
        describe_counter!("gateway_errors_total", Unit::Count, "Total gateway errors");
        describe_counter!(
            "gateway_operator_notifications_total",
            Unit::Count,
            "Dispatches slow enough to page an operator"
        );

        describe_histogram!(
            "gateway_dispatch_duration_seconds",
            Unit::Seconds,
            "Time from socket read to bus publish"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_heartbeat_latency_ms",
            Unit::Milliseconds,
            "Last heartbeat round trip per shard"
        );
        describe_gauge!(
            "gateway_bus_connected",
            Unit::Count,
            "Bus connection status (1=connected, 0=disconnected)"
        );
    }

    /// Record an event received from the gateway.
    pub fn record_event(&self, identifier: &str, shard_id: u32) {
        counter!(
            "gateway_events_received_total",
            "manager" => identifier.to_string(),
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a successful publish and its end-to-end latency.
    pub fn record_publish_success(&self, identifier: &str, duration: Duration) {
        counter!(
            "gateway_events_published_total",
            "manager" => identifier.to_string()
        )
        .increment(1);

        histogram!(
            "gateway_dispatch_duration_seconds",
            "manager" => identifier.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_publish_failure(&self, identifier: &str) {
        counter!(
            "gateway_publish_failures_total",
            "manager" => identifier.to_string()
        )
        .increment(1);
    }

    pub fn record_dropped(&self, identifier: &str, reason: &'static str) {
        counter!(
            "gateway_events_dropped_total",
            "manager" => identifier.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    pub fn record_operator_notification(&self, identifier: &str) {
        counter!(
            "gateway_operator_notifications_total",
            "manager" => identifier.to_string()
        )
        .increment(1);
    }

    pub fn record_heartbeat(&self, shard_id: u32, latency: Duration) {
        gauge!(
            "gateway_heartbeat_latency_ms",
            "shard_id" => shard_id.to_string()
        )
        .set(latency.as_millis() as f64);
    }

    pub fn set_shards_ready(&self, identifier: &str, count: usize) {
        gauge!(
            "gateway_shards_ready",
            "manager" => identifier.to_string()
        )
        .set(count as f64);
    }

    pub fn set_bus_connected(&self, connected: bool) {
        gauge!("gateway_bus_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format.
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}
