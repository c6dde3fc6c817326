//! Gateway metrics.
//!
//! Plain atomic counters, exported as Prometheus text and JSON on the admin port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Sync gateway metrics
#[derive(Default)]
pub struct GatewayMetrics {
    // HTTP
    pub http_requests_total: AtomicU64,
    pub http_requests_error: AtomicU64,
    pub http_not_modified: AtomicU64,

    // WebSocket
    pub ws_connections: AtomicU64,
    pub ws_connections_total: AtomicU64,
    pub subscriptions: AtomicU64,

    // Tables
    pub observables_created: AtomicU64,
    pub observables_destroyed: AtomicU64,
    pub channels_created: AtomicU64,
    pub channels_destroyed: AtomicU64,

    // Delivery
    pub frames_sent: AtomicU64,
    pub diffs_sent: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Safeguards
    pub rate_limit_rejected: AtomicU64,
    pub rate_limit_overflows: AtomicU64,
    pub backpressure_disconnects: AtomicU64,
    pub protocol_violations: AtomicU64,

    // Functions
    pub function_calls: AtomicU64,
    pub function_errors: AtomicU64,

    // Latency tracking (simplified - in production use histograms)
    pub total_latency_ms: AtomicU64,
    pub request_count_for_latency: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn dec(counter: &AtomicU64) {
    // gauges never go below zero even if a disconnect races a connect
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_http_request(&self, success: bool, latency_ms: u64) {
        inc(&self.http_requests_total);
        if !success {
            inc(&self.http_requests_error);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        inc(&self.request_count_for_latency);
    }

    pub fn record_not_modified(&self) {
        inc(&self.http_not_modified);
    }

    pub fn record_ws_connect(&self) {
        inc(&self.ws_connections);
        inc(&self.ws_connections_total);
    }

    pub fn record_ws_disconnect(&self) {
        dec(&self.ws_connections);
    }

    pub fn record_subscribe(&self) {
        inc(&self.subscriptions);
    }

    pub fn record_unsubscribe(&self) {
        dec(&self.subscriptions);
    }

    pub fn record_observable_created(&self) {
        inc(&self.observables_created);
    }

    pub fn record_observable_destroyed(&self) {
        inc(&self.observables_destroyed);
    }

    pub fn record_channel_created(&self) {
        inc(&self.channels_created);
    }

    pub fn record_channel_destroyed(&self) {
        inc(&self.channels_destroyed);
    }

    pub fn record_frame(&self, bytes: usize, is_diff: bool) {
        inc(&self.frames_sent);
        if is_diff {
            inc(&self.diffs_sent);
        }
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rate_limit_rejection(&self, first: bool) {
        inc(&self.rate_limit_rejected);
        if first {
            inc(&self.rate_limit_overflows);
        }
    }

    pub fn record_backpressure_disconnect(&self) {
        inc(&self.backpressure_disconnects);
    }

    pub fn record_protocol_violation(&self) {
        inc(&self.protocol_violations);
    }

    pub fn record_function_call(&self, success: bool) {
        inc(&self.function_calls);
        if !success {
            inc(&self.function_errors);
        }
    }

    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.request_count_for_latency.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    fn series(&self) -> [(&'static str, &'static str, &'static str, &AtomicU64); 19] {
        [
            ("http_requests_total", "counter", "HTTP requests", &self.http_requests_total),
            ("http_requests_error_total", "counter", "HTTP requests answered with an error", &self.http_requests_error),
            ("http_not_modified_total", "counter", "HTTP 304 responses", &self.http_not_modified),
            ("ws_connections", "gauge", "Open WebSocket connections", &self.ws_connections),
            ("ws_connections_total", "counter", "Accepted WebSocket connections", &self.ws_connections_total),
            ("subscriptions", "gauge", "Active observable and channel subscriptions", &self.subscriptions),
            ("observables_created_total", "counter", "Observables created", &self.observables_created),
            ("observables_destroyed_total", "counter", "Observables destroyed", &self.observables_destroyed),
            ("channels_created_total", "counter", "Channels created", &self.channels_created),
            ("channels_destroyed_total", "counter", "Channels destroyed", &self.channels_destroyed),
            ("frames_sent_total", "counter", "Frames queued to clients", &self.frames_sent),
            ("diffs_sent_total", "counter", "Diff frames queued to clients", &self.diffs_sent),
            ("bytes_sent_total", "counter", "Frame bytes queued to clients", &self.bytes_sent),
            ("rate_limit_rejected_total", "counter", "Requests rejected by a rate limiter", &self.rate_limit_rejected),
            ("rate_limit_overflows_total", "counter", "Sources crossing a rate limit", &self.rate_limit_overflows),
            ("backpressure_disconnects_total", "counter", "Connections closed for slow consumption", &self.backpressure_disconnects),
            ("protocol_violations_total", "counter", "Connections closed for malformed frames", &self.protocol_violations),
            ("function_calls_total", "counter", "Function invocations", &self.function_calls),
            ("function_errors_total", "counter", "Function invocations that failed", &self.function_errors),
        ]
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, kind, help, value) in self.series() {
            output.push_str(&format!(
                "# HELP sync_gateway_{name} {help}\n\
                 # TYPE sync_gateway_{name} {kind}\n\
                 sync_gateway_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "# HELP sync_gateway_average_latency_ms Average HTTP request latency\n\
             # TYPE sync_gateway_average_latency_ms gauge\n\
             sync_gateway_average_latency_ms {:.2}\n",
            self.average_latency_ms()
        ));
        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, _, _, value) in self.series() {
            map.insert(name.to_string(), value.load(Ordering::Relaxed).into());
        }
        map.insert("average_latency_ms".to_string(), self.average_latency_ms().into());
        serde_json::Value::Object(map)
    }
}

/// Request timing helper
pub struct RequestTimer {
    start: Instant,
    metrics: Arc<GatewayMetrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self, success: bool) {
        let latency_ms = self.start.elapsed().as_millis() as u64;
        self.metrics.record_http_request(success, latency_ms);
    }
}
