//! Prometheus metrics for the HTTP and WebSocket surface.
//!
//! Engine metrics live in `cartpilot_core::metrics` and are registered here
//! alongside the transport ones, so `/metrics` serves both.

use once_cell::sync::Lazy;
use prometheus::{
    core::Collector, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use regex_lite::Regex;

use cartpilot_core::BatchState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// HTTP request duration in seconds, by route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "cartpilot_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.005, 0.025, 0.1, 0.5, 2.5]),
        &["method", "path"],
    )
    .unwrap()
});

/// HTTP responses by route and status.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cartpilot_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// Open event stream connections.
pub static WS_SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "cartpilot_ws_subscribers",
        "Connected event stream clients",
    )
    .unwrap()
});

/// Event stream messages sent, by message type.
pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cartpilot_ws_messages_sent_total", "Event stream messages sent"),
        &["type"],
    )
    .unwrap()
});

/// Batches currently running. Set on scrape.
pub static BATCHES_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("cartpilot_batches_running", "Batches currently running").unwrap()
});

/// Tasks of running batches by status (`running` or `pending`). Set on scrape.
pub static LIVE_TASKS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("cartpilot_live_tasks", "Tasks of running batches by status"),
        &["status"],
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    let server: Vec<Box<dyn Collector>> = vec![
        Box::new(HTTP_REQUEST_DURATION.clone()),
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(WS_SUBSCRIBERS.clone()),
        Box::new(WS_MESSAGES_SENT.clone()),
        Box::new(BATCHES_RUNNING.clone()),
        Box::new(LIVE_TASKS.clone()),
    ];
    for metric in server.into_iter().chain(cartpilot_core::metrics::all_metrics()) {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Refresh the scrape-time gauges from the batch registry.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let batches = state.controller().list().await;
    let running: Vec<_> = batches
        .iter()
        .filter(|b| b.state == BatchState::Running)
        .collect();

    BATCHES_RUNNING.set(running.len() as i64);
    LIVE_TASKS
        .with_label_values(&["running"])
        .set(running.iter().map(|b| b.running as i64).sum());
    LIVE_TASKS
        .with_label_values(&["pending"])
        .set(running.iter().map(|b| b.pending as i64).sum());
}

static UUID_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\d+(/|$)").unwrap());

/// Collapse ids in a request path so labels stay bounded.
pub fn normalize_path(path: &str) -> String {
    let path = UUID_SEGMENT.replace_all(path, "{id}");
    NUMERIC_SEGMENT.replace_all(&path, "/{id}$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/v1/batches/550e8400-e29b-41d4-a716-446655440000/results"),
            "/api/v1/batches/{id}/results"
        );
        assert_eq!(normalize_path("/api/v1/accounts/42"), "/api/v1/accounts/{id}");
        assert_eq!(normalize_path("/api/v1/health"), "/api/v1/health");
    }

    #[test]
    fn test_encode_includes_core_metrics() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/api/v1/health", "200"])
            .inc();
        let output = encode_metrics();
        assert!(output.contains("cartpilot_http_requests_total"));
        assert!(output.contains("cartpilot_batches_rejected_total"));
    }
}
