//! Metrics for admission decisions and downstream calls.
//!
//! Two surfaces are provided:
//!
//! - A Prometheus exporter on a dedicated port (default `9090`, `0` disables)
//! - An in-process [`RequestStats`] summary served as JSON by `GET /metrics`
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gate_requests_total` - Completed requests (labels: route, status)
//! - `gate_rejections_total` - Admission rejections (labels: reason)
//! - `gate_denylist_additions_total` - Entities promoted to the denylist (labels: scope)
//! - `gate_downstream_calls_total` - Downstream calls (labels: outcome)
//!
//! ## Histograms
//! - `gate_request_duration_seconds` - Request duration (labels: route, method, status)
//! - `gate_downstream_duration_seconds` - Downstream call duration
//!
//! ## Gauges
//! - `gate_rate_limit_buckets` - Live token buckets (labels: scope)
//! - `gate_abuse_tracked_entities` - Entities with an abuse tracker
//! - `gate_denylist_entries` - Denylist size
//!
//! # Usage
//!
//! ```rust,ignore
//! use inference_gate::metrics::{init_metrics, record_rejection};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_rejection("rate_limited_ip");
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gate_requests_total";
    pub const REJECTIONS_TOTAL: &str = "gate_rejections_total";
    pub const DENYLIST_ADDITIONS_TOTAL: &str = "gate_denylist_additions_total";
    pub const DOWNSTREAM_CALLS_TOTAL: &str = "gate_downstream_calls_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gate_request_duration_seconds";
    pub const DOWNSTREAM_DURATION_SECONDS: &str = "gate_downstream_duration_seconds";
    pub const RATE_LIMIT_BUCKETS: &str = "gate_rate_limit_buckets";
    pub const ABUSE_TRACKED_ENTITIES: &str = "gate_abuse_tracked_entities";
    pub const DENYLIST_ENTRIES: &str = "gate_denylist_entries";
}

/// Initialize the Prometheus metrics exporter on `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Total number of completed requests");
    describe_counter!(
        names::REJECTIONS_TOTAL,
        "Total number of requests rejected by the admission gate"
    );
    describe_counter!(
        names::DENYLIST_ADDITIONS_TOTAL,
        "Total number of entities promoted to the denylist"
    );
    describe_counter!(
        names::DOWNSTREAM_CALLS_TOTAL,
        "Total number of inference backend calls"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_histogram!(
        names::DOWNSTREAM_DURATION_SECONDS,
        "Inference backend call duration in seconds"
    );

    describe_gauge!(names::RATE_LIMIT_BUCKETS, "Live token buckets per scope");
    describe_gauge!(
        names::ABUSE_TRACKED_ENTITIES,
        "Entities currently tracked by the abuse detector"
    );
    describe_gauge!(names::DENYLIST_ENTRIES, "Entities on the denylist");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counters
// =============================================================================

pub fn record_request(route: &str, status: u16) {
    counter!(names::REQUESTS_TOTAL, "route" => route.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record an admission rejection (`denied_ip`, `unauthenticated`, `rate_limited_ip`, ...).
pub fn record_rejection(reason: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record an entity promoted to the denylist.
pub fn record_denylist_addition(scope: &'static str) {
    counter!(names::DENYLIST_ADDITIONS_TOTAL, "scope" => scope).increment(1);
}

pub fn record_downstream_call(outcome: &'static str, duration_secs: f64) {
    counter!(names::DOWNSTREAM_CALLS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::DOWNSTREAM_DURATION_SECONDS).record(duration_secs);
}

// =============================================================================
// Histograms
// =============================================================================

/// Record HTTP request duration.
pub fn record_request_duration(route: &str, method: &str, status: &str, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "route" => route.to_string(), "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauges
// =============================================================================

pub fn set_rate_limit_buckets(ip: usize, credential: usize) {
    gauge!(names::RATE_LIMIT_BUCKETS, "scope" => "ip").set(ip as f64);
    gauge!(names::RATE_LIMIT_BUCKETS, "scope" => "credential").set(credential as f64);
}

pub fn set_abuse_gauges(tracked_entities: usize, denylist_entries: usize) {
    gauge!(names::ABUSE_TRACKED_ENTITIES).set(tracked_entities as f64);
    gauge!(names::DENYLIST_ENTRIES).set(denylist_entries as f64);
}

// =============================================================================
// In-process Request Summary
// =============================================================================

/// Latency samples kept for percentile estimates.
pub const LATENCY_WINDOW: usize = 1000;

/// Rolling request counters and latencies for the JSON metrics endpoint.
#[derive(Debug)]
pub struct RequestStats {
    total: u64,
    success: u64,
    client_errors: u64,
    server_errors: u64,
    latencies_ms: VecDeque<f64>,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self {
            total: 0,
            success: 0,
            client_errors: 0,
            server_errors: 0,
            latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }
}

/// Point-in-time view of [`RequestStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    pub total: u64,
    pub success: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl RequestStats {
    pub fn record(&mut self, status: u16, latency_ms: f64) {
        self.total += 1;
        match status {
            200..=399 => self.success += 1,
            400..=499 => self.client_errors += 1,
            _ => self.server_errors += 1,
        }

        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    pub fn summary(&self) -> RequestSummary {
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        RequestSummary {
            total: self.total,
            success: self.success,
            client_errors: self.client_errors,
            server_errors: self.server_errors,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
        }
    }
}

/// Nearest-rank percentile of an ascending slice. Empty input yields 0.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q) as usize;
    sorted
        .get(rank.min(sorted.len() - 1))
        .copied()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recording without an installed exporter must not panic.

    #[test]
    fn test_recorders_without_exporter() {
        record_request("/v1/chat/completions", 200);
        record_rejection("denied_ip");
        record_denylist_addition("ip");
        record_downstream_call("ok", 0.2);
        record_request_duration("/health", "GET", "200", 0.001);
        set_rate_limit_buckets(3, 1);
        set_abuse_gauges(4, 0);
    }

    #[test]
    fn test_request_stats_classes() {
        let mut stats = RequestStats::default();
        stats.record(200, 10.0);
        stats.record(401, 1.0);
        stats.record(429, 1.0);
        stats.record(503, 5.0);

        let summary = stats.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.client_errors, 2);
        assert_eq!(summary.server_errors, 1);
    }

    #[test]
    fn test_percentiles() {
        let mut stats = RequestStats::default();
        for ms in 1..=100 {
            stats.record(200, f64::from(ms));
        }
        let summary = stats.summary();
        assert_eq!(summary.p50_ms, 51.0);
        assert_eq!(summary.p95_ms, 96.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let mut stats = RequestStats::default();
        for _ in 0..LATENCY_WINDOW {
            stats.record(200, 1000.0);
        }
        for _ in 0..LATENCY_WINDOW {
            stats.record(200, 1.0);
        }
        let summary = stats.summary();
        assert_eq!(summary.total, 2 * LATENCY_WINDOW as u64);
        assert_eq!(summary.p95_ms, 1.0);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RequestStats::default().summary();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.p50_ms, 0.0);
    }
}
