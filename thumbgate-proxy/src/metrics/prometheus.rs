//! Prometheus metrics for the thumbgate gateway
//!
//! Exposes metrics in Prometheus format for monitoring and observability.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for thumbgate metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Resize requests by outcome (success, error, rejected)
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of resize requests")
            .namespace("thumbgate"),
        &["outcome"]
    ).expect("metric can be created");

    /// Resize request duration by outcome
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "request_duration_seconds",
            "Resize request duration in seconds"
        )
        .namespace("thumbgate")
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["outcome"]
    ).expect("metric can be created");

    /// Active requests gauge (currently being processed)
    pub static ref ACTIVE_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("active_requests", "Number of resize requests currently being processed")
            .namespace("thumbgate")
    ).expect("metric can be created");

    // ============== Coordination Metrics ==============

    /// Requests answered from another request's in-flight result
    pub static ref COALESCED_REQUESTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("coalesced_requests_total", "Total requests served by an identical in-flight request")
            .namespace("thumbgate")
    ).expect("metric can be created");

    /// Requests refused by admission control
    pub static ref ADMISSION_REJECTED_TOTAL: Counter = Counter::with_opts(
        Opts::new("admission_rejected_total", "Total requests refused because max clients was reached")
            .namespace("thumbgate")
    ).expect("metric can be created");

    /// Distinct fingerprints currently executing
    pub static ref IN_FLIGHT_FINGERPRINTS: Gauge = Gauge::with_opts(
        Opts::new("in_flight_fingerprints", "Number of distinct requests currently executing")
            .namespace("thumbgate")
    ).expect("metric can be created");

    /// Maximum concurrent executions gauge
    pub static ref MAX_CONCURRENCY: Gauge = Gauge::with_opts(
        Opts::new("max_concurrency", "Maximum concurrent pipeline executions allowed")
            .namespace("thumbgate")
    ).expect("metric can be created");

    // ============== Upstream Metrics ==============

    /// Upstream fetch attempts by outcome (ok, timeout, status, transport)
    pub static ref FETCH_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("fetch_attempts_total", "Total upstream fetch attempts")
            .namespace("thumbgate"),
        &["outcome"]
    ).expect("metric can be created");

    /// Fetches that ended in a timeout after all attempts
    pub static ref FETCH_TIMEOUTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("fetch_timeouts_total", "Total fetches that timed out")
            .namespace("thumbgate")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    // Request metrics
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;

    // Coordination metrics
    REGISTRY.register(Box::new(COALESCED_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ADMISSION_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IN_FLIGHT_FINGERPRINTS.clone()))?;
    REGISTRY.register(Box::new(MAX_CONCURRENCY.clone()))?;

    // Upstream metrics
    REGISTRY.register(Box::new(FETCH_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FETCH_TIMEOUTS_TOTAL.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Helper struct for tracking request duration.
/// Automatically records the duration when dropped.
pub struct RequestTimer {
    start: std::time::Instant,
}

impl RequestTimer {
    /// Start a new request timer.
    pub fn new() -> Self {
        ACTIVE_REQUESTS.inc();
        Self { start: std::time::Instant::now() }
    }

    /// Record a successful request completion.
    pub fn record_success(self) {
        self.finish("success");
    }

    /// Record a failed request.
    pub fn record_failure(self) {
        self.finish("error");
    }

    fn finish(self, outcome: &str) {
        observe(outcome, self.start.elapsed().as_secs_f64());
        ACTIVE_REQUESTS.dec();
        // Prevent the Drop impl from running
        std::mem::forget(self);
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        // Dropped without explicit record: the client went away
        ACTIVE_REQUESTS.dec();
        observe("abandoned", self.start.elapsed().as_secs_f64());
    }
}

fn observe(outcome: &str, duration: f64) {
    REQUEST_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration);
    REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a request served from an in-flight result.
pub fn record_coalesced() {
    COALESCED_REQUESTS_TOTAL.inc();
}

/// Record a request refused by admission control.
pub fn record_rejected() {
    ADMISSION_REJECTED_TOTAL.inc();
    REQUESTS_TOTAL.with_label_values(&["rejected"]).inc();
}

/// Update the in-flight fingerprint gauge.
pub fn set_in_flight(count: usize) {
    IN_FLIGHT_FINGERPRINTS.set(count as f64);
}

/// Publish the configured concurrency ceiling.
pub fn set_max_concurrency(max: usize) {
    MAX_CONCURRENCY.set(max as f64);
}

/// Record one upstream fetch attempt.
pub fn record_fetch_attempt(outcome: &str) {
    FETCH_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a fetch that gave up on a timeout.
pub fn record_fetch_timeout() {
    FETCH_TIMEOUTS_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timer() {
        let before = REQUESTS_TOTAL.with_label_values(&["success"]).get();
        let timer = RequestTimer::new();
        timer.record_success();
        assert!(REQUESTS_TOTAL.with_label_values(&["success"]).get() >= before + 1.0);
    }

    #[test]
    fn test_coordination_metrics() {
        let before = COALESCED_REQUESTS_TOTAL.get();
        record_coalesced();
        assert!(COALESCED_REQUESTS_TOTAL.get() >= before + 1.0);

        record_rejected();
        record_fetch_attempt("ok");
        set_in_flight(2);
        // gauges are process-wide and coordinator tests set them concurrently
        set_max_concurrency(4);
    }

    #[test]
    fn test_encode_metrics() {
        let output = encode_metrics();
        // Should return something (even if registry not initialized)
        assert!(output.is_empty() || output.starts_with('#') || output.contains("thumbgate"));
    }
}
