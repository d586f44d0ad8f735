//! Lightweight metrics helpers for the gateway.
//!
//! Convenience functions and RAII timers wrapping the `metrics` crate macros.
//! No exporter is embedded; the application can install any compatible
//! recorder. Without one every call is a no-op.
//!
//! Provided metrics (labels vary by family):
//! * `gateway_requests_total` (counter)
//! * `gateway_request_duration_seconds` (histogram)
//! * `gateway_backend_requests_total` (counter, one per attempt)
//! * `gateway_backend_request_duration_seconds` (histogram)
//! * `gateway_retry_attempts_total` (counter)
//! * `gateway_rate_limited_total` (counter)
//! * `gateway_circuit_breaker_state` (gauge: 0 closed, 1 half-open, 2 open)
//! * `gateway_backend_health_status` (gauge: 1 up, 0 otherwise)
//! * `gateway_rate_limiter_tracked_clients` (gauge)
use std::time::Duration;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;
use tokio::time::Instant;

use crate::core::circuit_breaker::CircuitState;

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const GATEWAY_BACKEND_REQUESTS_TOTAL: &str = "gateway_backend_requests_total";
pub const GATEWAY_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "gateway_backend_request_duration_seconds";
pub const GATEWAY_RETRY_ATTEMPTS_TOTAL: &str = "gateway_retry_attempts_total";
pub const GATEWAY_RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
pub const GATEWAY_CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
pub const GATEWAY_BACKEND_HEALTH_STATUS: &str = "gateway_backend_health_status";
pub const GATEWAY_RATE_LIMITER_TRACKED_CLIENTS: &str = "gateway_rate_limiter_tracked_clients";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        GATEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        GATEWAY_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of attempts forwarded to backend services."
    );
    describe_histogram!(
        GATEWAY_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of attempts forwarded to backend services."
    );
    describe_counter!(
        GATEWAY_RETRY_ATTEMPTS_TOTAL,
        Unit::Count,
        "Backend attempts scheduled after a transport failure."
    );
    describe_counter!(
        GATEWAY_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected by the per-client rate limiter."
    );
    describe_gauge!(
        GATEWAY_CIRCUIT_BREAKER_STATE,
        "Circuit breaker state per backend (0 closed, 1 half-open, 2 open)"
    );
    describe_gauge!(
        GATEWAY_BACKEND_HEALTH_STATUS,
        "Health status of individual backends (1 for up, 0 otherwise)"
    );
    describe_gauge!(
        GATEWAY_RATE_LIMITER_TRACKED_CLIENTS,
        "Client keys currently holding a token bucket."
    );
});

/// Export a breaker state change.
pub fn set_circuit_breaker_state(backend: &str, state: CircuitState) {
    gauge!(GATEWAY_CIRCUIT_BREAKER_STATE, "backend" => backend.to_string())
        .set(state.as_gauge());
}

pub fn set_backend_health_status(backend: &str, is_up: bool) {
    let value = if is_up { 1.0 } else { 0.0 };
    gauge!(GATEWAY_BACKEND_HEALTH_STATUS, "backend" => backend.to_string()).set(value);
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(route: &str, method: &str, status: u16) {
    counter!(
        GATEWAY_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(route: &str, method: &str, duration: Duration) {
    histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count one backend attempt. `outcome` is the status code or an error class.
pub fn increment_backend_request_total(backend: &str, method: &str, outcome: &str) {
    counter!(
        GATEWAY_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_backend_request_duration(backend: &str, method: &str, duration: Duration) {
    histogram!(
        GATEWAY_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_retry_attempts(backend: &str) {
    counter!(GATEWAY_RETRY_ATTEMPTS_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn increment_rate_limited() {
    counter!(GATEWAY_RATE_LIMITED_TOTAL).increment(1);
}

pub fn set_rate_limiter_tracked_clients(count: usize) {
    gauge!(GATEWAY_RATE_LIMITER_TRACKED_CLIENTS).set(count as f64);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    route: String,
    method: String,
}

impl RequestTimer {
    pub fn new(route: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.route, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring one backend attempt.
pub struct BackendRequestTimer {
    start: Instant,
    backend: String,
    method: String,
}

impl BackendRequestTimer {
    pub fn new(backend: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        record_backend_request_duration(&self.backend, &self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&DESCRIBED);
    tracing::info!("Gateway metrics described");
    Ok(())
}
