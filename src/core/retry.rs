//! Retrying forwarder: one logical proxied call, replayed with exponential
//! backoff while the backend is unreachable.
//!
//! Each attempt goes through the backend's [`CircuitBreaker`]. Retrying stops
//! as soon as the breaker refuses an attempt, when the elapsed-time budget is
//! spent, or when the request deadline would be passed. A returned response
//! streams its body under the same deadline.
use std::{sync::Arc, time::Duration};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri, Version};
use rand::Rng;
use tokio::time::{Instant, timeout_at};
use tracing::Instrument;

use crate::{
    config::RetryConfig,
    core::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerError},
        deadline_body::DeadlineBody,
        service_proxy::ProxyError,
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup::create_backend_span,
};

/// Exponential backoff bounded by total elapsed time rather than attempt count.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_interval: Duration,
    max_elapsed: Duration,
    start: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            current_interval: Duration::from_millis(config.initial_interval_ms),
            multiplier: config.multiplier,
            randomization_factor: config.randomization_factor,
            max_interval: Duration::from_millis(config.max_interval_ms),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
            start: Instant::now(),
        }
    }

    /// Wait before the next attempt, or `None` once the budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let next = self.randomized_interval();
        self.increment_interval();

        if self.start.elapsed() + next > self.max_elapsed {
            return None;
        }
        Some(next)
    }

    fn randomized_interval(&self) -> Duration {
        if self.randomization_factor <= 0.0 {
            return self.current_interval;
        }
        let interval = self.current_interval.as_secs_f64();
        let delta = self.randomization_factor * interval;
        let secs = rand::rng().random_range((interval - delta)..=(interval + delta));
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn increment_interval(&mut self) {
        let next = self.current_interval.as_secs_f64() * self.multiplier;
        self.current_interval = if next >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(next)
        };
    }
}

/// Everything needed to replay one inbound request against a backend.
#[derive(Debug)]
pub struct ProxyAttemptContext {
    pub deadline: Instant,
    pub method: Method,
    pub version: Version,
    pub original_uri: Uri,
    pub target_uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub attempts: u32,
}

impl ProxyAttemptContext {
    /// Build a fresh outbound request for the next attempt.
    pub fn build_request(&self) -> Result<Request<AxumBody>, ProxyError> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.target_uri.clone())
            .version(self.version)
            .body(AxumBody::from(self.body.clone()))
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

pub struct RetryingForwarder {
    client: Arc<dyn HttpClient>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl RetryingForwarder {
    pub fn new(client: Arc<dyn HttpClient>, retry: RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            client,
            retry,
            attempt_timeout,
        }
    }

    /// Forward `ctx` until a backend answers or retrying is no longer allowed.
    ///
    /// Any status code from the backend is a success here and is returned
    /// unchanged.
    pub async fn forward(
        &self,
        breaker: &CircuitBreaker,
        ctx: &mut ProxyAttemptContext,
    ) -> Result<Response<AxumBody>, ProxyError> {
        let backend = breaker.name();
        let mut backoff = ExponentialBackoff::new(&self.retry);

        loop {
            let now = Instant::now();
            if now >= ctx.deadline {
                return Err(ProxyError::RetriesExhausted {
                    attempts: ctx.attempts,
                    source: HttpClientError::Timeout(now.duration_since(backoff.start)),
                });
            }

            ctx.attempts += 1;
            let attempt_deadline = now
                .checked_add(self.attempt_timeout)
                .map_or(ctx.deadline, |at| at.min(ctx.deadline));
            let request = ctx.build_request()?;
            let span = create_backend_span(
                backend,
                ctx.method.as_str(),
                ctx.target_uri.path(),
                ctx.attempts,
            );

            let outcome = {
                let _timer = metrics::BackendRequestTimer::new(backend, ctx.method.as_str());
                breaker
                    .execute(|| async {
                        match timeout_at(attempt_deadline, self.client.send_request(request)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(HttpClientError::Timeout(attempt_deadline - now)),
                        }
                    })
                    .instrument(span.clone())
                    .await
            };

            let error = match outcome {
                Ok(response) => {
                    span.record("http.status_code", response.status().as_u16());
                    metrics::increment_backend_request_total(
                        backend,
                        ctx.method.as_str(),
                        response.status().as_str(),
                    );
                    let deadline = ctx.deadline;
                    return Ok(response.map(|body| {
                        AxumBody::new(DeadlineBody::new(body, deadline))
                    }));
                }
                Err(CircuitBreakerError::Open) | Err(CircuitBreakerError::TooManyRequests) => {
                    tracing::warn!(parent: &span, "Circuit breaker rejected attempt");
                    metrics::increment_backend_request_total(
                        backend,
                        ctx.method.as_str(),
                        "rejected",
                    );
                    return Err(ProxyError::CircuitOpen);
                }
                Err(CircuitBreakerError::Inner(error)) => error,
            };

            metrics::increment_backend_request_total(backend, ctx.method.as_str(), "error");
            if !error.is_retryable() {
                return Err(ProxyError::RetriesExhausted {
                    attempts: ctx.attempts,
                    source: error,
                });
            }

            let wait = match backoff.next_backoff() {
                Some(wait)
                    if Instant::now()
                        .checked_add(wait)
                        .is_some_and(|at| at < ctx.deadline) =>
                {
                    wait
                }
                _ => {
                    return Err(ProxyError::RetriesExhausted {
                        attempts: ctx.attempts,
                        source: error,
                    });
                }
            };

            tracing::warn!(
                parent: &span,
                error = %error,
                retry_in_ms = wait.as_millis() as u64,
                "Backend attempt failed, retrying"
            );
            metrics::increment_retry_attempts(backend);
            tokio::time::sleep(wait).await;
        }
    }
}
