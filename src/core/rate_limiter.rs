//! Per-client rate limiting built atop `governor`.
//!
//! Every client key owns a GCRA cell equivalent to a token bucket of capacity
//! `burst` refilled at `requests_per_second`. Cells live in governor's sharded
//! keyed store, so lookup-or-create is atomic per key and distinct keys never
//! contend on one global lock. Cells that have fully refilled carry no state
//! worth keeping and are dropped by a periodic sweep.
use std::{
    net::SocketAddr,
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

use axum::{
    Json,
    extract::ConnectInfo,
    response::{IntoResponse, Response as AxumResponse},
};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use http::{Request, StatusCode};
use serde_json::json;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    config::models::{MissingKeyPolicy, RateLimitConfig},
    metrics,
};

pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

pub const X_REAL_IP: &str = "x-real-ip";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limit '{0}' must be greater than 0")]
    ZeroQuota(&'static str),
}

/// Per-client token buckets keyed by client address.
pub struct ClientRateLimiter {
    limiter: KeyedRateLimiterImpl<String>,
    exempt_path: String,
    trust_forwarded_headers: bool,
    on_missing_key: MissingKeyPolicy,
}

impl ClientRateLimiter {
    /// Build a limiter from the `rate_limit` section. `exempt_path` (the
    /// gateway health endpoint) is never limited.
    pub fn new(config: &RateLimitConfig, exempt_path: impl Into<String>) -> Result<Self, RateLimitError> {
        let rate = NonZeroU32::new(config.requests_per_second)
            .ok_or(RateLimitError::ZeroQuota("requests_per_second"))?;
        let burst = NonZeroU32::new(config.burst).ok_or(RateLimitError::ZeroQuota("burst"))?;
        let quota = Quota::per_second(rate).allow_burst(burst);

        tracing::info!(
            requests_per_second = config.requests_per_second,
            burst = config.burst,
            trust_forwarded_headers = config.trust_forwarded_headers,
            on_missing_key = ?config.on_missing_key,
            "Creating per-client rate limiter"
        );

        Ok(Self {
            limiter: RateLimiter::keyed(quota),
            exempt_path: exempt_path.into(),
            trust_forwarded_headers: config.trust_forwarded_headers,
            on_missing_key: config.on_missing_key,
        })
    }

    /// Take one token for `key`. A refused request consumes nothing.
    pub fn check_key(&self, key: &str) -> bool {
        self.limiter.check_key(&key.to_string()).is_ok()
    }

    /// Admit or reject an inbound request, returning the 429 response on
    /// rejection.
    pub fn check<T>(&self, req: &Request<T>) -> Result<(), Box<AxumResponse>> {
        if req.uri().path() == self.exempt_path {
            return Ok(());
        }

        match self.client_key(req) {
            Some(key) => {
                if self.check_key(&key) {
                    Ok(())
                } else {
                    tracing::debug!(client = %key, "Rate limit exceeded");
                    metrics::increment_rate_limited();
                    Err(Box::new(rate_limited_response()))
                }
            }
            None => match self.on_missing_key {
                MissingKeyPolicy::Allow => Ok(()),
                MissingKeyPolicy::Deny => {
                    metrics::increment_rate_limited();
                    Err(Box::new(rate_limited_response()))
                }
            },
        }
    }

    /// Client identity: peer IP, or the forwarding headers when trusted.
    pub fn client_key<T>(&self, req: &Request<T>) -> Option<String> {
        if self.trust_forwarded_headers {
            let headers = req.headers();
            let forwarded = headers
                .get(X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty());
            let real_ip = || {
                headers
                    .get(X_REAL_IP)
                    .and_then(|value| value.to_str().ok())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            };
            if let Some(key) = forwarded.or_else(real_ip) {
                return Some(key.to_string());
            }
        }

        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|connect_info| connect_info.0.ip().to_string())
    }

    /// Number of client keys currently holding state.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }

    /// Drop buckets that have fully refilled.
    pub fn sweep(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        let tracked = self.tracked_clients();
        metrics::set_rate_limiter_tracked_clients(tracked);
        tracing::debug!(tracked_clients = tracked, "Rate limiter sweep completed");
    }

    /// Sweep every `interval` until a shutdown signal arrives.
    pub fn spawn_sweeper<S>(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<S>,
    ) -> JoinHandle<()>
    where
        S: Clone + Send + 'static,
    {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.sweep(),
                    _ = shutdown.recv() => {
                        tracing::debug!("Rate limiter sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn rate_limited_response() -> AxumResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Rate limit exceeded" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::{
            Barrier,
            atomic::{AtomicU32, Ordering},
        },
        thread,
    };

    use http::{Method, Request};

    use super::*;

    fn config(rps: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: rps,
            burst,
            ..RateLimitConfig::default()
        }
    }

    fn request_from(ip: [u8; 4], path: &str) -> Request<()> {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::from(ip)),
            40_000,
        )));
        req
    }

    #[test]
    fn test_zero_quota_rejected() {
        assert!(ClientRateLimiter::new(&config(0, 5), "/health").is_err());
        assert!(ClientRateLimiter::new(&config(5, 0), "/health").is_err());
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = ClientRateLimiter::new(&config(5, 5), "/health").unwrap();
        let req = request_from([10, 0, 0, 1], "/api/courses");

        for _ in 0..5 {
            assert!(limiter.check(&req).is_ok());
        }
        let rejected = limiter.check(&req).unwrap_err();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_concurrent_first_requests_share_one_bucket() {
        let limiter = ClientRateLimiter::new(&config(1, 4), "/health").unwrap();
        let barrier = Barrier::new(16);
        let admitted = AtomicU32::new(0);

        thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    barrier.wait();
                    if limiter.check_key("198.51.100.7") {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 4);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_tokens_refill_up_to_burst() {
        // One token every 50ms, at most two held.
        let limiter = ClientRateLimiter::new(&config(20, 2), "/health").unwrap();
        assert!(limiter.check_key("k"));
        assert!(limiter.check_key("k"));
        assert!(!limiter.check_key("k"));

        thread::sleep(Duration::from_millis(60));
        assert!(limiter.check_key("k"));

        // A long idle period still only restores `burst` tokens.
        thread::sleep(Duration::from_millis(500));
        let admitted = (0..10).filter(|_| limiter.check_key("k")).count();
        assert_eq!(admitted, 2);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = ClientRateLimiter::new(&config(1, 1), "/health").unwrap();

        assert!(limiter.check(&request_from([10, 0, 0, 1], "/a")).is_ok());
        assert!(limiter.check(&request_from([10, 0, 0, 1], "/a")).is_err());
        assert!(limiter.check(&request_from([10, 0, 0, 2], "/a")).is_ok());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_health_endpoint_is_exempt() {
        let limiter = ClientRateLimiter::new(&config(1, 1), "/health").unwrap();
        let req = request_from([10, 0, 0, 1], "/health");
        for _ in 0..10 {
            assert!(limiter.check(&req).is_ok());
        }
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_forwarded_headers_only_when_trusted() {
        let mut req = request_from([10, 0, 0, 1], "/api");
        req.headers_mut()
            .insert(X_FORWARDED_FOR, "198.51.100.4, 10.0.0.1".parse().unwrap());

        let untrusted = ClientRateLimiter::new(&config(5, 5), "/health").unwrap();
        assert_eq!(untrusted.client_key(&req).as_deref(), Some("10.0.0.1"));

        let trusted = ClientRateLimiter::new(
            &RateLimitConfig {
                trust_forwarded_headers: true,
                ..config(5, 5)
            },
            "/health",
        )
        .unwrap();
        assert_eq!(trusted.client_key(&req).as_deref(), Some("198.51.100.4"));

        req.headers_mut().remove(X_FORWARDED_FOR);
        req.headers_mut()
            .insert(X_REAL_IP, "198.51.100.9".parse().unwrap());
        assert_eq!(trusted.client_key(&req).as_deref(), Some("198.51.100.9"));
    }

    #[test]
    fn test_missing_key_policy() {
        let req = Request::builder().uri("/api").body(()).unwrap();

        let allow = ClientRateLimiter::new(&config(5, 5), "/health").unwrap();
        assert!(allow.check(&req).is_ok());

        let deny = ClientRateLimiter::new(
            &RateLimitConfig {
                on_missing_key: MissingKeyPolicy::Deny,
                ..config(5, 5)
            },
            "/health",
        )
        .unwrap();
        assert!(deny.check(&req).is_err());
    }

    #[test]
    fn test_sweep_keeps_partially_drained_buckets() {
        let limiter = ClientRateLimiter::new(&config(1, 10), "/health").unwrap();
        assert!(limiter.check_key("busy"));
        limiter.sweep();
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let limiter = Arc::new(ClientRateLimiter::new(&config(5, 5), "/health").unwrap());
        let (tx, rx) = broadcast::channel::<()>(1);

        let handle = limiter.spawn_sweeper(Duration::from_millis(10), rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
