//! Configuration data structures for the gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to
//! `GATEWAY__*` environment overrides. Every section carries defaults so that an
//! empty configuration reproduces the stock two-backend deployment.
use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Which backend a route forwards to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    /// Hosts auth and the business API; its health decides overall liveness.
    Primary,
    /// Serves course content.
    Content,
}

impl BackendRole {
    pub const ALL: [BackendRole; 2] = [BackendRole::Primary, BackendRole::Content];
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendRole::Primary => write!(f, "primary"),
            BackendRole::Content => write!(f, "content"),
        }
    }
}

/// A single upstream service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    /// Display name used in logs and the health report
    pub name: String,
    /// Base URL (scheme, host, optional base path and query)
    pub url: String,
    /// Path appended to `url` when probing liveness
    #[serde(default = "default_backend_health_path")]
    pub health_path: String,
}

fn default_backend_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackendsConfig {
    pub primary: BackendConfig,
    pub content: BackendConfig,
}

impl BackendsConfig {
    pub fn get(&self, role: BackendRole) -> &BackendConfig {
        match role {
            BackendRole::Primary => &self.primary,
            BackendRole::Content => &self.content,
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            primary: BackendConfig {
                name: "CMS Service".to_string(),
                url: "http://localhost:8080".to_string(),
                health_path: default_backend_health_path(),
            },
            content: BackendConfig {
                name: "Content Service".to_string(),
                url: "http://localhost:8082".to_string(),
                health_path: default_backend_health_path(),
            },
        }
    }
}

/// One entry of the ordered route table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Path prefix, matched on segment boundaries
    pub prefix: String,
    pub backend: BackendRole,
    /// Remove `prefix` from the path before joining it onto the backend base path
    #[serde(default)]
    pub strip_prefix: bool,
}

impl RouteConfig {
    pub fn new(prefix: impl Into<String>, backend: BackendRole) -> Self {
        Self {
            prefix: prefix.into(),
            backend,
            strip_prefix: false,
        }
    }
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new("/auth", BackendRole::Primary),
        RouteConfig::new("/api/courses", BackendRole::Primary),
        RouteConfig::new("/api/enrollments", BackendRole::Primary),
        RouteConfig::new("/api/admin", BackendRole::Primary),
        RouteConfig::new("/api/content", BackendRole::Content),
        RouteConfig::new("/public/content", BackendRole::Content),
    ]
}

/// Rule applied when no route prefix matches.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FallbackConfig {
    /// Raw path prefixes that send unmatched requests to the content backend
    pub content_prefixes: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            content_prefixes: vec!["/api/content".to_string(), "/public/content".to_string()],
        }
    }
}

/// Behaviour when a client key could not be extracted (no peer address etc.).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    Allow,
    Deny,
}

/// Per-client token bucket settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Continuous refill rate
    pub requests_per_second: u32,
    /// Bucket capacity
    pub burst: u32,
    /// Derive the client key from `X-Forwarded-For` / `X-Real-IP` before the peer address
    pub trust_forwarded_headers: bool,
    pub on_missing_key: MissingKeyPolicy,
    /// How often fully refilled buckets are dropped; 0 disables the sweeper
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst: 60,
            trust_forwarded_headers: false,
            on_missing_key: MissingKeyPolicy::Allow,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Trial calls admitted while half-open, and successes needed to close
    pub max_requests: u32,
    /// Length of the closed-state counting window; 0 never resets
    pub interval_secs: u64,
    /// Time spent open before trial calls are allowed
    pub timeout_secs: u64,
    /// Requests required in the window before the failure ratio is considered
    pub min_requests: u32,
    pub failure_ratio: f64,
}

impl CircuitBreakerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            interval_secs: 30,
            timeout_secs: 10,
            min_requests: 5,
            failure_ratio: 0.5,
        }
    }
}

/// Exponential backoff bounded by total elapsed time.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    /// Each wait is drawn from `interval * [1 - factor, 1 + factor]`
    pub randomization_factor: f64,
    pub max_interval_ms: u64,
    /// Retry budget; no attempt is scheduled past this point
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval_ms: 2_000,
            max_elapsed_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Path of the gateway's own health endpoint
    pub endpoint: String,
    pub probe_timeout_secs: u64,
    pub aggregate_timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: "/health".to_string(),
            probe_timeout_secs: 3,
            aggregate_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub backends: BackendsConfig,
    pub routes: Vec<RouteConfig>,
    pub fallback: FallbackConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub health_check: HealthCheckConfig,
    /// Deadline for one proxied request, retries included
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            backends: BackendsConfig::default(),
            routes: default_routes(),
            fallback: FallbackConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            health_check: HealthCheckConfig::default(),
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            logging: LoggingConfig::default(),
        }
    }
}
