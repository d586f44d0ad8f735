use std::net::SocketAddr;

use crate::{
    config::models::{
        BackendConfig, BackendRole, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig,
        RateLimitConfig, RetryConfig, RouteConfig,
    },
    core::backend::BackendTarget,
};

/// Upper bound for every timeout, window and backoff setting.
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;
const MAX_DURATION_MS: u64 = MAX_DURATION_SECS * 1000;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator. Any error here is fatal at startup.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every problem found.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        for role in BackendRole::ALL {
            errors.extend(Self::validate_backend(role, config.backends.get(role)));
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }
        for route in &config.routes {
            errors.extend(Self::validate_route(route));
        }
        errors.extend(Self::check_route_conflicts(&config.routes));

        for prefix in &config.fallback.content_prefixes {
            if !prefix.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("fallback content prefix: {prefix}"),
                    message: "Prefixes must start with '/'".to_string(),
                });
            }
        }

        errors.extend(Self::validate_rate_limit(&config.rate_limit));
        errors.extend(Self::validate_circuit_breaker(&config.circuit_breaker));
        errors.extend(Self::validate_retry(&config.retry));
        errors.extend(Self::validate_health_check(&config.health_check));

        errors.extend(Self::bounded_secs("request_timeout_secs", config.request_timeout_secs));
        if config.max_body_bytes == 0 {
            errors.push(Self::positive("max_body_bytes"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8000' or '0.0.0.0:8000')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_backend(role: BackendRole, backend: &BackendConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if backend.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("backends.{role}.name"),
            });
        }
        if let Err(e) = BackendTarget::from_config(role, backend) {
            errors.push(ValidationError::InvalidField {
                field: format!("backends.{role}.url"),
                message: e.to_string(),
            });
        }
        if !backend.health_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("backends.{role}.health_path"),
                message: "Health paths must start with '/'".to_string(),
            });
        }

        errors
    }

    fn validate_route(route: &RouteConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !route.prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route prefix: {}", route.prefix),
                message: "Route prefixes must start with '/'".to_string(),
            });
        }
        if route.prefix.contains('?') || route.prefix.contains('#') {
            errors.push(ValidationError::InvalidField {
                field: format!("route prefix: {}", route.prefix),
                message: "Route prefixes must not contain a query or fragment".to_string(),
            });
        }
        errors
    }

    /// The same prefix routed to two different backends is ambiguous.
    fn check_route_conflicts(routes: &[RouteConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (i, route) in routes.iter().enumerate() {
            let normalized = route.prefix.trim_end_matches('/');
            for other in &routes[i + 1..] {
                if other.prefix.trim_end_matches('/') == normalized
                    && (other.backend != route.backend || other.strip_prefix != route.strip_prefix)
                {
                    errors.push(ValidationError::RouteConflict {
                        message: format!(
                            "prefix '{}' is configured for both {} and {}",
                            route.prefix, route.backend, other.backend
                        ),
                    });
                }
            }
        }
        errors
    }

    fn validate_rate_limit(config: &RateLimitConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !config.enabled {
            return errors;
        }
        if config.requests_per_second == 0 {
            errors.push(Self::positive("rate_limit.requests_per_second"));
        }
        if config.burst == 0 {
            errors.push(Self::positive("rate_limit.burst"));
        }
        if config.sweep_interval_secs > MAX_DURATION_SECS {
            errors.push(Self::too_large("rate_limit.sweep_interval_secs", MAX_DURATION_SECS));
        }
        errors
    }

    fn validate_circuit_breaker(config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.max_requests == 0 {
            errors.push(Self::positive("circuit_breaker.max_requests"));
        }
        errors.extend(Self::bounded_secs(
            "circuit_breaker.timeout_secs",
            config.timeout_secs,
        ));
        if config.interval_secs > MAX_DURATION_SECS {
            errors.push(Self::too_large("circuit_breaker.interval_secs", MAX_DURATION_SECS));
        }
        if config.min_requests == 0 {
            errors.push(Self::positive("circuit_breaker.min_requests"));
        }
        if !(config.failure_ratio > 0.0 && config.failure_ratio <= 1.0) {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.failure_ratio".to_string(),
                message: format!("must be in (0, 1], got {}", config.failure_ratio),
            });
        }
        errors
    }

    fn validate_retry(config: &RetryConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.initial_interval_ms == 0 {
            errors.push(Self::positive("retry.initial_interval_ms"));
        }
        if !(config.multiplier.is_finite() && config.multiplier >= 1.0) {
            errors.push(ValidationError::InvalidField {
                field: "retry.multiplier".to_string(),
                message: format!(
                    "must be a finite number of at least 1.0, got {}",
                    config.multiplier
                ),
            });
        }
        if !(0.0..1.0).contains(&config.randomization_factor) {
            errors.push(ValidationError::InvalidField {
                field: "retry.randomization_factor".to_string(),
                message: format!("must be in [0, 1), got {}", config.randomization_factor),
            });
        }
        if config.max_interval_ms < config.initial_interval_ms {
            errors.push(ValidationError::InvalidField {
                field: "retry.max_interval_ms".to_string(),
                message: "must not be smaller than retry.initial_interval_ms".to_string(),
            });
        }
        if config.max_interval_ms > MAX_DURATION_MS {
            errors.push(Self::too_large("retry.max_interval_ms", MAX_DURATION_MS));
        }
        if config.max_elapsed_ms > MAX_DURATION_MS {
            errors.push(Self::too_large("retry.max_elapsed_ms", MAX_DURATION_MS));
        }
        errors
    }

    fn validate_health_check(config: &HealthCheckConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !config.endpoint.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "health_check.endpoint".to_string(),
                message: "Health endpoint must start with '/'".to_string(),
            });
        }
        errors.extend(Self::bounded_secs(
            "health_check.probe_timeout_secs",
            config.probe_timeout_secs,
        ));
        errors.extend(Self::bounded_secs(
            "health_check.aggregate_timeout_secs",
            config.aggregate_timeout_secs,
        ));
        errors
    }

    fn positive(field: &str) -> ValidationError {
        ValidationError::InvalidField {
            field: field.to_string(),
            message: "must be greater than 0".to_string(),
        }
    }

    /// A timeout in seconds must be in `1..=MAX_DURATION_SECS`.
    fn bounded_secs(field: &str, value: u64) -> Option<ValidationError> {
        if value == 0 {
            Some(Self::positive(field))
        } else if value > MAX_DURATION_SECS {
            Some(Self::too_large(field, MAX_DURATION_SECS))
        } else {
            None
        }
    }

    fn too_large(field: &str, max: u64) -> ValidationError {
        ValidationError::InvalidField {
            field: field.to_string(),
            message: format!("must not exceed {max}"),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
