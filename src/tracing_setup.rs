use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize tracing from the `logging` config section.
///
/// `RUST_LOG` wins over `logging.level` when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    init_tracing_with_config(&config.level, config.json, true)
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let result = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    result.wrap_err("A global tracing subscriber is already installed")?;

    tracing::info!(level, json = json_format, "Gateway logging initialized");
    Ok(())
}

/// Shutdown tracing gracefully
pub fn shutdown_tracing() {
    // The fmt layer writes synchronously; nothing is buffered.
    tracing::info!("Gateway tracing shutdown complete");
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        backend = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
    )
}

/// Create a span for one attempt against a backend
pub fn create_backend_span(backend: &str, method: &str, path: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "backend_request",
        backend = backend,
        http.method = method,
        http.path = path,
        attempt,
        http.status_code = tracing::field::Empty,
    )
}
