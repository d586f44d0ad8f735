//! Resilient API gateway for a two-backend learning platform.
//!
//! Every inbound request passes through a per-client token bucket, is matched
//! against a longest-prefix route table and forwarded to either the primary
//! (CMS) or content backend. Each backend sits behind its own circuit breaker
//! and a retrying forwarder with exponential backoff; `/health` fans out to
//! all backends concurrently and reports an aggregate status.
//!
//! # Architecture
//! Ports (traits) live in [`ports`], their implementations in [`adapters`] and
//! the gateway logic in [`core`]. [`server`] wires everything into an axum
//! router; [`server::serve_with`] lets embedders wrap it in extra layers.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use learnvibe_gateway::{config::load_config, server, utils::GracefulShutdown};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("config.toml").await?;
//! server::serve(config, Arc::new(GracefulShutdown::new())).await?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Domain errors are `thiserror` enums; application-level APIs return
//! `eyre::Result<T>` with context attached through `WrapErr`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod server;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HealthAggregator, HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    server::build_router,
    utils::GracefulShutdown,
};
