//! Router assembly and the serve loop.
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    middleware,
    response::Response,
    routing::any,
};
use eyre::{Result, WrapErr};
use http::StatusCode;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::{HttpClientAdapter, HttpHandler, cors_middleware, request_id_middleware},
    config::GatewayConfig,
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};

/// Build the gateway router. Every path and method lands on the handler;
/// CORS runs outermost so preflights never reach the rate limiter.
pub fn build_router(handler: HttpHandler) -> Router {
    let gateway = any(move |req: Request| {
        let handler = handler.clone();
        async move {
            let client_addr = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            match handler.handle_request(req, client_addr).await {
                Ok(response) => Ok::<Response<Body>, Infallible>(response),
                Err(e) => {
                    tracing::error!("Request handling error: {:?}", e);
                    let mut response = Response::new(Body::from("Internal Server Error"));
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        }
    });

    Router::new()
        .fallback(gateway)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(cors_middleware))
}

/// Run the gateway until `shutdown` fires, then give in-flight requests the
/// drain timeout to finish.
pub async fn serve(config: GatewayConfig, shutdown: Arc<GracefulShutdown>) -> Result<()> {
    serve_with(config, shutdown, |router| router).await
}

/// Like [`serve`], with `customize` applied to the assembled router before it
/// is bound. Embedders use it to add outer layers, such as an authentication
/// layer that inserts [`IdentityClaims`](crate::core::IdentityClaims) for the
/// proxy to forward.
pub async fn serve_with<F>(
    config: GatewayConfig,
    shutdown: Arc<GracefulShutdown>,
    customize: F,
) -> Result<()>
where
    F: FnOnce(Router) -> Router,
{
    let config = Arc::new(config);
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err_with(|| format!("Invalid listen address {}", config.listen_addr))?;

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().wrap_err("Failed to create HTTP client adapter")?);
    let gateway_service = Arc::new(GatewayService::new(config.clone(), http_client)?);

    let sweeper = match gateway_service.rate_limiter() {
        Some(limiter) if config.rate_limit.sweep_interval_secs > 0 => Some(limiter.spawn_sweeper(
            Duration::from_secs(config.rate_limit.sweep_interval_secs),
            shutdown.subscribe(),
        )),
        _ => None,
    };

    for route in &config.routes {
        tracing::info!(
            "Configured route: {} -> {} (strip_prefix: {})",
            route.prefix,
            route.backend,
            route.strip_prefix
        );
    }

    let app = customize(build_router(HttpHandler::new(gateway_service)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))?;
    tracing::info!("Gateway listening on {}", addr);

    let signal = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = signal.wait_for_shutdown_signal().await;
        tracing::info!("Stopping listener: {:?}", reason);
    });

    let mut server = std::pin::pin!(server.into_future());
    tokio::select! {
        result = &mut server => result.wrap_err("Server error")?,
        _ = async {
            shutdown.wait_for_shutdown_signal().await;
            tokio::time::sleep(shutdown.drain_timeout()).await;
        } => {
            tracing::warn!(
                "In-flight requests did not finish within {:?}, forcing shutdown",
                shutdown.drain_timeout()
            );
        }
    }

    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            tracing::debug!("Rate limiter sweeper ended abnormally: {}", e);
        }
    }
    tracing::info!("Graceful shutdown completed");
    Ok(())
}
