use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body as AxumBody,
    extract::ConnectInfo,
    http::{StatusCode, header},
};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};
use tracing::Instrument;

use crate::{
    adapters::middleware::X_REQUEST_ID, core::GatewayService, metrics,
    tracing_setup::create_request_span,
};

/// HTTP handler for the gateway: health endpoint, rate limiting, dispatch and
/// proxying, in that order.
#[derive(Clone)]
pub struct HttpHandler {
    gateway_service: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway_service: Arc<GatewayService>) -> Self {
        Self { gateway_service }
    }

    /// Main request handler
    pub async fn handle_request(
        &self,
        mut req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>> {
        if let Some(addr) = client_addr {
            if req.extensions().get::<ConnectInfo<SocketAddr>>().is_none() {
                req.extensions_mut().insert(ConnectInfo(addr));
            }
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = req
            .headers()
            .get(&X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-")
            .to_string();

        let span = create_request_span(method.as_str(), &path, &request_id);
        async move {
            if self.gateway_service.is_health_endpoint(&path) {
                return self.handle_health_check().await;
            }

            if let Some(limiter) = self.gateway_service.rate_limiter() {
                if let Err(rejection) = limiter.check(&req) {
                    metrics::increment_request_total("rate_limited", method.as_str(), 429);
                    return Ok(*rejection);
                }
            }

            let route = self.gateway_service.resolve(&path);
            let proxy = self.gateway_service.proxy(route.backend);
            tracing::Span::current().record("backend", proxy.target().name());
            let _timer = metrics::RequestTimer::new(route.label(), method.as_str());

            let response = proxy
                .handle(req, &route, client_addr.map(|addr| addr.ip()))
                .await;

            tracing::Span::current().record("http.status_code", response.status().as_u16());
            metrics::increment_request_total(
                route.label(),
                method.as_str(),
                response.status().as_u16(),
            );
            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Aggregate backend health. Always 200; the body carries the verdict.
    async fn handle_health_check(&self) -> Result<Response<AxumBody>> {
        let report = self.gateway_service.health().check().await;
        let body = serde_json::to_vec(&report).wrap_err("Failed to serialize health report")?;

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(body))
            .wrap_err("Failed to build health check response")
    }
}
