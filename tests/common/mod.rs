// Shared setup for gateway integration tests
#![allow(dead_code)]

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response},
};
use learnvibe_gateway::{
    HttpClient, HttpClientAdapter, HttpHandler, build_router,
    config::GatewayConfig,
    core::GatewayService,
};
use tower::ServiceExt;

/// Config pointing both backends at mock servers, with fast failure settings.
pub fn config(primary_url: &str, content_url: &str) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.backends.primary.url = primary_url.to_string();
    config.backends.content.url = content_url.to_string();
    config.request_timeout_secs = 1;
    config.retry.max_elapsed_ms = 0;
    config
}

pub fn gateway(config: GatewayConfig) -> (Router, Arc<GatewayService>) {
    let http_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new().unwrap());
    let service = Arc::new(GatewayService::new(Arc::new(config), http_client).unwrap());
    (build_router(HttpHandler::new(service.clone())), service)
}

pub fn request(method: &str, uri: &str, client_ip: &str) -> Request<Body> {
    request_with_body(method, uri, client_ip, Body::empty())
}

pub fn request_with_body(method: &str, uri: &str, client_ip: &str, body: Body) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "gateway.test")
        .body(body)
        .unwrap();
    let ip: IpAddr = client_ip.parse().unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::new(ip, 40_000)));
    req
}

pub async fn send(app: &Router, req: Request<Body>) -> Response<Body> {
    app.clone().oneshot(req).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
