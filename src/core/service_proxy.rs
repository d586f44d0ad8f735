//! Service proxy: one per backend. Rewrites the inbound request for its
//! backend, buffers the body so attempts can be replayed, and hands the call to
//! the [`RetryingForwarder`] guarded by the backend's own [`CircuitBreaker`].
use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::{
    Json,
    body::Body as AxumBody,
    response::{IntoResponse, Response as AxumResponse},
};
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, header, uri::PathAndQuery,
};
use http_body_util::LengthLimitError;
use serde_json::json;
use thiserror::Error;
use crate::{
    config::GatewayConfig,
    core::{
        backend::BackendTarget,
        circuit_breaker::CircuitBreaker,
        deadline_body::deadline_after,
        dispatcher::RouteMatch,
        retry::{ProxyAttemptContext, RetryingForwarder},
    },
    ports::http_client::{HttpClient, HttpClientError},
};

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_ROLE: HeaderName = HeaderName::from_static("x-user-role");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Identity established by an upstream authentication layer. When present as a
/// request extension it is forwarded as `X-User-ID` / `X-User-Role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    pub user_id: String,
    pub role: String,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("circuit breaker rejected the request")]
    CircuitOpen,

    #[error("backend unreachable after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        source: HttpClientError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::CircuitOpen | ProxyError::RetriesExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl IntoResponse for ProxyError {
    /// Generic bodies only; backend names and error details stay in the logs.
    fn into_response(self) -> AxumResponse {
        let message = match self {
            ProxyError::CircuitOpen | ProxyError::RetriesExhausted { .. } => {
                "Service is currently unavailable"
            }
            ProxyError::InvalidRequest(_) => "Invalid request",
            ProxyError::BodyTooLarge { .. } => "Request body too large",
        };
        (self.status_code(), Json(json!({ "error": message }))).into_response()
    }
}

/// Join a backend base path and a request path with exactly one slash between
/// them.
pub fn join_url_path(base: &str, reference: &str) -> String {
    if reference.is_empty() {
        return base.to_string();
    }
    if base.is_empty() || base == "/" {
        return reference.to_string();
    }

    match (base.ends_with('/'), reference.starts_with('/')) {
        (true, true) => format!("{base}{}", &reference[1..]),
        (false, false) => format!("{base}/{reference}"),
        _ => format!("{base}{reference}"),
    }
}

/// Concatenate two raw query strings with `&`.
pub fn join_query(base: Option<&str>, inbound: Option<&str>) -> Option<String> {
    match (base.filter(|q| !q.is_empty()), inbound.filter(|q| !q.is_empty())) {
        (Some(base), Some(inbound)) => Some(format!("{base}&{inbound}")),
        (Some(query), None) | (None, Some(query)) => Some(query.to_string()),
        (None, None) => None,
    }
}

pub struct ServiceProxy {
    target: BackendTarget,
    breaker: CircuitBreaker,
    forwarder: RetryingForwarder,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl ServiceProxy {
    pub fn new(target: BackendTarget, config: &GatewayConfig, client: Arc<dyn HttpClient>) -> Self {
        let breaker = CircuitBreaker::new(target.name(), &config.circuit_breaker);
        let forwarder =
            RetryingForwarder::new(client, config.retry.clone(), config.request_timeout());
        Self {
            target,
            breaker,
            forwarder,
            request_timeout: config.request_timeout(),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Proxy `req` and always produce a response: the backend's own, or a
    /// synthesized failure.
    pub async fn handle(
        &self,
        req: Request<AxumBody>,
        route: &RouteMatch<'_>,
        client_ip: Option<IpAddr>,
    ) -> AxumResponse {
        match self.forward(req, route, client_ip).await {
            Ok(response) => response,
            Err(error) => {
                match &error {
                    ProxyError::CircuitOpen => tracing::warn!(
                        backend = %self.target.name(),
                        state = %self.breaker.state(),
                        "Backend circuit open, failing fast"
                    ),
                    _ => tracing::warn!(
                        backend = %self.target.name(),
                        error = %error,
                        "Proxy request failed"
                    ),
                }
                error.into_response()
            }
        }
    }

    pub async fn forward(
        &self,
        req: Request<AxumBody>,
        route: &RouteMatch<'_>,
        client_ip: Option<IpAddr>,
    ) -> Result<AxumResponse, ProxyError> {
        let deadline = deadline_after(self.request_timeout);
        let (parts, body) = req.into_parts();

        let target_uri = self.target_uri(&parts.uri, route)?;
        let headers = self.forwarded_headers(&parts.headers, &parts.extensions, &parts.uri, client_ip)?;

        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| {
                if e.into_inner().is::<LengthLimitError>() {
                    ProxyError::BodyTooLarge {
                        limit: self.max_body_bytes,
                    }
                } else {
                    ProxyError::InvalidRequest("failed to read request body".to_string())
                }
            })?;

        let mut ctx = ProxyAttemptContext {
            deadline,
            method: parts.method,
            version: parts.version,
            original_uri: parts.uri,
            target_uri,
            headers,
            body,
            attempts: 0,
        };

        tracing::debug!(
            backend = %self.target.name(),
            from = %ctx.original_uri,
            to = %ctx.target_uri,
            "Forwarding request"
        );

        self.forwarder.forward(&self.breaker, &mut ctx).await
    }

    /// Backend URI for an inbound URI: scheme and authority from the backend,
    /// base path joined with the (optionally prefix-stripped) request path,
    /// base query joined with the request query.
    pub fn target_uri(&self, inbound: &Uri, route: &RouteMatch<'_>) -> Result<Uri, ProxyError> {
        let request_path = route.forwarded_path(inbound.path());
        let url = self.target.url();

        let mut path = join_url_path(url.base_path(), request_path);
        if path.is_empty() {
            path.push('/');
        }
        let path_and_query = match join_query(url.base_query(), inbound.query()) {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };
        let path_and_query = PathAndQuery::try_from(path_and_query)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        Uri::builder()
            .scheme(url.scheme())
            .authority(url.authority())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))
    }

    fn forwarded_headers(
        &self,
        inbound: &HeaderMap,
        extensions: &http::Extensions,
        inbound_uri: &Uri,
        client_ip: Option<IpAddr>,
    ) -> Result<HeaderMap, ProxyError> {
        let mut headers = inbound.clone();

        // Headers named in Connection are hop-by-hop too.
        let listed: Vec<HeaderName> = inbound
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect();
        for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
            headers.remove(name);
        }
        headers.remove(HeaderName::from_static("proxy-connection"));
        // Recomputed from the buffered body.
        headers.remove(header::CONTENT_LENGTH);

        if let Some(ip) = client_ip {
            let forwarded_for = match inbound
                .get(&X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
            {
                Some(prior) if !prior.trim().is_empty() => format!("{prior}, {ip}"),
                _ => ip.to_string(),
            };
            headers.insert(X_FORWARDED_FOR, header_value(&forwarded_for)?);
        }
        if let Some(host) = inbound.get(header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        } else if let Some(authority) = inbound_uri.authority() {
            headers.insert(X_FORWARDED_HOST, header_value(authority.as_str())?);
        }
        let proto = inbound_uri.scheme_str().unwrap_or("http");
        headers.insert(X_FORWARDED_PROTO, header_value(proto)?);

        headers.insert(
            header::HOST,
            self.target
                .host_header()
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?,
        );

        headers.remove(&X_USER_ID);
        headers.remove(&X_USER_ROLE);
        if let Some(claims) = extensions.get::<IdentityClaims>() {
            headers.insert(X_USER_ID, header_value(&claims.user_id)?);
            headers.insert(X_USER_ROLE, header_value(&claims.role)?);
        }

        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::InvalidRequest(e.to_string()))
}
