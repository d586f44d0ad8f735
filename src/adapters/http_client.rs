use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

const USER_AGENT: &str = concat!("learnvibe-gateway/", env!("CARGO_PKG_VERSION"));

/// HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// Responsibilities:
/// * Sets a default User-Agent and a Host header when the caller did not
/// * Forces request version to HTTP/1.1 while allowing ALPN to negotiate h2
/// * Performs GET based health checks with timeout
/// * Converts between Hyper body and Axum body types
///
/// Retries and circuit breaking live in `core`; this adapter makes exactly one
/// attempt per call.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Self::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(connect_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::info!(?connect_timeout, "Created backend HTTP client");
        Ok(Self { client })
    }

    /// Fill in headers the caller left out. Existing values are never replaced.
    fn add_default_headers(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let authority = match (req.uri().scheme(), req.uri().authority()) {
            (Some(_), Some(authority)) => authority.as_str().to_string(),
            _ => {
                return Err(HttpClientError::InvalidRequest(format!(
                    "Outgoing URI must be absolute: {}",
                    req.uri()
                )));
            }
        };

        let headers = req.headers_mut();
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        if !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&authority)
                .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
            headers.insert(header::HOST, host);
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::add_default_headers(&mut req)?;

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;

        let span = tracing::debug_span!(
            "backend_http",
            http.method = %parts.method,
            http.url = %parts.uri,
            http.status_code = tracing::field::Empty,
        );
        tracing::debug!(parent: &span, "Outgoing request headers: {:?}", parts.headers);

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let outgoing_request = Request::from_parts(parts, body);

        match self
            .client
            .request(outgoing_request)
            .instrument(span.clone())
            .await
        {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());

                let (mut parts, hyper_body) = response.into_parts();
                // Body is re-framed by the inbound server.
                parts.headers.remove(header::TRANSFER_ENCODING);

                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::warn!(parent: &span, "Request to {} {} failed: {}", method, uri, e);
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }

    async fn health_check(&self, url: &str, limit: Duration) -> HttpClientResult<StatusCode> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        Self::add_default_headers(&mut request)?;

        tracing::debug!("Health checking URL: {}", url);

        match timeout(limit, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                // Drain so the connection can return to the pool
                let _ = response.into_body().collect().await;
                tracing::debug!("Health check for {} returned {}", url, status);
                Ok(status)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health check error for {}: {}", url, err);
                Err(HttpClientError::ConnectionError(err.to_string()))
            }
            Err(_) => {
                tracing::debug!("Health check timeout for {}", url);
                Err(HttpClientError::Timeout(limit))
            }
        }
    }
}
