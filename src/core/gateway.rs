//! Core gateway registry.
//!
//! `GatewayService` is built once at startup from an immutable
//! [`GatewayConfig`] and owns every piece of shared runtime state: one
//! [`ServiceProxy`] (and therefore one circuit breaker) per backend, the route
//! table, the per-client rate limiter and the health aggregator. Handlers
//! share it through an `Arc`.
use std::sync::Arc;

use eyre::{Result, WrapErr};

use crate::{
    adapters::health_checker::HealthAggregator,
    config::{BackendRole, GatewayConfig},
    core::{
        backend::BackendTarget,
        dispatcher::{RouteMatch, RouteTable},
        rate_limiter::ClientRateLimiter,
        service_proxy::ServiceProxy,
    },
    ports::http_client::HttpClient,
};

pub struct GatewayService {
    config: Arc<GatewayConfig>,
    routes: RouteTable,
    primary: ServiceProxy,
    content: ServiceProxy,
    rate_limiter: Option<Arc<ClientRateLimiter>>,
    health: HealthAggregator,
}

impl GatewayService {
    /// Build the registry. Fails only on configuration the validator would
    /// also reject.
    pub fn new(config: Arc<GatewayConfig>, http_client: Arc<dyn HttpClient>) -> Result<Self> {
        let primary = Self::target(&config, BackendRole::Primary)?;
        let content = Self::target(&config, BackendRole::Content)?;

        let rate_limiter = if config.rate_limit.enabled {
            let limiter = ClientRateLimiter::new(&config.rate_limit, &config.health_check.endpoint)
                .wrap_err("Invalid rate limit configuration")?;
            Some(Arc::new(limiter))
        } else {
            tracing::info!("Rate limiting is disabled");
            None
        };

        let health = HealthAggregator::new(
            http_client.clone(),
            vec![primary.clone(), content.clone()],
            &config.health_check,
        );

        let service = Self {
            routes: RouteTable::new(&config.routes, &config.fallback),
            primary: ServiceProxy::new(primary, &config, http_client.clone()),
            content: ServiceProxy::new(content, &config, http_client),
            rate_limiter,
            health,
            config,
        };

        tracing::info!(
            primary = %service.primary.target().url(),
            content = %service.content.target().url(),
            routes = service.routes.len(),
            "Gateway service initialized"
        );
        Ok(service)
    }

    fn target(config: &GatewayConfig, role: BackendRole) -> Result<BackendTarget> {
        BackendTarget::from_config(role, config.backends.get(role))
            .wrap_err_with(|| format!("Invalid {role} backend"))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn resolve(&self, path: &str) -> RouteMatch<'_> {
        self.routes.resolve(path)
    }

    pub fn proxy(&self, role: BackendRole) -> &ServiceProxy {
        match role {
            BackendRole::Primary => &self.primary,
            BackendRole::Content => &self.content,
        }
    }

    pub fn rate_limiter(&self) -> Option<&Arc<ClientRateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    pub fn is_health_endpoint(&self, path: &str) -> bool {
        path == self.config.health_check.endpoint
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use hyper::{Request, Response, StatusCode};

    use super::*;
    use crate::{
        core::circuit_breaker::CircuitState,
        ports::http_client::HttpClientResult,
    };

    struct MockHttpClient;

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_request(
            &self,
            _req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            Ok(Response::new(AxumBody::empty()))
        }

        async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            Ok(StatusCode::OK)
        }
    }

    fn service(config: GatewayConfig) -> Result<GatewayService> {
        GatewayService::new(Arc::new(config), Arc::new(MockHttpClient))
    }

    #[tokio::test]
    async fn test_one_proxy_and_breaker_per_backend() {
        let service = service(GatewayConfig::default()).unwrap();

        let primary = service.proxy(BackendRole::Primary);
        let content = service.proxy(BackendRole::Content);
        assert_eq!(primary.target().name(), "CMS Service");
        assert_eq!(content.target().name(), "Content Service");
        assert_eq!(primary.breaker().name(), "CMS Service");
        assert_eq!(primary.breaker().state(), CircuitState::Closed);
        assert!(!std::ptr::eq(primary.breaker(), content.breaker()));
    }

    #[tokio::test]
    async fn test_dispatch_and_health_endpoint() {
        let service = service(GatewayConfig::default()).unwrap();

        assert_eq!(service.resolve("/api/content/1").backend, BackendRole::Content);
        assert_eq!(service.resolve("/unknown").backend, BackendRole::Primary);
        assert!(service.is_health_endpoint("/health"));
        assert!(!service.is_health_endpoint("/health/deep"));
        assert_eq!(service.health().targets().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limiter_optional() {
        let mut config = GatewayConfig::default();
        assert!(service(config.clone()).unwrap().rate_limiter().is_some());

        config.rate_limit.enabled = false;
        assert!(service(config).unwrap().rate_limiter().is_none());
    }

    #[tokio::test]
    async fn test_invalid_backend_rejected() {
        let mut config = GatewayConfig::default();
        config.backends.primary.url = "not a url".to_string();
        assert!(service(config).is_err());
    }
}
