use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    task::JoinSet,
    time::{timeout, timeout_at},
};

use crate::{
    config::{BackendRole, HealthCheckConfig},
    core::{
        backend::BackendTarget,
        deadline_body::deadline_after,
        health::{GatewayHealth, ServiceHealth, ServiceStatus},
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
};

/// On-demand health aggregator: probes every backend concurrently and folds
/// the results into one [`GatewayHealth`] report.
///
/// The aggregate deadline is enforced on the fan-out itself, so a probe that
/// ignores its own timeout still cannot hold the report back.
pub struct HealthAggregator {
    http_client: Arc<dyn HttpClient>,
    targets: Vec<BackendTarget>,
    probe_timeout: Duration,
    aggregate_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        targets: Vec<BackendTarget>,
        config: &HealthCheckConfig,
    ) -> Self {
        Self {
            http_client,
            targets,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            aggregate_timeout: Duration::from_secs(config.aggregate_timeout_secs),
        }
    }

    pub fn targets(&self) -> &[BackendTarget] {
        &self.targets
    }

    pub async fn check(&self) -> GatewayHealth {
        let deadline = deadline_after(self.aggregate_timeout);
        let mut results: Vec<Option<ServiceStatus>> = vec![None; self.targets.len()];

        let mut probes = JoinSet::new();
        for (index, target) in self.targets.iter().enumerate() {
            let client = self.http_client.clone();
            let url = target.health_url();
            let probe_timeout = self.probe_timeout;
            probes.spawn(async move { (index, probe(client.as_ref(), &url, probe_timeout).await) });
        }

        loop {
            match timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok((index, status)))) => results[index] = Some(status),
                Ok(Some(Err(join_error))) => {
                    tracing::error!("Health probe task failed: {}", join_error);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        pending = probes.len(),
                        "Health check aggregate deadline exceeded"
                    );
                    probes.abort_all();
                    break;
                }
            }
        }

        let services = self
            .targets
            .iter()
            .zip(results)
            .map(|(target, status)| {
                let status = status.unwrap_or(ServiceStatus::Error);
                metrics::set_backend_health_status(target.name(), status == ServiceStatus::Up);
                ServiceHealth {
                    name: target.name().to_string(),
                    status,
                    url: target.url().to_string(),
                    primary: target.role() == BackendRole::Primary,
                }
            })
            .collect();

        let report = GatewayHealth::new(services, Utc::now());
        tracing::debug!(status = ?report.status, "Health check completed");
        report
    }
}

async fn probe(client: &dyn HttpClient, url: &str, probe_timeout: Duration) -> ServiceStatus {
    match timeout(probe_timeout, client.health_check(url, probe_timeout)).await {
        Ok(Ok(status)) if status.is_success() => ServiceStatus::Up,
        Ok(Ok(status)) => {
            tracing::debug!("Health probe {} answered {}", url, status);
            ServiceStatus::Down
        }
        Ok(Err(HttpClientError::InvalidRequest(reason))) => {
            tracing::warn!("Health probe {} could not be built: {}", url, reason);
            ServiceStatus::Error
        }
        Ok(Err(err)) => {
            tracing::debug!("Health probe {} failed: {}", url, err);
            ServiceStatus::Down
        }
        Err(_) => {
            tracing::debug!("Health probe {} timed out", url);
            ServiceStatus::Down
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use hyper::{Request, Response, StatusCode};
    use tokio::time::Instant;

    use super::*;
    use crate::{core::health::OverallStatus, ports::http_client::HttpClientResult};

    #[derive(Clone, Copy)]
    enum Probe {
        Status(StatusCode),
        Refused,
        Invalid,
        Hang,
    }

    struct MockHttpClient {
        probes: HashMap<String, Probe>,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_request(
            &self,
            _req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            unreachable!("health checks never forward requests")
        }

        async fn health_check(&self, url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            match self.probes.get(url).copied().unwrap_or(Probe::Refused) {
                Probe::Status(status) => Ok(status),
                Probe::Refused => Err(HttpClientError::ConnectionError("refused".to_string())),
                Probe::Invalid => Err(HttpClientError::InvalidRequest("bad url".to_string())),
                Probe::Hang => std::future::pending().await,
            }
        }
    }

    fn aggregator(primary: Probe, content: Probe, config: &HealthCheckConfig) -> HealthAggregator {
        let targets = vec![
            BackendTarget::new("CMS Service", BackendRole::Primary, "http://cms:8080", "/health")
                .unwrap(),
            BackendTarget::new(
                "Content Service",
                BackendRole::Content,
                "http://content:8082",
                "/health",
            )
            .unwrap(),
        ];
        let probes = HashMap::from([
            ("http://cms:8080/health".to_string(), primary),
            ("http://content:8082/health".to_string(), content),
        ]);
        HealthAggregator::new(Arc::new(MockHttpClient { probes }), targets, config)
    }

    #[tokio::test]
    async fn all_up() {
        let ok = Probe::Status(StatusCode::OK);
        let report = aggregator(ok, ok, &HealthCheckConfig::default()).check().await;

        assert_eq!(report.status, OverallStatus::Up);
        assert_eq!(report.services[0].name, "CMS Service");
        assert_eq!(report.services[0].url, "http://cms:8080");
        assert_eq!(report.services[1].status, ServiceStatus::Up);
    }

    #[tokio::test]
    async fn content_down_degrades() {
        let report = aggregator(
            Probe::Status(StatusCode::OK),
            Probe::Status(StatusCode::SERVICE_UNAVAILABLE),
            &HealthCheckConfig::default(),
        )
        .check()
        .await;

        assert_eq!(report.status, OverallStatus::Degraded);
        assert_eq!(report.services[1].status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn primary_down_is_down() {
        let report = aggregator(
            Probe::Refused,
            Probe::Status(StatusCode::OK),
            &HealthCheckConfig::default(),
        )
        .check()
        .await;

        assert_eq!(report.status, OverallStatus::Down);
        assert_eq!(report.services[0].status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn unbuildable_probe_is_error() {
        let report = aggregator(
            Probe::Status(StatusCode::OK),
            Probe::Invalid,
            &HealthCheckConfig::default(),
        )
        .check()
        .await;

        assert_eq!(report.services[1].status, ServiceStatus::Error);
        assert_eq!(report.status, OverallStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_is_cut_by_probe_timeout() {
        let report = aggregator(
            Probe::Status(StatusCode::OK),
            Probe::Hang,
            &HealthCheckConfig::default(),
        )
        .check()
        .await;

        assert_eq!(report.services[1].status, ServiceStatus::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_deadline_holds_even_if_probes_hang() {
        let config = HealthCheckConfig {
            probe_timeout_secs: 60,
            aggregate_timeout_secs: 5,
            ..HealthCheckConfig::default()
        };
        let started = Instant::now();
        let report = aggregator(Probe::Hang, Probe::Status(StatusCode::OK), &config)
            .check()
            .await;

        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(report.services[0].status, ServiceStatus::Error);
        assert_eq!(report.services[1].status, ServiceStatus::Up);
        assert_eq!(report.status, OverallStatus::Degraded);
    }
}
