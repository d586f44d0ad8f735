// Aggregated /health against live mock backends
mod common;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use axum::http::StatusCode;
    use tokio::time::Instant;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use crate::common::{body_json, config, gateway, request, send};

    async fn backend(status: u16, delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(status).set_delay(delay))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_all_backends_up() {
        let primary = backend(200, Duration::ZERO).await;
        let content = backend(200, Duration::ZERO).await;
        let (app, _) = gateway(config(&primary.uri(), &content.uri()));

        let response = send(&app, request("GET", "/health", "192.0.2.10")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let report = body_json(response).await;
        assert_eq!(report["status"], "up");
        assert_eq!(report["services"][0]["name"], "CMS Service");
        assert_eq!(report["services"][0]["url"], primary.uri());
        assert_eq!(report["services"][1]["status"], "up");
        let time = report["time"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(time).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_content_down_is_degraded() {
        let primary = backend(200, Duration::ZERO).await;
        let content = backend(503, Duration::ZERO).await;
        let (app, _) = gateway(config(&primary.uri(), &content.uri()));

        let report = body_json(send(&app, request("GET", "/health", "192.0.2.11")).await).await;
        assert_eq!(report["status"], "degraded");
        assert_eq!(report["services"][1]["status"], "down");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_primary_down_is_down() {
        let primary = backend(500, Duration::ZERO).await;
        let content = backend(200, Duration::ZERO).await;
        let (app, _) = gateway(config(&primary.uri(), &content.uri()));

        let response = send(&app, request("GET", "/health", "192.0.2.12")).await;
        // The verdict is carried in the body only.
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "down");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hung_probe_is_bounded_by_aggregate_deadline() {
        let primary = backend(200, Duration::ZERO).await;
        let content = backend(200, Duration::from_secs(10)).await;
        let mut cfg = config(&primary.uri(), &content.uri());
        cfg.health_check.probe_timeout_secs = 5;
        cfg.health_check.aggregate_timeout_secs = 1;
        let (app, _) = gateway(cfg);

        let started = Instant::now();
        let report = body_json(send(&app, request("GET", "/health", "192.0.2.13")).await).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report["services"][0]["status"], "up");
        assert_eq!(report["services"][1]["status"], "error");
        assert_eq!(report["status"], "degraded");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_bypasses_rate_limit() {
        let primary = backend(200, Duration::ZERO).await;
        let content = backend(200, Duration::ZERO).await;
        let mut cfg = config(&primary.uri(), &content.uri());
        cfg.rate_limit.requests_per_second = 1;
        cfg.rate_limit.burst = 1;
        let (app, _) = gateway(cfg);

        for _ in 0..5 {
            let response = send(&app, request("GET", "/health", "192.0.2.14")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
