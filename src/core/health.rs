//! Health report types and the overall-status policy.
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of probing one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Probe answered 2xx
    Up,
    /// Non-2xx, connection failure or probe timeout
    Down,
    /// Probe could not be built, or did not finish before the aggregate deadline
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub url: String,
    #[serde(skip)]
    pub primary: bool,
}

/// Body of the gateway health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub status: OverallStatus,
    pub services: Vec<ServiceHealth>,
    pub time: DateTime<Utc>,
}

impl GatewayHealth {
    pub fn new(services: Vec<ServiceHealth>, time: DateTime<Utc>) -> Self {
        Self {
            status: overall_status(&services),
            services,
            time,
        }
    }
}

/// A down primary takes the whole gateway down; anything else short of all-up
/// is degraded.
pub fn overall_status(services: &[ServiceHealth]) -> OverallStatus {
    if services
        .iter()
        .any(|s| s.primary && s.status == ServiceStatus::Down)
    {
        OverallStatus::Down
    } else if services.iter().all(|s| s.status == ServiceStatus::Up) {
        OverallStatus::Up
    } else {
        OverallStatus::Degraded
    }
}
