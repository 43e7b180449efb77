//! Health report types
//!
//! Per-tier health checks and the aggregate bridge report built from them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status for a tier or the bridge as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Tier is fully operational
    Healthy,
    /// Operational, but a cache tier is failing
    Degraded,
    /// Not operational
    Unhealthy,
    /// Not yet probed
    Unknown,
}

/// Health check result for a single tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    /// Tier name
    pub component: String,
    pub message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            response_time_ms: None,
            metadata: None,
        }
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            component: component.into(),
            message: Some(message.into()),
            response_time_ms: None,
            metadata: None,
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            component: component.into(),
            message: Some(message.into()),
            response_time_ms: None,
            metadata: None,
        }
    }

    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

/// Aggregate of every tier's check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub tiers: Vec<HealthCheck>,
}

impl HealthReport {
    /// Combine tier checks. The bridge is unhealthy when its store is, and
    /// degraded when any other tier is not healthy.
    pub fn from_checks(store: &str, tiers: Vec<HealthCheck>) -> Self {
        let store_down = tiers
            .iter()
            .any(|c| c.component == store && c.status == HealthStatus::Unhealthy);
        let any_down = tiers.iter().any(|c| c.status != HealthStatus::Healthy);
        let status = if store_down {
            HealthStatus::Unhealthy
        } else if any_down {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self { status, tiers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_is_unhealthy() {
        let report = HealthReport::from_checks(
            "pg",
            vec![
                HealthCheck::healthy("local"),
                HealthCheck::unhealthy("pg", "connection refused"),
            ],
        );
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_cache_failure_is_degraded() {
        let report = HealthReport::from_checks(
            "pg",
            vec![
                HealthCheck::unhealthy("remote", "timeout"),
                HealthCheck::healthy("pg").with_response_time(3),
            ],
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.tiers[1].response_time_ms, Some(3));
    }

    #[test]
    fn test_all_healthy() {
        let report = HealthReport::from_checks(
            "pg",
            vec![
                HealthCheck::healthy("local").with_metadata("entries", serde_json::json!(4)),
                HealthCheck::healthy("pg"),
            ],
        );
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.tiers[0].metadata.as_ref().unwrap()["entries"], 4);
    }
}
