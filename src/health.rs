//! Health report types for the diagnostics endpoint
//!
//! `InstanceCache::check_health` returns plain issue strings; the types here
//! add the classification and timing the REST layer shows on its
//! diagnostics page.

use crate::storage::ResourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health status of one instance cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Instance and every resident table and reader responded
    Healthy,
    /// Instance responded but some tables or readers did not
    Degraded,
    /// Instance probe failed or the cache is stopped
    Unhealthy,
}

impl HealthStatus {
    /// Convert to HTTP status code equivalent
    pub fn to_http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }

    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// A single failed probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    /// Kind of resource that failed
    pub kind: ResourceKind,
    /// Display name of the resource
    pub resource: String,
    /// Human readable description
    pub message: String,
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Result of probing everything one instance cache holds open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Instance name
    pub instance: String,
    /// Overall status
    pub status: HealthStatus,
    /// Failed probes, instance first, then tables, then readers
    pub issues: Vec<HealthIssue>,
    /// Tables resident when the sweep ran
    pub tables: usize,
    /// Readers resident when the sweep ran
    pub readers: usize,
    /// Time spent probing, in milliseconds
    pub response_time_ms: u64,
    /// When the sweep ran
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub(crate) fn from_issues(
        instance: impl Into<String>,
        issues: Vec<HealthIssue>,
        tables: usize,
        readers: usize,
        response_time_ms: u64,
    ) -> Self {
        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else if issues.iter().any(|i| i.kind == ResourceKind::Instance) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            instance: instance.into(),
            status,
            issues,
            tables,
            readers,
            response_time_ms,
            timestamp: Utc::now(),
        }
    }

    /// Issue messages in probe order
    pub fn messages(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.message.clone()).collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
