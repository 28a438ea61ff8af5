//! Metric, alert and report types
//!
//! Everything here serializes camelCase so reports keep the JSON shape
//! dashboards consume: `{requests, services, rotations, responseTime, alerts}`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{ModuleId, ServiceId};

/// Key access reported by the lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    /// Requested service
    pub service: ServiceId,
    /// Requesting module
    pub module: ModuleId,
    /// Whether a key was returned
    pub success: bool,
    /// Time spent serving the request
    pub duration: Duration,
}

/// Outcome of a rotation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    /// Rotated service
    pub service: ServiceId,
    /// Whether the rotation completed
    pub success: bool,
    /// Failure description
    pub error: Option<String>,
}

/// Provider quota report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaEvent {
    /// Service the quota belongs to
    pub service: ServiceId,
    /// Allowed calls in the provider's window
    pub quota: u64,
    /// Calls used so far
    pub used: u64,
}

/// Success/failure tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounters {
    /// All attempts
    pub total: u64,
    /// Successful attempts
    pub successful: u64,
    /// Failed attempts
    pub failed: u64,
}

impl OutcomeCounters {
    pub(crate) fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
    }

    /// failed / total; `0.0` when nothing was recorded
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Latency aggregate in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimeStats {
    /// Samples recorded
    pub count: u64,
    /// Sum of all samples
    pub total_ms: f64,
    /// Slowest sample
    pub max_ms: f64,
    /// `total_ms / count`
    pub average_ms: f64,
}

impl ResponseTimeStats {
    pub(crate) fn record(&mut self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.count += 1;
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
        self.average_ms = self.total_ms / self.count as f64;
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.total_ms += other.total_ms;
        self.max_ms = self.max_ms.max(other.max_ms);
        self.average_ms = if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        };
    }
}

/// Last reported quota state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    /// Allowed calls
    pub quota: u64,
    /// Calls used
    pub used: u64,
    /// used / quota
    pub usage: f64,
    /// When this was reported
    pub updated_at: DateTime<Utc>,
}

/// Per-service breakdown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    /// Key requests
    pub requests: OutcomeCounters,
    /// Rotation attempts
    pub rotations: OutcomeCounters,
    /// Key request latency
    pub response_time: ResponseTimeStats,
    /// Most recent quota report
    pub quota: Option<QuotaUsage>,
    /// Requests per module
    pub modules: BTreeMap<ModuleId, u64>,
}

impl ServiceMetrics {
    pub(crate) fn merge(&mut self, other: &Self) {
        self.requests.merge(&other.requests);
        self.rotations.merge(&other.rotations);
        self.response_time.merge(&other.response_time);
        if let Some(theirs) = other.quota {
            if self
                .quota
                .is_none_or(|mine| mine.updated_at < theirs.updated_at)
            {
                self.quota = Some(theirs);
            }
        }
        for (module, count) in &other.modules {
            *self.modules.entry(module.clone()).or_default() += count;
        }
    }
}

/// Immutable metrics capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Key requests across services
    pub requests: OutcomeCounters,
    /// Requests rejected before a service could be resolved, also counted
    /// as failures in `requests`
    #[serde(default)]
    pub invalid_requests: u64,
    /// Rotations across services
    pub rotations: OutcomeCounters,
    /// Latency across services
    pub response_time: ResponseTimeStats,
    /// Breakdown by service
    pub per_service: BTreeMap<ServiceId, ServiceMetrics>,
}

impl MetricSnapshot {
    /// Snapshot with no activity
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            requests: OutcomeCounters::default(),
            invalid_requests: 0,
            rotations: OutcomeCounters::default(),
            response_time: ResponseTimeStats::default(),
            per_service: BTreeMap::new(),
        }
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.requests.merge(&other.requests);
        self.invalid_requests += other.invalid_requests;
        self.rotations.merge(&other.rotations);
        self.response_time.merge(&other.response_time);
        for (service, metrics) in &other.per_service {
            self.per_service
                .entry(service.clone())
                .or_default()
                .merge(metrics);
        }
    }
}

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// Request error rate above threshold
    ErrorRate,
    /// Average latency above threshold
    ResponseTime,
    /// Quota usage above threshold
    QuotaUsage,
    /// Consecutive rotation failures reached the threshold
    RotationFailure,
}

/// Raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Unique alert id
    pub id: Uuid,
    /// Alert category
    #[serde(rename = "type")]
    pub kind: AlertKind,
    /// Affected service
    pub service: ServiceId,
    /// Human-readable summary
    pub message: String,
    /// When the alert was raised
    pub timestamp: DateTime<Utc>,
    /// Measured values and thresholds
    pub payload: serde_json::Value,
}

/// Report window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    /// Last 60 minutes
    Hour,
    /// Last 24 hours
    Day,
    /// Last 7 days
    Week,
}

impl ReportPeriod {
    /// Window length
    pub fn duration(self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            Self::Hour => Duration::from_secs(HOUR),
            Self::Day => Duration::from_secs(24 * HOUR),
            Self::Week => Duration::from_secs(7 * 24 * HOUR),
        }
    }
}

impl std::str::FromStr for ReportPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            other => Err(format!("unknown report period '{other}' (expected hour, day or week)")),
        }
    }
}

/// Aggregated metrics for a report window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    /// Requested window
    pub period: ReportPeriod,
    /// Start of the window
    pub since: DateTime<Utc>,
    /// Report time
    pub generated_at: DateTime<Utc>,
    /// Key requests across services
    pub requests: OutcomeCounters,
    /// Breakdown by service
    pub services: BTreeMap<ServiceId, ServiceMetrics>,
    /// Rotations across services
    pub rotations: OutcomeCounters,
    /// Latency across services
    pub response_time: ResponseTimeStats,
    /// Alerts in the window, newest first
    pub alerts: Vec<Alert>,
}
