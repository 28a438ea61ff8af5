use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::monitoring::MetricSnapshot;
use crate::permissions::PermissionsReport;
use crate::rotation::ServiceSummary;
use crate::storage::StorageStats;

/// Point-in-time view of the whole lifecycle; contains no key material
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    /// Per-service key ids and schedules
    pub services: Vec<ServiceSummary>,
    /// Number of services holding an active key
    pub credential_count: usize,
    /// Module access table and its reverse index
    pub permissions: PermissionsReport,
    pub monitoring: MonitoringSummary,
    /// Secure cache occupancy
    pub storage: StorageStats,
    pub generated_at: DateTime<Utc>,
}

/// Monitoring part of a [`LifecycleReport`]
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSummary {
    /// Cumulative counters since startup
    pub snapshot: MetricSnapshot,
    /// Alerts currently retained
    pub active_alerts: usize,
    /// Alerts and snapshots published to subscribers
    pub events_published: u64,
}
