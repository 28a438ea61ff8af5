//! Metrics, alerting and reporting for API key usage

mod events;
mod metrics;
mod service;

pub use events::{MonitorEvent, MonitorSubscriber};
pub use metrics::{
    AccessEvent, Alert, AlertKind, MetricSnapshot, MetricsReport, OutcomeCounters, QuotaEvent,
    QuotaUsage, ReportPeriod, ResponseTimeStats, RotationEvent, ServiceMetrics,
};
pub use service::MonitoringService;
