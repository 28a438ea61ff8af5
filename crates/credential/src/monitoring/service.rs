//! Access, rotation and quota monitoring
//!
//! Tracking calls update counters and evaluate thresholds inline so alerts
//! are raised as soon as a condition holds, not at the next snapshot.
//! Threshold alerts are edge-triggered per (kind, service) and re-arm once
//! the condition clears.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{MonitorBus, MonitorEvent, MonitorSubscriber};
use super::metrics::{
    AccessEvent, Alert, AlertKind, MetricSnapshot, MetricsReport, QuotaEvent, QuotaUsage,
    ReportPeriod, RotationEvent, ServiceMetrics,
};
use crate::config::MonitoringConfig;
use crate::core::{Clock, ServiceId, sub_duration};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Default)]
struct MonitorState {
    /// Since the service started
    totals: Option<MetricSnapshot>,
    /// Since the last `collect_metrics`
    window: Option<MetricSnapshot>,
    consecutive_failures: HashMap<ServiceId, u32>,
    raised: HashSet<(AlertKind, ServiceId)>,
    alerts: VecDeque<Alert>,
    history: VecDeque<MetricSnapshot>,
}

impl MonitorState {
    fn apply(&mut self, now: DateTime<Utc>, update: impl Fn(&mut MetricSnapshot)) {
        update(self.totals.get_or_insert_with(|| MetricSnapshot::empty(now)));
        update(self.window.get_or_insert_with(|| MetricSnapshot::empty(now)));
    }

    fn window_service(&self, service: &ServiceId) -> Option<&ServiceMetrics> {
        self.window.as_ref()?.per_service.get(service)
    }
}

/// Counters, thresholds, snapshots and reports
pub struct MonitoringService {
    config: MonitoringConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    bus: MonitorBus,
}

impl std::fmt::Debug for MonitoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MonitoringService {
    /// Creates a monitor reading time from `clock`
    pub fn new(config: MonitoringConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(MonitorState::default()),
            bus: MonitorBus::new(EVENT_BUS_CAPACITY),
        }
    }

    /// Subscribes to alerts and snapshots
    pub fn subscribe(&self) -> MonitorSubscriber {
        self.bus.subscribe()
    }

    /// Alerts and snapshots published since start
    pub fn events_published(&self) -> u64 {
        self.bus.total_emitted()
    }

    /// Records a key access and checks error-rate and latency thresholds
    pub fn track_api_key_access(&self, event: AccessEvent) {
        let now = self.clock.now();
        let thresholds = &self.config.thresholds;
        let mut raised = Vec::new();
        {
            let mut state = self.state.lock();
            state.apply(now, |snapshot| {
                snapshot.requests.record(event.success);
                snapshot.response_time.record(event.duration);
                let service = snapshot.per_service.entry(event.service.clone()).or_default();
                service.requests.record(event.success);
                service.response_time.record(event.duration);
                *service.modules.entry(event.module.clone()).or_default() += 1;
            });

            let Some(window) = state.window_service(&event.service).cloned() else {
                return;
            };

            let error_rate = window.requests.error_rate();
            let evaluable = window.requests.total >= thresholds.min_requests;
            raised.extend(self.evaluate(
                &mut state,
                now,
                AlertKind::ErrorRate,
                &event.service,
                evaluable.then_some(error_rate > thresholds.error_rate),
                || {
                    (
                        format!(
                            "error rate {:.1}% exceeds {:.1}%",
                            error_rate * 100.0,
                            thresholds.error_rate * 100.0
                        ),
                        json!({
                            "errorRate": error_rate,
                            "threshold": thresholds.error_rate,
                            "requests": window.requests.total,
                        }),
                    )
                },
            ));

            let average_ms = window.response_time.average_ms;
            let limit_ms = thresholds.response_time.as_secs_f64() * 1000.0;
            raised.extend(self.evaluate(
                &mut state,
                now,
                AlertKind::ResponseTime,
                &event.service,
                Some(average_ms > limit_ms),
                || {
                    (
                        format!("average response time {average_ms:.0}ms exceeds {limit_ms:.0}ms"),
                        json!({ "averageMs": average_ms, "thresholdMs": limit_ms }),
                    )
                },
            ));
        }
        self.publish(raised);
    }

    /// Records a request rejected before its service could be resolved.
    ///
    /// Counts as a failed request in the totals; no service is charged.
    pub fn track_invalid_request(&self, duration: Duration) {
        let now = self.clock.now();
        self.state.lock().apply(now, |snapshot| {
            snapshot.requests.record(false);
            snapshot.response_time.record(duration);
            snapshot.invalid_requests += 1;
        });
    }

    /// Records a rotation attempt; raises one alert when consecutive
    /// failures reach the threshold
    pub fn track_api_key_rotation(&self, event: RotationEvent) {
        let now = self.clock.now();
        let threshold = self.config.thresholds.rotation_failures;
        let mut raised = Vec::new();
        {
            let mut state = self.state.lock();
            state.apply(now, |snapshot| {
                snapshot.rotations.record(event.success);
                snapshot
                    .per_service
                    .entry(event.service.clone())
                    .or_default()
                    .rotations
                    .record(event.success);
            });

            if event.success {
                state.consecutive_failures.remove(&event.service);
                state
                    .raised
                    .remove(&(AlertKind::RotationFailure, event.service.clone()));
            } else {
                let failures = {
                    let count = state
                        .consecutive_failures
                        .entry(event.service.clone())
                        .or_default();
                    *count = count.saturating_add(1);
                    *count
                };
                let last_error = event.error.clone().unwrap_or_default();
                raised.extend(self.evaluate(
                    &mut state,
                    now,
                    AlertKind::RotationFailure,
                    &event.service,
                    Some(failures >= threshold),
                    || {
                        (
                            format!("{failures} consecutive rotation failures"),
                            json!({
                                "consecutiveFailures": failures,
                                "threshold": threshold,
                                "lastError": last_error,
                            }),
                        )
                    },
                ));
            }
        }
        self.publish(raised);
    }

    /// Records provider quota usage and checks the quota threshold
    pub fn track_api_key_quota(&self, event: QuotaEvent) {
        let now = self.clock.now();
        let threshold = self.config.thresholds.quota_usage;
        if event.quota == 0 {
            tracing::warn!(service = %event.service, "ignoring quota report with zero quota");
            return;
        }

        let usage = event.used as f64 / event.quota as f64;
        let quota = QuotaUsage {
            quota: event.quota,
            used: event.used,
            usage,
            updated_at: now,
        };

        let raised = {
            let mut state = self.state.lock();
            state.apply(now, |snapshot| {
                snapshot
                    .per_service
                    .entry(event.service.clone())
                    .or_default()
                    .quota = Some(quota);
            });
            self.evaluate(
                &mut state,
                now,
                AlertKind::QuotaUsage,
                &event.service,
                Some(usage >= threshold),
                || {
                    (
                        format!(
                            "quota usage {:.1}% ({}/{}) at or above {:.1}%",
                            usage * 100.0,
                            event.used,
                            event.quota,
                            threshold * 100.0
                        ),
                        json!({
                            "quota": event.quota,
                            "used": event.used,
                            "usage": usage,
                            "threshold": threshold,
                        }),
                    )
                },
            )
        };
        self.publish(raised.into_iter().collect());
    }

    /// Closes the current window into an immutable snapshot, appends it to
    /// history and prunes snapshots older than the retention window
    pub fn collect_metrics(&self) -> MetricSnapshot {
        let now = self.clock.now();
        let cutoff = sub_duration(now, self.config.retention);

        let snapshot = {
            let mut state = self.state.lock();
            let mut snapshot = state
                .window
                .take()
                .unwrap_or_else(|| MetricSnapshot::empty(now));
            snapshot.timestamp = now;

            state.history.push_back(snapshot.clone());
            while state
                .history
                .front()
                .is_some_and(|oldest| oldest.timestamp < cutoff)
            {
                state.history.pop_front();
            }
            snapshot
        };

        tracing::debug!(
            requests = snapshot.requests.total,
            rotations = snapshot.rotations.total,
            "metrics snapshot collected"
        );
        self.bus.emit(MonitorEvent::Snapshot(snapshot.clone()));
        snapshot
    }

    /// Cumulative metrics since start, not appended to history
    pub fn current_snapshot(&self) -> MetricSnapshot {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut snapshot = state
            .totals
            .clone()
            .unwrap_or_else(|| MetricSnapshot::empty(now));
        snapshot.timestamp = now;
        snapshot
    }

    /// Snapshots still retained, oldest first
    pub fn history(&self) -> Vec<MetricSnapshot> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Retained alerts, newest first
    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.state.lock().alerts.iter().rev().cloned().collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts
    }

    /// Aggregates snapshots (and the still-open window) within `period`
    pub fn generate_metrics_report(&self, period: ReportPeriod) -> MetricsReport {
        let now = self.clock.now();
        let since = sub_duration(now, period.duration());

        let (aggregate, mut alerts) = {
            let state = self.state.lock();
            let mut aggregate = MetricSnapshot::empty(now);
            for snapshot in state.history.iter().filter(|s| s.timestamp >= since) {
                aggregate.merge(snapshot);
            }
            if let Some(window) = &state.window {
                aggregate.merge(window);
            }
            let alerts: Vec<Alert> = state
                .alerts
                .iter()
                .rev()
                .filter(|alert| alert.timestamp >= since)
                .cloned()
                .collect();
            (aggregate, alerts)
        };

        let mut seen = HashSet::new();
        alerts.retain(|alert| seen.insert(alert.id));
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        MetricsReport {
            period,
            since,
            generated_at: now,
            requests: aggregate.requests,
            services: aggregate.per_service,
            rotations: aggregate.rotations,
            response_time: aggregate.response_time,
            alerts,
        }
    }

    /// Spawns the periodic `collect_metrics` loop
    pub fn spawn_collector(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("metrics collector stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.collect_metrics();
                    }
                }
            }
        })
    }

    /// Applies the edge trigger: returns an alert only on the false → true
    /// transition. `condition == None` means "not enough data" and leaves
    /// the trigger untouched.
    fn evaluate(
        &self,
        state: &mut MonitorState,
        now: DateTime<Utc>,
        kind: AlertKind,
        service: &ServiceId,
        condition: Option<bool>,
        describe: impl FnOnce() -> (String, serde_json::Value),
    ) -> Option<Alert> {
        let key = (kind, service.clone());
        match condition {
            Some(true) => {
                if !state.raised.insert(key) {
                    return None;
                }
                let (message, payload) = describe();
                let alert = Alert {
                    id: Uuid::new_v4(),
                    kind,
                    service: service.clone(),
                    message,
                    timestamp: now,
                    payload,
                };
                state.alerts.push_back(alert.clone());
                while state.alerts.len() > self.config.alert_capacity {
                    state.alerts.pop_front();
                }
                Some(alert)
            }
            Some(false) => {
                state.raised.remove(&key);
                None
            }
            None => None,
        }
    }

    fn publish(&self, alerts: Vec<Alert>) {
        for alert in alerts {
            tracing::warn!(
                alert_type = ?alert.kind,
                service = %alert.service,
                message = %alert.message,
                "alert raised"
            );
            self.bus.emit(MonitorEvent::Alert(alert));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertThresholds;
    use crate::core::{ManualClock, ModuleId};
    use pretty_assertions::assert_eq;

    fn monitor() -> (MonitoringService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (
            MonitoringService::new(MonitoringConfig::default(), clock.clone()),
            clock,
        )
    }

    fn service(id: &str) -> ServiceId {
        ServiceId::new(id).unwrap()
    }

    fn access(service_id: &str, success: bool, ms: u64) -> AccessEvent {
        AccessEvent {
            service: service(service_id),
            module: ModuleId::new("route-module").unwrap(),
            success,
            duration: Duration::from_millis(ms),
        }
    }

    fn rotation(service_id: &str, success: bool) -> RotationEvent {
        RotationEvent {
            service: service(service_id),
            success,
            error: (!success).then(|| "provider unavailable".to_string()),
        }
    }

    fn alerts_of(monitor: &MonitoringService, kind: AlertKind) -> usize {
        monitor.alerts().iter().filter(|a| a.kind == kind).count()
    }

    #[test]
    fn test_three_failures_raise_exactly_one_alert() {
        let (monitor, _) = monitor();
        for _ in 0..3 {
            monitor.track_api_key_rotation(rotation("strava", false));
        }
        assert_eq!(alerts_of(&monitor, AlertKind::RotationFailure), 1);

        monitor.track_api_key_rotation(rotation("strava", false));
        assert_eq!(alerts_of(&monitor, AlertKind::RotationFailure), 1);
    }

    #[test]
    fn test_invalid_request_counts_as_failure() {
        let (monitor, _) = monitor();
        monitor.track_api_key_access(access("strava", true, 5));
        monitor.track_invalid_request(Duration::from_millis(1));

        let snapshot = monitor.current_snapshot();
        assert_eq!((snapshot.requests.total, snapshot.requests.failed), (2, 1));
        assert_eq!(snapshot.invalid_requests, 1);
        assert_eq!(snapshot.per_service[&service("strava")].requests.failed, 0);
        assert_eq!(monitor.collect_metrics().invalid_requests, 1);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let (monitor, _) = monitor();
        monitor.track_api_key_rotation(rotation("strava", false));
        monitor.track_api_key_rotation(rotation("strava", false));
        monitor.track_api_key_rotation(rotation("strava", true));
        monitor.track_api_key_rotation(rotation("strava", false));
        monitor.track_api_key_rotation(rotation("strava", false));
        assert_eq!(alerts_of(&monitor, AlertKind::RotationFailure), 0);

        monitor.track_api_key_rotation(rotation("strava", false));
        assert_eq!(alerts_of(&monitor, AlertKind::RotationFailure), 1);
    }

    #[test]
    fn test_failures_are_counted_per_service() {
        let (monitor, _) = monitor();
        monitor.track_api_key_rotation(rotation("strava", false));
        monitor.track_api_key_rotation(rotation("mapbox", false));
        monitor.track_api_key_rotation(rotation("strava", false));
        monitor.track_api_key_rotation(rotation("mapbox", false));
        assert_eq!(alerts_of(&monitor, AlertKind::RotationFailure), 0);
    }

    #[test]
    fn test_error_rate_needs_minimum_sample() {
        let (monitor, _) = monitor();
        for _ in 0..9 {
            monitor.track_api_key_access(access("mapbox", false, 5));
        }
        assert_eq!(alerts_of(&monitor, AlertKind::ErrorRate), 0);

        monitor.track_api_key_access(access("mapbox", false, 5));
        assert_eq!(alerts_of(&monitor, AlertKind::ErrorRate), 1);

        monitor.track_api_key_access(access("mapbox", false, 5));
        assert_eq!(alerts_of(&monitor, AlertKind::ErrorRate), 1);
    }

    #[test]
    fn test_response_time_alert_is_immediate() {
        let (monitor, _) = monitor();
        monitor.track_api_key_access(access("openWeather", true, 2500));
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ResponseTime);
        assert_eq!(alerts[0].service, service("openWeather"));
    }

    #[test]
    fn test_quota_alert_rearms_after_clearing() {
        let (monitor, _) = monitor();
        let quota = |used| QuotaEvent {
            service: service("openRouter"),
            quota: 1000,
            used,
        };
        monitor.track_api_key_quota(quota(950));
        monitor.track_api_key_quota(quota(990));
        assert_eq!(alerts_of(&monitor, AlertKind::QuotaUsage), 1);

        monitor.track_api_key_quota(quota(10));
        monitor.track_api_key_quota(quota(900));
        assert_eq!(alerts_of(&monitor, AlertKind::QuotaUsage), 2);
    }

    #[test]
    fn test_alert_ring_buffer_is_bounded() {
        let clock = Arc::new(ManualClock::default());
        let config = MonitoringConfig {
            alert_capacity: 3,
            thresholds: AlertThresholds {
                rotation_failures: 1,
                ..AlertThresholds::default()
            },
            ..MonitoringConfig::default()
        };
        let monitor = MonitoringService::new(config, clock);
        for i in 0..5 {
            let id = format!("svc{i}");
            monitor.track_api_key_rotation(rotation(&id, false));
        }
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.service != service("svc0")));
    }

    #[test]
    fn test_collect_appends_and_prunes() {
        let (monitor, clock) = monitor();
        monitor.track_api_key_access(access("mapbox", true, 10));
        let first = monitor.collect_metrics();
        assert_eq!(first.requests.total, 1);

        let second = monitor.collect_metrics();
        assert_eq!(second.requests.total, 0);
        assert_eq!(monitor.history().len(), 2);

        clock.advance(Duration::from_secs(8 * 24 * 60 * 60));
        monitor.collect_metrics();
        assert_eq!(monitor.history().len(), 1);
        assert_eq!(monitor.current_snapshot().requests.total, 1);
    }

    #[test]
    fn test_report_window_and_alert_order() {
        let (monitor, clock) = monitor();
        monitor.track_api_key_access(access("mapbox", true, 10));
        monitor.collect_metrics();

        clock.advance(Duration::from_secs(2 * 60 * 60));
        monitor.track_api_key_access(access("strava", true, 20));
        monitor.track_api_key_quota(QuotaEvent {
            service: service("strava"),
            quota: 10,
            used: 10,
        });
        clock.advance(Duration::from_secs(1));
        monitor.track_api_key_access(access("strava", true, 5000));

        let hour = monitor.generate_metrics_report(ReportPeriod::Hour);
        assert_eq!(hour.requests.total, 2);
        assert!(!hour.services.contains_key(&service("mapbox")));
        assert_eq!(hour.alerts.len(), 2);
        assert_eq!(hour.alerts[0].kind, AlertKind::ResponseTime);
        assert_eq!(hour.alerts[1].kind, AlertKind::QuotaUsage);

        let day = monitor.generate_metrics_report(ReportPeriod::Day);
        assert_eq!(day.requests.total, 3);
        assert_eq!(day.services[&service("mapbox")].requests.total, 1);

        let json = serde_json::to_value(&day).unwrap();
        for key in ["requests", "services", "rotations", "responseTime", "alerts"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_alerts() {
        let (monitor, _) = monitor();
        let mut sub = monitor.subscribe();
        monitor.track_api_key_access(access("mapbox", true, 1500));
        match sub.recv().await {
            Some(MonitorEvent::Alert(alert)) => assert_eq!(alert.kind, AlertKind::ResponseTime),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
