//! Observer bus for alerts and snapshots.
//!
//! Uses [`tokio::sync::broadcast`] for fan-out delivery to multiple subscribers.
//! Events are fire-and-forget projections; a slow subscriber skips ahead
//! instead of back-pressuring the tracking path.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use super::metrics::{Alert, MetricSnapshot};

/// Something observers can react to
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A threshold was crossed
    Alert(Alert),
    /// `collect_metrics` produced a snapshot
    Snapshot(MetricSnapshot),
}

pub(crate) struct MonitorBus {
    sender: broadcast::Sender<MonitorEvent>,
    emitted: AtomicU64,
}

impl MonitorBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            emitted: AtomicU64::new(0),
        }
    }

    pub(crate) fn emit(&self, event: MonitorEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> MonitorSubscriber {
        MonitorSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// Receiving half returned by [`MonitoringService::subscribe`](super::MonitoringService::subscribe)
#[derive(Debug)]
pub struct MonitorSubscriber {
    receiver: broadcast::Receiver<MonitorEvent>,
}

impl MonitorSubscriber {
    /// Waits for the next event; `None` once the service is dropped
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "monitor subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> MetricSnapshot {
        MetricSnapshot::empty(Utc::now())
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = MonitorBus::new(4);
        bus.emit(MonitorEvent::Snapshot(snapshot()));
        assert_eq!(bus.total_emitted(), 1);
    }

    #[test]
    fn lagged_subscriber_skips_to_newest() {
        let bus = MonitorBus::new(2);
        let mut sub = bus.subscribe();
        for _ in 0..5 {
            bus.emit(MonitorEvent::Snapshot(snapshot()));
        }
        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
