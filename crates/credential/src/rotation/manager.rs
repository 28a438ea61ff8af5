//! Key rotation manager
//!
//! Each service owns a slot holding its current [`ServiceCredential`] behind
//! an [`ArcSwap`]. Readers load the record without locking; writers (rotation,
//! schedule changes, grace purges) take the slot's own async mutex, build a
//! new record and publish it with a single store. There is no lock spanning
//! services.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;

use super::error::{RotationError, RotationResult};
use super::persistence::{PersistedServiceState, StatePersistence};
use super::slot::{KeyState, ServiceCredential, ServiceSummary};
use crate::config::RotationSchedule;
use crate::core::{Clock, SecretString, ServiceId};
use crate::monitoring::{MonitoringService, RotationEvent};
use crate::source::CredentialSource;

struct ServiceSlot {
    current: ArcSwap<ServiceCredential>,
    /// Staged replacement keys; holding the lock serializes writers
    staged: Mutex<VecDeque<SecretString>>,
}

impl ServiceSlot {
    fn new(record: ServiceCredential) -> Self {
        Self {
            current: ArcSwap::from_pointee(record),
            staged: Mutex::new(VecDeque::new()),
        }
    }
}

/// What `add_key` did with the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddKeyOutcome {
    /// The service was unknown and is now registered with this key active
    Registered,
    /// The service exists; the key was queued as its next replacement
    Staged {
        /// Keys now waiting, including this one
        pending: usize,
    },
}

/// Result of one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Services rotated because they were due
    pub rotated: Vec<ServiceId>,
    /// Due services whose rotation failed; retried next pass
    pub failed: Vec<ServiceId>,
    /// Services whose retiring key was purged
    pub purged: Vec<ServiceId>,
}

impl TickSummary {
    /// Nothing happened
    pub fn is_empty(&self) -> bool {
        self.rotated.is_empty() && self.failed.is_empty() && self.purged.is_empty()
    }
}

/// Owns every service's credential record and performs rotations
pub struct KeyRotationManager {
    slots: DashMap<ServiceId, Arc<ServiceSlot>>,
    source: Arc<dyn CredentialSource>,
    monitor: Arc<MonitoringService>,
    clock: Arc<dyn Clock>,
    persistence: Option<StatePersistence>,
}

impl std::fmt::Debug for KeyRotationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotationManager")
            .field("services", &self.slots.len())
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl KeyRotationManager {
    /// Creates an empty manager
    pub fn new(
        source: Arc<dyn CredentialSource>,
        monitor: Arc<MonitoringService>,
        clock: Arc<dyn Clock>,
        persistence: Option<StatePersistence>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            source,
            monitor,
            clock,
            persistence,
        }
    }

    /// Loads `service`'s key from the credential source and registers it.
    ///
    /// Returns `Ok(None)` when the source has no key for the service.
    pub async fn load(
        &self,
        service: &ServiceId,
        schedule: RotationSchedule,
    ) -> Result<Option<Arc<ServiceCredential>>, crate::core::CredentialError> {
        if let Some(current) = self.current(service) {
            return Ok(Some(current));
        }

        let Some(key) = self.source.load(service).await? else {
            tracing::warn!(%service, "no key configured for service");
            return Ok(None);
        };

        self.add_key(service.clone(), key, schedule).await?;
        Ok(self.current(service))
    }

    /// Registers an unknown service with `key` active, or stages `key` as
    /// the next replacement of a known one
    pub async fn add_key(
        &self,
        service: ServiceId,
        key: SecretString,
        schedule: RotationSchedule,
    ) -> RotationResult<AddKeyOutcome> {
        if let Some(slot) = self.slot(&service) {
            return Ok(self.stage(&service, &slot, key).await);
        }

        schedule
            .validate(service.as_str())
            .map_err(|reason| RotationError::InvalidConfig {
                service: service.clone(),
                reason,
            })?;

        let record = self.restore(ServiceCredential::new(
            service.clone(),
            key.clone(),
            schedule,
            self.clock.now(),
        ))
        .await;

        let slot = match self.slots.entry(service.clone()) {
            Entry::Vacant(vacant) => {
                tracing::info!(
                    %service,
                    key_id = %record.active().id(),
                    next_rotation_at = %record.next_rotation_at(),
                    "service registered"
                );
                vacant.insert(Arc::new(ServiceSlot::new(record)));
                return Ok(AddKeyOutcome::Registered);
            }
            // Lost a registration race; treat the key as a replacement.
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
        };
        Ok(self.stage(&service, &slot, key).await)
    }

    /// Current record of `service`
    pub fn current(&self, service: &ServiceId) -> Option<Arc<ServiceCredential>> {
        self.slot(service).map(|slot| slot.current.load_full())
    }

    /// Registered services, sorted
    pub fn services(&self) -> Vec<ServiceId> {
        let mut services: Vec<ServiceId> = self.slots.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    /// Key ids and schedules of every service, sorted by service
    pub fn summaries(&self) -> Vec<ServiceSummary> {
        let now = self.clock.now();
        let mut summaries: Vec<ServiceSummary> = self
            .slots
            .iter()
            .map(|e| e.value().current.load().summary(now))
            .collect();
        summaries.sort_by(|a, b| a.service.cmp(&b.service));
        summaries
    }

    /// State of `key` for `service` right now
    pub fn key_state(&self, service: &ServiceId, key: &SecretString) -> KeyState {
        self.slot(service).map_or(KeyState::Revoked, |slot| {
            slot.current.load().state_of(key, self.clock.now())
        })
    }

    /// Whether `key` is active, or retiring within its grace window
    pub fn is_valid_key(&self, service: &ServiceId, key: &SecretString) -> bool {
        !matches!(self.key_state(service, key), KeyState::Revoked)
    }

    /// Rotates `service` now.
    ///
    /// The replacement is the oldest staged key, else the credential
    /// source's replacement. The outcome is reported to monitoring.
    pub async fn force_rotation(
        &self,
        service: &ServiceId,
    ) -> RotationResult<Arc<ServiceCredential>> {
        let slot = self.slot(service).ok_or_else(|| RotationError::UnknownService {
            service: service.clone(),
        })?;

        let result = self.rotate(service, &slot).await;
        match &result {
            Ok(record) => {
                tracing::info!(
                    %service,
                    key_id = %record.active().id(),
                    retiring_key_id = ?record.retiring().map(|r| r.key.id().to_string()),
                    version = record.version(),
                    "key rotated"
                );
            }
            Err(error) => {
                tracing::error!(%service, %error, "key rotation failed");
            }
        }

        self.monitor.track_api_key_rotation(RotationEvent {
            service: service.clone(),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Changes `service`'s schedule without rotating; the next rotation is
    /// rescheduled from now
    pub async fn update_rotation_config(
        &self,
        service: &ServiceId,
        schedule: RotationSchedule,
    ) -> RotationResult<Arc<ServiceCredential>> {
        let slot = self.slot(service).ok_or_else(|| RotationError::UnknownService {
            service: service.clone(),
        })?;
        schedule
            .validate(service.as_str())
            .map_err(|reason| RotationError::InvalidConfig {
                service: service.clone(),
                reason,
            })?;

        let _writer = slot.staged.lock().await;
        let next = Arc::new(slot.current.load().with_schedule(schedule, self.clock.now()));
        slot.current.store(Arc::clone(&next));
        self.persist(&next).await;

        tracing::info!(
            %service,
            rotation_interval = ?schedule.rotation_interval,
            grace_period = ?schedule.grace_period,
            next_rotation_at = %next.next_rotation_at(),
            "rotation config updated"
        );
        Ok(next)
    }

    /// Unregisters `service`; returns whether it existed
    pub fn remove(&self, service: &ServiceId) -> bool {
        let removed = self.slots.remove(service).is_some();
        if removed {
            tracing::info!(%service, "service removed");
        }
        removed
    }

    /// One scheduler pass: purges closed grace windows, then rotates every
    /// service that is due. A failed rotation leaves the schedule untouched
    /// so the next pass retries it.
    pub async fn run_due_rotations(&self) -> TickSummary {
        let slots: Vec<(ServiceId, Arc<ServiceSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut summary = TickSummary::default();
        for (service, slot) in slots {
            if self.purge_retiring(&service, &slot).await {
                summary.purged.push(service.clone());
            }

            if !slot.current.load().is_rotation_due(self.clock.now()) {
                continue;
            }
            match self.force_rotation(&service).await {
                Ok(_) => summary.rotated.push(service),
                Err(_) => summary.failed.push(service),
            }
        }
        summary
    }

    fn slot(&self, service: &ServiceId) -> Option<Arc<ServiceSlot>> {
        self.slots.get(service).map(|slot| Arc::clone(slot.value()))
    }

    async fn stage(&self, service: &ServiceId, slot: &ServiceSlot, key: SecretString) -> AddKeyOutcome {
        let mut staged = slot.staged.lock().await;
        staged.push_back(key);
        tracing::info!(%service, pending = staged.len(), "replacement key staged");
        AddKeyOutcome::Staged {
            pending: staged.len(),
        }
    }

    async fn rotate(
        &self,
        service: &ServiceId,
        slot: &ServiceSlot,
    ) -> RotationResult<Arc<ServiceCredential>> {
        let mut staged = slot.staged.lock().await;
        let replacement = match staged.pop_front() {
            Some(key) => key,
            None => self
                .source
                .replacement(service)
                .await
                .map_err(|e| RotationError::Source {
                    service: service.clone(),
                    reason: e.to_string(),
                })?
                .ok_or_else(|| RotationError::NoReplacementKey {
                    service: service.clone(),
                })?,
        };

        let current = slot.current.load_full();
        if current.active().matches(&replacement) {
            return Err(RotationError::ReplacementMatchesActive {
                service: service.clone(),
            });
        }

        let next = Arc::new(current.rotated(replacement, self.clock.now()));
        slot.current.store(Arc::clone(&next));
        self.persist(&next).await;
        drop(staged);
        Ok(next)
    }

    async fn purge_retiring(&self, service: &ServiceId, slot: &ServiceSlot) -> bool {
        let _writer = slot.staged.lock().await;
        let Some(purged) = slot.current.load().without_expired_retiring(self.clock.now()) else {
            return false;
        };
        let purged = Arc::new(purged);
        slot.current.store(Arc::clone(&purged));
        self.persist(&purged).await;
        tracing::debug!(%service, "retiring key purged");
        true
    }

    /// Applies persisted schedule metadata when it describes the same active key
    async fn restore(&self, record: ServiceCredential) -> ServiceCredential {
        let Some(persistence) = &self.persistence else {
            return record;
        };
        match persistence.load(record.service()).await {
            Ok(Some(state)) if &state.active_key_id == record.active().id() => {
                tracing::info!(
                    service = %record.service(),
                    version = state.version,
                    next_rotation_at = %state.next_rotation_at,
                    "restored persisted rotation schedule"
                );
                let schedule = state.schedule();
                record.restored(schedule, state.next_rotation_at, state.version)
            }
            Ok(Some(state)) => {
                tracing::warn!(
                    service = %record.service(),
                    persisted_key_id = %state.active_key_id,
                    loaded_key_id = %record.active().id(),
                    "persisted state describes a different key, ignoring"
                );
                record
            }
            Ok(None) => record,
            Err(error) => {
                tracing::warn!(service = %record.service(), %error, "failed to read persisted state");
                record
            }
        }
    }

    async fn persist(&self, record: &ServiceCredential) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(error) = persistence.save(&PersistedServiceState::from(record)).await {
            tracing::warn!(service = %record.service(), %error, "failed to persist rotation state");
        }
    }
}
