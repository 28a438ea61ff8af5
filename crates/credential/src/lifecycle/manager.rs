//! The orchestrator behind every key operation
//!
//! Keys are served through [`SecureMemoryStorage`], keyed by service and
//! tagged with the id of the key they were cached from. A cached entry is
//! only served while that id is still the service's active key, so rotation
//! invalidates it without an explicit purge. The cache bounds how long a
//! decrypted copy outlives its use: entries expire after the storage TTL
//! and the whole cache is wiped on [`LifecycleManager::stop`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::builder::LifecycleBuilder;
use super::report::{LifecycleReport, MonitoringSummary};
use crate::config::{LifecycleConfig, RotationSchedule};
use crate::core::{
    Clock, ConfigurationError, CredentialError, ModuleId, Result, SecretString, ServiceId,
    exposed,
};
use crate::crypto::{AesGcmCipher, OsNonceSource, STORAGE_KEY_CONTEXT, derive_storage_key};
use crate::monitoring::{AccessEvent, MonitoringService};
use crate::permissions::PermissionRegistry;
use crate::rotation::{
    AddKeyOutcome, KeyId, KeyRotationManager, RotationScheduler, ServiceSummary,
    StatePersistence,
};
use crate::secrets::SecretManager;
use crate::storage::SecureMemoryStorage;

const CACHE_KEY_PREFIX: &str = "apikey:";

/// Cached form of an active key, tagged with the id it had when cached
#[derive(Serialize, Deserialize)]
struct CachedKey {
    key_id: KeyId,
    #[serde(with = "exposed")]
    key: SecretString,
}

fn cache_key(service: &ServiceId) -> String {
    format!("{CACHE_KEY_PREFIX}{service}")
}

/// Entry point for every API key operation
///
/// Operations may run concurrently from any number of tasks. After
/// [`stop`](Self::stop) every operation returns [`CredentialError::Stopped`].
pub struct LifecycleManager {
    config: LifecycleConfig,
    clock: Arc<dyn Clock>,
    secrets: SecretManager,
    storage: Arc<SecureMemoryStorage>,
    permissions: PermissionRegistry,
    monitor: Arc<MonitoringService>,
    rotation: Arc<KeyRotationManager>,

    stopped: AtomicBool,
    /// Operations hold a read guard; `stop` takes the write guard to wait
    /// for in-flight operations
    gate: RwLock<()>,
    /// Set once shutdown has fully completed; every `stop` caller awaits it
    stopped_complete: OnceCell<()>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("rotation", &self.rotation)
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Starts building a manager
    pub fn builder() -> LifecycleBuilder {
        LifecycleBuilder::new()
    }

    pub(super) async fn initialize(builder: LifecycleBuilder) -> Result<Self> {
        let config = builder.config.clone();
        config.validate()?;

        let secrets = SecretManager::new(config.secrets.clone(), builder.resolve_secret_source());
        secrets.initialize(config.secrets.enforce_strength)?;

        let master = secrets.secret(&config.secrets.encryption_key).ok_or_else(|| {
            ConfigurationError::MissingSecrets {
                missing: vec![config.secrets.encryption_key.clone()],
            }
        })?;
        let storage_key = derive_storage_key(&master, STORAGE_KEY_CONTEXT)?;
        let nonces = builder
            .nonce_source
            .clone()
            .unwrap_or_else(|| Arc::new(OsNonceSource));
        let cipher = AesGcmCipher::with_nonce_source(&storage_key, nonces)?;

        let clock = Arc::clone(&builder.clock);
        let storage = Arc::new(SecureMemoryStorage::new(
            Arc::new(cipher),
            Arc::clone(&clock),
            config.storage.ttl,
        ));
        let monitor = Arc::new(MonitoringService::new(
            config.monitoring.clone(),
            Arc::clone(&clock),
        ));
        let permissions = PermissionRegistry::least_privilege(
            &config.permissions,
            config.services.iter().map(|service| &service.id),
        );
        let persistence = config.keys_directory.clone().map(StatePersistence::new);
        let rotation = Arc::new(KeyRotationManager::new(
            builder.resolve_credential_source(),
            Arc::clone(&monitor),
            Arc::clone(&clock),
            persistence,
        ));

        for service in &config.services {
            rotation.load(&service.id, service.schedule()).await?;
        }

        let manager = Self {
            config,
            clock,
            secrets,
            storage,
            permissions,
            monitor,
            rotation,
            stopped: AtomicBool::new(false),
            gate: RwLock::new(()),
            stopped_complete: OnceCell::new(),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        };
        if builder.background_tasks {
            manager.spawn_background_tasks();
        }

        tracing::info!(
            services = manager.rotation.services().len(),
            configured = manager.config.services.len(),
            keys_directory = ?manager.config.keys_directory,
            "lifecycle manager initialized"
        );
        Ok(manager)
    }

    fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(
            self.storage
                .spawn_cleanup(self.config.storage.cleanup_interval, self.shutdown.child_token()),
        );
        tasks.push(self.monitor.spawn_collector(
            self.config.monitoring.snapshot_interval,
            self.shutdown.child_token(),
        ));
        if self.config.rotation.auto_rotate {
            tasks.push(
                RotationScheduler::new(
                    Arc::clone(&self.rotation),
                    self.config.rotation.check_interval,
                )
                .spawn(self.shutdown.child_token()),
            );
        }
    }

    /// Returns the active key of `service` for `module`.
    ///
    /// The key is served from the encrypted cache when it still matches the
    /// service's active key, otherwise from the rotation manager, loading the
    /// service from the credential source if it is not held yet. Every
    /// outcome is reported to monitoring.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::Validation`] when either identifier is malformed
    /// - [`CredentialError::PermissionDenied`] when `module` may not read `service`
    /// - [`CredentialError::KeyUnavailable`] when no key is configured
    /// - [`CredentialError::Stopped`] after [`stop`](Self::stop)
    pub async fn get_api_key(&self, service: &str, module: &str) -> Result<SecretString> {
        let _op = self.enter().await?;
        let started = Instant::now();

        let ids = ServiceId::new(service).and_then(|id| Ok((id, ModuleId::new(module)?)));
        let (service, module) = match ids {
            Ok(ids) => ids,
            Err(error) => {
                tracing::warn!(service, module, %error, "api key request rejected");
                self.monitor.track_invalid_request(started.elapsed());
                return Err(error.into());
            }
        };

        let result = self.resolve_api_key(&service, &module).await;
        self.monitor.track_api_key_access(AccessEvent {
            service,
            module,
            success: result.is_ok(),
            duration: started.elapsed(),
        });
        result
    }

    async fn resolve_api_key(&self, service: &ServiceId, module: &ModuleId) -> Result<SecretString> {
        if !self.permissions.has_permission(module, service) {
            tracing::warn!(%service, %module, "api key access denied");
            return Err(CredentialError::PermissionDenied {
                module: module.to_string(),
                service: service.to_string(),
            });
        }

        let cache_key = cache_key(service);
        let current = match self.rotation.current(service) {
            Some(current) => current,
            None => self
                .rotation
                .load(service, self.schedule_for(service))
                .await?
                .ok_or_else(|| CredentialError::KeyUnavailable {
                    service: service.to_string(),
                })?,
        };

        if let Some(cached) = self.storage.get::<CachedKey>(&cache_key) {
            if &cached.key_id == current.active().id() {
                tracing::debug!(%service, %module, "api key served from cache");
                return Ok(cached.key);
            }
        }

        let key = current.active().secret().clone();
        let entry = CachedKey {
            key_id: current.active().id().clone(),
            key: key.clone(),
        };
        if let Err(error) = self.storage.set(&cache_key, &entry, None) {
            tracing::warn!(%service, %error, "failed to cache api key");
        }
        tracing::debug!(%service, %module, key_id = %entry.key_id, "api key served");
        Ok(key)
    }

    /// Registers `service` with `key` active, or stages `key` as its next
    /// replacement when it is already registered.
    ///
    /// A newly registered service is granted to the admin module only.
    pub async fn add_key(&self, service: &str, key: SecretString) -> Result<AddKeyOutcome> {
        let _op = self.enter().await?;
        let service = ServiceId::new(service)?;

        let outcome = self
            .rotation
            .add_key(service.clone(), key, self.schedule_for(&service))
            .await?;
        if outcome == AddKeyOutcome::Registered {
            self.permissions.grant_admin([service.clone()]);
        }
        self.storage.delete(&cache_key(&service));
        Ok(outcome)
    }

    /// Rotates `service` immediately
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Rotation`] when the service is unknown or
    /// no replacement key is available; the failure is reported to monitoring.
    pub async fn rotate_keys(&self, service: &str) -> Result<ServiceSummary> {
        let _op = self.enter().await?;
        let service = ServiceId::new(service)?;

        let record = self.rotation.force_rotation(&service).await?;
        self.storage.delete(&cache_key(&service));
        Ok(record.summary(self.clock.now()))
    }

    /// Replaces the rotation schedule of `service`
    pub async fn update_rotation_config(
        &self,
        service: &str,
        schedule: RotationSchedule,
    ) -> Result<ServiceSummary> {
        let _op = self.enter().await?;
        let service = ServiceId::new(service)?;

        let record = self.rotation.update_rotation_config(&service, schedule).await?;
        Ok(record.summary(self.clock.now()))
    }

    /// Whether `key` is the active key of `service`, or its predecessor
    /// within the grace window
    pub async fn is_valid_key(&self, service: &str, key: &SecretString) -> Result<bool> {
        let _op = self.enter().await?;
        let service = ServiceId::new(service)?;
        Ok(self.rotation.is_valid_key(&service, key))
    }

    /// Registered services, sorted
    pub async fn list_services(&self) -> Result<Vec<ServiceId>> {
        let _op = self.enter().await?;
        Ok(self.rotation.services())
    }

    /// Unregisters `service`, dropping its keys, cache entry and grants.
    ///
    /// Returns whether the service was registered.
    pub async fn remove_service(&self, service: &str) -> Result<bool> {
        let _op = self.enter().await?;
        let service = ServiceId::new(service)?;

        let removed = self.rotation.remove(&service);
        self.storage.delete(&cache_key(&service));
        self.permissions.revoke_service(&service);
        Ok(removed)
    }

    /// Credential, permission, monitoring and cache overview
    pub async fn generate_report(&self) -> Result<LifecycleReport> {
        let _op = self.enter().await?;

        let services = self.rotation.summaries();
        Ok(LifecycleReport {
            credential_count: services.len(),
            services,
            permissions: self.permissions.generate_permissions_report(),
            monitoring: MonitoringSummary {
                snapshot: self.monitor.current_snapshot(),
                active_alerts: self.monitor.alerts().len(),
                events_published: self.monitor.events_published(),
            },
            storage: self.storage.get_stats(),
            generated_at: self.clock.now(),
        })
    }

    /// Stops background tasks and wipes the cache.
    ///
    /// Waits for operations already in progress, then cancels and joins every
    /// background task. Idempotent: concurrent and repeated callers all return
    /// only once shutdown has completed. Later operations return
    /// [`CredentialError::Stopped`].
    pub async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);

        self.stopped_complete
            .get_or_init(|| async {
                let _exclusive = self.gate.write().await;
                self.shutdown.cancel();

                let tasks = std::mem::take(&mut *self.tasks.lock());
                for task in tasks {
                    if let Err(error) = task.await {
                        tracing::error!(%error, "background task failed during shutdown");
                    }
                }
                self.storage.clear();

                tracing::info!("lifecycle manager stopped");
            })
            .await;
        Ok(())
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Bootstrap secret validation
    pub fn secrets(&self) -> &SecretManager {
        &self.secrets
    }

    /// Module access table
    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    /// Metrics and alerts
    pub fn monitor(&self) -> &Arc<MonitoringService> {
        &self.monitor
    }

    /// Key records and rotation
    pub fn rotation(&self) -> &Arc<KeyRotationManager> {
        &self.rotation
    }

    /// Encrypted key cache
    pub fn storage(&self) -> &Arc<SecureMemoryStorage> {
        &self.storage
    }

    async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>> {
        if self.is_stopped() {
            return Err(CredentialError::Stopped);
        }
        let guard = self.gate.read().await;
        // `stop` may have completed while this call waited for the gate.
        if self.is_stopped() {
            return Err(CredentialError::Stopped);
        }
        Ok(guard)
    }

    fn schedule_for(&self, service: &ServiceId) -> RotationSchedule {
        self.config
            .service(service)
            .map_or_else(|| self.config.rotation.defaults(), |s| s.schedule())
    }
}
