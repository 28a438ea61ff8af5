use std::sync::Arc;

use crate::config::LifecycleConfig;
use crate::core::{Clock, SystemClock};
use crate::crypto::NonceSource;
use crate::secrets::{EnvSecretSource, SecretSource};
use crate::source::{CredentialSource, EnvCredentialSource};

use super::LifecycleManager;

/// Builder for [`LifecycleManager`]
///
/// Every collaborator has a production default: secrets and keys come from
/// the process environment, time from the system clock, nonces from the OS.
///
/// ```no_run
/// use keyward_credential::LifecycleManager;
/// use keyward_credential::config::LifecycleConfig;
///
/// # async fn example() -> keyward_credential::Result<()> {
/// let manager = LifecycleManager::builder()
///     .config(LifecycleConfig::load(None)?)
///     .initialize()
///     .await?;
/// let key = manager.get_api_key("mapbox", "map-module").await?;
/// manager.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LifecycleBuilder {
    pub(super) config: LifecycleConfig,
    pub(super) secret_source: Option<Arc<dyn SecretSource>>,
    pub(super) credential_source: Option<Arc<dyn CredentialSource>>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) nonce_source: Option<Arc<dyn NonceSource>>,
    pub(super) background_tasks: bool,
}

impl LifecycleBuilder {
    pub(super) fn new() -> Self {
        Self {
            config: LifecycleConfig::default(),
            secret_source: None,
            credential_source: None,
            clock: Arc::new(SystemClock),
            nonce_source: None,
            background_tasks: true,
        }
    }

    /// Configuration (defaults to [`LifecycleConfig::default`])
    #[must_use]
    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Where bootstrap secrets are read from
    #[must_use]
    pub fn secret_source(mut self, source: Arc<dyn SecretSource>) -> Self {
        self.secret_source = Some(source);
        self
    }

    /// Source of truth for service keys
    #[must_use]
    pub fn credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credential_source = Some(source);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Nonce source for the cache cipher
    #[must_use]
    pub fn nonce_source(mut self, nonces: Arc<dyn NonceSource>) -> Self {
        self.nonce_source = Some(nonces);
        self
    }

    /// Whether `initialize` spawns the cleanup, collector and scheduler
    /// tasks (default `true`). Tests driving time by hand turn this off.
    #[must_use]
    pub fn spawn_background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks = enabled;
        self
    }

    /// Validates configuration and secrets, loads every configured service
    /// and starts background tasks
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Configuration`](crate::CredentialError::Configuration)
    /// when the configuration is invalid or a required secret is missing or
    /// weak, and a source error when the credential source fails.
    pub async fn initialize(self) -> crate::Result<LifecycleManager> {
        LifecycleManager::initialize(self).await
    }

    pub(super) fn resolve_secret_source(&self) -> Arc<dyn SecretSource> {
        self.secret_source
            .clone()
            .unwrap_or_else(|| Arc::new(EnvSecretSource))
    }

    pub(super) fn resolve_credential_source(&self) -> Arc<dyn CredentialSource> {
        self.credential_source
            .clone()
            .unwrap_or_else(|| Arc::new(EnvCredentialSource::new(&self.config.services)))
    }
}

impl Default for LifecycleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
