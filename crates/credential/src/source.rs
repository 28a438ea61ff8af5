//! Source of truth for API keys
//!
//! The lifecycle manager loads each service's active key from a
//! [`CredentialSource`] at startup (and again on a cache miss for a service
//! it does not hold yet), and asks it for a replacement when rotating and
//! nothing has been staged through `add_key`.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::ServiceConfig;
use crate::core::{CredentialError, SecretString, ServiceId};

/// Suffix of the env var holding a service's next key
pub const NEXT_KEY_SUFFIX: &str = "_NEXT";

/// Where active and replacement keys come from
#[async_trait]
pub trait CredentialSource: Send + Sync + std::fmt::Debug {
    /// Current key for `service`, `None` when it is not configured
    async fn load(&self, service: &ServiceId) -> Result<Option<SecretString>, CredentialError>;

    /// Key to rotate to, `None` when the source cannot supply one
    async fn replacement(
        &self,
        service: &ServiceId,
    ) -> Result<Option<SecretString>, CredentialError> {
        let _ = service;
        Ok(None)
    }
}

/// Reads keys from the env vars named in the service config.
///
/// `<ENV_VAR>_NEXT`, when set, is offered as the replacement key.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialSource {
    vars: HashMap<ServiceId, String>,
}

impl EnvCredentialSource {
    /// Source for the given services
    pub fn new<'a>(services: impl IntoIterator<Item = &'a ServiceConfig>) -> Self {
        Self {
            vars: services
                .into_iter()
                .map(|s| (s.id.clone(), s.env_var.clone()))
                .collect(),
        }
    }

    fn read(name: &str) -> Option<SecretString> {
        std::env::var(name)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(SecretString::new)
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn load(&self, service: &ServiceId) -> Result<Option<SecretString>, CredentialError> {
        Ok(self.vars.get(service).and_then(|var| Self::read(var)))
    }

    async fn replacement(
        &self,
        service: &ServiceId,
    ) -> Result<Option<SecretString>, CredentialError> {
        Ok(self
            .vars
            .get(service)
            .and_then(|var| Self::read(&format!("{var}{NEXT_KEY_SUFFIX}"))))
    }
}

/// In-memory keys, for tests and embedding
#[derive(Debug, Default)]
pub struct StaticCredentialSource {
    keys: DashMap<ServiceId, SecretString>,
    replacements: DashMap<ServiceId, VecDeque<SecretString>>,
}

impl StaticCredentialSource {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the active key for `service`
    pub fn with_key(self, service: ServiceId, key: impl Into<String>) -> Self {
        self.keys.insert(service, SecretString::new(key));
        self
    }

    /// Sets or replaces the active key
    pub fn set_key(&self, service: ServiceId, key: SecretString) {
        self.keys.insert(service, key);
    }

    /// Queues a replacement key, handed out once
    pub fn push_replacement(&self, service: ServiceId, key: SecretString) {
        self.replacements.entry(service).or_default().push_back(key);
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn load(&self, service: &ServiceId) -> Result<Option<SecretString>, CredentialError> {
        Ok(self.keys.get(service).map(|key| key.clone()))
    }

    async fn replacement(
        &self,
        service: &ServiceId,
    ) -> Result<Option<SecretString>, CredentialError> {
        Ok(self
            .replacements
            .get_mut(service)
            .and_then(|mut queue| queue.pop_front()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str) -> ServiceId {
        ServiceId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_static_source_hands_out_replacements_once() {
        let source = StaticCredentialSource::new().with_key(service("mapbox"), "pk.live");
        source.push_replacement(service("mapbox"), SecretString::new("pk.next"));

        let active = source.load(&service("mapbox")).await.unwrap().unwrap();
        assert_eq!(active, SecretString::new("pk.live"));

        let next = source.replacement(&service("mapbox")).await.unwrap();
        assert_eq!(next, Some(SecretString::new("pk.next")));
        assert_eq!(source.replacement(&service("mapbox")).await.unwrap(), None);
        assert_eq!(source.load(&service("strava")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_env_source_unknown_service() {
        let source = EnvCredentialSource::default();
        assert_eq!(source.load(&service("mapbox")).await.unwrap(), None);
        assert_eq!(source.replacement(&service("mapbox")).await.unwrap(), None);
    }
}
