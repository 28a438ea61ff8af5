//! Per-service rotation state files and backups
//!
//! Layout under the keys directory:
//!
//! ```text
//! <dir>/<service>.json                              current state
//! <dir>/backups/<service>.<timestamp>.v<version>.json   previous states
//! ```
//!
//! Only metadata is written (key ids, schedule, grace window), never key
//! material. Writes go through a temp file and an atomic rename; the file
//! being replaced is copied into `backups/` first and only the newest
//! backups are retained.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::error::RotationError;
use super::slot::{KeyId, ServiceCredential};
use crate::config::RotationSchedule;
use crate::core::ServiceId;

/// Backups retained per service
pub const DEFAULT_MAX_BACKUPS: usize = 10;

const BACKUP_DIR: &str = "backups";

/// On-disk form of a [`ServiceCredential`] without key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedServiceState {
    pub service: ServiceId,
    pub active_key_id: KeyId,
    pub retiring_key_id: Option<KeyId>,
    pub retire_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    pub auto_rotate: bool,
    pub next_rotation_at: DateTime<Utc>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl PersistedServiceState {
    /// Schedule stored in the file
    pub fn schedule(&self) -> RotationSchedule {
        RotationSchedule {
            rotation_interval: self.rotation_interval,
            grace_period: self.grace_period,
            auto_rotate: self.auto_rotate,
        }
    }
}

impl From<&ServiceCredential> for PersistedServiceState {
    fn from(record: &ServiceCredential) -> Self {
        let schedule = record.schedule();
        Self {
            service: record.service().clone(),
            active_key_id: record.active().id().clone(),
            retiring_key_id: record.retiring().map(|r| r.key.id().clone()),
            retire_at: record.retiring().map(|r| r.retire_at),
            rotation_interval: schedule.rotation_interval,
            grace_period: schedule.grace_period,
            auto_rotate: schedule.auto_rotate,
            next_rotation_at: record.next_rotation_at(),
            version: record.version(),
            updated_at: record.updated_at(),
        }
    }
}

/// Reads and writes state files under one directory
#[derive(Debug, Clone)]
pub struct StatePersistence {
    dir: PathBuf,
    max_backups: usize,
}

impl StatePersistence {
    /// Persistence rooted at `dir`, keeping [`DEFAULT_MAX_BACKUPS`] backups
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }

    /// Overrides the number of retained backups
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a service's current state file
    pub fn state_path(&self, service: &ServiceId) -> PathBuf {
        self.dir.join(format!("{service}.json"))
    }

    /// Writes `state`, backing up the file it replaces
    pub async fn save(&self, state: &PersistedServiceState) -> Result<(), RotationError> {
        let service = &state.service;
        let fail = |reason: String| RotationError::Persistence {
            service: service.clone(),
            reason,
        };

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| fail(format!("create {}: {e}", self.dir.display())))?;

        let path = self.state_path(service);
        match fs::read(&path).await {
            Ok(previous) => self.backup(service, &previous).await?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(fail(format!("read {}: {e}", path.display()))),
        }

        let json = serde_json::to_vec_pretty(state).map_err(|e| fail(e.to_string()))?;
        let tmp = self.dir.join(format!(".{service}.json.tmp"));
        fs::write(&tmp, &json)
            .await
            .map_err(|e| fail(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| fail(format!("rename to {}: {e}", path.display())))?;

        tracing::debug!(%service, version = state.version, "rotation state saved");
        Ok(())
    }

    /// Reads a service's state; `None` when no file exists
    pub async fn load(
        &self,
        service: &ServiceId,
    ) -> Result<Option<PersistedServiceState>, RotationError> {
        let path = self.state_path(service);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RotationError::Persistence {
                    service: service.clone(),
                    reason: format!("read {}: {e}", path.display()),
                });
            }
        };

        let state: PersistedServiceState =
            serde_json::from_slice(&bytes).map_err(|e| RotationError::Persistence {
                service: service.clone(),
                reason: format!("parse {}: {e}", path.display()),
            })?;

        if &state.service != service {
            return Err(RotationError::Persistence {
                service: service.clone(),
                reason: format!("{} belongs to {}", path.display(), state.service),
            });
        }
        Ok(Some(state))
    }

    /// Backup files for `service`, oldest first
    pub async fn backups(&self, service: &ServiceId) -> Result<Vec<PathBuf>, RotationError> {
        let dir = self.dir.join(BACKUP_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RotationError::Persistence {
                    service: service.clone(),
                    reason: format!("list {}: {e}", dir.display()),
                });
            }
        };

        // '.' never appears in a service id, so the prefix is unambiguous
        let prefix = format!("{service}.");
        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            RotationError::Persistence {
                service: service.clone(),
                reason: format!("list {}: {e}", dir.display()),
            }
        })? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                backups.push(entry.path());
            }
        }
        // Timestamps are zero-padded, so name order is chronological.
        backups.sort();
        Ok(backups)
    }

    async fn backup(&self, service: &ServiceId, previous: &[u8]) -> Result<(), RotationError> {
        let fail = |reason: String| RotationError::Persistence {
            service: service.clone(),
            reason,
        };
        let dir = self.dir.join(BACKUP_DIR);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| fail(format!("create {}: {e}", dir.display())))?;

        let name = match serde_json::from_slice::<PersistedServiceState>(previous) {
            Ok(prev) => format!(
                "{service}.{}.v{:010}.json",
                prev.updated_at.format("%Y%m%dT%H%M%S%.6fZ"),
                prev.version
            ),
            Err(_) => format!("{service}.{}.unparsed.json", Utc::now().format("%Y%m%dT%H%M%S%.6fZ")),
        };
        let path = dir.join(name);
        fs::write(&path, previous)
            .await
            .map_err(|e| fail(format!("write {}: {e}", path.display())))?;

        let backups = self.backups(service).await?;
        let excess = backups.len().saturating_sub(self.max_backups);
        for old in &backups[..excess] {
            if let Err(e) = fs::remove_file(old).await {
                tracing::warn!(%service, path = %old.display(), error = %e, "failed to prune backup");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SecretString;
    use pretty_assertions::assert_eq;

    fn record(service: &str) -> ServiceCredential {
        ServiceCredential::new(
            ServiceId::new(service).unwrap(),
            SecretString::new("key-0"),
            RotationSchedule {
                rotation_interval: Duration::from_secs(3600),
                grace_period: Duration::from_secs(60),
                auto_rotate: true,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let state = PersistedServiceState::from(&record("mapbox"));

        persistence.save(&state).await.unwrap();
        let loaded = persistence.load(&state.service).await.unwrap();
        assert_eq!(loaded, Some(state));
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let loaded = persistence
            .load(&ServiceId::new("strava").unwrap())
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_file_contains_no_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let rotated = record("mapbox").rotated(SecretString::new("key-1"), Utc::now());
        persistence
            .save(&PersistedServiceState::from(&rotated))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(persistence.state_path(rotated.service())).unwrap();
        assert!(!raw.contains("key-0"));
        assert!(!raw.contains("key-1"));
        assert!(raw.contains(rotated.active().id().as_str()));
    }

    #[tokio::test]
    async fn test_backups_are_pruned_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path()).with_max_backups(3);

        let mut current = record("mapbox");
        persistence
            .save(&PersistedServiceState::from(&current))
            .await
            .unwrap();
        for i in 1..=6 {
            current = current.rotated(SecretString::new(format!("key-{i}")), Utc::now());
            persistence
                .save(&PersistedServiceState::from(&current))
                .await
                .unwrap();
        }

        let backups = persistence.backups(current.service()).await.unwrap();
        assert_eq!(backups.len(), 3);
        let newest = backups.last().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(newest.ends_with(".v0000000006.json"), "{newest}");
    }

    #[tokio::test]
    async fn test_backups_are_per_service() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        for service in ["map", "map-box"] {
            let state = PersistedServiceState::from(&record(service));
            persistence.save(&state).await.unwrap();
            persistence.save(&state).await.unwrap();
        }
        let map = ServiceId::new("map").unwrap();
        assert_eq!(persistence.backups(&map).await.unwrap().len(), 1);
    }
}
