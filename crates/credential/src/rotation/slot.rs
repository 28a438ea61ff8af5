//! Immutable per-service credential records
//!
//! A [`ServiceCredential`] is never mutated: rotation, schedule changes and
//! grace-window purges each produce a new record that replaces the old one
//! atomically. Every key is in exactly one [`KeyState`] relative to a record
//! and an instant.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RotationSchedule;
use crate::core::{SecretString, ServiceId, add_duration};

const KEY_ID_LENGTH: usize = 12;

/// Non-secret fingerprint of a key: the first 12 hex chars of its SHA-256
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Fingerprint of `secret`
    pub fn of(secret: &SecretString) -> Self {
        let digest = secret.expose_secret(|s| Sha256::digest(s.as_bytes()));
        let mut id = hex::encode(digest);
        id.truncate(KEY_ID_LENGTH);
        Self(id)
    }

    /// Fingerprint as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key together with its fingerprint
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    id: KeyId,
    secret: SecretString,
}

impl KeyMaterial {
    /// Wraps `secret`, computing its id
    pub fn new(secret: SecretString) -> Self {
        Self {
            id: KeyId::of(&secret),
            secret,
        }
    }

    /// Fingerprint
    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// Key value
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// Constant-time match against a presented key
    pub fn matches(&self, candidate: &SecretString) -> bool {
        self.secret.ct_eq(candidate)
    }
}

/// Previous active key, valid until `retire_at`
#[derive(Debug, Clone)]
pub struct RetiringKey {
    /// The superseded key
    pub key: KeyMaterial,
    /// End of the grace window (exclusive)
    pub retire_at: DateTime<Utc>,
}

/// Validity of a presented key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyState {
    /// The current key
    Active,
    /// The previous key, accepted until `until`
    Retiring {
        /// End of the grace window
        until: DateTime<Utc>,
    },
    /// Unknown, or past its grace window
    Revoked,
}

/// Snapshot of one service's keys and schedule
#[derive(Debug, Clone)]
pub struct ServiceCredential {
    service: ServiceId,
    active: KeyMaterial,
    retiring: Option<RetiringKey>,
    schedule: RotationSchedule,
    next_rotation_at: DateTime<Utc>,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl ServiceCredential {
    /// First record for a freshly loaded key
    pub fn new(
        service: ServiceId,
        key: SecretString,
        schedule: RotationSchedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            service,
            active: KeyMaterial::new(key),
            retiring: None,
            next_rotation_at: add_duration(now, schedule.rotation_interval),
            schedule,
            version: 1,
            updated_at: now,
        }
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn active(&self) -> &KeyMaterial {
        &self.active
    }

    pub fn retiring(&self) -> Option<&RetiringKey> {
        self.retiring.as_ref()
    }

    pub fn schedule(&self) -> RotationSchedule {
        self.schedule
    }

    pub fn next_rotation_at(&self) -> DateTime<Utc> {
        self.next_rotation_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// State of `key` at `now`
    pub fn state_of(&self, key: &SecretString, now: DateTime<Utc>) -> KeyState {
        if self.active.matches(key) {
            return KeyState::Active;
        }
        match &self.retiring {
            Some(retiring) if now < retiring.retire_at && retiring.key.matches(key) => {
                KeyState::Retiring {
                    until: retiring.retire_at,
                }
            }
            _ => KeyState::Revoked,
        }
    }

    /// Active, or retiring within its grace window
    pub fn is_valid_key(&self, key: &SecretString, now: DateTime<Utc>) -> bool {
        !matches!(self.state_of(key, now), KeyState::Revoked)
    }

    /// Whether the scheduler should rotate this service at `now`
    pub fn is_rotation_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule.auto_rotate && now >= self.next_rotation_at
    }

    /// New record with `replacement` active and the current key retiring.
    ///
    /// Any older retiring key is dropped. A zero grace period retires the
    /// current key immediately.
    #[must_use]
    pub fn rotated(&self, replacement: SecretString, now: DateTime<Utc>) -> Self {
        let retiring = (!self.schedule.grace_period.is_zero()).then(|| RetiringKey {
            key: self.active.clone(),
            retire_at: add_duration(now, self.schedule.grace_period),
        });

        Self {
            service: self.service.clone(),
            active: KeyMaterial::new(replacement),
            retiring,
            schedule: self.schedule,
            next_rotation_at: add_duration(now, self.schedule.rotation_interval),
            version: self.version + 1,
            updated_at: now,
        }
    }

    /// New record without the retiring key, if its window has closed
    pub fn without_expired_retiring(&self, now: DateTime<Utc>) -> Option<Self> {
        let expired = self
            .retiring
            .as_ref()
            .is_some_and(|retiring| now >= retiring.retire_at);
        expired.then(|| Self {
            retiring: None,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        })
    }

    /// New record with a different schedule; the next rotation is
    /// rescheduled from `now`
    #[must_use]
    pub fn with_schedule(&self, schedule: RotationSchedule, now: DateTime<Utc>) -> Self {
        Self {
            schedule,
            next_rotation_at: add_duration(now, schedule.rotation_interval),
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Record with persisted schedule metadata applied on top
    pub(crate) fn restored(
        self,
        schedule: RotationSchedule,
        next_rotation_at: DateTime<Utc>,
        version: u64,
    ) -> Self {
        Self {
            schedule,
            next_rotation_at,
            version,
            ..self
        }
    }

    /// Serializable view without key material
    pub fn summary(&self, now: DateTime<Utc>) -> ServiceSummary {
        let retiring = self
            .retiring
            .as_ref()
            .filter(|retiring| now < retiring.retire_at);
        ServiceSummary {
            service: self.service.clone(),
            active_key_id: self.active.id.clone(),
            retiring_key_id: retiring.map(|r| r.key.id.clone()),
            retire_at: retiring.map(|r| r.retire_at),
            rotation_interval: self.schedule.rotation_interval,
            grace_period: self.schedule.grace_period,
            auto_rotate: self.schedule.auto_rotate,
            next_rotation_at: self.next_rotation_at,
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// Key ids and schedule of one service, safe to log and report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub service: ServiceId,
    pub active_key_id: KeyId,
    pub retiring_key_id: Option<KeyId>,
    pub retire_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub rotation_interval: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub grace_period: std::time::Duration,
    pub auto_rotate: bool,
    pub next_rotation_at: DateTime<Utc>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}
