//! TTL-bounded, AEAD-encrypted in-memory cache
//!
//! Values are serialized to JSON, sealed with the storage cipher (the entry
//! key is bound as associated data), and kept in a [`DashMap`]. Reads slide
//! the expiry forward by the entry's TTL. Entries that fail authentication
//! are dropped and reported as misses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::{Clock, CryptoError, add_duration};
use crate::crypto::{Cipher, SealedBox};

struct MemoryEntry {
    sealed: SealedBox,
    ttl: Duration,
    expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn size(&self, key: &str) -> usize {
        key.len() + self.sealed.size() + std::mem::size_of::<Self>()
    }
}

/// Point-in-time storage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StorageStats {
    /// Entries that have not expired
    pub active: usize,
    /// Expired entries not yet swept
    pub expired: usize,
    /// Approximate heap + inline bytes held by entries
    pub approximate_bytes: usize,
    /// Successful reads
    pub hits: u64,
    /// Reads that found nothing usable
    pub misses: u64,
    /// Entries removed because they expired or failed authentication
    pub evictions: u64,
}

impl StorageStats {
    /// Hit rate in `0.0..=1.0`; `0.0` before any read
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Encrypted, TTL-bounded key/value cache
pub struct SecureMemoryStorage {
    entries: DashMap<String, MemoryEntry>,
    cipher: Arc<dyn Cipher>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for SecureMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureMemoryStorage")
            .field("entries", &self.entries.len())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl SecureMemoryStorage {
    /// Creates an empty storage sealing entries with `cipher`
    pub fn new(cipher: Arc<dyn Cipher>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            cipher,
            clock,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Encrypts and stores `value`, replacing any previous entry.
    ///
    /// `ttl` defaults to the storage TTL.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CryptoError> {
        let plaintext = zeroize::Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| CryptoError::Serialization(e.to_string()))?,
        );
        let sealed = self.cipher.seal(&plaintext, key.as_bytes())?;
        let ttl = ttl.unwrap_or(self.default_ttl);

        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                sealed,
                ttl,
                expires_at: add_duration(self.clock.now(), ttl),
            },
        );
        Ok(())
    }

    /// Decrypts the value under `key`, renewing its expiry.
    ///
    /// Returns `None` when the entry is absent, expired, fails
    /// authentication, or does not decode as `T`; the last three evict it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(now) {
            drop(entry);
            self.evict_if(key, |e| e.is_expired(now));
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let decoded = self
            .cipher
            .open(&entry.sealed, key.as_bytes())
            .and_then(|plaintext| {
                serde_json::from_slice::<T>(&plaintext)
                    .map_err(|e| CryptoError::Serialization(e.to_string()))
            });

        match decoded {
            Ok(value) => {
                entry.expires_at = add_duration(now, entry.ttl);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(error) => {
                let nonce = entry.sealed.nonce;
                drop(entry);
                tracing::warn!(key, %error, "discarding unreadable cache entry");
                // Only evict the entry we failed on, not a concurrent rewrite.
                self.evict_if(key, |e| e.sealed.nonce == nonce);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a non-expired entry exists; expired entries are evicted
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return false,
        };
        if expired {
            self.evict_if(key, |e| e.is_expired(now));
        }
        !expired
    }

    /// Removes an entry; returns whether it existed
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Sweeps expired entries; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Current statistics
    pub fn get_stats(&self) -> StorageStats {
        let now = self.clock.now();
        let mut stats = StorageStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ..StorageStats::default()
        };
        for entry in &self.entries {
            if entry.is_expired(now) {
                stats.expired += 1;
            } else {
                stats.active += 1;
            }
            stats.approximate_bytes += entry.size(entry.key());
        }
        stats
    }

    /// Spawns the periodic sweep; it exits when `shutdown` is cancelled
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("storage sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = storage.cleanup();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired cache entries");
                        }
                    }
                }
            }
        })
    }

    fn evict_if(&self, key: &str, predicate: impl FnOnce(&MemoryEntry) -> bool) {
        if self.entries.remove_if(key, |_, e| predicate(e)).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, SecretString};
    use crate::crypto::{AesGcmCipher, SequenceNonceSource, STORAGE_KEY_CONTEXT, derive_storage_key};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    fn storage(ttl: Duration) -> (SecureMemoryStorage, Arc<ManualClock>) {
        let key = derive_storage_key(
            &SecretString::new("Unit-Test-Master-Secret-0123456789-abcdef"),
            STORAGE_KEY_CONTEXT,
        )
        .unwrap();
        let cipher = AesGcmCipher::with_nonce_source(&key, Arc::new(SequenceNonceSource::new(*b"unit")))
            .unwrap();
        let clock = Arc::new(ManualClock::default());
        (
            SecureMemoryStorage::new(Arc::new(cipher), clock.clone(), ttl),
            clock,
        )
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (storage, _) = storage(Duration::from_secs(60));
        storage.set("k", &vec![1u32, 2, 3], None).unwrap();
        assert_eq!(storage.get::<Vec<u32>>("k"), Some(vec![1, 2, 3]));
        assert_eq!(storage.get::<Vec<u32>>("missing"), None);

        let stats = storage.get_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Nested {
        id: String,
        tags: BTreeMap<String, Vec<u32>>,
        inner: Option<Box<Nested>>,
    }

    #[test]
    fn test_nested_values_roundtrip() {
        let (storage, _) = storage(Duration::from_secs(60));
        let value = Nested {
            id: "outer".to_string(),
            tags: BTreeMap::from([("a".to_string(), vec![1, 2]), ("b".to_string(), vec![])]),
            inner: Some(Box::new(Nested {
                id: "inner".to_string(),
                tags: BTreeMap::new(),
                inner: None,
            })),
        };
        storage.set("nested", &value, None).unwrap();
        assert_eq!(storage.get::<Nested>("nested"), Some(value));

        let json = serde_json::json!({
            "key_id": "k-1",
            "key": "sk-live-0123",
            "meta": { "scopes": ["read", "write"], "quota": null },
        });
        storage.set("json", &json, None).unwrap();
        assert_eq!(storage.get::<serde_json::Value>("json"), Some(json));
    }

    #[test]
    fn test_expired_entry_is_evicted_on_read() {
        let (storage, clock) = storage(Duration::from_secs(10));
        storage.set("k", &"v", None).unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(storage.get::<String>("k"), None);
        assert!(storage.entries.is_empty());
        assert_eq!(storage.get_stats().evictions, 1);
    }

    #[test]
    fn test_read_slides_expiry() {
        let (storage, clock) = storage(Duration::from_secs(10));
        storage.set("k", &"v", None).unwrap();

        for _ in 0..5 {
            clock.advance(Duration::from_secs(9));
            assert_eq!(storage.get::<String>("k").as_deref(), Some("v"));
        }

        clock.advance(Duration::from_secs(10));
        assert!(!storage.has("k"));
    }

    #[test]
    fn test_custom_ttl_renews_with_own_ttl() {
        let (storage, clock) = storage(Duration::from_secs(60));
        storage.set("short", &1u8, Some(Duration::from_secs(2))).unwrap();

        clock.advance(Duration::from_secs(1));
        assert_eq!(storage.get::<u8>("short"), Some(1));
        clock.advance(Duration::from_secs(2));
        assert_eq!(storage.get::<u8>("short"), None);
    }

    #[test]
    fn test_tampered_entry_is_a_miss() {
        let (storage, _) = storage(Duration::from_secs(60));
        storage.set("k", &"v", None).unwrap();
        storage.entries.get_mut("k").unwrap().sealed.tag[3] ^= 0xff;

        assert_eq!(storage.get::<String>("k"), None);
        assert!(!storage.has("k"));
    }

    #[test]
    fn test_ciphertext_does_not_contain_plaintext() {
        let (storage, _) = storage(Duration::from_secs(60));
        storage.set("k", &"plain-api-key", None).unwrap();
        let entry = storage.entries.get("k").unwrap();
        assert!(
            !entry
                .sealed
                .ciphertext
                .windows(b"plain-api-key".len())
                .any(|w| w == b"plain-api-key")
        );
    }

    #[test]
    fn test_each_write_uses_fresh_nonce() {
        let (storage, _) = storage(Duration::from_secs(60));
        storage.set("k", &"v", None).unwrap();
        let first = storage.entries.get("k").unwrap().sealed.nonce;
        storage.set("k", &"v", None).unwrap();
        let second = storage.entries.get("k").unwrap().sealed.nonce;
        assert_ne!(first, second);
    }

    #[test]
    fn test_cleanup_counts_removed() {
        let (storage, clock) = storage(Duration::from_secs(10));
        storage.set("a", &1u8, None).unwrap();
        storage.set("b", &2u8, None).unwrap();
        storage.set("c", &3u8, Some(Duration::from_secs(100))).unwrap();

        clock.advance(Duration::from_secs(11));
        let stats = storage.get_stats();
        assert_eq!((stats.active, stats.expired), (1, 2));
        assert!(stats.approximate_bytes > 0);

        assert_eq!(storage.cleanup(), 2);
        assert_eq!(storage.cleanup(), 0);
        assert!(storage.has("c"));
    }

    #[test]
    fn test_delete_and_clear() {
        let (storage, _) = storage(Duration::from_secs(10));
        storage.set("a", &1u8, None).unwrap();
        storage.set("b", &2u8, None).unwrap();
        assert!(storage.delete("a"));
        assert!(!storage.delete("a"));
        storage.clear();
        assert_eq!(storage.get_stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_on_cancel() {
        let (storage, _) = storage(Duration::from_secs(10));
        let storage = Arc::new(storage);
        let token = CancellationToken::new();
        let handle = storage.spawn_cleanup(Duration::from_millis(50), token.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
