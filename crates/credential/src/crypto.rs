//! AES-256-GCM sealing for cached API keys
//!
//! The storage key is never the master secret itself: [`derive_storage_key`]
//! runs HMAC-SHA256 keyed by the master secret over a fixed context label, so
//! the same master secret can feed other purposes without key reuse.
//!
//! Nonces come from an injectable [`NonceSource`]. Production uses
//! [`OsNonceSource`]; tests can use [`SequenceNonceSource`] for reproducible
//! output.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::core::{CryptoError, SecretString};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;
/// 96-bit GCM nonce
pub const NONCE_SIZE: usize = 12;
/// 128-bit GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Context label for the secure memory cache key
pub const STORAGE_KEY_CONTEXT: &str = "keyward/secure-memory-storage/v1";

/// Ciphertext plus the nonce and tag needed to open it
#[derive(Clone, PartialEq, Eq)]
pub struct SealedBox {
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
    /// Nonce used for this seal
    pub nonce: [u8; NONCE_SIZE],
    /// Authentication tag
    pub tag: [u8; TAG_SIZE],
}

impl SealedBox {
    /// Total bytes held by this box
    pub fn size(&self) -> usize {
        self.ciphertext.len() + NONCE_SIZE + TAG_SIZE
    }
}

impl fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBox")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("nonce", &hex::encode(self.nonce))
            .finish_non_exhaustive()
    }
}

/// Authenticated encryption used by the secure memory cache
pub trait Cipher: Send + Sync + fmt::Debug {
    /// Encrypts `plaintext`, binding it to `aad`
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox, CryptoError>;

    /// Decrypts and verifies a box sealed with the same `aad`
    fn open(&self, sealed: &SealedBox, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// Supplies a unique nonce for every seal
pub trait NonceSource: Send + Sync + fmt::Debug {
    /// Next nonce; must never repeat for the lifetime of a key
    fn next_nonce(&self) -> [u8; NONCE_SIZE];
}

/// Random nonces from the operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsNonceSource;

impl NonceSource for OsNonceSource {
    fn next_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }
}

/// Deterministic nonces: a 4-byte prefix followed by a big-endian counter
#[derive(Debug)]
pub struct SequenceNonceSource {
    prefix: [u8; 4],
    counter: AtomicU64,
}

impl SequenceNonceSource {
    /// Sequence starting at counter 0
    pub fn new(prefix: [u8; 4]) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }
}

impl NonceSource for SequenceNonceSource {
    fn next_nonce(&self) -> [u8; NONCE_SIZE] {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&count.to_be_bytes());
        nonce
    }
}

/// AES-256-GCM cipher with detached tags
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    nonces: Arc<dyn NonceSource>,
}

impl AesGcmCipher {
    /// Builds a cipher from a 32-byte key using OS-random nonces
    pub fn new(key: &[u8; KEY_SIZE]) -> Result<Self, CryptoError> {
        Self::with_nonce_source(key, Arc::new(OsNonceSource))
    }

    /// Builds a cipher with a custom nonce source
    pub fn with_nonce_source(
        key: &[u8; KEY_SIZE],
        nonces: Arc<dyn NonceSource>,
    ) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid AES-256 key: {e}")))?;
        Ok(Self { cipher, nonces })
    }
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("nonces", &self.nonces)
            .finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox, CryptoError> {
        let nonce = self.nonces.next_nonce();
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok(SealedBox {
            ciphertext: buffer,
            nonce,
            tag: tag_bytes,
        })
    }

    fn open(&self, sealed: &SealedBox, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&sealed.nonce),
                aad,
                buffer.as_mut_slice(),
                Tag::from_slice(&sealed.tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(buffer)
    }
}

/// One-way derivation of a 32-byte key from the master secret and a context label
pub fn derive_storage_key(
    master: &SecretString,
    context: &str,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    if master.is_empty() {
        return Err(CryptoError::KeyDerivation(
            "master secret is empty".to_string(),
        ));
    }

    let mut mac = master
        .expose_secret(|secret| <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(context.as_bytes());

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cipher() -> AesGcmCipher {
        let key = derive_storage_key(
            &SecretString::new("Master-Secret-For-Unit-Tests-0123456789!"),
            STORAGE_KEY_CONTEXT,
        )
        .unwrap();
        AesGcmCipher::new(&key).unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = cipher();
        let sealed = cipher.seal(b"ors-key-value", b"apikey:openRouteService").unwrap();
        assert_ne!(sealed.ciphertext.as_slice(), b"ors-key-value");

        let opened = cipher.open(&sealed, b"apikey:openRouteService").unwrap();
        assert_eq!(opened.as_slice(), b"ors-key-value");
    }

    #[test]
    fn test_tampered_tag_fails() {
        let cipher = cipher();
        let mut sealed = cipher.seal(b"payload", b"k").unwrap();
        sealed.tag[0] ^= 0x01;
        assert_eq!(cipher.open(&sealed, b"k"), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let cipher = cipher();
        let sealed = cipher.seal(b"payload", b"apikey:mapbox").unwrap();
        assert!(cipher.open(&sealed, b"apikey:strava").is_err());
    }

    #[test]
    fn test_each_seal_uses_fresh_nonce() {
        let cipher = cipher();
        let a = cipher.seal(b"same", b"k").unwrap();
        let b = cipher.seal(b"same", b"k").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_sequence_nonce_source_is_deterministic() {
        let source = SequenceNonceSource::new(*b"test");
        let first = source.next_nonce();
        let second = source.next_nonce();
        assert_eq!(&first[..4], b"test");
        assert_eq!(first[11], 0);
        assert_eq!(second[11], 1);
    }

    #[test]
    fn test_derivation_is_context_bound() {
        let master = SecretString::new("Master-Secret-For-Unit-Tests-0123456789!");
        let a = derive_storage_key(&master, "ctx-a").unwrap();
        let b = derive_storage_key(&master, "ctx-b").unwrap();
        let again = derive_storage_key(&master, "ctx-a").unwrap();
        assert_ne!(*a, *b);
        assert_eq!(*a, *again);
    }

    #[test]
    fn test_empty_master_rejected() {
        assert!(matches!(
            derive_storage_key(&SecretString::new(""), STORAGE_KEY_CONTEXT),
            Err(CryptoError::KeyDerivation(_))
        ));
    }
}
