//! Secret string type with automatic zeroization
//!
//! API keys and master secrets travel through the crate as [`SecretString`].
//! The value is only reachable inside an [`expose_secret`](SecretString::expose_secret)
//! closure, is redacted in `Debug`/`Display`/`Serialize`, and is zeroed on drop.

use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret string with automatic memory zeroization
///
/// # Examples
///
/// ```
/// use keyward_credential::SecretString;
///
/// let key = SecretString::new("ors-live-key");
/// assert_eq!(key.expose_secret(str::len), 12);
/// assert_eq!(format!("{key:?}"), "[REDACTED]");
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    /// Creates a new secret from any string-like value
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self { inner: s.into() }
    }

    /// Accesses the secret value within a closure scope
    pub fn expose_secret<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        f(&self.inner)
    }

    /// Returns the length without exposing content
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Checks if empty without exposing content
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Constant-time comparison against another secret
    pub fn ct_eq(&self, other: &Self) -> bool {
        self.inner.as_bytes().ct_eq(other.inner.as_bytes()).into()
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

impl Eq for SecretString {}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

// Redacted so reports and logs never carry key material.
impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

/// Serde adapter that writes the real secret value.
///
/// Only for payloads that are encrypted before they leave the process
/// (the secure memory cache). Use as `#[serde(with = "exposed")]`.
pub(crate) mod exposed {
    use super::SecretString;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        secret.expose_secret(|value| serializer.serialize_str(value))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::new)
    }
}
