//! Error types for API key lifecycle operations
//!
//! The hierarchy mirrors how failures are handled at runtime:
//! - [`CredentialError`]: top-level error returned by the lifecycle manager
//! - [`ConfigurationError`]: fatal at startup (missing or weak secrets, bad config)
//! - [`CryptoError`]: encryption, decryption, key derivation
//! - [`ValidationError`]: malformed service or module identifiers
//! - [`RotationError`](crate::rotation::RotationError): a single rotation attempt failed
//!
//! Decryption failures inside the secure cache never surface here; the cache
//! treats them as a miss and evicts the entry.
//!
//! # Error Conversion Examples
//!
//! ```
//! use keyward_credential::core::{CredentialError, ValidationError};
//!
//! let err: CredentialError = ValidationError::EmptyIdentifier { kind: "service" }.into();
//! assert!(err.to_string().contains("service"));
//! ```

use thiserror::Error;

use crate::rotation::RotationError;

/// Top-level lifecycle error
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Configuration or startup secret problem
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Module is not allowed to read the service's key
    #[error("Module '{module}' is not permitted to access service '{service}'")]
    PermissionDenied {
        /// Requesting module
        module: String,
        /// Requested service
        service: String,
    },

    /// No key material is available for the service
    #[error("No API key available for service '{service}'")]
    KeyUnavailable {
        /// Service identifier
        service: String,
    },

    /// Cryptographic error
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Rotation attempt failed
    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Credential source could not be read
    #[error("Credential source failed for service '{service}': {reason}")]
    Source {
        /// Service identifier
        service: String,
        /// Failure description
        reason: String,
    },

    /// The lifecycle manager has been stopped
    #[error("Lifecycle manager has been stopped")]
    Stopped,
}

impl CredentialError {
    /// Whether retrying the same call later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyUnavailable { .. } | Self::Source { .. })
    }
}

/// Configuration and startup errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// One or more required secrets are not set
    #[error("Missing required secrets: {}", missing.join(", "))]
    MissingSecrets {
        /// Names of the missing secrets
        missing: Vec<String>,
    },

    /// A required secret does not meet the strength policy
    #[error("Secret '{name}' is too weak: {reason}")]
    WeakSecret {
        /// Secret name
        name: String,
        /// Human-readable reason
        reason: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Cryptographic operation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Decryption failed: wrong key, wrong associated data, or corrupted data
    #[error("Decryption failed - invalid key or corrupted data")]
    DecryptionFailed,

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Cached value could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Identifier validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Identifier cannot be empty
    #[error("{kind} identifier cannot be empty")]
    EmptyIdentifier {
        /// Identifier kind ("service" or "module")
        kind: &'static str,
    },

    /// Invalid identifier
    #[error("Invalid {kind} identifier '{id}': {reason}")]
    InvalidIdentifier {
        /// Identifier kind ("service" or "module")
        kind: &'static str,
        /// The rejected value
        id: String,
        /// Reason for invalidity
        reason: String,
    },
}

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, CredentialError>;
