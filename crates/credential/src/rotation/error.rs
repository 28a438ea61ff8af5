//! Rotation-specific error types

use thiserror::Error;

use crate::core::ServiceId;

/// Errors from a single rotation or schedule change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    /// Neither a staged key nor the credential source supplied a replacement
    #[error("No replacement key available for {service}")]
    NoReplacementKey { service: ServiceId },

    /// Service is not registered with the rotation manager
    #[error("Service {service} is not registered")]
    UnknownService { service: ServiceId },

    /// The replacement is identical to the active key
    #[error("Replacement key for {service} matches the active key")]
    ReplacementMatchesActive { service: ServiceId },

    /// Schedule values are unusable
    #[error("Invalid rotation config for {service}: {reason}")]
    InvalidConfig { service: ServiceId, reason: String },

    /// The credential source failed while fetching a replacement
    #[error("Credential source failed for {service}: {reason}")]
    Source { service: ServiceId, reason: String },

    /// State file could not be read or written
    #[error("Rotation state persistence failed for {service}: {reason}")]
    Persistence { service: ServiceId, reason: String },
}

impl RotationError {
    /// Service the error refers to
    pub fn service(&self) -> &ServiceId {
        match self {
            Self::NoReplacementKey { service }
            | Self::UnknownService { service }
            | Self::ReplacementMatchesActive { service }
            | Self::InvalidConfig { service, .. }
            | Self::Source { service, .. }
            | Self::Persistence { service, .. } => service,
        }
    }
}

/// Result type for rotation operations
pub type RotationResult<T> = Result<T, RotationError>;
