//! Keyward Credential - API key lifecycle management
//!
//! Holds third-party API keys for the services an application talks to and
//! hands them to internal modules on a least-privilege basis.
//!
//! # Features
//!
//! - **Bootstrap secret validation** - missing secrets are fatal, weak ones configurable
//! - **Encrypted key cache** - AES-256-GCM with TTL and renew-on-read
//! - **Module permissions** - explicit module → service grants
//! - **Zero-downtime rotation** - Active / Retiring / Revoked keys with a grace window
//! - **Monitoring** - access, rotation and quota metrics with immediate alerts
//! - **Persistence** - per-service rotation state with bounded backups
#![forbid(unsafe_code)]

/// Configuration loading and validation
pub mod config;
/// Core types, errors, and primitives
pub mod core;
/// Authenticated encryption for the key cache
pub mod crypto;
/// Orchestrator and public API
pub mod lifecycle;
/// Tracing subscriber setup
pub mod logging;
pub mod monitoring;
/// Module → service access control
pub mod permissions;
pub mod rotation;
/// Bootstrap secret validation and generation
pub mod secrets;
pub mod source;
pub mod storage;

// ── Root re-exports ─────────────────────────────────────────────────────────
// Commonly-used types available directly as `keyward_credential::TypeName`.

pub use crate::core::{
    Clock, ConfigurationError, CredentialError, CryptoError, ManualClock, ModuleId, Result,
    SecretString, ServiceId, SystemClock, ValidationError,
};

pub use crate::config::{LifecycleConfig, RotationSchedule};
pub use crate::lifecycle::{LifecycleBuilder, LifecycleManager, LifecycleReport};
pub use crate::rotation::{AddKeyOutcome, KeyState, RotationError, RotationResult};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::core::{
        Clock, CredentialError, ModuleId, Result, SecretString, ServiceId, SystemClock,
    };

    pub use crate::config::{LifecycleConfig, RotationSchedule};
    pub use crate::lifecycle::{LifecycleManager, LifecycleReport};

    pub use crate::monitoring::{Alert, AlertKind, MonitorEvent, MonitoringService, ReportPeriod};
    pub use crate::permissions::PermissionRegistry;
    pub use crate::rotation::{AddKeyOutcome, KeyRotationManager, KeyState, RotationError};
    pub use crate::secrets::{SecretManager, SecretSource};
    pub use crate::source::{CredentialSource, EnvCredentialSource, StaticCredentialSource};
    pub use crate::storage::{SecureMemoryStorage, StorageStats};
}
