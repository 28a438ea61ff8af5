//! API key rotation
//!
//! - [`slot`]: immutable per-service records and the Active / Retiring / Revoked states
//! - [`manager`]: [`KeyRotationManager`], copy-on-write rotation per service
//! - [`scheduler`]: periodic due-rotation and grace-purge loop
//! - [`persistence`]: state files and backups under the keys directory

pub mod error;
pub mod manager;
pub mod persistence;
pub mod scheduler;
pub mod slot;

pub use error::{RotationError, RotationResult};
pub use manager::{AddKeyOutcome, KeyRotationManager, TickSummary};
pub use persistence::{DEFAULT_MAX_BACKUPS, PersistedServiceState, StatePersistence};
pub use scheduler::RotationScheduler;
pub use slot::{KeyId, KeyMaterial, KeyState, RetiringKey, ServiceCredential, ServiceSummary};
