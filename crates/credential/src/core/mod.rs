//! Core types shared by every lifecycle component

mod clock;
mod error;
mod id;
mod secret_string;

pub use clock::{Clock, ManualClock, SystemClock, add_duration, sub_duration};
pub use error::{ConfigurationError, CredentialError, CryptoError, Result, ValidationError};
pub use id::{ModuleId, ServiceId};
pub use secret_string::SecretString;

pub(crate) use secret_string::exposed;
