//! Service and module identifiers with validation
//!
//! Identifiers end up in cache keys, log fields and state file names, so
//! they are restricted to a filesystem- and log-safe alphabet.

use crate::core::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length for service and module identifiers
const MAX_ID_LENGTH: usize = 128;

fn validate(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyIdentifier { kind });
    }

    if id.len() > MAX_ID_LENGTH {
        return Err(ValidationError::InvalidIdentifier {
            kind,
            id: id.to_owned(),
            reason: format!("exceeds maximum length of {MAX_ID_LENGTH} characters"),
        });
    }

    // ASCII only: these end up in file names
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidIdentifier {
            kind,
            id: id.to_owned(),
            reason: "contains invalid characters (only alphanumeric, hyphens, underscores allowed)"
                .to_string(),
        });
    }

    Ok(())
}

/// Identifier of an external service whose API key is managed
/// (e.g. `openRouteService`, `mapbox`)
///
/// # Examples
///
/// ```
/// use keyward_credential::ServiceId;
///
/// let id = ServiceId::new("openRouteService").unwrap();
/// assert_eq!(id.as_str(), "openRouteService");
///
/// assert!(ServiceId::new("").is_err());
/// assert!(ServiceId::new("../etc/passwd").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    /// Creates a new validated service identifier
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        validate("service", &id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

impl TryFrom<String> for ServiceId {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for ServiceId {
    type Error = ValidationError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

/// Identifier of an application module that consumes API keys
/// (e.g. `route-module`, `admin`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

impl ModuleId {
    /// Creates a new validated module identifier
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        validate("module", &id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ModuleId> for String {
    fn from(id: ModuleId) -> Self {
        id.0
    }
}

impl TryFrom<String> for ModuleId {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for ModuleId {
    type Error = ValidationError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(ServiceId::new("openRouteService").is_ok());
        assert!(ServiceId::new("open_weather-2").is_ok());
        assert!(ModuleId::new("route-module").is_ok());
        assert!(ModuleId::new("a").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(matches!(
            ServiceId::new(""),
            Err(ValidationError::EmptyIdentifier { kind: "service" })
        ));
        assert!(matches!(
            ModuleId::new(""),
            Err(ValidationError::EmptyIdentifier { kind: "module" })
        ));
        assert!(matches!(
            ServiceId::new("../keys"),
            Err(ValidationError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            ServiceId::new("map box"),
            Err(ValidationError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            ModuleId::new("módulo"),
            Err(ValidationError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_length_limit() {
        assert!(ServiceId::new("a".repeat(MAX_ID_LENGTH)).is_ok());
        let result = ServiceId::new("a".repeat(MAX_ID_LENGTH + 1));
        if let Err(ValidationError::InvalidIdentifier { reason, .. }) = result {
            assert!(reason.contains("128"));
        } else {
            panic!("expected length violation");
        }
    }

    #[test]
    fn test_serde_roundtrip_and_rejection() {
        let id = ServiceId::new("mapbox").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"mapbox\"");
        assert_eq!(serde_json::from_str::<ServiceId>(&json).unwrap(), id);

        assert!(serde_json::from_str::<ModuleId>("\"bad/module\"").is_err());
    }
}
