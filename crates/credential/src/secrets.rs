//! Bootstrap secret validation and generation
//!
//! [`SecretManager`] checks that the secrets the process cannot run without
//! (the cache encryption key, the JWT signing secret) are present and strong
//! enough before anything else starts. A missing secret is always fatal; a
//! weak one is fatal only when strength is enforced.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;

use crate::config::SecretPolicy;
use crate::core::{ConfigurationError, SecretString};

/// Length used by `keyward generate-secret` when none is given
pub const DEFAULT_SECRET_LENGTH: usize = 48;

/// Shortest secret [`SecretManager::generate_strong_secret`] will produce.
/// Matches the default [`SecretPolicy::min_length`].
pub const MIN_GENERATED_LENGTH: usize = 32;

const MAX_GENERATION_ATTEMPTS: usize = 32;

/// Where bootstrap secrets are read from
pub trait SecretSource: Send + Sync + fmt::Debug {
    /// Returns the secret if it is set and non-empty
    fn read(&self, name: &str) -> Option<SecretString>;
}

/// Reads secrets from process environment variables
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn read(&self, name: &str) -> Option<SecretString> {
        std::env::var(name)
            .ok()
            .filter(|value| !value.is_empty())
            .map(SecretString::new)
    }
}

/// In-memory secrets, for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MapSecretSource {
    secrets: HashMap<String, SecretString>,
}

impl MapSecretSource {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), SecretString::new(value));
        self
    }
}

impl SecretSource for MapSecretSource {
    fn read(&self, name: &str) -> Option<SecretString> {
        self.secrets.get(name).filter(|s| !s.is_empty()).cloned()
    }
}

/// Result of checking that all required secrets exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredSecretsReport {
    /// `true` when nothing is missing
    pub valid: bool,
    /// Names of missing secrets, in policy order
    pub missing: Vec<String>,
}

/// Why a secret failed the strength check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrengthFailure {
    /// Secret is empty
    Missing,
    /// Shorter than the policy minimum
    TooShort {
        /// Actual length in characters
        length: usize,
        /// Required length
        required: usize,
    },
    /// Not enough distinct character classes
    TooFewClasses {
        /// Classes present
        classes: usize,
        /// Classes required
        required: usize,
    },
}

impl fmt::Display for StrengthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("secret is empty"),
            Self::TooShort { length, required } => {
                write!(f, "length {length} is below the minimum of {required}")
            }
            Self::TooFewClasses { classes, required } => write!(
                f,
                "uses {classes} character classes, at least {required} of lowercase, uppercase, digits and symbols are required"
            ),
        }
    }
}

/// Result of a strength check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrengthReport {
    /// `true` when the secret meets the policy
    pub valid: bool,
    /// Set when `valid` is `false`
    pub reason: Option<StrengthFailure>,
}

impl StrengthReport {
    fn pass() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn fail(reason: StrengthFailure) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// One line of [`SecretManager::audit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretAuditEntry {
    /// Secret name
    pub name: String,
    /// Whether the secret is set
    pub present: bool,
    /// Strength check, `None` when the secret is missing
    pub strength: Option<StrengthReport>,
}

/// Validates and generates bootstrap secrets
#[derive(Debug, Clone)]
pub struct SecretManager {
    policy: SecretPolicy,
    source: Arc<dyn SecretSource>,
}

impl SecretManager {
    /// Manager over `source` enforcing `policy`
    pub fn new(policy: SecretPolicy, source: Arc<dyn SecretSource>) -> Self {
        Self { policy, source }
    }

    /// Manager reading from the process environment
    pub fn from_env(policy: SecretPolicy) -> Self {
        Self::new(policy, Arc::new(EnvSecretSource))
    }

    /// Policy in effect
    pub fn policy(&self) -> &SecretPolicy {
        &self.policy
    }

    /// Reads a secret through the configured source
    pub fn secret(&self, name: &str) -> Option<SecretString> {
        self.source.read(name)
    }

    /// Checks that every required secret is present
    pub fn validate_required_secrets(&self) -> RequiredSecretsReport {
        let missing: Vec<String> = self
            .policy
            .required
            .iter()
            .filter(|name| self.source.read(name).is_none())
            .cloned()
            .collect();

        RequiredSecretsReport {
            valid: missing.is_empty(),
            missing,
        }
    }

    /// Reads `name` from the source and checks its strength
    pub fn validate_named_secret_strength(&self, name: &str) -> StrengthReport {
        match self.source.read(name) {
            Some(secret) => self.validate_secret_strength(&secret),
            None => StrengthReport::fail(StrengthFailure::Missing),
        }
    }

    /// Checks length and character-class diversity
    pub fn validate_secret_strength(&self, secret: &SecretString) -> StrengthReport {
        if secret.is_empty() {
            return StrengthReport::fail(StrengthFailure::Missing);
        }

        let (length, classes) = secret.expose_secret(|s| (s.chars().count(), character_classes(s)));
        if length < self.policy.min_length {
            return StrengthReport::fail(StrengthFailure::TooShort {
                length,
                required: self.policy.min_length,
            });
        }
        if classes < self.policy.min_entropy_classes {
            return StrengthReport::fail(StrengthFailure::TooFewClasses {
                classes,
                required: self.policy.min_entropy_classes,
            });
        }
        StrengthReport::pass()
    }

    /// Validates all required secrets.
    ///
    /// Missing secrets always fail. Weak secrets fail only when
    /// `throw_on_error` is set; otherwise they are logged and tolerated.
    pub fn initialize(&self, throw_on_error: bool) -> Result<(), ConfigurationError> {
        let required = self.validate_required_secrets();
        if !required.valid {
            tracing::error!(missing = ?required.missing, "required secrets are not set");
            return Err(ConfigurationError::MissingSecrets {
                missing: required.missing,
            });
        }

        for name in &self.policy.required {
            let Some(secret) = self.source.read(name) else {
                continue;
            };
            let report = self.validate_secret_strength(&secret);
            if let Some(reason) = report.reason {
                if throw_on_error {
                    tracing::error!(secret = %name, %reason, "secret rejected by strength policy");
                    return Err(ConfigurationError::WeakSecret {
                        name: name.clone(),
                        reason: reason.to_string(),
                    });
                }
                tracing::warn!(secret = %name, %reason, "weak secret accepted");
            }
        }

        tracing::info!(count = self.policy.required.len(), "required secrets validated");
        Ok(())
    }

    /// Presence and strength of every required secret; never fails
    pub fn audit(&self) -> Vec<SecretAuditEntry> {
        self.policy
            .required
            .iter()
            .map(|name| {
                let secret = self.source.read(name);
                SecretAuditEntry {
                    name: name.clone(),
                    present: secret.is_some(),
                    strength: secret.map(|s| self.validate_secret_strength(&s)),
                }
            })
            .collect()
    }

    /// Generates a URL-safe random secret of exactly `length` characters
    /// containing at least three character classes
    pub fn generate_strong_secret(length: usize) -> Result<SecretString, ConfigurationError> {
        if length < MIN_GENERATED_LENGTH {
            return Err(ConfigurationError::Invalid(format!(
                "generated secrets must be at least {MIN_GENERATED_LENGTH} characters"
            )));
        }

        // 3 random bytes encode to 4 characters
        let byte_len = length.div_ceil(4) * 3;
        let mut bytes = zeroize::Zeroizing::new(vec![0u8; byte_len]);

        for _ in 0..MAX_GENERATION_ATTEMPTS {
            OsRng.fill_bytes(&mut bytes);
            let mut encoded = URL_SAFE_NO_PAD.encode(bytes.as_slice());
            encoded.truncate(length);
            let candidate = SecretString::new(encoded);
            if candidate.expose_secret(character_classes) >= 3 {
                return Ok(candidate);
            }
        }

        Err(ConfigurationError::Invalid(
            "could not generate a secret with enough character classes".to_string(),
        ))
    }
}

fn character_classes(s: &str) -> usize {
    let lower = s.chars().any(|c| c.is_ascii_lowercase());
    let upper = s.chars().any(|c| c.is_ascii_uppercase());
    let digit = s.chars().any(|c| c.is_ascii_digit());
    let symbol = s.chars().any(|c| !c.is_ascii_alphanumeric());
    [lower, upper, digit, symbol].into_iter().filter(|&b| b).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const STRONG: &str = "Strong-Secret-Value-For-Tests-0123456789";

    fn manager(source: MapSecretSource) -> SecretManager {
        SecretManager::new(SecretPolicy::default(), Arc::new(source))
    }

    #[test]
    fn test_missing_secrets_reported_in_order() {
        let mgr = manager(MapSecretSource::new().with("JWT_SECRET", STRONG));
        assert_eq!(
            mgr.validate_required_secrets(),
            RequiredSecretsReport {
                valid: false,
                missing: vec!["API_KEYS_ENCRYPTION_KEY".to_string()],
            }
        );
    }

    #[rstest]
    #[case("", Some(StrengthFailure::Missing))]
    #[case("Short-1", Some(StrengthFailure::TooShort { length: 7, required: 32 }))]
    #[case(
        "alllowercaseandnothingelseatallxyz",
        Some(StrengthFailure::TooFewClasses { classes: 1, required: 3 })
    )]
    #[case("abcdefghijklmnopqrst", Some(StrengthFailure::TooShort { length: 20, required: 32 }))]
    #[case("lowercase-and-symbols-but-no-upper", Some(StrengthFailure::TooFewClasses { classes: 2, required: 3 }))]
    #[case("lowercase-and-symbols-and-Upper-case", None)]
    #[case(STRONG, None)]
    fn test_strength_policy(#[case] secret: &str, #[case] expected: Option<StrengthFailure>) {
        let report = manager(MapSecretSource::new()).validate_secret_strength(&SecretString::new(secret));
        assert_eq!(report.valid, expected.is_none());
        assert_eq!(report.reason, expected);
    }

    #[test]
    fn test_initialize_missing_is_always_fatal() {
        let mgr = manager(MapSecretSource::new());
        for throw_on_error in [true, false] {
            assert!(matches!(
                mgr.initialize(throw_on_error),
                Err(ConfigurationError::MissingSecrets { missing }) if missing.len() == 2
            ));
        }
    }

    #[test]
    fn test_initialize_weak_secret_depends_on_flag() {
        let mgr = manager(
            MapSecretSource::new()
                .with("API_KEYS_ENCRYPTION_KEY", STRONG)
                .with("JWT_SECRET", "weak"),
        );
        assert!(matches!(
            mgr.initialize(true),
            Err(ConfigurationError::WeakSecret { name, .. }) if name == "JWT_SECRET"
        ));
        assert!(mgr.initialize(false).is_ok());
    }

    #[test]
    fn test_audit_never_fails() {
        let mgr = manager(MapSecretSource::new().with("JWT_SECRET", "weak"));
        let audit = mgr.audit();
        assert_eq!(audit.len(), 2);
        assert!(!audit[0].present);
        assert!(audit[0].strength.is_none());
        assert!(audit[1].present);
        assert_eq!(audit[1].strength.as_ref().map(|s| s.valid), Some(false));
    }

    #[test]
    fn test_named_strength_reads_source() {
        let mgr = manager(
            MapSecretSource::new()
                .with("JWT_SECRET", STRONG)
                .with("API_KEYS_ENCRYPTION_KEY", "abcdefghijklmnopqrst"),
        );
        assert!(mgr.validate_named_secret_strength("JWT_SECRET").valid);
        assert_eq!(
            mgr.validate_named_secret_strength("API_KEYS_ENCRYPTION_KEY").reason,
            Some(StrengthFailure::TooShort { length: 20, required: 32 })
        );
        assert_eq!(
            mgr.validate_named_secret_strength("UNSET").reason,
            Some(StrengthFailure::Missing)
        );
    }

    #[rstest]
    #[case(MIN_GENERATED_LENGTH)]
    #[case(DEFAULT_SECRET_LENGTH)]
    #[case(97)]
    fn test_generated_secret_passes_policy(#[case] length: usize) {
        let secret = SecretManager::generate_strong_secret(length).unwrap();
        assert_eq!(secret.len(), length);
        assert!(secret.expose_secret(|s| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }));
        assert!(secret.expose_secret(character_classes) >= 3);

        let report = manager(MapSecretSource::new()).validate_secret_strength(&secret);
        assert!(report.valid, "{report:?}");
    }

    #[test]
    fn test_generated_secrets_differ() {
        let a = SecretManager::generate_strong_secret(48).unwrap();
        let b = SecretManager::generate_strong_secret(48).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_rejects_short_length() {
        assert!(SecretManager::generate_strong_secret(8).is_err());
        assert!(SecretManager::generate_strong_secret(MIN_GENERATED_LENGTH - 1).is_err());
    }
}
