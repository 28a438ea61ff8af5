//! Configuration for the API key lifecycle manager
//!
//! Loaded in layers: compiled defaults, an optional TOML file, then
//! `KEYWARD_`-prefixed environment variables (nested keys split on `__`,
//! e.g. `KEYWARD_STORAGE__TTL=10m`). `KEYS_DIRECTORY` is honoured as-is.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::{ConfigurationError, ModuleId, ServiceId};
use crate::logging::LogConfig;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Name of the secret the storage key is derived from
pub const ENCRYPTION_KEY_SECRET: &str = "API_KEYS_ENCRYPTION_KEY";
/// Name of the token-signing secret validated at startup
pub const JWT_SECRET: &str = "JWT_SECRET";

/// Complete lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Managed services and their rotation schedules
    pub services: Vec<ServiceConfig>,
    /// Secure memory cache
    pub storage: StorageConfig,
    /// Metrics and alerting
    pub monitoring: MonitoringConfig,
    /// Rotation scheduler
    pub rotation: RotationSettings,
    /// Bootstrap secret policy
    pub secrets: SecretPolicy,
    /// Module → service access table
    pub permissions: PermissionsConfig,
    /// Where per-service rotation state is persisted; `None` keeps state in memory only
    pub keys_directory: Option<PathBuf>,
    /// Logging
    pub log: LogConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        let services = [
            ("openRouteService", "OPENROUTE_API_KEY"),
            ("openWeather", "OPENWEATHER_API_KEY"),
            ("strava", "STRAVA_CLIENT_SECRET"),
            ("mapbox", "MAPBOX_SECRET_TOKEN"),
            ("openRouter", "OPENROUTER_API_KEY"),
        ]
        .into_iter()
        .filter_map(|(id, env_var)| Some(ServiceConfig::new(ServiceId::new(id).ok()?, env_var)))
        .collect();

        Self {
            services,
            storage: StorageConfig::default(),
            monitoring: MonitoringConfig::default(),
            rotation: RotationSettings::default(),
            secrets: SecretPolicy::default(),
            permissions: PermissionsConfig::default(),
            keys_directory: None,
            log: LogConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Loads defaults → `path` (if given) → environment, then validates
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigurationError::Invalid(format!(
                    "config file '{}' does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed("KEYWARD_").split("__"))
            .merge(
                Env::raw()
                    .only(&["KEYS_DIRECTORY"])
                    .map(|_| "keys_directory".into()),
            )
            .extract()
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Looks up a configured service
    pub fn service(&self, id: &ServiceId) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| &s.id == id)
    }

    /// Rejects configurations that would make timers spin or invariants unsatisfiable
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: String| Err(ConfigurationError::Invalid(msg));

        if self.storage.ttl.is_zero() {
            return invalid("storage.ttl must be greater than zero".into());
        }
        if self.storage.cleanup_interval.is_zero() {
            return invalid("storage.cleanup_interval must be greater than zero".into());
        }
        if self.monitoring.snapshot_interval.is_zero() {
            return invalid("monitoring.snapshot_interval must be greater than zero".into());
        }
        if self.monitoring.retention.is_zero() {
            return invalid("monitoring.retention must be greater than zero".into());
        }
        if self.monitoring.alert_capacity == 0 {
            return invalid("monitoring.alert_capacity must be at least 1".into());
        }
        self.monitoring.thresholds.validate()?;
        if self.rotation.check_interval.is_zero() {
            return invalid("rotation.check_interval must be greater than zero".into());
        }
        self.rotation
            .defaults()
            .validate("rotation defaults")
            .map_err(ConfigurationError::Invalid)?;
        if !(1..=4).contains(&self.secrets.min_entropy_classes) {
            return invalid("secrets.min_entropy_classes must be between 1 and 4".into());
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(&service.id) {
                return invalid(format!("duplicate service id '{}'", service.id));
            }
            service
                .schedule()
                .validate(service.id.as_str())
                .map_err(ConfigurationError::Invalid)?;
            if service.env_var.trim().is_empty() {
                return invalid(format!("service '{}' has an empty env_var", service.id));
            }
        }

        Ok(())
    }
}

/// One managed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service identifier
    pub id: ServiceId,
    /// Environment variable holding the active key
    pub env_var: String,
    /// Time between scheduled rotations
    #[serde(with = "humantime_serde", default = "default_rotation_interval")]
    pub rotation_interval: Duration,
    /// How long the previous key stays valid after a rotation
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,
    /// Whether the scheduler rotates this service
    #[serde(default = "default_true")]
    pub auto_rotate: bool,
}

impl ServiceConfig {
    /// Entry with the default schedule
    pub fn new(id: ServiceId, env_var: impl Into<String>) -> Self {
        Self {
            id,
            env_var: env_var.into(),
            rotation_interval: default_rotation_interval(),
            grace_period: default_grace_period(),
            auto_rotate: true,
        }
    }

    /// Schedule portion of this entry
    pub fn schedule(&self) -> RotationSchedule {
        RotationSchedule {
            rotation_interval: self.rotation_interval,
            grace_period: self.grace_period,
            auto_rotate: self.auto_rotate,
        }
    }
}

/// Rotation cadence for a single service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSchedule {
    /// Time between scheduled rotations
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,
    /// How long the previous key stays valid after a rotation
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Whether the scheduler rotates this service
    pub auto_rotate: bool,
}

impl RotationSchedule {
    /// Checks interval and grace period against each other
    pub fn validate(&self, owner: &str) -> Result<(), String> {
        if self.rotation_interval.is_zero() {
            return Err(format!("{owner}: rotation_interval must be greater than zero"));
        }
        if self.grace_period >= self.rotation_interval {
            return Err(format!(
                "{owner}: grace_period ({:?}) must be shorter than rotation_interval ({:?})",
                self.grace_period, self.rotation_interval
            ));
        }
        Ok(())
    }
}

/// Secure memory cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Default time-to-live for cached entries
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Period of the expired-entry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Metrics collection and alerting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Period of `collect_metrics`
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
    /// Snapshots older than this are pruned
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Alert ring buffer size
    pub alert_capacity: usize,
    /// Alert thresholds
    pub thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(60),
            retention: 7 * DAY,
            alert_capacity: 100,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Conditions that raise alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Failed / total requests above which an error-rate alert fires
    pub error_rate: f64,
    /// Requests needed before the error rate is evaluated
    pub min_requests: u64,
    /// Average response time above which a latency alert fires
    #[serde(with = "humantime_serde")]
    pub response_time: Duration,
    /// used / quota above which a quota alert fires
    pub quota_usage: f64,
    /// Consecutive rotation failures that raise an alert
    pub rotation_failures: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            min_requests: 10,
            response_time: Duration::from_millis(1000),
            quota_usage: 0.9,
            rotation_failures: 3,
        }
    }
}

impl AlertThresholds {
    fn validate(&self) -> Result<(), ConfigurationError> {
        let ratio = 0.0..=1.0;
        if !ratio.contains(&self.error_rate) || !ratio.contains(&self.quota_usage) {
            return Err(ConfigurationError::Invalid(
                "monitoring.thresholds ratios must be within 0.0..=1.0".into(),
            ));
        }
        if self.rotation_failures == 0 {
            return Err(ConfigurationError::Invalid(
                "monitoring.thresholds.rotation_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler settings and defaults for services added at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// How often the scheduler looks for due rotations and expired grace windows
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Master switch for scheduled rotation
    pub auto_rotate: bool,
    /// Interval for services registered through `add_key`
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,
    /// Grace period for services registered through `add_key`
    #[serde(with = "humantime_serde")]
    pub default_grace_period: Duration,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            auto_rotate: true,
            default_interval: default_rotation_interval(),
            default_grace_period: default_grace_period(),
        }
    }
}

impl RotationSettings {
    /// Schedule applied to services that have no explicit entry
    pub fn defaults(&self) -> RotationSchedule {
        RotationSchedule {
            rotation_interval: self.default_interval,
            grace_period: self.default_grace_period,
            auto_rotate: self.auto_rotate,
        }
    }
}

/// Startup secret requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretPolicy {
    /// Secrets that must be present
    pub required: Vec<String>,
    /// Secret the cache encryption key is derived from (must also be required)
    pub encryption_key: String,
    /// Minimum length in characters
    pub min_length: usize,
    /// Minimum number of character classes (lower, upper, digit, symbol)
    pub min_entropy_classes: usize,
    /// Treat weak secrets as fatal
    pub enforce_strength: bool,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self {
            required: vec![ENCRYPTION_KEY_SECRET.to_string(), JWT_SECRET.to_string()],
            encryption_key: ENCRYPTION_KEY_SECRET.to_string(),
            min_length: 32,
            min_entropy_classes: 3,
            enforce_strength: true,
        }
    }
}

/// Module access table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Module granted every registered service
    pub admin_module: Option<ModuleId>,
    /// Explicit grants
    pub modules: BTreeMap<ModuleId, BTreeSet<ServiceId>>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        let grants = [
            ("route-module", "openRouteService"),
            ("weather-module", "openWeather"),
            ("activity-module", "strava"),
            ("map-module", "mapbox"),
            ("ai-module", "openRouter"),
        ];

        let modules = grants
            .into_iter()
            .filter_map(|(module, service)| {
                Some((
                    ModuleId::new(module).ok()?,
                    BTreeSet::from([ServiceId::new(service).ok()?]),
                ))
            })
            .collect();

        Self {
            admin_module: ModuleId::new("admin").ok(),
            modules,
        }
    }
}

fn default_rotation_interval() -> Duration {
    30 * DAY
}

fn default_grace_period() -> Duration {
    DAY
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = LifecycleConfig::default();
        config.validate().unwrap();
        assert_eq!(config.services.len(), 5);
        assert_eq!(
            config
                .service(&ServiceId::new("mapbox").unwrap())
                .map(|s| s.env_var.as_str()),
            Some("MAPBOX_SECRET_TOKEN")
        );
        assert_eq!(config.monitoring.alert_capacity, 100);
    }

    #[test]
    fn test_rejects_duplicate_services() {
        let mut config = LifecycleConfig::default();
        let dup = config.services[0].clone();
        config.services.push(dup);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Invalid(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_rejects_grace_not_shorter_than_interval() {
        let mut config = LifecycleConfig::default();
        config.services[0].grace_period = config.services[0].rotation_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_ttl_and_capacity() {
        let mut config = LifecycleConfig::default();
        config.storage.ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = LifecycleConfig::default();
        config.monitoring.alert_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
keys_directory = "/var/lib/keyward"

[storage]
ttl = "10m"

[[services]]
id = "mapbox"
env_var = "MAPBOX_TOKEN"
rotation_interval = "7days"
grace_period = "2h"
"#
        )
        .unwrap();

        let config = LifecycleConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.storage.ttl, Duration::from_secs(600));
        assert_eq!(config.storage.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].grace_period, Duration::from_secs(7200));
        assert!(config.services[0].auto_rotate);
        assert_eq!(
            config.keys_directory,
            Some(PathBuf::from("/var/lib/keyward"))
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = LifecycleConfig::load(Some(Path::new("/nonexistent/keyward.toml")));
        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }
}
