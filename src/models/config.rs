//! Configuration models for bulkimport.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use super::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for an import run.
///
/// Every section is optional in the TOML file; missing values fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Where checkpoints, idempotency stores and logs live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Retry policy for per-record processing
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breakers, one per external dependency
    #[serde(default)]
    pub breakers: BreakersConfig,

    /// Batching and deadlock handling
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Checkpoint cadence and retention
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// File-level validation rules
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Required fields per table type
    #[serde(default)]
    pub schemas: HashMap<String, SchemaConfig>,
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default = "default_idempotency_dir")]
    pub idempotency_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_idempotency_dir() -> PathBuf {
    PathBuf::from("idempotency")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            idempotency_dir: default_idempotency_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl StorageConfig {
    /// Place all storage directories under a single root.
    pub fn under(root: &Path) -> Self {
        Self {
            checkpoint_dir: root.join("checkpoints"),
            idempotency_dir: root.join("idempotency"),
            log_dir: root.join("logs"),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    /// Apply ±10% jitter to computed delays
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Error kinds eligible for retry (None = all non-fatal kinds)
    #[serde(default)]
    pub retryable_kinds: Option<Vec<ErrorKind>>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: true,
            retryable_kinds: None,
        }
    }
}

/// Circuit breaker configuration for each dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakersConfig {
    #[serde(default = "BreakerConfig::database")]
    pub database: BreakerConfig,

    #[serde(default = "BreakerConfig::filesystem")]
    pub filesystem: BreakerConfig,

    #[serde(default = "BreakerConfig::parsing")]
    pub parsing: BreakerConfig,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            database: BreakerConfig::database(),
            filesystem: BreakerConfig::filesystem(),
            parsing: BreakerConfig::parsing(),
        }
    }
}

/// Thresholds for a single circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Time after the last failure before a probe is admitted
    pub recovery_timeout_ms: u64,

    /// Consecutive probe successes before closing again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_success_threshold() -> u32 {
    1
}

impl BreakerConfig {
    pub fn database() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 2,
        }
    }

    pub fn filesystem() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
            success_threshold: 1,
        }
    }

    pub fn parsing() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout_ms: 30_000,
            success_threshold: 1,
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Transaction batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Records buffered before a commit is forced
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_deadlock_max_retries")]
    pub deadlock_max_retries: u32,

    #[serde(default = "default_deadlock_base_delay_ms")]
    pub deadlock_base_delay_ms: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_deadlock_max_retries() -> u32 {
    3
}

fn default_deadlock_base_delay_ms() -> u64 {
    100
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            deadlock_max_retries: default_deadlock_max_retries(),
            deadlock_base_delay_ms: default_deadlock_base_delay_ms(),
        }
    }
}

/// Checkpoint cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Commit and checkpoint after this many batches
    #[serde(default = "default_interval_batches")]
    pub interval_batches: usize,

    /// Snapshots older than this are removed at run start
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,
}

fn default_interval_batches() -> usize {
    1
}

fn default_keep_days() -> u32 {
    7
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_batches: default_interval_batches(),
            keep_days: default_keep_days(),
        }
    }
}

/// File-level validation rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Accepted file extensions, lowercase without the dot (empty = any)
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
}

/// Record shape required for a table type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl ImportConfig {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the resilience machinery meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.exponential_base must be >= 1.0".into(),
            ));
        }
        if self.transaction.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "transaction.batch_size must be >= 1".into(),
            ));
        }
        if self.checkpoint.interval_batches == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint.interval_batches must be >= 1".into(),
            ));
        }
        for (name, breaker) in [
            ("database", &self.breakers.database),
            ("filesystem", &self.breakers.filesystem),
            ("parsing", &self.breakers.parsing),
        ] {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "breakers.{name}: thresholds must be >= 1"
                )));
            }
        }
        Ok(())
    }

    /// Required fields for a table type, if a schema is configured.
    pub fn required_fields(&self, table_type: &str) -> Option<&[String]> {
        self.schemas
            .get(table_type)
            .map(|s| s.required_fields.as_slice())
    }
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Values outside their meaningful range
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ImportConfig = toml::from_str("").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.transaction.batch_size, 100);
        assert_eq!(config.breakers.database.failure_threshold, 5);
        assert_eq!(config.breakers.database.success_threshold, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: ImportConfig = toml::from_str(
            r#"
[retry]
max_attempts = 5
retryable_kinds = ["deadlock", "io"]

[breakers.database]
failure_threshold = 2
recovery_timeout_ms = 500

[schemas.employees]
required_fields = ["employee_id", "name"]
"#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(
            config.retry.retryable_kinds,
            Some(vec![ErrorKind::Deadlock, ErrorKind::Io])
        );
        assert_eq!(config.breakers.database.failure_threshold, 2);
        assert_eq!(config.breakers.database.success_threshold, 1);
        assert_eq!(config.breakers.filesystem.failure_threshold, 3);
        assert_eq!(
            config.required_fields("employees"),
            Some(&["employee_id".to_string(), "name".to_string()][..])
        );
        assert!(config.required_fields("payroll").is_none());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = ImportConfig::default();
        config.transaction.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
