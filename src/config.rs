//! Process configuration, read once at startup from YAML
//!
//! The file is optional; every field has a default. The bot token is never
//! part of it and comes from `DISCORD_TOKEN`.

use crate::duration::parse_duration;
use crate::moderation::{NotificationTarget, RetryPolicy, SchedulerSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SENTINEL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/sentinel.yaml";
pub const TOKEN_ENV: &str = "DISCORD_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Only `* * * * *`, `*/N * * * *`, `0 */N * * *` or a plain duration are accepted
    #[error("Invalid cadence `{0}`")]
    InvalidCadence(String),

    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub rate_limit_per_window: u32,
    pub rate_limit_window_secs: u64,
    pub worker_pool_width: usize,
    pub destination_moderators_enabled: bool,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_window: 5,
            rate_limit_window_secs: 1,
            worker_pool_width: 5,
            destination_moderators_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 1800 }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub expiry_cadence: String,
    pub health_cadence: String,
    pub limiter_cleanup_secs: u64,
    pub limiter_idle_secs: u64,
    pub departure_cooldown_secs: u64,
    /// Minimum gap before an unauthorized destination is warned about again
    pub rewarn_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_cadence: "*/1 * * * *".to_string(),
            health_cadence: "*/5 * * * *".to_string(),
            limiter_cleanup_secs: 300,
            limiter_idle_secs: 300,
            departure_cooldown_secs: 1800,
            rewarn_interval_secs: 1800,
        }
    }
}

impl SchedulerConfig {
    /// Resolve cadences into the scheduler's settings
    ///
    /// # Errors
    /// Returns `InvalidCadence` for an unsupported cadence string
    pub fn settings(&self, cache_ttl: Duration) -> Result<SchedulerSettings, ConfigError> {
        Ok(SchedulerSettings {
            expiry_every: parse_cadence(&self.expiry_cadence)?,
            health_every: parse_cadence(&self.health_cadence)?,
            cleanup_every: Duration::from_secs(self.limiter_cleanup_secs.max(1)),
            limiter_idle: Duration::from_secs(self.limiter_idle_secs),
            warning_max_age: cache_ttl,
        })
    }

    #[must_use]
    pub fn departure_cooldown(&self) -> Duration {
        Duration::from_secs(self.departure_cooldown_secs)
    }

    #[must_use]
    pub fn rewarn_interval(&self) -> Duration {
        Duration::from_secs(self.rewarn_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot directory; memory only when unset
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root_operators: Vec<u64>,
    /// Group and channel for operator notifications; `/setchannel` overrides it
    pub notification: Option<NotificationTarget>,
    pub moderation: ModerationConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `SENTINEL_CONFIG`, or the default path
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path).await
    }

    /// Load from `path`; a missing file yields defaults
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let config = Self::from_yaml(&content)?;
                info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse and validate a YAML document
    ///
    /// # Errors
    /// Returns an error for malformed YAML or an unsupported cadence
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.scheduler.settings(config.cache.ttl())?;
        Ok(config)
    }

    /// Bot token from the environment
    ///
    /// # Errors
    /// Returns `MissingEnv` when `DISCORD_TOKEN` is unset
    pub fn token() -> Result<String, ConfigError> {
        std::env::var(TOKEN_ENV).map_err(|_| ConfigError::MissingEnv(TOKEN_ENV))
    }

    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.moderation.rate_limit_window_secs.max(1))
    }

    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Interval for a restricted cron expression or a plain duration
///
/// # Errors
/// Returns `InvalidCadence` for anything else
pub fn parse_cadence(cadence: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidCadence(cadence.to_string());
    let fields: Vec<&str> = cadence.split_whitespace().collect();

    let secs = match fields.as_slice() {
        ["*", "*", "*", "*", "*"] => 60,
        [minute, "*", "*", "*", "*"] => step(minute)
            .and_then(|n| n.checked_mul(60))
            .ok_or_else(invalid)?,
        ["0", hour, "*", "*", "*"] => step(hour)
            .and_then(|n| n.checked_mul(3600))
            .ok_or_else(invalid)?,
        [single] => u64::from(parse_duration(single).map_err(|_| invalid())?),
        _ => return Err(invalid()),
    };

    if secs == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}

/// `*/N` with N > 0
fn step(field: &str) -> Option<u64> {
    field
        .strip_prefix("*/")
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadences() {
        assert_eq!(parse_cadence("* * * * *").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_cadence("*/1 * * * *").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_cadence("*/5 * * * *").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_cadence("0 */2 * * *").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_cadence("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_cadence("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_unsupported_cadences() {
        for cadence in [
            "15 3 * * *",
            "*/0 * * * *",
            "0 */x * * *",
            "0s",
            "",
            "5w",
            "* * * *",
            "*/18446744073709551615 * * * *",
            "0 */18446744073709551615 * * *",
        ] {
            assert!(
                matches!(parse_cadence(cadence), Err(ConfigError::InvalidCadence(_))),
                "{cadence} should be rejected"
            );
        }
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            "root_operators: [1, 2]\nnotification:\n  destination: 50\n  channel: 900\nmoderation:\n  worker_pool_width: 8\nscheduler:\n  expiry_cadence: 30s\n",
        )
        .unwrap();

        assert_eq!(config.root_operators, vec![1, 2]);
        assert_eq!(config.notification, Some(NotificationTarget::new(50, 900)));
        assert_eq!(config.scheduler.rewarn_interval(), Duration::from_secs(1800));
        assert_eq!(config.moderation.worker_pool_width, 8);
        assert_eq!(config.moderation.rate_limit_per_window, 5);
        assert_eq!(config.cache.ttl_secs, 1800);
        assert_eq!(config.logging.dir, "logs");

        let settings = config.scheduler.settings(config.cache.ttl()).unwrap();
        assert_eq!(settings.expiry_every, Duration::from_secs(30));
        assert_eq!(settings.health_every, Duration::from_secs(300));
    }

    #[test]
    fn test_bad_cadence_rejects_config() {
        let result = Config::from_yaml("scheduler:\n  health_cadence: \"0 0 1 * *\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidCadence(_))));
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let config = Config::load_from("/nonexistent/sentinel.yaml").await.unwrap();
        assert_eq!(config, Config::default());
    }
}
