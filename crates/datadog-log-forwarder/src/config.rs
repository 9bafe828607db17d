// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::constants;
use crate::errors::ConfigError;
use crate::logs::batch_strategy::BatchStrategyConfig;
use crate::logs::encoding::{ContentEncoding, IdentityContentEncoding, ZstdContentEncoding};
use crate::retry::disk_usage::{DiskUsageLimit, StatfsDiskUsageRetriever};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration of the logs pipeline and of the forwarder storage.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Datadog API key, scrubbed from persisted transactions
    pub api_key: Option<String>,
    /// Datadog site (e.g., datadoghq.com, datadoghq.eu)
    pub site: String,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub batch_wait: Duration,
    pub batch_max_size: usize,
    pub batch_max_content_size: usize,
    pub use_compression: bool,
    /// zstd level, only used when compression is enabled
    pub compression_level: i32,
    /// Root directory of the on-disk retry queue
    pub storage_path: PathBuf,
    /// Disk quota of the retry queue, 0 disables it
    pub storage_max_size_in_bytes: u64,
    pub storage_max_disk_ratio: f64,
    pub retry_interval: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            site: "datadoghq.com".to_string(),
            log_level: "info".to_string(),
            batch_wait: constants::DEFAULT_BATCH_WAIT,
            batch_max_size: constants::MAX_BATCH_SIZE,
            batch_max_content_size: constants::MAX_CONTENT_SIZE_BYTES,
            use_compression: true,
            compression_level: constants::DEFAULT_COMPRESSION_LEVEL,
            storage_path: PathBuf::from(constants::DEFAULT_STORAGE_PATH),
            storage_max_size_in_bytes: constants::DEFAULT_STORAGE_MAX_SIZE_IN_BYTES,
            storage_max_disk_ratio: constants::DEFAULT_STORAGE_MAX_DISK_RATIO,
            retry_interval: constants::DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ForwarderConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary variable source.
    /// Values that do not parse fall back to their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let seconds = |key: &str| parse_var(&lookup, key).map(Duration::from_secs);

        let config = Self {
            api_key: lookup("DD_API_KEY").filter(|key| !key.is_empty()),
            site: lookup("DD_SITE").unwrap_or(defaults.site),
            log_level: lookup("DD_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            batch_wait: seconds("DD_LOGS_CONFIG_BATCH_WAIT").unwrap_or(defaults.batch_wait),
            batch_max_size: parse_var(&lookup, "DD_LOGS_CONFIG_BATCH_MAX_SIZE")
                .unwrap_or(defaults.batch_max_size),
            batch_max_content_size: parse_var(&lookup, "DD_LOGS_CONFIG_BATCH_MAX_CONTENT_SIZE")
                .unwrap_or(defaults.batch_max_content_size),
            use_compression: lookup("DD_LOGS_CONFIG_USE_COMPRESSION")
                .map(|val| val.to_lowercase() != "false")
                .unwrap_or(defaults.use_compression),
            compression_level: parse_var(&lookup, "DD_LOGS_CONFIG_COMPRESSION_LEVEL")
                .unwrap_or(defaults.compression_level),
            storage_path: lookup("DD_FORWARDER_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path),
            storage_max_size_in_bytes: parse_var(&lookup, "DD_FORWARDER_STORAGE_MAX_SIZE_IN_BYTES")
                .unwrap_or(defaults.storage_max_size_in_bytes),
            storage_max_disk_ratio: parse_var(&lookup, "DD_FORWARDER_STORAGE_MAX_DISK_RATIO")
                .unwrap_or(defaults.storage_max_disk_ratio),
            retry_interval: seconds("DD_FORWARDER_RETRY_INTERVAL")
                .unwrap_or(defaults.retry_interval),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.site.trim().is_empty() {
            return Err(ConfigError::Invalid("DD_SITE cannot be empty".to_string()));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.batch_wait.is_zero() {
            return Err(ConfigError::Invalid(
                "Batch wait must be greater than 0".to_string(),
            ));
        }
        if self.batch_max_size == 0 || self.batch_max_content_size == 0 {
            return Err(ConfigError::Invalid(
                "Batch limits must be greater than 0".to_string(),
            ));
        }

        if !(1..=21).contains(&self.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "Invalid compression level {}. Must be between 1 and 21",
                self.compression_level
            )));
        }

        if !(0.0..=1.0).contains(&self.storage_max_disk_ratio) {
            return Err(ConfigError::Invalid(format!(
                "Invalid max disk ratio {}. Must be between 0 and 1",
                self.storage_max_disk_ratio
            )));
        }

        if self.retry_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Retry interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Intake domain for the configured site.
    #[must_use]
    pub fn logs_domain(&self) -> String {
        format!("https://http-intake.logs.{}", self.site.trim())
    }

    #[must_use]
    pub fn batch_strategy_config(&self) -> BatchStrategyConfig {
        BatchStrategyConfig {
            batch_wait: self.batch_wait,
            max_batch_size: self.batch_max_size,
            max_content_size: self.batch_max_content_size,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn content_encoding(&self) -> Arc<dyn ContentEncoding> {
        if self.use_compression {
            Arc::new(ZstdContentEncoding::new(self.compression_level))
        } else {
            Arc::new(IdentityContentEncoding)
        }
    }

    /// Quota of the retry queue on the real filesystem, `None` when disk
    /// retry is disabled.
    #[must_use]
    pub fn disk_usage_limit(&self) -> Option<DiskUsageLimit> {
        if self.storage_max_size_in_bytes == 0 {
            return None;
        }
        Some(DiskUsageLimit::new(
            self.storage_path.clone(),
            Arc::new(StatfsDiskUsageRetriever),
            self.storage_max_size_in_bytes,
            self.storage_max_disk_ratio,
        ))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|val| val.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ForwarderConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ForwarderConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ForwarderConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.disk_usage_limit().is_none());
        assert_eq!(config.content_encoding().name(), "zstd");
        assert_eq!(config.logs_domain(), "https://http-intake.logs.datadoghq.com");
    }

    #[test]
    fn test_from_lookup_without_variables() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.batch_wait, constants::DEFAULT_BATCH_WAIT);
        assert_eq!(config.batch_max_size, constants::MAX_BATCH_SIZE);
        assert_eq!(config.storage_max_size_in_bytes, 0);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_from_lookup() {
        let config = from_vars(&[
            ("DD_API_KEY", "secret"),
            ("DD_SITE", "datadoghq.eu"),
            ("DD_LOG_LEVEL", "DEBUG"),
            ("DD_LOGS_CONFIG_BATCH_WAIT", "2"),
            ("DD_LOGS_CONFIG_BATCH_MAX_SIZE", "10"),
            ("DD_LOGS_CONFIG_BATCH_MAX_CONTENT_SIZE", "2048"),
            ("DD_LOGS_CONFIG_USE_COMPRESSION", "false"),
            ("DD_FORWARDER_STORAGE_PATH", "/var/lib/retry"),
            ("DD_FORWARDER_STORAGE_MAX_SIZE_IN_BYTES", "1048576"),
            ("DD_FORWARDER_STORAGE_MAX_DISK_RATIO", "0.5"),
            ("DD_FORWARDER_RETRY_INTERVAL", "30"),
        ])
        .unwrap();

        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.logs_domain(), "https://http-intake.logs.datadoghq.eu");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.content_encoding().name(), "identity");
        assert_eq!(config.retry_interval, Duration::from_secs(30));

        let batch = config.batch_strategy_config();
        assert_eq!(batch.batch_wait, Duration::from_secs(2));
        assert_eq!(batch.max_batch_size, 10);
        assert_eq!(batch.max_content_size, 2048);

        let limit = config.disk_usage_limit().unwrap();
        assert_eq!(limit.max_size_in_bytes(), 1_048_576);
    }

    #[test]
    fn test_unparseable_values_use_defaults() {
        let config = from_vars(&[
            ("DD_LOGS_CONFIG_BATCH_MAX_SIZE", "many"),
            ("DD_FORWARDER_RETRY_INTERVAL", "-3"),
        ])
        .unwrap();
        assert_eq!(config.batch_max_size, constants::MAX_BATCH_SIZE);
        assert_eq!(config.retry_interval, constants::DEFAULT_RETRY_INTERVAL);
    }

    #[test]
    fn test_validate_invalid_log_level() {
        assert!(from_vars(&[("DD_LOG_LEVEL", "verbose")]).is_err());
    }

    #[test]
    fn test_validate_empty_site() {
        let config = ForwarderConfig {
            site: "   ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_compression_level() {
        for level in [0, 22] {
            let config = ForwarderConfig {
                compression_level: level,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "level {level} should be invalid");
        }
    }

    #[test]
    fn test_validate_disk_ratio() {
        let config = ForwarderConfig {
            storage_max_disk_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_limits() {
        assert!(from_vars(&[("DD_LOGS_CONFIG_BATCH_WAIT", "0")]).is_err());
        assert!(from_vars(&[("DD_LOGS_CONFIG_BATCH_MAX_SIZE", "0")]).is_err());
        assert!(from_vars(&[("DD_FORWARDER_RETRY_INTERVAL", "0")]).is_err());
    }
}
