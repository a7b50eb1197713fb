//! Worker configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. built-in defaults ([`WorkerConfig::default`]);
//! 2. an optional TOML file ([`WorkerConfig::load`]);
//! 3. command-line flags and environment variables, applied by the binary.
//!
//! # Example TOML
//!
//! ```toml
//! redis_url = "redis://redis:6379"
//! queue_name = "dockerQueue"
//! concurrency = 50
//! default_image = "alpine:3.14"
//! docker_bin = "docker"
//! poll_interval_ms = 500
//! forward_output = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CONCURRENCY, DEFAULT_IMAGE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_QUEUE_NAME};
use crate::error::ConfigError;

/// Redis URL used when nothing else is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Everything the worker binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Redis instance for the queue and the cancellation channels.
    pub redis_url: String,
    /// Queue name; prefixes every queue key.
    pub queue_name: String,
    /// Maximum number of tasks running at once.
    pub concurrency: usize,
    /// Image used by `add` when none is given.
    pub default_image: String,
    /// Docker-compatible CLI binary.
    pub docker_bin: String,
    /// Wait between polls of an empty queue, in milliseconds.
    pub poll_interval_ms: u64,
    /// Copy workload output to the worker's stdout.
    pub forward_output: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            default_image: DEFAULT_IMAGE.to_string(),
            docker_bin: "docker".to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            forward_output: true,
        }
    }
}

impl WorkerConfig {
    /// Parses and validates a config from TOML text. Missing keys keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] for out-of-range values.
    ///
    /// # Examples
    ///
    /// ```
    /// use cancelable_worker::WorkerConfig;
    ///
    /// let config = WorkerConfig::from_toml_str("concurrency = 4").unwrap();
    /// assert_eq!(config.concurrency, 4);
    /// assert_eq!(config.queue_name, "dockerQueue");
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, "<inline>")
    }

    /// Reads, parses and validates a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                message: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("redis_url", &self.redis_url),
            ("queue_name", &self.queue_name),
            ("default_image", &self.default_image),
            ("docker_bin", &self.docker_bin),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// [`poll_interval_ms`](Self::poll_interval_ms) as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Redis URL for a bare host name, as given by `REDIS_HOST`.
///
/// ```
/// use cancelable_worker::config::redis_url_for_host;
///
/// assert_eq!(redis_url_for_host("redis"), "redis://redis:6379");
/// ```
pub fn redis_url_for_host(host: &str) -> String {
    format!("redis://{host}:6379")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(WorkerConfig::from_toml_str("").unwrap(), WorkerConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let config = WorkerConfig::from_toml_str(
            r#"
            redis_url = "redis://redis:6379"
            queue_name = "jobs"
            poll_interval_ms = 250
            forward_output = false
            "#,
        )
        .unwrap();
        assert_eq!(config.redis_url, "redis://redis:6379");
        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(!config.forward_output);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = WorkerConfig::from_toml_str("concurrancy = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let err = WorkerConfig::from_toml_str("concurrency = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "concurrency", .. }));
    }

    #[test]
    fn blank_queue_name_is_invalid() {
        let err = WorkerConfig::from_toml_str("queue_name = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "queue_name", .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = WorkerConfig::load(Path::new("/nonexistent/worker.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
