//! Startup configuration, validated eagerly.
//!
//! Misconfiguration surfaces as a startup failure, never a silent default
//! at write time: stages load config once, call [`Config::validate`], and
//! refuse to run on any error.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, VeristateError};
use crate::retry::RetryPolicy;
use crate::state::{HybridCodec, DEFAULT_INLINE_THRESHOLD};

/// Default per-stage deadline in seconds.
pub const DEFAULT_STAGE_DEADLINE_SECS: u64 = 30;

/// Runtime configuration shared by all stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Bucket holding stored payloads.
    pub state_bucket: String,
    /// Table holding final/failed status records.
    pub results_table: String,
    /// Whether the hybrid inline/reference codec is enabled.
    pub hybrid_enabled: bool,
    /// Inline/reference boundary in bytes.
    pub inline_threshold: usize,
    /// Retry policy for sub-operations against the stores.
    pub retry: RetryPolicy,
    /// Deadline applied to each store-facing operation, in seconds.
    pub stage_deadline_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_bucket: String::new(),
            results_table: String::new(),
            hybrid_enabled: true,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            retry: RetryPolicy::default(),
            stage_deadline_secs: DEFAULT_STAGE_DEADLINE_SECS,
        }
    }
}

impl Config {
    /// Creates a config with the required store names and defaults for
    /// everything else.
    #[must_use]
    pub fn new(state_bucket: impl Into<String>, results_table: impl Into<String>) -> Self {
        Self {
            state_bucket: state_bucket.into(),
            results_table: results_table.into(),
            ..Self::default()
        }
    }

    /// Sets the hybrid codec switch.
    #[must_use]
    pub const fn with_hybrid_enabled(mut self, enabled: bool) -> Self {
        self.hybrid_enabled = enabled;
        self
    }

    /// Sets the inline/reference boundary.
    #[must_use]
    pub const fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    /// Sets the sub-operation retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-operation deadline.
    #[must_use]
    pub const fn with_stage_deadline_secs(mut self, secs: u64) -> Self {
        self.stage_deadline_secs = secs;
        self
    }

    /// Loads configuration from the process environment and validates it.
    ///
    /// Recognized variables: `STATE_BUCKET`, `RESULTS_TABLE`,
    /// `ENABLE_HYBRID_STORAGE`, `INLINE_SIZE_THRESHOLD`,
    /// `MAX_RETRY_ATTEMPTS`, `RETRY_BASE_DELAY_MS`, `STAGE_DEADLINE_SECS`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for missing required variables or unparseable
    /// values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(
            require_env("STATE_BUCKET")?,
            require_env("RESULTS_TABLE")?,
        );

        if let Some(raw) = optional_env("ENABLE_HYBRID_STORAGE") {
            config.hybrid_enabled = parse_env("ENABLE_HYBRID_STORAGE", &raw)?;
        }
        if let Some(raw) = optional_env("INLINE_SIZE_THRESHOLD") {
            config.inline_threshold = parse_env("INLINE_SIZE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = optional_env("MAX_RETRY_ATTEMPTS") {
            config.retry.max_attempts = parse_env("MAX_RETRY_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = optional_env("RETRY_BASE_DELAY_MS") {
            config.retry.base_delay_ms = parse_env("RETRY_BASE_DELAY_MS", &raw)?;
        }
        if let Some(raw) = optional_env("STAGE_DEADLINE_SECS") {
            config.stage_deadline_secs = parse_env("STAGE_DEADLINE_SECS", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration. Called eagerly at startup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.state_bucket.is_empty() {
            return Err(VeristateError::config("state_bucket must not be empty"));
        }
        if self.results_table.is_empty() {
            return Err(VeristateError::config("results_table must not be empty"));
        }
        if self.hybrid_enabled && self.inline_threshold == 0 {
            return Err(VeristateError::config(
                "inline_threshold must be positive when hybrid storage is enabled",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(VeristateError::config("retry.max_attempts must be at least 1"));
        }
        if self.stage_deadline_secs == 0 {
            return Err(VeristateError::config("stage_deadline_secs must be positive"));
        }
        Ok(())
    }

    /// The hybrid codec this configuration describes.
    #[must_use]
    pub const fn codec(&self) -> HybridCodec {
        HybridCodec::new(self.hybrid_enabled, self.inline_threshold)
    }

    /// The per-operation deadline as a [`Duration`].
    #[must_use]
    pub const fn stage_deadline(&self) -> Duration {
        Duration::from_secs(self.stage_deadline_secs)
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| VeristateError::config(format!("missing required variable {name}")))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| VeristateError::config(format!("invalid value for {name}: '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Config::new("state", "results");
        assert!(config.hybrid_enabled);
        assert_eq!(config.inline_threshold, 2 * 1024 * 1024);
        assert_eq!(config.stage_deadline_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = Config::new("state", "results")
            .with_hybrid_enabled(false)
            .with_inline_threshold(0)
            .with_retry(RetryPolicy::new().with_max_attempts(5))
            .with_stage_deadline_secs(10);

        assert!(!config.hybrid_enabled);
        assert_eq!(config.retry.max_attempts, 5);
        // Threshold of zero is fine while hybrid routing is disabled.
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        assert_eq!(
            Config::new("", "results").validate().unwrap_err().code(),
            "CONFIG_ERROR"
        );
        assert_eq!(
            Config::new("state", "").validate().unwrap_err().code(),
            "CONFIG_ERROR"
        );
        assert!(Config::new("state", "results")
            .with_inline_threshold(0)
            .validate()
            .is_err());
        assert!(Config::new("state", "results")
            .with_stage_deadline_secs(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_codec_from_config() {
        let codec = Config::new("state", "results")
            .with_inline_threshold(1024)
            .codec();
        assert!(codec.should_inline(1024));
        assert!(!codec.should_inline(1025));
    }

    #[test]
    fn test_config_errors_are_not_retryable() {
        let err = Config::default().validate().unwrap_err();
        assert!(!err.is_retryable());
    }
}
