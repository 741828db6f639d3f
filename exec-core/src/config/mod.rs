//! Configuration System
//!
//! Runtime configuration lives in a TOML file and is overridable by
//! environment variables, one struct per namespace:
//! `rate_limiter`, `circuit_breaker`, `stream`, `reconciliation`, `risk`,
//! `portfolio`, plus the ambient `database`/`redis`/`metrics`/`exchange`
//! sections a runnable process also needs.
//!
//! ## Loading Configuration
//!
//! ```rust,no_run
//! use exec_core::config::Config;
//!
//! let config = Config::load("config/production.toml")?;
//! let config = Config::load_default()?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Precedence
//!
//! 1. Struct defaults (see each namespace's `Default` impl).
//! 2. The TOML file at the given path.
//! 3. Environment variables prefixed `EXEC__`, double underscore (`__`)
//!    separating nested fields, e.g. `EXEC__METRICS__LOG_LEVEL=debug`.
//!
//! Validation runs once, after load, in [`Config::validate`].

pub mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use std::path::Path;

impl Config {
    /// Load configuration from a TOML file, overridable by `EXEC__`
    /// environment variables, and validate the result.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();

        let loader = ConfigLoader::builder()
            .add_source(File::from(config_path).required(false))
            .add_source(Environment::with_prefix("EXEC").separator("__"))
            .build()
            .context("failed to build configuration")?;

        let cfg: Config = loader
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from the default location (`./config/default.toml`), falling
    /// back to struct defaults entirely if the file doesn't exist.
    pub fn load_default() -> Result<Self> {
        Self::load("config/default.toml")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiter.capacity == 0 {
            bail!("rate_limiter.capacity must be positive");
        }
        if self.rate_limiter.refill_per_sec == 0 {
            bail!("rate_limiter.refill_per_sec must be positive");
        }
        if self.rate_limiter.max_wait_ms == 0 {
            bail!("rate_limiter.max_wait_ms must be positive");
        }

        if self.circuit_breaker.window_size == 0 {
            bail!("circuit_breaker.window_size must be positive");
        }
        if self.circuit_breaker.failure_threshold > self.circuit_breaker.window_size {
            bail!("circuit_breaker.failure_threshold cannot exceed window_size");
        }

        if self.stream.reconnect_base_ms == 0 {
            bail!("stream.reconnect_base_ms must be positive");
        }
        if self.stream.reconnect_max_ms < self.stream.reconnect_base_ms {
            bail!("stream.reconnect_max_ms cannot be less than reconnect_base_ms");
        }

        if self.reconciliation.interval_ms == 0 {
            bail!("reconciliation.interval_ms must be positive");
        }
        if self.reconciliation.lookback_hours <= 0 {
            bail!("reconciliation.lookback_hours must be positive");
        }

        if self.portfolio.staleness_sec <= 0 {
            bail!("portfolio.staleness_sec must be positive");
        }
        if self.portfolio.batch_size <= 0 {
            bail!("portfolio.batch_size must be positive");
        }

        if self.database.path.is_empty() {
            bail!("database.path must not be empty");
        }

        if self.redis.url.is_empty() {
            bail!("redis.url must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.metrics.log_level.as_str()) {
            bail!(
                "invalid log level '{}', must be one of: {:?}",
                self.metrics.log_level,
                valid_log_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = Config::default();
        config.rate_limiter.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn failure_threshold_above_window_rejected() {
        let mut config = Config::default();
        config.circuit_breaker.window_size = 3;
        config.circuit_breaker.failure_threshold = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = Config::default();
        config.metrics.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let config = Config::load("does/not/exist.toml").expect("env-only load should succeed");
        assert_eq!(config.rate_limiter.capacity, 50);
    }
}
