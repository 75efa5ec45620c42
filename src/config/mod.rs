//! Configuration management for timeseal
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use timeseal::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Timestamp authority: {}", config.batch.tsa_url);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `TIMESEAL__<section>__<key>`
//!
//! Examples:
//! - `TIMESEAL__BATCH__TSA_URL=https://freetsa.org/tsr`
//! - `TIMESEAL__TSA__REQUEST_TIMEOUT=60s`
//! - `TIMESEAL__SIGNATURE__RESERVED_BYTES=32KB`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/timeseal.toml`.
//! This can be overridden using the `TIMESEAL_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

// Re-export public types
pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{BatchSettings, Config, LoggingSettings, SignatureSettings, TsaSettings};
pub use validation::ValidationError;

use crate::tsa::TsaClientConfig;
use crate::worker::BatchConfig;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`TIMESEAL__*`)
    /// 2. TOML file (default: `config/timeseal.toml`)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Same as [`load`](Self::load), reading the TOML file from `path` when
    /// given.
    pub fn load_with(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = sources::load(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Re-run validation, e.g. after command-line overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate(self)?;
        Ok(())
    }

    /// Transport settings for the timestamp client.
    pub fn tsa_client_config(&self) -> TsaClientConfig {
        TsaClientConfig {
            url: self.batch.tsa_url.clone(),
            connect_timeout: self.tsa.connect_timeout.as_duration(),
            request_timeout: self.tsa.request_timeout.as_duration(),
            max_attempts: self.tsa.max_attempts,
            user_agent: self.tsa.user_agent.clone(),
            policy_oid: self.tsa.policy_oid.clone(),
            probe: self.tsa.probe,
        }
    }

    /// Immutable settings for one batch run.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::builder()
            .tsa_url(self.batch.tsa_url.clone())
            .output_suffix(self.batch.output_suffix.clone())
            .repair_enabled(self.batch.repair_enabled)
            .field_name(self.batch.field_name.clone())
            .hash_algorithm(self.batch.hash_algorithm)
            .reserved_bytes(self.signature.reserved_bytes)
            .client(self.tsa_client_config())
            .build()
    }
}
