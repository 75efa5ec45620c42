//! Batch worker
//!
//! A single sequential worker that takes every registered document through
//! repair, signature-field creation, timestamping and embedding, reporting
//! progress as [`BatchEvent`]s over an mpsc channel.

pub mod events;
pub mod job;
pub mod orchestrator;
pub mod runner;

pub use events::{BatchEvent, BatchResult};
pub use job::{Job, JobStatus, derive_output_path};
pub use orchestrator::{BatchError, BatchOrchestrator, CancelHandle, RunHandle};
pub use runner::StageError;

use crate::digest::HashAlgorithm;
use crate::humanize::ByteSize;
use crate::signing::mutator::DEFAULT_RESERVED_BYTES;
use crate::tsa::TsaClientConfig;
use crate::tsa::http::DEFAULT_TSA_URL;

pub const DEFAULT_OUTPUT_SUFFIX: &str = "_sealed";
pub const DEFAULT_FIELD_NAME: &str = "TimestampSignature";

/// Settings for one run, fixed once the run starts
#[derive(Debug, Clone, bon::Builder)]
pub struct BatchConfig {
    #[builder(into, default = DEFAULT_TSA_URL.to_string())]
    pub tsa_url: String,
    #[builder(into, default = DEFAULT_OUTPUT_SUFFIX.to_string())]
    pub output_suffix: String,
    #[builder(default = true)]
    pub repair_enabled: bool,
    #[builder(into, default = DEFAULT_FIELD_NAME.to_string())]
    pub field_name: String,
    #[builder(default)]
    pub hash_algorithm: HashAlgorithm,
    #[builder(default = DEFAULT_RESERVED_BYTES)]
    pub reserved_bytes: ByteSize,
    /// Transport settings; its `url` is replaced by `tsa_url`
    #[builder(default)]
    pub client: TsaClientConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BatchConfig {
    /// Client settings pointing at `tsa_url`.
    pub fn tsa_client_config(&self) -> TsaClientConfig {
        TsaClientConfig {
            url: self.tsa_url.clone(),
            ..self.client.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_config_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.tsa_url, "http://timestamp.digicert.com");
        assert_eq!(config.output_suffix, "_sealed");
        assert!(config.repair_enabled);
        assert_eq!(config.field_name, "TimestampSignature");
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.reserved_bytes.as_u64(), 16 * 1024);
    }

    #[test]
    fn test_builder_overrides() {
        let config = BatchConfig::builder()
            .tsa_url("http://127.0.0.1:3180/")
            .output_suffix("_ts")
            .repair_enabled(false)
            .build();
        assert_eq!(config.output_suffix, "_ts");
        assert!(!config.repair_enabled);
        assert_eq!(config.tsa_client_config().url, "http://127.0.0.1:3180/");
        assert_eq!(config.tsa_client_config().max_attempts, 1);
    }
}
