use crate::digest::HashAlgorithm;
use crate::humanize::{ByteSize, HumanDuration};
use crate::signing::mutator::DEFAULT_RESERVED_BYTES;
use crate::tsa::http::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TSA_URL,
    DEFAULT_USER_AGENT,
};
use crate::worker::{DEFAULT_FIELD_NAME, DEFAULT_OUTPUT_SUFFIX};
use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub tsa: TsaSettings,
    #[serde(default)]
    pub signature: SignatureSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Per-run settings shared by every job
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchSettings {
    #[serde(default = "default_tsa_url")]
    pub tsa_url: String,
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
    #[serde(default = "default_true")]
    pub repair_enabled: bool,
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            tsa_url: default_tsa_url(),
            output_suffix: default_output_suffix(),
            repair_enabled: true,
            field_name: default_field_name(),
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

/// Timestamp authority transport
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TsaSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    /// Attempts per request on transport failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_oid: Option<String>,
    #[serde(default = "default_true")]
    pub probe: bool,
}

impl Default for TsaSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_attempts: default_max_attempts(),
            user_agent: default_user_agent(),
            policy_oid: None,
            probe: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignatureSettings {
    /// Room reserved for the token inside `/Contents`
    #[serde(default = "default_reserved_bytes")]
    pub reserved_bytes: ByteSize,
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self {
            reserved_bytes: default_reserved_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_tsa_url() -> String {
    DEFAULT_TSA_URL.to_string()
}

fn default_output_suffix() -> String {
    DEFAULT_OUTPUT_SUFFIX.to_string()
}

fn default_field_name() -> String {
    DEFAULT_FIELD_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> HumanDuration {
    HumanDuration(DEFAULT_CONNECT_TIMEOUT)
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration(DEFAULT_REQUEST_TIMEOUT)
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_reserved_bytes() -> ByteSize {
    DEFAULT_RESERVED_BYTES
}

fn default_log_filter() -> String {
    "info".to_string()
}
