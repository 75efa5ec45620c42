//! RFC 3161 timestamp protocol
//!
//! - [`der`] - DER encoder/decoder for the message structures
//! - [`messages`] - TimeStampReq / TimeStampResp / TSTInfo
//! - [`token`] - decoded token and request matching
//! - [`http`] - transport and the [`TimestampAuthority`] seam

pub mod der;
pub mod http;
pub mod messages;
pub mod token;

pub use http::{HttpTimestampClient, TimestampAuthority, TsaClientConfig};
pub use token::TimestampToken;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TsaError {
    #[error("Invalid TSA URL: {0}")]
    InvalidUrl(String),

    #[error("TSA request timed out after {0:?}")]
    Timeout(Duration),

    #[error("TSA network error: {0}")]
    Network(String),

    #[error("TSA protocol error: {0}")]
    Protocol(String),
}

impl TsaError {
    /// Transport-level failure, worth another attempt.
    pub fn is_network(&self) -> bool {
        matches!(self, TsaError::Network(_) | TsaError::Timeout(_))
    }
}

impl From<der::DerError> for TsaError {
    fn from(e: der::DerError) -> Self {
        TsaError::Protocol(format!("malformed response: {}", e))
    }
}

impl From<token::TokenMismatch> for TsaError {
    fn from(e: token::TokenMismatch) -> Self {
        TsaError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TsaError>;
