//! Timestamp token returned by the authority

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::der::DerError;
use super::messages::{TimeStampReq, TstInfo, parse_signed_data};

/// Ways a token can disagree with the request it answers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenMismatch {
    #[error("token hash algorithm {found} does not match requested {expected}")]
    Algorithm { expected: String, found: String },

    #[error("token message imprint does not match the requested digest")]
    Digest,

    #[error("token carries no nonce but one was sent")]
    MissingNonce,

    #[error("token nonce does not match the request nonce")]
    Nonce,
}

/// DER of the CMS ContentInfo plus its decoded `TSTInfo`.
#[derive(Debug, Clone)]
pub struct TimestampToken {
    der: Vec<u8>,
    info: TstInfo,
    has_certificates: bool,
    signer_count: usize,
}

impl TimestampToken {
    pub fn from_der(der: Vec<u8>) -> Result<Self, DerError> {
        let content = parse_signed_data(&der)?;
        let info = TstInfo::from_der(&content.tst_info)?;
        Ok(Self {
            der,
            info,
            has_certificates: content.has_certificates,
            signer_count: content.signer_count,
        })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn into_der(self) -> Vec<u8> {
        self.der
    }

    pub fn info(&self) -> &TstInfo {
        &self.info
    }

    pub fn gen_time(&self) -> DateTime<Utc> {
        self.info.gen_time
    }

    pub fn serial_hex(&self) -> String {
        hex::encode(&self.info.serial)
    }

    pub fn has_certificates(&self) -> bool {
        self.has_certificates
    }

    pub fn signer_count(&self) -> usize {
        self.signer_count
    }

    /// Check the token answers `request`: same algorithm, same digest and
    /// the nonce echoed back.
    pub fn verify_matches(&self, request: &TimeStampReq) -> Result<(), TokenMismatch> {
        let imprint = &self.info.imprint;
        if imprint.algorithm_oid != request.imprint.algorithm_oid {
            return Err(TokenMismatch::Algorithm {
                expected: request.imprint.algorithm_oid.clone(),
                found: imprint.algorithm_oid.clone(),
            });
        }
        if imprint.digest != request.imprint.digest {
            return Err(TokenMismatch::Digest);
        }
        if let Some(sent) = &request.nonce {
            let echoed = self.info.nonce.as_ref().ok_or(TokenMismatch::MissingNonce)?;
            if strip_zeros(echoed) != strip_zeros(sent) {
                return Err(TokenMismatch::Nonce);
            }
        }
        Ok(())
    }
}

fn strip_zeros(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    &bytes[skip..]
}
