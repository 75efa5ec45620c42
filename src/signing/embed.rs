//! Writing a token into a prepared signature slot

use thiserror::Error;

use super::byterange::{self, ByteRangeError};
use super::mutator::PreparedDocument;
use crate::digest::HashAlgorithm;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("token needs {needed} bytes but the signature slot holds {available}")]
    TokenTooLarge { needed: usize, available: usize },

    #[error("signature slot not found or already filled")]
    SlotNotFound,

    #[error("byte range: {0}")]
    ByteRange(#[from] ByteRangeError),
}

/// Hex-encode `token` into the reserved `/Contents` slot. The remainder of
/// the slot stays zero-padded and no other byte moves.
pub fn embed(prepared: PreparedDocument, token: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let PreparedDocument { mut bytes, slot, .. } = prepared;

    let region = bytes
        .get(slot.start..slot.end)
        .ok_or(EmbedError::SlotNotFound)?;
    let well_formed = region.len() >= 2
        && region[0] == b'<'
        && region[region.len() - 1] == b'>'
        && region[1..region.len() - 1].iter().all(|&b| b == b'0');
    if !well_formed {
        return Err(EmbedError::SlotNotFound);
    }

    let available = slot.capacity();
    if token.len() > available {
        return Err(EmbedError::TokenTooLarge {
            needed: token.len(),
            available,
        });
    }

    let encoded = hex::encode_upper(token);
    bytes[slot.start + 1..slot.start + 1 + encoded.len()].copy_from_slice(encoded.as_bytes());
    Ok(bytes)
}

/// Digest of the newest signature's covered spans, recomputed from the file.
pub fn signed_digest(data: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>, ByteRangeError> {
    let range = byterange::find_last(data)?;
    range.digest(data, algorithm)
}
