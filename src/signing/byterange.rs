//! ByteRange geometry for the signature slot
//!
//! The ByteRange array is `[0 a b c]`: the file minus the `/Contents` value.
//! It is written as a fixed-width placeholder first and patched in place once
//! the final file length is known, so patching never shifts any offset.

use thiserror::Error;

use crate::digest::HashAlgorithm;
use crate::pdf::parser::{Parser, rfind_bytes};

/// Placeholder written into the signature dictionary; every value is ten
/// digits wide.
pub const PLACEHOLDER: &[u8] = b"[0 0000000000 0000000000 0000000000]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ByteRangeError {
    #[error("no /ByteRange found")]
    NotFound,

    #[error("ByteRange {0:?} does not fit a file of {1} bytes")]
    OutOfBounds([usize; 4], usize),

    #[error("ByteRange {0:?} must start at 0 and its spans must not overlap")]
    Malformed([usize; 4]),

    #[error("value {0} does not fit the fixed-width ByteRange")]
    TooWide(usize),
}

/// Where the hex `/Contents` value sits: `start` is the `<`, `end` is one past
/// the `>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: usize,
    pub end: usize,
}

impl Slot {
    /// Number of token bytes the slot can hold.
    pub fn capacity(&self) -> usize {
        (self.end - self.start).saturating_sub(2) / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange(pub [usize; 4]);

impl ByteRange {
    /// Everything in a file of `file_len` bytes except `slot`.
    pub fn around(slot: Slot, file_len: usize) -> Self {
        ByteRange([0, slot.start, slot.end, file_len.saturating_sub(slot.end)])
    }

    /// Fixed-width form, the same length as [`PLACEHOLDER`].
    pub fn format_fixed(&self) -> Result<Vec<u8>, ByteRangeError> {
        let [_, a, b, c] = self.0;
        if let Some(&wide) = [a, b, c].iter().find(|&&v| v > 9_999_999_999) {
            return Err(ByteRangeError::TooWide(wide));
        }
        Ok(format!("[0 {:010} {:010} {:010}]", a, b, c).into_bytes())
    }

    pub fn validate(&self, file_len: usize) -> Result<(), ByteRangeError> {
        let [first, len1, second, len2] = self.0;
        if first != 0 || len1 > second {
            return Err(ByteRangeError::Malformed(self.0));
        }
        if second.checked_add(len2) != Some(file_len) {
            return Err(ByteRangeError::OutOfBounds(self.0, file_len));
        }
        Ok(())
    }

    /// The two covered spans of `data`.
    pub fn spans<'a>(&self, data: &'a [u8]) -> Result<[&'a [u8]; 2], ByteRangeError> {
        self.validate(data.len())?;
        let [_, len1, second, _] = self.0;
        Ok([&data[..len1], &data[second..]])
    }

    /// Digest over the covered spans.
    pub fn digest(&self, data: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>, ByteRangeError> {
        let [head, tail] = self.spans(data)?;
        Ok(algorithm.digest_parts(&[head, tail]))
    }

    /// The excluded region as a slot.
    pub fn slot(&self) -> Slot {
        Slot {
            start: self.0[1],
            end: self.0[2],
        }
    }
}

/// Hex placeholder for `/Contents`, room for `reserved_bytes` of token.
pub fn contents_placeholder(reserved_bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(reserved_bytes * 2 + 2);
    out.push(b'<');
    out.resize(reserved_bytes * 2 + 1, b'0');
    out.push(b'>');
    out
}

/// The last `/ByteRange` array in the file, i.e. the newest signature's.
pub fn find_last(data: &[u8]) -> Result<ByteRange, ByteRangeError> {
    let key = rfind_bytes(data, b"/ByteRange").ok_or(ByteRangeError::NotFound)?;
    let mut parser = Parser::at(data, key + b"/ByteRange".len());
    let object = parser.parse_object().map_err(|_| ByteRangeError::NotFound)?;
    let items = object.as_array().map_err(|_| ByteRangeError::NotFound)?;

    let mut values = [0usize; 4];
    if items.len() != 4 {
        return Err(ByteRangeError::NotFound);
    }
    for (slot, item) in values.iter_mut().zip(items) {
        *slot = item
            .as_i64()
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or(ByteRangeError::NotFound)?;
    }
    Ok(ByteRange(values))
}
