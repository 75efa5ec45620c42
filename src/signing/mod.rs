//! Document timestamp signatures
//!
//! [`IncrementalMutator`] appends a revision with an empty signature slot and
//! reports the digest to timestamp; [`embed`] fills the slot with the token.

pub mod byterange;
pub mod embed;
pub mod mutator;

pub use byterange::{ByteRange, ByteRangeError, Slot};
pub use embed::{EmbedError, embed, signed_digest};
pub use mutator::{IncrementalMutator, MutateError, PreparedDocument};
