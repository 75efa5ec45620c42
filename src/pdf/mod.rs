//! Minimal PDF structural layer
//!
//! Just enough of ISO 32000 to open a document through its cross-reference
//! data, resolve objects (including compressed object streams), walk the page
//! tree, and serialize objects back out for full rewrites and incremental
//! updates.
//!
//! - [`PdfDocument`] - parsed view over the document bytes
//! - [`Object`] / [`Dictionary`] - object model
//! - [`writer`] - serialization, full documents and xref sections

pub mod document;
pub mod filters;
pub mod object;
pub mod parser;
pub mod writer;
pub mod xref;

pub use document::{PageRef, PdfDocument};
pub use object::{Dictionary, Object, ObjectId, Stream, StringFormat};
pub use xref::{XrefEntry, XrefKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEof(usize),

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("missing %PDF header")]
    MissingHeader,

    #[error("startxref marker not found")]
    MissingStartXref,

    #[error("invalid cross-reference data: {0}")]
    InvalidXref(String),

    #[error("object {0} {1} R not found")]
    ObjectNotFound(u32, u16),

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),

    #[error("stream decoding failed: {0}")]
    Decode(String),

    #[error("document catalog not found")]
    MissingCatalog,

    #[error("page tree is malformed: {0}")]
    PageTree(String),
}

pub type Result<T> = std::result::Result<T, PdfError>;
