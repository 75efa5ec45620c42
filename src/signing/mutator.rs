//! Incremental revision carrying a document timestamp field
//!
//! The source bytes are never touched. The new revision adds the signature
//! value dictionary (with the `/ByteRange` and `/Contents` placeholders), a
//! merged field/widget annotation, the updated page or `/Annots` array, the
//! updated AcroForm (and catalog when needed), and a cross-reference section
//! in the same flavour as the one it follows.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use super::byterange::{self, ByteRange, ByteRangeError, Slot};
use crate::digest::HashAlgorithm;
use crate::humanize::ByteSize;
use crate::pdf::writer::{self, CompressedRecord, XrefRecord};
use crate::pdf::{Dictionary, Object, ObjectId, PdfDocument, PdfError, XrefEntry, XrefKind};

/// Widget flags: Print | Locked
const WIDGET_FLAGS: i64 = 132;

/// Signatures exist and the file must be updated incrementally
const SIG_FLAGS: i64 = 3;

/// Largest token slot a revision will reserve.
pub const MAX_RESERVED_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_RESERVED_BYTES: ByteSize = ByteSize(16 * 1024);

/// Depth limit when collecting field names through `/Kids`.
const MAX_FIELD_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum MutateError {
    #[error("invalid PDF structure: {0}")]
    InvalidStructure(String),

    #[error("page index {index} is out of range, the document has {count} pages")]
    PageOutOfRange { index: usize, count: usize },

    #[error("encrypted documents cannot be timestamped")]
    Encrypted,

    #[error("reserved signature size {0} exceeds {max} bytes", max = MAX_RESERVED_BYTES)]
    ReservedTooLarge(u64),
}

impl From<PdfError> for MutateError {
    fn from(e: PdfError) -> Self {
        MutateError::InvalidStructure(e.to_string())
    }
}

impl From<ByteRangeError> for MutateError {
    fn from(e: ByteRangeError) -> Self {
        MutateError::InvalidStructure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MutateError>;

/// Document with a reserved, still empty signature slot.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub bytes: Vec<u8>,
    pub slot: Slot,
    pub byte_range: ByteRange,
    /// Digest of everything outside the slot
    pub digest: Vec<u8>,
    pub hash_algorithm: HashAlgorithm,
    /// Field name actually used (unique within the document)
    pub field_name: String,
    /// Length of the source, where the new revision begins
    pub revision_start: usize,
}

/// Appends signature-field revisions.
#[derive(Debug, Clone)]
pub struct IncrementalMutator {
    reserved: ByteSize,
    hash_algorithm: HashAlgorithm,
}

impl Default for IncrementalMutator {
    fn default() -> Self {
        Self {
            reserved: DEFAULT_RESERVED_BYTES,
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

/// Objects a revision adds or replaces.
struct Revision {
    signature_id: ObjectId,
    objects: Vec<(ObjectId, Object)>,
    next_number: u32,
}

impl IncrementalMutator {
    pub fn new(reserved: ByteSize, hash_algorithm: HashAlgorithm) -> Self {
        Self {
            reserved,
            hash_algorithm,
        }
    }

    /// Append a revision holding a new timestamp signature field on page
    /// `page_index`.
    pub fn append_signature_field(
        &self,
        source: Vec<u8>,
        field_name: &str,
        page_index: usize,
    ) -> Result<PreparedDocument> {
        let reserved = Some(self.reserved.as_u64())
            .filter(|&bytes| bytes <= MAX_RESERVED_BYTES)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or(MutateError::ReservedTooLarge(self.reserved.as_u64()))?;
        let document = PdfDocument::load(source)?;
        if document.is_encrypted() {
            return Err(MutateError::Encrypted);
        }

        let pages = document.pages()?;
        let page = pages.get(page_index).ok_or(MutateError::PageOutOfRange {
            index: page_index,
            count: pages.len(),
        })?;

        let root_id = document.root_id()?;
        let mut catalog = document.catalog()?;

        let (acroform_id, mut acroform) = match catalog.get(b"AcroForm") {
            Some(Object::Reference(id)) => (Some(*id), document.get_object(*id)?.into_dict()?),
            Some(Object::Dictionary(inline)) => (None, inline.clone()),
            _ => (None, Dictionary::new()),
        };
        let mut fields = match document.resolve_key(&acroform, b"Fields") {
            Some(Object::Array(fields)) => fields,
            _ => Vec::new(),
        };

        let unique_name = unique_field_name(&document, &fields, field_name);

        let mut revision = Revision {
            signature_id: (document.next_object_number(), 0),
            objects: Vec::new(),
            next_number: document.next_object_number() + 1,
        };
        let widget_id = revision.allocate();

        // Field and widget merged into one dictionary
        let mut widget = Dictionary::new();
        widget.set(b"Type", Object::name(b"Annot"));
        widget.set(b"Subtype", Object::name(b"Widget"));
        widget.set(b"FT", Object::name(b"Sig"));
        widget.set(b"T", Object::literal(unique_name.as_bytes()));
        widget.set(b"V", revision.signature_id);
        widget.set(
            b"Rect",
            vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(0),
            ],
        );
        widget.set(b"F", WIDGET_FLAGS);
        widget.set(b"P", page.id);
        revision.objects.push((widget_id, widget.into()));

        // Hook the widget into the page's annotations
        match page.dict.get(b"Annots") {
            Some(Object::Reference(annots_id)) => {
                let mut annots = match document.get_object(*annots_id) {
                    Ok(Object::Array(items)) => items,
                    _ => Vec::new(),
                };
                annots.push(Object::Reference(widget_id));
                revision.objects.push((*annots_id, annots.into()));
            }
            existing => {
                let mut annots = match existing {
                    Some(Object::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                annots.push(Object::Reference(widget_id));
                let mut page_dict = page.dict.clone();
                page_dict.set(b"Annots", annots);
                revision.objects.push((page.id, page_dict.into()));
            }
        }

        fields.push(Object::Reference(widget_id));
        acroform.set(b"Fields", fields);
        acroform.set(b"SigFlags", SIG_FLAGS);
        match acroform_id {
            Some(id) => revision.objects.push((id, acroform.into())),
            None => {
                let id = revision.allocate();
                revision.objects.push((id, acroform.into()));
                catalog.set(b"AcroForm", id);
                revision.objects.push((root_id, catalog.into()));
            }
        }

        let reconstructed = document.is_reconstructed();
        let flavour = document.last_kind();
        let prev = document.startxref();
        let trailer = revision_trailer(document.trailer(), root_id);
        let (existing, compressed) = if reconstructed {
            reconstructed_records(&document)
        } else {
            (Vec::new(), Vec::new())
        };

        let mut out = document.into_bytes();
        let revision_start = out.len();
        if !matches!(out.last(), Some(b'\n' | b'\r')) {
            out.push(b'\n');
        }

        let mut records = existing;
        let (byte_range_at, slot) = {
            let offset = out.len();
            records.push(XrefRecord {
                number: revision.signature_id.0,
                generation: revision.signature_id.1,
                offset,
            });
            write_signature_value(&mut out, revision.signature_id, reserved)
        };
        for (id, object) in &revision.objects {
            records.push(XrefRecord {
                number: id.0,
                generation: id.1,
                offset: out.len(),
            });
            writer::write_indirect(&mut out, *id, object);
        }
        dedup_keep_last(&mut records);

        let mut trailer = trailer;
        if !reconstructed {
            trailer.set(b"Prev", prev as i64);
        }
        // Reconstructed indexes are written out whole; the old chain is unusable.
        // Objects living in object streams can only be indexed by a stream.
        if flavour == XrefKind::Stream || !compressed.is_empty() {
            let xref_id = revision.allocate();
            trailer.set(b"Size", i64::from(revision.next_number));
            let at = writer::write_xref_stream(&mut out, xref_id, &records, &compressed, trailer);
            out.extend_from_slice(format!("startxref\n{}\n%%EOF\n", at).as_bytes());
        } else {
            trailer.set(b"Size", i64::from(revision.next_number));
            let at = out.len();
            writer::write_xref_table(&mut out, &records, reconstructed);
            out.extend_from_slice(b"trailer\n");
            writer::write_dictionary(&mut out, &trailer);
            out.extend_from_slice(format!("\nstartxref\n{}\n%%EOF\n", at).as_bytes());
        }

        let byte_range = ByteRange::around(slot, out.len());
        let fixed = byte_range.format_fixed()?;
        out[byte_range_at..byte_range_at + fixed.len()].copy_from_slice(&fixed);

        let digest = byte_range.digest(&out, self.hash_algorithm)?;
        debug!(
            field = %unique_name,
            page = page_index,
            revision_start,
            size = out.len(),
            "Signature field appended"
        );

        Ok(PreparedDocument {
            bytes: out,
            slot,
            byte_range,
            digest,
            hash_algorithm: self.hash_algorithm,
            field_name: unique_name,
            revision_start,
        })
    }
}

impl Revision {
    fn allocate(&mut self) -> ObjectId {
        let id = (self.next_number, 0);
        self.next_number += 1;
        id
    }
}

/// Keep only the last record per object number.
fn dedup_keep_last(records: &mut Vec<XrefRecord>) {
    let mut seen = HashSet::new();
    let mut kept: Vec<XrefRecord> = records
        .iter()
        .rev()
        .filter(|record| seen.insert(record.number))
        .copied()
        .collect();
    kept.reverse();
    *records = kept;
}

/// Write the signature value dictionary. Returns the offset of the ByteRange
/// placeholder and the `/Contents` slot.
fn write_signature_value(out: &mut Vec<u8>, id: ObjectId, reserved_bytes: usize) -> (usize, Slot) {
    out.extend_from_slice(format!("{} {} obj\n", id.0, id.1).as_bytes());
    out.extend_from_slice(
        b"<</Type /DocTimeStamp/Filter /Adobe.PPKLite/SubFilter /ETSI.RFC3161/ByteRange ",
    );
    let byte_range_at = out.len();
    out.extend_from_slice(byterange::PLACEHOLDER);
    out.extend_from_slice(b"/Contents ");
    let start = out.len();
    out.extend_from_slice(&byterange::contents_placeholder(reserved_bytes));
    let end = out.len();
    out.extend_from_slice(b">>\nendobj\n");
    (byte_range_at, Slot { start, end })
}

/// `/Root`, `/Info` and `/ID` carried over from the previous trailer.
fn revision_trailer(previous: &Dictionary, root_id: ObjectId) -> Dictionary {
    let mut trailer = Dictionary::new();
    trailer.set(b"Root", root_id);
    for key in [b"Info".as_slice(), b"ID"] {
        if let Some(value) = previous.get(key) {
            trailer.set(key, value.clone());
        }
    }
    trailer
}

/// Every live object of a reconstructed source, split into in-file and
/// object-stream entries.
fn reconstructed_records(document: &PdfDocument) -> (Vec<XrefRecord>, Vec<CompressedRecord>) {
    let mut records = Vec::new();
    let mut compressed = Vec::new();
    for (&number, entry) in document.entries() {
        match *entry {
            XrefEntry::InFile { offset, generation } if number != 0 => records.push(XrefRecord {
                number,
                generation,
                offset,
            }),
            XrefEntry::InStream { stream, index } => compressed.push(CompressedRecord {
                number,
                stream,
                index,
            }),
            _ => {}
        }
    }
    if !compressed.is_empty() {
        debug!(
            compressed = compressed.len(),
            "Rebuilt index keeps object stream members, writing a cross-reference stream"
        );
    }
    (records, compressed)
}

/// `requested`, or `requested_2`, `requested_3`... whichever is free.
fn unique_field_name(document: &PdfDocument, fields: &[Object], requested: &str) -> String {
    let mut taken = HashSet::new();
    collect_field_names(document, fields, &mut taken, 0);

    if !taken.contains(requested) {
        return requested.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", requested, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| requested.to_string())
}

fn collect_field_names(
    document: &PdfDocument,
    fields: &[Object],
    taken: &mut HashSet<String>,
    depth: usize,
) {
    if depth > MAX_FIELD_DEPTH {
        return;
    }
    for field in fields {
        let Ok(dict) = document.resolve(field).and_then(Object::into_dict) else {
            continue;
        };
        if let Some(Object::String(name, _)) = document.resolve_key(&dict, b"T") {
            taken.insert(String::from_utf8_lossy(&name).into_owned());
        }
        if let Some(Object::Array(kids)) = document.resolve_key(&dict, b"Kids") {
            collect_field_names(document, &kids, taken, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::parser::find_bytes;

    fn simple_pdf(extra_catalog: &str, extra_objects: &[(u32, &str)], pages: usize) -> Vec<u8> {
        let mut objects: Vec<(u32, String)> = vec![
            (1, format!("<< /Type /Catalog /Pages 2 0 R {} >>", extra_catalog)),
        ];
        let kids: Vec<String> = (0..pages).map(|i| format!("{} 0 R", 3 + i)).collect();
        objects.push((
            2,
            format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), pages),
        ));
        for i in 0..pages {
            objects.push((
                3 + i as u32,
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>".to_string(),
            ));
        }
        for (number, body) in extra_objects {
            objects.push((*number, body.to_string()));
        }

        let mut data = b"%PDF-1.4\n".to_vec();
        let mut offsets = std::collections::BTreeMap::new();
        for (number, body) in &objects {
            offsets.insert(*number, data.len());
            data.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", number, body).as_bytes());
        }
        let size = offsets.keys().max().unwrap() + 1;
        let xref = data.len();
        data.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f\r\n", size).as_bytes());
        for number in 1..size {
            match offsets.get(&number) {
                Some(offset) => data.extend_from_slice(format!("{:010} 00000 n\r\n", offset).as_bytes()),
                None => data.extend_from_slice(b"0000000000 00000 f\r\n"),
            }
        }
        data.extend_from_slice(
            format!("trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n", size, xref).as_bytes(),
        );
        data
    }

    fn mutator() -> IncrementalMutator {
        IncrementalMutator::new(ByteSize(64), HashAlgorithm::Sha256)
    }

    #[test]
    fn test_revision_preserves_source_bytes() {
        let source = simple_pdf("", &[], 1);
        let prepared = mutator()
            .append_signature_field(source.clone(), "TimestampSignature", 0)
            .unwrap();
        assert!(prepared.bytes.starts_with(&source));
        assert_eq!(prepared.revision_start, source.len());
        assert_eq!(prepared.field_name, "TimestampSignature");
        assert_eq!(prepared.slot.capacity(), 64);
    }

    #[test]
    fn test_byte_range_and_digest_cover_everything_but_slot() {
        let source = simple_pdf("", &[], 2);
        let prepared = mutator()
            .append_signature_field(source, "TimestampSignature", 1)
            .unwrap();
        let bytes = &prepared.bytes;

        let found = byterange::find_last(bytes).unwrap();
        assert_eq!(found, prepared.byte_range);
        assert_eq!(found.0[1], prepared.slot.start);
        assert_eq!(found.0[2] + found.0[3], bytes.len());
        assert_eq!(bytes[prepared.slot.start], b'<');
        assert_eq!(bytes[prepared.slot.end - 1], b'>');

        let expected = HashAlgorithm::Sha256
            .digest_parts(&[&bytes[..prepared.slot.start], &bytes[prepared.slot.end..]]);
        assert_eq!(prepared.digest, expected);
    }

    #[test]
    fn test_result_reopens_with_field_and_acroform() {
        let source = simple_pdf("", &[], 1);
        let prepared = mutator()
            .append_signature_field(source, "TimestampSignature", 0)
            .unwrap();

        let doc = PdfDocument::open(prepared.bytes).unwrap();
        assert!(!doc.is_reconstructed());
        let catalog = doc.catalog().unwrap();
        let acroform = doc.resolve_key(&catalog, b"AcroForm").unwrap();
        let acroform = acroform.as_dict().unwrap();
        assert_eq!(acroform.get_i64(b"SigFlags"), Some(3));

        let fields = acroform.get(b"Fields").unwrap().as_array().unwrap();
        assert_eq!(fields.len(), 1);
        let widget = doc.resolve(&fields[0]).unwrap();
        let widget = widget.as_dict().unwrap();
        assert_eq!(widget.get_name(b"FT"), Some(b"Sig".as_slice()));
        assert_eq!(widget.get_i64(b"F"), Some(132));

        let value = doc.resolve_key(widget, b"V").unwrap();
        let value = value.as_dict().unwrap();
        assert!(value.has_type(b"DocTimeStamp"));
        assert_eq!(value.get_name(b"SubFilter"), Some(b"ETSI.RFC3161".as_slice()));

        let page = &doc.pages().unwrap()[0];
        let annots = page.dict.get(b"Annots").unwrap().as_array().unwrap();
        assert_eq!(annots, &vec![fields[0].clone()]);
        assert!(doc.trailer().get_i64(b"Prev").is_some());
    }

    #[test]
    fn test_existing_field_name_gets_suffix() {
        let source = simple_pdf(
            "/AcroForm 10 0 R",
            &[
                (10, "<< /Fields [11 0 R 12 0 R] >>"),
                (11, "<< /FT /Sig /T (TimestampSignature) >>"),
                (12, "<< /FT /Sig /T (TimestampSignature_2) >>"),
            ],
            1,
        );
        let prepared = mutator()
            .append_signature_field(source, "TimestampSignature", 0)
            .unwrap();
        assert_eq!(prepared.field_name, "TimestampSignature_3");

        // The existing AcroForm object is updated in place, not replaced
        let doc = PdfDocument::open(prepared.bytes).unwrap();
        let catalog = doc.catalog().unwrap();
        assert_eq!(catalog.get(b"AcroForm"), Some(&Object::Reference((10, 0))));
        let acroform = doc.get_object((10, 0)).unwrap();
        assert_eq!(acroform.as_dict().unwrap().get(b"Fields").unwrap().as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_page_out_of_range() {
        let err = mutator()
            .append_signature_field(simple_pdf("", &[], 1), "TimestampSignature", 3)
            .unwrap_err();
        assert!(matches!(err, MutateError::PageOutOfRange { index: 3, count: 1 }));
    }

    #[test]
    fn test_encrypted_documents_are_rejected() {
        let source = simple_pdf("", &[(9, "<< /Filter /Standard >>")], 1);
        let text = String::from_utf8(source).unwrap();
        let source = text.replace("/Root 1 0 R >>", "/Root 1 0 R /Encrypt 9 0 R >>").into_bytes();
        let err = mutator()
            .append_signature_field(source, "TimestampSignature", 0)
            .unwrap_err();
        assert!(matches!(err, MutateError::Encrypted));
    }

    #[test]
    fn test_garbage_is_invalid_structure() {
        let err = mutator()
            .append_signature_field(b"definitely not a pdf".to_vec(), "TimestampSignature", 0)
            .unwrap_err();
        assert!(matches!(err, MutateError::InvalidStructure(_)));
    }

    #[test]
    fn test_broken_xref_gets_full_table() {
        let mut source = simple_pdf("", &[], 1);
        let marker = find_bytes(&source, b"startxref", 0).unwrap();
        source.truncate(marker);
        source.extend_from_slice(b"startxref\n424242\n%%EOF\n");

        let prepared = mutator()
            .append_signature_field(source, "TimestampSignature", 0)
            .unwrap();
        let doc = PdfDocument::open(prepared.bytes).unwrap();
        assert!(doc.trailer().get(b"Prev").is_none());
        assert_eq!(doc.pages().unwrap().len(), 1);
    }

    #[test]
    fn test_xref_stream_source_keeps_stream_flavour() {
        let mut source = b"%PDF-1.5\n".to_vec();
        let mut records = Vec::new();
        for (number, body) in [
            (1u32, "<< /Type /Catalog /Pages 2 0 R >>"),
            (2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>"),
            (3, "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>"),
        ] {
            records.push(XrefRecord {
                number,
                generation: 0,
                offset: source.len(),
            });
            source.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", number, body).as_bytes());
        }
        let mut trailer = Dictionary::new();
        trailer.set(b"Size", 5i64);
        trailer.set(b"Root", (1u32, 0u16));
        let at = writer::write_xref_stream(&mut source, (4, 0), &records, &[], trailer);
        source.extend_from_slice(format!("startxref\n{}\n%%EOF\n", at).as_bytes());

        let prepared = mutator()
            .append_signature_field(source, "TimestampSignature", 0)
            .unwrap();
        let doc = PdfDocument::open(prepared.bytes).unwrap();
        assert_eq!(doc.last_kind(), XrefKind::Stream);
        assert_eq!(doc.pages().unwrap().len(), 1);
    }
    #[test]
    fn test_reconstructed_source_keeps_object_stream_members() {
        let bodies = [
            "<< /Type /Catalog /Pages 2 0 R >>",
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>",
        ];
        let mut header = String::new();
        let mut members = String::new();
        for (i, body) in bodies.iter().enumerate() {
            header.push_str(&format!("{} {} ", i + 1, members.len()));
            members.push_str(body);
            members.push(' ');
        }
        let content = format!("{}{}", header, members);
        let source = format!(
            "%PDF-1.5\n4 0 obj\n<< /Type /ObjStm /N 3 /First {} /Length {} >>\nstream\n{}\nendstream\nendobj\ntrailer\n<< /Size 5 /Root 1 0 R >>\nstartxref\n999999\n%%EOF\n",
            header.len(),
            content.len(),
            content
        )
        .into_bytes();

        let prepared = mutator()
            .append_signature_field(source.clone(), "TimestampSignature", 0)
            .unwrap();
        assert!(prepared.bytes.starts_with(&source));

        let doc = PdfDocument::open(prepared.bytes).unwrap();
        assert_eq!(doc.last_kind(), XrefKind::Stream);
        assert!(doc.trailer().get(b"Prev").is_none());
        assert!(matches!(
            doc.entries().get(&2),
            Some(XrefEntry::InStream { stream: 4, .. })
        ));
        assert_eq!(doc.pages().unwrap().len(), 1);
        let catalog = doc.catalog().unwrap();
        assert!(doc.resolve_key(&catalog, b"AcroForm").is_some());
    }

    #[test]
    fn test_oversized_reservation_is_rejected() {
        for bytes in [MAX_RESERVED_BYTES + 1, u64::MAX] {
            let mutator = IncrementalMutator::new(ByteSize(bytes), HashAlgorithm::Sha256);
            let err = mutator
                .append_signature_field(simple_pdf("", &[], 1), "TimestampSignature", 0)
                .unwrap_err();
            assert!(matches!(err, MutateError::ReservedTooLarge(b) if b == bytes));
        }
    }
}
