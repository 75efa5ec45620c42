//! Structural repair
//!
//! Rebuilds a damaged document from whatever pages can still be recovered:
//! a fresh catalog, a single flat page tree, every page with its inherited
//! attributes written in, and the objects those pages reference copied over
//! and renumbered from 1 upward.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pdf::document::INHERITABLE;
use crate::pdf::writer::DocumentWriter;
use crate::pdf::{Dictionary, Object, ObjectId, PageRef, PdfDocument, PdfError};

/// How far up `/Parent` links a loose page is followed for inherited values.
const MAX_PARENT_DEPTH: usize = 32;

const CATALOG_NUMBER: u32 = 1;
const PAGES_NUMBER: u32 = 2;
const FIRST_PAGE_NUMBER: u32 = 3;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("document cannot be parsed: {0}")]
    Unparseable(String),

    #[error("no recoverable pages")]
    NoPages,

    #[error("encrypted documents cannot be rebuilt")]
    Encrypted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RepairError>;

/// Read `path` and rebuild it in memory. Nothing is written to disk.
pub fn repair(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let data = std::fs::read(path.as_ref())?;
    repair_bytes(data)
}

/// Rebuild a document from its bytes.
pub fn repair_bytes(data: Vec<u8>) -> Result<Vec<u8>> {
    let document = PdfDocument::load(data).map_err(|e| match e {
        PdfError::MissingHeader => RepairError::Unparseable(e.to_string()),
        other => {
            debug!(error = %other, "Loader found no objects");
            RepairError::NoPages
        }
    })?;
    // Strings and streams stay encrypted under the original key
    if document.is_encrypted() {
        return Err(RepairError::Encrypted);
    }

    let pages = recover_pages(&document);
    if pages.is_empty() {
        return Err(RepairError::NoPages);
    }

    let mut copier = Copier::new(&document);
    for (index, page) in pages.iter().enumerate() {
        copier
            .numbers
            .insert(page.id.0, FIRST_PAGE_NUMBER + index as u32);
    }
    copier.next = FIRST_PAGE_NUMBER + pages.len() as u32;

    let mut writer = DocumentWriter::new();
    let mut kids = Vec::with_capacity(pages.len());
    for (index, page) in pages.iter().enumerate() {
        let number = FIRST_PAGE_NUMBER + index as u32;
        let mut dict = page.materialized();
        dict.remove(b"Parent");
        let mut dict = match copier.remap(Object::Dictionary(dict)) {
            Object::Dictionary(dict) => dict,
            _ => Dictionary::new(),
        };
        dict.set(b"Type", Object::name(b"Page"));
        dict.set(b"Parent", (PAGES_NUMBER, 0u16));
        writer.add(number, dict.into());
        kids.push(Object::Reference((number, 0)));
    }

    let info = match document.trailer().get(b"Info") {
        Some(value) => match document.resolve(value) {
            Ok(Object::Dictionary(info)) => Some(copier.remap(Object::Dictionary(info))),
            _ => {
                warn!("Document information dictionary is unreadable, dropping it");
                None
            }
        },
        None => None,
    };
    let info_number = info.map(|info| {
        let number = copier.allocate();
        writer.add(number, info);
        number
    });

    copier.drain(&mut writer);

    let mut page_tree = Dictionary::new();
    page_tree.set(b"Type", Object::name(b"Pages"));
    page_tree.set(b"Count", pages.len() as i64);
    page_tree.set(b"Kids", kids);
    writer.add(PAGES_NUMBER, page_tree.into());

    let mut catalog = Dictionary::new();
    catalog.set(b"Type", Object::name(b"Catalog"));
    catalog.set(b"Pages", (PAGES_NUMBER, 0u16));
    writer.add(CATALOG_NUMBER, catalog.into());

    let mut trailer = Dictionary::new();
    trailer.set(b"Root", (CATALOG_NUMBER, 0u16));
    if let Some(number) = info_number {
        trailer.set(b"Info", (number, 0u16));
    }

    let objects = writer.len();
    let bytes = writer.finish(trailer);
    info!(
        pages = pages.len(),
        objects,
        reconstructed = document.is_reconstructed(),
        size = bytes.len(),
        "Document rebuilt"
    );
    Ok(bytes)
}

/// Pages from the page tree, or failing that every page object in file order.
fn recover_pages(document: &PdfDocument) -> Vec<PageRef> {
    match document.pages() {
        Ok(pages) if !pages.is_empty() => return pages,
        Ok(_) => warn!("Page tree is empty, scanning for page objects"),
        Err(e) => warn!(error = %e, "Page tree unusable, scanning for page objects"),
    }

    document
        .objects_in_file_order()
        .into_iter()
        .filter_map(|id| {
            let dict = document.get_object(id).ok()?.into_dict().ok()?;
            dict.has_type(b"Page").then(|| loose_page(document, id, dict))
        })
        .collect()
}

/// A page found outside the tree; inheritable values still come from
/// whatever `/Parent` chain is left.
fn loose_page(document: &PdfDocument, id: ObjectId, dict: Dictionary) -> PageRef {
    let mut inherited = Dictionary::new();
    let mut seen = HashSet::from([id.0]);
    let mut parent = dict.get(b"Parent").and_then(|p| p.as_reference().ok());

    for _ in 0..MAX_PARENT_DEPTH {
        let Some(parent_id) = parent else { break };
        if !seen.insert(parent_id.0) {
            break;
        }
        let Ok(node) = document.get_object(parent_id).and_then(Object::into_dict) else {
            break;
        };
        for key in INHERITABLE {
            if !dict.contains_key(key) && !inherited.contains_key(key) {
                if let Some(value) = node.get(key) {
                    inherited.set(key, value.clone());
                }
            }
        }
        parent = node.get(b"Parent").and_then(|p| p.as_reference().ok());
    }

    PageRef {
        id,
        dict,
        inherited,
    }
}

/// Copies referenced objects into the new numbering.
struct Copier<'a> {
    document: &'a PdfDocument,
    /// Old object number to new object number
    numbers: HashMap<u32, u32>,
    /// Old objects assigned a number but not yet written
    pending: VecDeque<(ObjectId, u32)>,
    next: u32,
}

impl<'a> Copier<'a> {
    fn new(document: &'a PdfDocument) -> Self {
        Self {
            document,
            numbers: HashMap::new(),
            pending: VecDeque::new(),
            next: FIRST_PAGE_NUMBER,
        }
    }

    fn allocate(&mut self) -> u32 {
        let number = self.next;
        self.next += 1;
        number
    }

    /// Rewrite every reference inside `object` to the new numbering.
    fn remap(&mut self, object: Object) -> Object {
        match object {
            Object::Reference(id) => self.map_reference(id),
            Object::Array(items) => {
                Object::Array(items.into_iter().map(|item| self.remap(item)).collect())
            }
            Object::Dictionary(dict) => Object::Dictionary(self.remap_dict(dict)),
            Object::Stream(mut stream) => {
                // Rewritten from the actual content length
                stream.dict.remove(b"Length");
                stream.dict = self.remap_dict(stream.dict);
                Object::Stream(stream)
            }
            other => other,
        }
    }

    fn remap_dict(&mut self, dict: Dictionary) -> Dictionary {
        let entries: Vec<(Vec<u8>, Object)> = dict
            .iter()
            .map(|(key, value)| (key.to_vec(), value.clone()))
            .collect();
        entries
            .into_iter()
            .map(|(key, value)| (key, self.remap(value)))
            .collect()
    }

    fn map_reference(&mut self, id: ObjectId) -> Object {
        if let Some(number) = self.numbers.get(&id.0) {
            return Object::Reference((*number, 0));
        }
        let Ok(target) = self.document.get_object(id) else {
            return Object::Null;
        };
        // Pages that were not recovered and old tree nodes stay behind
        if target
            .as_dict()
            .is_ok_and(|d| d.has_type(b"Page") || d.has_type(b"Pages"))
        {
            return Object::Null;
        }

        let number = self.allocate();
        self.numbers.insert(id.0, number);
        self.pending.push_back((id, number));
        Object::Reference((number, 0))
    }

    /// Copy everything reached so far, and everything that reaches in turn.
    fn drain(&mut self, writer: &mut DocumentWriter) {
        while let Some((old, number)) = self.pending.pop_front() {
            match self.document.get_object(old) {
                Ok(object) => {
                    let copied = self.remap(object);
                    writer.add(number, copied);
                }
                Err(e) => {
                    debug!(object = old.0, error = %e, "Referenced object vanished");
                    writer.add(number, Object::Null);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(objects: &[(u32, &str)], trailer: &str) -> Vec<u8> {
        let mut data = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::new();
        for (number, body) in objects {
            offsets.push((*number, data.len()));
            data.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", number, body).as_bytes());
        }
        let size = objects.iter().map(|(n, _)| *n).max().unwrap_or(0) + 1;
        let xref = data.len();
        data.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f\r\n", size).as_bytes());
        for number in 1..size {
            match offsets.iter().find(|(n, _)| *n == number) {
                Some((_, offset)) => {
                    data.extend_from_slice(format!("{:010} 00000 n\r\n", offset).as_bytes())
                }
                None => data.extend_from_slice(b"0000000000 00000 f\r\n"),
            }
        }
        data.extend_from_slice(
            format!(
                "trailer\n<< /Size {} {} >>\nstartxref\n{}\n%%EOF\n",
                size, trailer, xref
            )
            .as_bytes(),
        );
        data
    }

    fn nested() -> Vec<u8> {
        build(
            &[
                (1, "<< /Type /Catalog /Pages 2 0 R /Outlines 9 0 R >>"),
                (2, "<< /Type /Pages /Kids [3 0 R 4 0 R] /Count 3 /MediaBox [0 0 612 792] >>"),
                (3, "<< /Type /Page /Parent 2 0 R /Contents 6 0 R >>"),
                (4, "<< /Type /Pages /Parent 2 0 R /Kids [5 0 R] /Count 1 /Rotate 90 >>"),
                (5, "<< /Type /Page /Parent 4 0 R /Contents 7 0 R /Resources << /Font << /F1 8 0 R >> >> >>"),
                (6, "<< /Length 12 >>\nstream\nBT (A) Tj ET\nendstream"),
                (7, "<< /Length 12 >>\nstream\nBT (B) Tj ET\nendstream"),
                (8, "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>"),
                (9, "<< /Type /Outlines /Count 0 >>"),
                (10, "<< /Title (Quarterly) >>"),
            ],
            "/Root 1 0 R /Info 10 0 R",
        )
    }

    fn page_contents(document: &PdfDocument) -> Vec<Vec<u8>> {
        document
            .pages()
            .unwrap()
            .iter()
            .map(|page| {
                let contents = document.resolve_key(&page.dict, b"Contents").unwrap();
                contents.as_stream().unwrap().content.clone()
            })
            .collect()
    }

    #[test]
    fn test_repair_flattens_and_materializes() {
        let repaired = repair_bytes(nested()).unwrap();
        let doc = PdfDocument::open(repaired).unwrap();

        let catalog = doc.catalog().unwrap();
        assert!(catalog.get(b"Outlines").is_none());
        let tree = doc.resolve_key(&catalog, b"Pages").unwrap();
        let tree = tree.as_dict().unwrap();
        assert_eq!(tree.get_i64(b"Count"), Some(2));

        let pages = doc.pages().unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.inherited.is_empty()));
        assert_eq!(pages[0].id, (3, 0));
        assert_eq!(pages[1].dict.get_i64(b"Rotate"), Some(90));
        assert!(pages[1].dict.get(b"MediaBox").is_some());

        assert_eq!(
            page_contents(&doc),
            vec![b"BT (A) Tj ET".to_vec(), b"BT (B) Tj ET".to_vec()]
        );

        let info = doc.resolve_key(doc.trailer(), b"Info").unwrap();
        assert_eq!(
            info.as_dict().unwrap().get(b"Title"),
            Some(&Object::literal(b"Quarterly".to_vec()))
        );
    }

    #[test]
    fn test_repair_is_idempotent() {
        let once = repair_bytes(nested()).unwrap();
        let twice = repair_bytes(once.clone()).unwrap();
        assert_eq!(once, twice);

        let first = PdfDocument::open(once).unwrap();
        let second = PdfDocument::open(twice).unwrap();
        assert_eq!(page_contents(&first), page_contents(&second));
    }

    #[test]
    fn test_broken_tree_falls_back_to_file_order() {
        let data = build(
            &[
                (1, "<< /Type /Catalog /Pages 40 0 R >>"),
                (2, "<< /Type /Page /MediaBox [0 0 100 100] >>"),
                (3, "<< /Type /Page /MediaBox [0 0 200 200] >>"),
            ],
            "/Root 1 0 R",
        );
        let doc = PdfDocument::open(repair_bytes(data).unwrap()).unwrap();
        let pages = doc.pages().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(
            pages[1].dict.get(b"MediaBox").unwrap().as_array().unwrap()[2],
            Object::Integer(200)
        );
    }

    #[test]
    fn test_corrupt_xref_is_recovered() {
        let mut data = nested();
        let at = crate::pdf::parser::rfind_bytes(&data, b"startxref").unwrap();
        data.truncate(at);
        data.extend_from_slice(b"startxref\n99999\n%%EOF\n");
        let doc = PdfDocument::open(repair_bytes(data).unwrap()).unwrap();
        assert_eq!(doc.pages().unwrap().len(), 2);
    }

    #[test]
    fn test_unparseable_and_pageless_inputs() {
        assert!(matches!(
            repair_bytes(b"just some text".to_vec()),
            Err(RepairError::Unparseable(_))
        ));

        let pageless = build(&[(1, "<< /Type /Catalog >>")], "/Root 1 0 R");
        assert!(matches!(repair_bytes(pageless), Err(RepairError::NoPages)));
    }

    #[test]
    fn test_encrypted_inputs_are_refused() {
        let mut objects = vec![(11, "<< /Filter /Standard /V 2 /R 3 /O <00> /U <00> /P -4 >>")];
        objects.extend([
            (1, "<< /Type /Catalog /Pages 2 0 R >>"),
            (2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>"),
            (3, "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>"),
        ]);
        let encrypted = build(&objects, "/Root 1 0 R /Encrypt 11 0 R /ID [<01> <01>]");
        assert!(matches!(
            repair_bytes(encrypted.clone()),
            Err(RepairError::Encrypted)
        ));

        // Same file with its xref pointer broken goes through reconstruction
        let at = crate::pdf::parser::rfind_bytes(&encrypted, b"startxref").unwrap();
        let mut broken = encrypted[..at].to_vec();
        broken.extend_from_slice(b"startxref\n777777\n%%EOF\n");
        assert!(matches!(repair_bytes(broken), Err(RepairError::Encrypted)));
    }

    #[test]
    fn test_repair_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.pdf");
        std::fs::write(&path, nested()).unwrap();
        let repaired = repair(&path).unwrap();
        assert!(repaired.starts_with(b"%PDF-1.7"));
        assert_eq!(std::fs::read(&path).unwrap(), nested());

        let missing = repair(dir.path().join("missing.pdf"));
        assert!(matches!(missing, Err(RepairError::Io(_))));
    }
}
