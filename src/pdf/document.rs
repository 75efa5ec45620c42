//! Parsed view over a PDF file
//!
//! [`PdfDocument::open`] trusts the cross-reference data; [`PdfDocument::reconstruct`]
//! ignores it and rebuilds an object index by scanning for `N G obj` headers,
//! which is what the repair path falls back to for damaged files.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

use lazy_static::lazy_static;
use regex::bytes::Regex;

use super::filters::decode_stream;
use super::object::{Dictionary, Object, ObjectId};
use super::parser::{Parser, find_bytes, is_regular, parse_indirect_at};
use super::xref::{self, CrossRef, XrefEntry, XrefKind};
use super::{PdfError, Result};

lazy_static! {
    static ref RE_OBJ_HEADER: Regex = Regex::new(r"(\d+)\s+(\d+)\s+obj\b").unwrap();
    static ref RE_TRAILER: Regex = Regex::new(r"trailer\s*<<").unwrap();
}

/// Attributes a page may inherit from its ancestors in the page tree.
pub const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Maximum nesting of references followed by [`PdfDocument::resolve`].
const MAX_INDIRECTION: usize = 16;

#[derive(Debug, Clone)]
pub struct PageRef {
    pub id: ObjectId,
    pub dict: Dictionary,
    /// Inheritable attributes the page picks up from its ancestors and does
    /// not define itself
    pub inherited: Dictionary,
}

impl PageRef {
    /// Page dictionary with the inherited attributes written in.
    pub fn materialized(&self) -> Dictionary {
        let mut dict = self.dict.clone();
        for (key, value) in self.inherited.iter() {
            if !dict.contains_key(key) {
                dict.set(key, value.clone());
            }
        }
        dict
    }
}

/// Decoded object stream: the decompressed body plus `(number, offset)` pairs.
#[derive(Debug)]
struct ObjectStreamIndex {
    body: Vec<u8>,
    offsets: Vec<(u32, usize)>,
}

pub struct PdfDocument {
    data: Vec<u8>,
    xref: CrossRef,
    reconstructed: bool,
    object_streams: RefCell<HashMap<u32, ObjectStreamIndex>>,
}

impl std::fmt::Debug for PdfDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfDocument")
            .field("len", &self.data.len())
            .field("objects", &self.xref.entries.len())
            .field("reconstructed", &self.reconstructed)
            .finish()
    }
}

impl PdfDocument {
    /// Open a document through its cross-reference chain.
    pub fn open(data: Vec<u8>) -> Result<Self> {
        check_header(&data)?;
        let xref = xref::load(&data)?;
        let document = Self::with_xref(data, xref, false);
        document.root_id()?;
        Ok(document)
    }

    /// Rebuild the object index by scanning the whole file.
    pub fn reconstruct(data: Vec<u8>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for caps in RE_OBJ_HEADER.captures_iter(&data) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > 0 && is_regular(data[whole.start() - 1]) {
                continue;
            }
            let number = parse_capture(caps.get(1).map(|m| m.as_bytes()));
            let generation = parse_capture(caps.get(2).map(|m| m.as_bytes()));
            if let (Some(number), Some(generation)) = (number, generation) {
                let (Ok(number), Ok(generation)) = (u32::try_from(number), u16::try_from(generation))
                else {
                    continue;
                };
                // Later definitions supersede earlier ones
                entries.insert(
                    number,
                    XrefEntry::InFile {
                        offset: whole.start(),
                        generation,
                    },
                );
            }
        }

        if entries.is_empty() {
            return Err(if find_bytes(&data, b"%PDF", 0).is_none() {
                PdfError::MissingHeader
            } else {
                PdfError::InvalidXref("no objects found".into())
            });
        }

        let max_number = entries.keys().next_back().copied().unwrap_or(0);
        let xref = CrossRef {
            entries,
            ..CrossRef::default()
        };
        let mut document = Self::with_xref(data, xref, true);
        document.index_object_streams();
        document.xref.trailer = document.recover_trailer();
        document
            .xref
            .trailer
            .set(b"Size", i64::from(max_number) + 1);

        tracing::debug!(
            objects = document.xref.entries.len(),
            has_root = document.xref.trailer.contains_key(b"Root"),
            "Reconstructed cross-reference index"
        );
        Ok(document)
    }

    /// [`open`](Self::open), falling back to [`reconstruct`](Self::reconstruct).
    pub fn load(data: Vec<u8>) -> Result<Self> {
        match check_header(&data).and_then(|_| xref::load(&data)) {
            Ok(xref) => {
                let document = Self::with_xref(data, xref, false);
                match document.root_id() {
                    Ok(_) => Ok(document),
                    Err(e) => {
                        tracing::warn!(error = %e, "Catalog unreachable, scanning objects");
                        Self::reconstruct(document.data)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cross-reference data unusable, scanning objects");
                Self::reconstruct(data)
            }
        }
    }

    fn with_xref(data: Vec<u8>, xref: CrossRef, reconstructed: bool) -> Self {
        Self {
            data,
            xref,
            reconstructed,
            object_streams: RefCell::new(HashMap::new()),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// True when the object index came from scanning rather than xref data.
    pub fn is_reconstructed(&self) -> bool {
        self.reconstructed
    }

    pub fn trailer(&self) -> &Dictionary {
        &self.xref.trailer
    }

    pub fn entries(&self) -> &BTreeMap<u32, XrefEntry> {
        &self.xref.entries
    }

    pub fn startxref(&self) -> usize {
        self.xref.startxref
    }

    pub fn last_kind(&self) -> XrefKind {
        self.xref.last_kind
    }

    pub fn is_encrypted(&self) -> bool {
        self.xref.trailer.contains_key(b"Encrypt")
    }

    /// First object number not used by any revision.
    pub fn next_object_number(&self) -> u32 {
        let size = self
            .xref
            .trailer
            .get_i64(b"Size")
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0);
        let max = self
            .xref
            .entries
            .keys()
            .next_back()
            .map_or(0, |n| n.saturating_add(1));
        size.max(max).max(1)
    }

    /// Generation currently recorded for `number`, or 0.
    pub fn generation_of(&self, number: u32) -> u16 {
        match self.xref.entries.get(&number) {
            Some(XrefEntry::InFile { generation, .. }) => *generation,
            _ => 0,
        }
    }

    pub fn root_id(&self) -> Result<ObjectId> {
        let root = self
            .xref
            .trailer
            .get(b"Root")
            .ok_or(PdfError::MissingCatalog)?
            .as_reference()
            .map_err(|_| PdfError::MissingCatalog)?;
        let catalog = self.get_object(root).map_err(|_| PdfError::MissingCatalog)?;
        if catalog.as_dict().is_err() {
            return Err(PdfError::MissingCatalog);
        }
        Ok(root)
    }

    pub fn catalog(&self) -> Result<Dictionary> {
        let root = self.root_id()?;
        self.get_object(root)?.into_dict()
    }

    /// Load the object with the given number; the generation is not checked.
    pub fn get_object(&self, id: ObjectId) -> Result<Object> {
        let not_found = || PdfError::ObjectNotFound(id.0, id.1);
        match self.xref.entries.get(&id.0).ok_or_else(not_found)? {
            XrefEntry::Free => Err(not_found()),
            XrefEntry::InFile { offset, .. } => {
                let (found, object) = parse_indirect_at(&self.data, *offset)?;
                if found.0 != id.0 {
                    return Err(PdfError::Syntax {
                        offset: *offset,
                        message: format!("expected object {}, found {}", id.0, found.0),
                    });
                }
                Ok(object)
            }
            XrefEntry::InStream { stream, index } => self.get_compressed(id, *stream, *index),
        }
    }

    /// Follow references until a direct object is reached.
    pub fn resolve(&self, object: &Object) -> Result<Object> {
        let mut current = object.clone();
        for _ in 0..MAX_INDIRECTION {
            match current {
                Object::Reference(id) => current = self.get_object(id)?,
                other => return Ok(other),
            }
        }
        Err(PdfError::Syntax {
            offset: 0,
            message: "reference chain too deep".into(),
        })
    }

    /// Resolve `key` in `dict` to a direct object.
    pub fn resolve_key(&self, dict: &Dictionary, key: &[u8]) -> Option<Object> {
        dict.get(key).and_then(|value| self.resolve(value).ok())
    }

    fn get_compressed(&self, id: ObjectId, stream: u32, index: u32) -> Result<Object> {
        self.ensure_object_stream(stream)?;
        let cache = self.object_streams.borrow();
        let objstm = cache
            .get(&stream)
            .ok_or(PdfError::ObjectNotFound(stream, 0))?;
        let offset = objstm
            .offsets
            .get(index as usize)
            .filter(|(number, _)| *number == id.0)
            .or_else(|| objstm.offsets.iter().find(|(number, _)| *number == id.0))
            .map(|(_, offset)| *offset)
            .ok_or(PdfError::ObjectNotFound(id.0, id.1))?;
        Parser::at(&objstm.body, offset).parse_object()
    }

    fn ensure_object_stream(&self, number: u32) -> Result<()> {
        if self.object_streams.borrow().contains_key(&number) {
            return Ok(());
        }
        let offset = match self.xref.entries.get(&number) {
            Some(XrefEntry::InFile { offset, .. }) => *offset,
            _ => return Err(PdfError::ObjectNotFound(number, 0)),
        };
        let (_, object) = parse_indirect_at(&self.data, offset)?;
        let index = read_object_stream(object.as_stream()?)?;
        self.object_streams.borrow_mut().insert(number, index);
        Ok(())
    }

    /// Add entries for objects that only live inside object streams.
    fn index_object_streams(&mut self) {
        let candidates: Vec<(u32, usize)> = self
            .xref
            .entries
            .iter()
            .filter_map(|(number, entry)| match entry {
                XrefEntry::InFile { offset, .. } => Some((*number, *offset)),
                _ => None,
            })
            .collect();

        for (number, offset) in candidates {
            let Ok((_, Object::Stream(stream))) = parse_indirect_at(&self.data, offset) else {
                continue;
            };
            if !stream.dict.has_type(b"ObjStm") {
                continue;
            }
            let Ok(index) = read_object_stream(&stream) else {
                tracing::debug!(stream = number, "Skipping undecodable object stream");
                continue;
            };
            for (position, (member, _)) in index.offsets.iter().enumerate() {
                self.xref
                    .entries
                    .entry(*member)
                    .or_insert(XrefEntry::InStream {
                        stream: number,
                        index: position as u32,
                    });
            }
            self.object_streams.get_mut().insert(number, index);
        }
    }

    /// Merge every trailer-like dictionary in the file, latest first, and
    /// make sure `/Root` points at a catalog.
    fn recover_trailer(&self) -> Dictionary {
        let mut trailer = Dictionary::new();

        let mut candidates: Vec<Dictionary> = RE_TRAILER
            .find_iter(&self.data)
            .filter_map(|m| {
                let mut parser = Parser::at(&self.data, m.end() - 2);
                parser.parse_dictionary().ok()
            })
            .collect();
        for (number, entry) in &self.xref.entries {
            if let XrefEntry::InFile { offset, .. } = entry {
                if let Ok((_, Object::Stream(stream))) = parse_indirect_at(&self.data, *offset) {
                    if stream.dict.has_type(b"XRef") {
                        tracing::trace!(number, "Found cross-reference stream dictionary");
                        candidates.push(stream.dict);
                    }
                }
            }
        }

        for candidate in candidates.iter().rev() {
            for key in [b"Root".as_slice(), b"Info", b"ID", b"Encrypt"] {
                if trailer.contains_key(key) {
                    continue;
                }
                if let Some(value) = candidate.get(key) {
                    trailer.set(key, value.clone());
                }
            }
        }

        let root_ok = trailer
            .get(b"Root")
            .and_then(|r| r.as_reference().ok())
            .and_then(|id| self.get_object(id).ok())
            .is_some_and(|obj| obj.as_dict().is_ok_and(|d| d.has_type(b"Catalog")));
        if !root_ok {
            trailer.remove(b"Root");
            if let Some(id) = self.find_catalog() {
                trailer.set(b"Root", id);
            }
        }
        trailer
    }

    fn find_catalog(&self) -> Option<ObjectId> {
        self.xref
            .entries
            .keys()
            .rev()
            .map(|&number| (number, self.generation_of(number)))
            .find(|&id| {
                self.get_object(id)
                    .is_ok_and(|obj| obj.as_dict().is_ok_and(|d| d.has_type(b"Catalog")))
            })
    }

    /// Ids of objects stored directly in the file, in file order.
    pub fn objects_in_file_order(&self) -> Vec<ObjectId> {
        let mut located: Vec<(usize, ObjectId)> = self
            .xref
            .entries
            .iter()
            .filter_map(|(number, entry)| match entry {
                XrefEntry::InFile { offset, generation } => Some((*offset, (*number, *generation))),
                _ => None,
            })
            .collect();
        located.sort_unstable();
        located.into_iter().map(|(_, id)| id).collect()
    }

    /// Pages in document order, via a depth-first walk of the page tree.
    pub fn pages(&self) -> Result<Vec<PageRef>> {
        let catalog = self.catalog()?;
        let root = catalog
            .get(b"Pages")
            .ok_or_else(|| PdfError::PageTree("catalog has no /Pages".into()))?
            .as_reference()
            .map_err(|_| PdfError::PageTree("/Pages is not a reference".into()))?;

        let mut pages = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(root, Dictionary::new())];

        while let Some((id, inherited)) = stack.pop() {
            if !visited.insert(id.0) {
                tracing::warn!(object = id.0, "Page tree revisits a node, skipping");
                continue;
            }
            let node = match self.get_object(id).and_then(Object::into_dict) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(object = id.0, error = %e, "Skipping unreadable page tree node");
                    continue;
                }
            };

            let is_pages = node.has_type(b"Pages") || (!node.has_type(b"Page") && node.contains_key(b"Kids"));
            if !is_pages {
                let mut own = Dictionary::new();
                for (key, value) in inherited.iter() {
                    if !node.contains_key(key) {
                        own.set(key, value.clone());
                    }
                }
                pages.push(PageRef {
                    id,
                    dict: node,
                    inherited: own,
                });
                continue;
            }

            let mut passed = inherited;
            for key in INHERITABLE {
                if let Some(value) = node.get(key) {
                    passed.set(key, value.clone());
                }
            }

            let kids = match self.resolve_key(&node, b"Kids") {
                Some(Object::Array(kids)) => kids,
                _ => {
                    tracing::warn!(object = id.0, "Pages node without /Kids array");
                    continue;
                }
            };
            for kid in kids.iter().rev() {
                match kid.as_reference() {
                    Ok(kid) => stack.push((kid, passed.clone())),
                    Err(_) => tracing::warn!(object = id.0, "Ignoring direct page tree kid"),
                }
            }
        }

        Ok(pages)
    }
}

fn check_header(data: &[u8]) -> Result<()> {
    let window = &data[..data.len().min(1024)];
    find_bytes(window, b"%PDF-", 0)
        .map(|_| ())
        .ok_or(PdfError::MissingHeader)
}

fn parse_capture(bytes: Option<&[u8]>) -> Option<u64> {
    std::str::from_utf8(bytes?).ok()?.parse().ok()
}

fn read_object_stream(stream: &super::object::Stream) -> Result<ObjectStreamIndex> {
    let count = stream
        .dict
        .get_i64(b"N")
        .ok_or_else(|| PdfError::Decode("object stream without /N".into()))?;
    let first = stream
        .dict
        .get_i64(b"First")
        .and_then(|f| usize::try_from(f).ok())
        .ok_or_else(|| PdfError::Decode("object stream without /First".into()))?;
    let body = decode_stream(stream)?;

    // Each header pair takes at least four bytes ("1 0 ")
    let count = usize::try_from(count)
        .ok()
        .filter(|&count| count <= body.len() / 4)
        .ok_or_else(|| {
            PdfError::Decode(format!(
                "object stream /N {} does not fit a {} byte body",
                count,
                body.len()
            ))
        })?;

    let mut header = Parser::new(&body);
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        let number = header.read_unsigned()?;
        let offset = header.read_unsigned()?;
        let number = u32::try_from(number)
            .map_err(|_| PdfError::Decode(format!("object number {} out of range", number)))?;
        let offset = usize::try_from(offset)
            .ok()
            .and_then(|offset| first.checked_add(offset))
            .filter(|&offset| offset <= body.len())
            .ok_or_else(|| PdfError::Decode(format!("object {} offset out of range", number)))?;
        offsets.push((number, offset));
    }
    Ok(ObjectStreamIndex { body, offsets })
}
