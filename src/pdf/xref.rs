//! Cross-reference loading
//!
//! Follows the chain of sections from the final `startxref` backwards through
//! `/Prev` (and hybrid `/XRefStm`) links. Newer sections shadow older ones, so
//! an entry is only recorded the first time its object number is seen.

use std::collections::{BTreeMap, HashSet};

use super::filters::decode_stream;
use super::object::{Dictionary, Object};
use super::parser::{Parser, is_regular, parse_indirect_at, rfind_bytes};
use super::{PdfError, Result};

/// How far around a recorded offset the loader looks for the real section.
const SEARCH_WINDOW: usize = 32;

/// Upper bound on sections followed through `/Prev`.
const MAX_SECTIONS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefEntry {
    Free,
    InFile { offset: usize, generation: u16 },
    InStream { stream: u32, index: u32 },
}

/// Flavour of a cross-reference section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XrefKind {
    #[default]
    Table,
    Stream,
}

#[derive(Debug, Clone, Default)]
pub struct CrossRef {
    pub entries: BTreeMap<u32, XrefEntry>,
    /// Trailer of the newest section
    pub trailer: Dictionary,
    /// Flavour of the newest section
    pub last_kind: XrefKind,
    /// Offset of the newest section, as written after `startxref`
    pub startxref: usize,
}

impl CrossRef {
    fn absorb(&mut self, entries: BTreeMap<u32, XrefEntry>) {
        for (number, entry) in entries {
            self.entries.entry(number).or_insert(entry);
        }
    }
}

/// Offset recorded after the last `startxref` keyword.
pub fn find_startxref(data: &[u8]) -> Result<usize> {
    let keyword = rfind_bytes(data, b"startxref").ok_or(PdfError::MissingStartXref)?;
    let mut parser = Parser::at(data, keyword + b"startxref".len());
    let offset = parser
        .read_unsigned()
        .map_err(|_| PdfError::InvalidXref("startxref is not followed by an offset".into()))?;
    usize::try_from(offset).map_err(|_| PdfError::InvalidXref("startxref offset overflow".into()))
}

/// Load every cross-reference section reachable from `startxref`.
pub fn load(data: &[u8]) -> Result<CrossRef> {
    let startxref = find_startxref(data)?;
    let mut xref = CrossRef {
        startxref,
        ..CrossRef::default()
    };

    let mut visited = HashSet::new();
    let mut next = Some(startxref);
    let mut newest = true;

    while let Some(recorded) = next.take() {
        if visited.len() >= MAX_SECTIONS {
            return Err(PdfError::InvalidXref("too many cross-reference sections".into()));
        }
        let offset = locate_section(data, recorded).ok_or_else(|| {
            PdfError::InvalidXref(format!("no cross-reference section near offset {}", recorded))
        })?;
        if !visited.insert(offset) {
            tracing::warn!(offset, "Cross-reference chain loops back, stopping");
            break;
        }
        if offset != recorded {
            tracing::debug!(recorded, actual = offset, "Cross-reference offset was off");
        }

        let (kind, entries, trailer) = read_section(data, offset)?;

        // Hybrid files: the table's companion stream ranks below the table
        // itself but above anything reached through /Prev
        let mut hybrid = BTreeMap::new();
        if kind == XrefKind::Table {
            if let Some(stm) = trailer.get_i64(b"XRefStm").and_then(|v| usize::try_from(v).ok()) {
                match locate_section(data, stm).map(|at| read_section(data, at)) {
                    Some(Ok((_, stream_entries, _))) => hybrid = stream_entries,
                    _ => tracing::warn!(offset = stm, "Ignoring unreadable /XRefStm section"),
                }
            }
        }

        next = trailer
            .get_i64(b"Prev")
            .and_then(|prev| usize::try_from(prev).ok());

        xref.absorb(entries);
        xref.absorb(hybrid);
        if newest {
            xref.trailer = trailer;
            xref.last_kind = kind;
            newest = false;
        }
    }

    Ok(xref)
}

type Section = (XrefKind, BTreeMap<u32, XrefEntry>, Dictionary);

fn read_section(data: &[u8], offset: usize) -> Result<Section> {
    let mut parser = Parser::at(data, offset);
    parser.skip_whitespace();
    if parser.at_keyword(b"xref") {
        let (entries, trailer) = read_table(&mut parser)?;
        Ok((XrefKind::Table, entries, trailer))
    } else {
        let (entries, trailer) = read_stream(data, parser.position())?;
        Ok((XrefKind::Stream, entries, trailer))
    }
}

fn read_table(parser: &mut Parser<'_>) -> Result<(BTreeMap<u32, XrefEntry>, Dictionary)> {
    parser.expect_keyword(b"xref")?;
    let mut entries = BTreeMap::new();

    loop {
        parser.skip_whitespace();
        if parser.at_keyword(b"trailer") {
            break;
        }
        let first = parser.read_unsigned()?;
        let count = parser.read_unsigned()?;
        for i in 0..count {
            let offset = parser.read_unsigned()?;
            let generation = parser.read_unsigned()?;
            let flag = parser.read_token();
            let number = first
                .checked_add(i)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| PdfError::InvalidXref("object number overflow".into()))?;
            let entry = match flag {
                b"n" => XrefEntry::InFile {
                    offset: usize::try_from(offset).unwrap_or(usize::MAX),
                    generation: generation.min(u64::from(u16::MAX)) as u16,
                },
                b"f" => XrefEntry::Free,
                other => {
                    return Err(PdfError::InvalidXref(format!(
                        "bad entry flag '{}' for object {}",
                        String::from_utf8_lossy(other),
                        number
                    )));
                }
            };
            entries.entry(number).or_insert(entry);
        }
    }

    parser.expect_keyword(b"trailer")?;
    parser.skip_whitespace();
    let trailer = parser.parse_dictionary()?;
    Ok((entries, trailer))
}

fn read_stream(data: &[u8], offset: usize) -> Result<(BTreeMap<u32, XrefEntry>, Dictionary)> {
    let (_, object) = parse_indirect_at(data, offset)?;
    let stream = object.as_stream()?;
    if !stream.dict.has_type(b"XRef") {
        return Err(PdfError::InvalidXref(format!(
            "object at offset {} is not a cross-reference stream",
            offset
        )));
    }

    let widths = stream
        .dict
        .get(b"W")
        .ok_or_else(|| PdfError::InvalidXref("xref stream without /W".into()))?
        .as_array()?
        .iter()
        .map(|w| w.as_i64().map(|w| w.max(0) as usize))
        .collect::<Result<Vec<_>>>()?;
    if widths.len() != 3 || widths.iter().any(|&w| w > 8) {
        return Err(PdfError::InvalidXref(format!("unsupported /W {:?}", widths)));
    }
    let row = widths.iter().sum::<usize>();
    if row == 0 {
        return Err(PdfError::InvalidXref("empty /W".into()));
    }

    let size = stream.dict.get_i64(b"Size").unwrap_or(0).max(0);
    let index = match stream.dict.get(b"Index") {
        Some(Object::Array(items)) => items
            .iter()
            .map(Object::as_i64)
            .collect::<Result<Vec<_>>>()?,
        _ => vec![0, size],
    };

    let decoded = decode_stream(stream)?;
    let mut rows = decoded.chunks_exact(row);
    let mut entries = BTreeMap::new();

    for pair in index.chunks(2) {
        let [first, count] = pair else {
            return Err(PdfError::InvalidXref("odd /Index array".into()));
        };
        for i in 0..(*count).max(0) {
            let Some(fields) = rows.next() else {
                tracing::warn!("Cross-reference stream is shorter than its /Index");
                return Ok((entries, stream.dict.clone()));
            };
            let (kind, rest) = fields.split_at(widths[0]);
            let (second, third) = rest.split_at(widths[1]);
            // A zero-width type field means type 1
            let kind = if widths[0] == 0 { 1 } else { read_be(kind) };
            let number = first
                .checked_add(i)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| PdfError::InvalidXref("object number overflow".into()))?;
            let entry = match kind {
                0 => XrefEntry::Free,
                1 => XrefEntry::InFile {
                    offset: usize::try_from(read_be(second)).unwrap_or(usize::MAX),
                    generation: read_be(third).min(u64::from(u16::MAX)) as u16,
                },
                2 => match (u32::try_from(read_be(second)), u32::try_from(read_be(third))) {
                    (Ok(stream), Ok(index)) => XrefEntry::InStream { stream, index },
                    _ => continue,
                },
                // Unknown types are treated as null references
                _ => continue,
            };
            entries.entry(number).or_insert(entry);
        }
    }

    Ok((entries, stream.dict.clone()))
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Find where the section recorded at `offset` actually begins.
fn locate_section(data: &[u8], offset: usize) -> Option<usize> {
    if section_starts_at(data, offset) {
        return Some(offset);
    }
    let low = offset.saturating_sub(SEARCH_WINDOW);
    let high = offset.saturating_add(SEARCH_WINDOW).min(data.len());
    let mut candidates: Vec<usize> = (low..high).collect();
    candidates.sort_by_key(|&pos| pos.abs_diff(offset));
    candidates
        .into_iter()
        .find(|&pos| section_starts_at(data, pos))
}

fn section_starts_at(data: &[u8], pos: usize) -> bool {
    if pos >= data.len() || (pos > 0 && is_regular(data[pos - 1])) {
        return false;
    }
    let mut parser = Parser::at(data, pos);
    parser.skip_whitespace();
    if parser.at_keyword(b"xref") {
        return true;
    }
    parser.read_unsigned().is_ok()
        && parser.read_unsigned().is_ok()
        && parser.expect_keyword(b"obj").is_ok()
}
