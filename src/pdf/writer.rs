//! Object serialization and cross-reference writing

use std::collections::BTreeMap;

use super::object::{Dictionary, Object, ObjectId, StringFormat};

/// Binary comment written after the header so transfer tools treat the file
/// as binary.
const BINARY_MARKER: &[u8] = b"%\xE2\xE3\xCF\xD3\n";

/// Serialize a direct object.
pub fn write_object(out: &mut Vec<u8>, object: &Object) {
    match object {
        Object::Null => out.extend_from_slice(b"null"),
        Object::Boolean(value) => out.extend_from_slice(if *value { b"true" } else { b"false" }),
        Object::Integer(value) => out.extend_from_slice(value.to_string().as_bytes()),
        Object::Real(value) => write_real(out, *value),
        Object::Name(name) => write_name(out, name),
        Object::String(bytes, StringFormat::Literal) => write_literal(out, bytes),
        Object::String(bytes, StringFormat::Hexadecimal) => {
            out.push(b'<');
            out.extend_from_slice(hex::encode_upper(bytes).as_bytes());
            out.push(b'>');
        }
        Object::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                write_object(out, item);
            }
            out.push(b']');
        }
        Object::Dictionary(dict) => write_dictionary(out, dict),
        Object::Stream(stream) => {
            let mut dict = stream.dict.clone();
            dict.set(b"Length", stream.content.len() as i64);
            write_dictionary(out, &dict);
            out.extend_from_slice(b"\nstream\n");
            out.extend_from_slice(&stream.content);
            out.extend_from_slice(b"\nendstream");
        }
        Object::Reference((number, generation)) => {
            out.extend_from_slice(format!("{} {} R", number, generation).as_bytes());
        }
    }
}

pub fn write_dictionary(out: &mut Vec<u8>, dict: &Dictionary) {
    out.extend_from_slice(b"<<");
    for (key, value) in dict.iter() {
        write_name(out, key);
        out.push(b' ');
        write_object(out, value);
    }
    out.extend_from_slice(b">>");
}

/// `N G obj ... endobj` with a trailing newline.
pub fn write_indirect(out: &mut Vec<u8>, id: ObjectId, object: &Object) {
    out.extend_from_slice(format!("{} {} obj\n", id.0, id.1).as_bytes());
    write_object(out, object);
    out.extend_from_slice(b"\nendobj\n");
}

pub fn to_bytes(object: &Object) -> Vec<u8> {
    let mut out = Vec::new();
    write_object(&mut out, object);
    out
}

fn write_name(out: &mut Vec<u8>, name: &[u8]) {
    out.push(b'/');
    for &byte in name {
        let plain = (0x21..=0x7E).contains(&byte)
            && byte != b'#'
            && !super::parser::is_delimiter(byte);
        if plain {
            out.push(byte);
        } else {
            out.extend_from_slice(format!("#{:02X}", byte).as_bytes());
        }
    }
}

fn write_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'(');
    for &byte in bytes {
        match byte {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(byte);
            }
            b'\r' => out.extend_from_slice(b"\\r"),
            _ => out.push(byte),
        }
    }
    out.push(b')');
}

fn write_real(out: &mut Vec<u8>, value: f64) {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        out.extend_from_slice(format!("{}", value as i64).as_bytes());
        return;
    }
    let text = format!("{:.6}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    out.extend_from_slice(text.as_bytes());
}

/// One in-use cross-reference entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XrefRecord {
    pub number: u32,
    pub generation: u16,
    pub offset: usize,
}

/// Group sorted records into contiguous `(first, records)` runs.
fn subsections(records: &[XrefRecord]) -> Vec<(u32, Vec<XrefRecord>)> {
    let mut sorted = records.to_vec();
    sorted.sort_by_key(|r| r.number);
    sorted.dedup_by_key(|r| r.number);

    let mut runs: Vec<(u32, Vec<XrefRecord>)> = Vec::new();
    for record in sorted {
        match runs.last_mut() {
            Some((first, run)) if *first + run.len() as u32 == record.number => run.push(record),
            _ => runs.push((record.number, vec![record])),
        }
    }
    runs
}

/// Classic `xref` section. With `free_head`, object 0 is written as the head
/// of the free list.
pub fn write_xref_table(out: &mut Vec<u8>, records: &[XrefRecord], free_head: bool) {
    out.extend_from_slice(b"xref\n");
    let mut runs = subsections(records);
    if free_head {
        if runs.first().is_some_and(|(first, _)| *first == 1) {
            let (_, run) = runs.remove(0);
            out.extend_from_slice(format!("0 {}\n", run.len() + 1).as_bytes());
            out.extend_from_slice(b"0000000000 65535 f\r\n");
            write_table_rows(out, &run);
        } else {
            out.extend_from_slice(b"0 1\n0000000000 65535 f\r\n");
        }
    }
    for (first, run) in &runs {
        out.extend_from_slice(format!("{} {}\n", first, run.len()).as_bytes());
        write_table_rows(out, run);
    }
}

fn write_table_rows(out: &mut Vec<u8>, run: &[XrefRecord]) {
    for record in run {
        out.extend_from_slice(
            format!("{:010} {:05} n\r\n", record.offset, record.generation).as_bytes(),
        );
    }
}

/// An object stored inside an object stream (type 2 entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedRecord {
    pub number: u32,
    pub stream: u32,
    pub index: u32,
}

/// Bytes needed to hold `value`, at least one.
fn field_width(value: u64) -> usize {
    (64 - value.leading_zeros() as usize).div_ceil(8).max(1)
}

/// Append an uncompressed cross-reference stream as object `id`, covering
/// `records`, `compressed` and the stream itself. An in-file record shadows a
/// compressed one with the same number. Field widths grow with the largest
/// value, so large offsets are never cut. Returns the stream's offset.
pub fn write_xref_stream(
    out: &mut Vec<u8>,
    id: ObjectId,
    records: &[XrefRecord],
    compressed: &[CompressedRecord],
    mut trailer: Dictionary,
) -> usize {
    let offset = out.len();

    // number -> (type, field 2, field 3)
    let mut rows: BTreeMap<u32, (u8, u64, u64)> = compressed
        .iter()
        .map(|c| (c.number, (2, u64::from(c.stream), u64::from(c.index))))
        .collect();
    let own = XrefRecord {
        number: id.0,
        generation: id.1,
        offset,
    };
    // Reversed so the first record for a number is the one kept
    for record in records.iter().chain(std::iter::once(&own)).rev() {
        rows.insert(
            record.number,
            (1, record.offset as u64, u64::from(record.generation)),
        );
    }

    let second = field_width(rows.values().map(|row| row.1).max().unwrap_or(0));
    let third = field_width(rows.values().map(|row| row.2).max().unwrap_or(0));

    let mut data = Vec::with_capacity(rows.len() * (1 + second + third));
    let mut index: Vec<(u32, i64)> = Vec::new();
    for (&number, &(kind, field2, field3)) in &rows {
        match index.last_mut() {
            Some((first, count)) if i64::from(*first) + *count == i64::from(number) => *count += 1,
            _ => index.push((number, 1)),
        }
        data.push(kind);
        data.extend_from_slice(&field2.to_be_bytes()[8 - second..]);
        data.extend_from_slice(&field3.to_be_bytes()[8 - third..]);
    }

    trailer.set(b"Type", Object::name(b"XRef"));
    trailer.set(
        b"W",
        vec![
            Object::Integer(1),
            Object::Integer(second as i64),
            Object::Integer(third as i64),
        ],
    );
    trailer.set(
        b"Index",
        index
            .into_iter()
            .flat_map(|(first, count)| [Object::Integer(i64::from(first)), Object::Integer(count)])
            .collect::<Vec<_>>(),
    );
    for key in [b"Filter".as_slice(), b"DecodeParms", b"Length", b"XRefStm"] {
        trailer.remove(key);
    }

    let stream = Object::Stream(super::object::Stream::new(trailer, data));
    write_indirect(out, id, &stream);
    offset
}

/// Writer for a complete single-revision document.
#[derive(Debug, Default)]
pub struct DocumentWriter {
    objects: BTreeMap<u32, Object>,
}

impl DocumentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, number: u32, object: Object) {
        self.objects.insert(number, object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Serialize everything with a classic xref and the given trailer
    /// (`/Size` is filled in).
    pub fn finish(self, mut trailer: Dictionary) -> Vec<u8> {
        let mut out = b"%PDF-1.7\n".to_vec();
        out.extend_from_slice(BINARY_MARKER);

        let mut records = Vec::with_capacity(self.objects.len());
        for (number, object) in &self.objects {
            records.push(XrefRecord {
                number: *number,
                generation: 0,
                offset: out.len(),
            });
            write_indirect(&mut out, (*number, 0), object);
        }

        let size = self.objects.keys().next_back().map_or(1, |n| n + 1);
        trailer.set(b"Size", i64::from(size));

        let startxref = out.len();
        write_xref_table(&mut out, &records, true);
        out.extend_from_slice(b"trailer\n");
        write_dictionary(&mut out, &trailer);
        out.extend_from_slice(format!("\nstartxref\n{}\n%%EOF\n", startxref).as_bytes());
        out
    }
}
