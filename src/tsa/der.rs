//! Minimal ASN.1 DER codec
//!
//! Covers the handful of universal types the timestamp protocol uses. The
//! reader also accepts the BER forms some authorities still emit:
//! indefinite lengths and constructed OCTET STRINGs.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

pub mod tag {
    pub const BOOLEAN: u8 = 0x01;
    pub const INTEGER: u8 = 0x02;
    pub const BIT_STRING: u8 = 0x03;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OID: u8 = 0x06;
    pub const UTF8_STRING: u8 = 0x0C;
    pub const GENERALIZED_TIME: u8 = 0x18;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;

    /// Constructed bit
    pub const CONSTRUCTED: u8 = 0x20;

    /// Context-specific tag `[n]`, constructed when `constructed` is set.
    pub const fn context(n: u8, constructed: bool) -> u8 {
        let form = if constructed { CONSTRUCTED } else { 0 };
        0x80 | form | (n & 0x1F)
    }
}

/// Nesting limit for indefinite-length scanning.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerError {
    #[error("truncated element at offset {0}")]
    Truncated(usize),

    #[error("invalid length encoding at offset {0}")]
    BadLength(usize),

    #[error("expected tag 0x{expected:02x}, found 0x{found:02x} at offset {offset}")]
    UnexpectedTag { expected: u8, found: u8, offset: usize },

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, DerError>;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

fn constructed(tag: u8, parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(tag, &parts.concat())
}

pub fn sequence(parts: &[Vec<u8>]) -> Vec<u8> {
    constructed(tag::SEQUENCE, parts)
}

pub fn set(parts: &[Vec<u8>]) -> Vec<u8> {
    constructed(tag::SET, parts)
}

/// `[n] EXPLICIT` wrapper around an already encoded element.
pub fn explicit(n: u8, inner: &[u8]) -> Vec<u8> {
    tlv(tag::context(n, true), inner)
}

pub fn null() -> Vec<u8> {
    vec![tag::NULL, 0]
}

pub fn boolean(value: bool) -> Vec<u8> {
    tlv(tag::BOOLEAN, &[if value { 0xFF } else { 0x00 }])
}

pub fn octet_string(bytes: &[u8]) -> Vec<u8> {
    tlv(tag::OCTET_STRING, bytes)
}

pub fn utf8_string(text: &str) -> Vec<u8> {
    tlv(tag::UTF8_STRING, text.as_bytes())
}

/// Non-negative INTEGER from unsigned big-endian magnitude bytes.
pub fn unsigned_integer(magnitude: &[u8]) -> Vec<u8> {
    let trimmed = trim_leading_zeros(magnitude);
    let mut content = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().is_none_or(|&b| b & 0x80 != 0) {
        content.push(0);
    }
    content.extend_from_slice(trimmed);
    tlv(tag::INTEGER, &content)
}

pub fn integer(value: u64) -> Vec<u8> {
    unsigned_integer(&value.to_be_bytes())
}

pub fn oid(dotted: &str) -> Result<Vec<u8>> {
    let arcs = dotted
        .split('.')
        .map(|arc| arc.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| DerError::Invalid(format!("invalid object identifier '{}'", dotted)))?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(DerError::Invalid(format!(
            "invalid object identifier '{}'",
            dotted
        )));
    }

    let mut content = Vec::new();
    let first = arcs[0] * 40 + arcs[1];
    for arc in std::iter::once(first).chain(arcs[2..].iter().copied()) {
        let mut chunk = vec![(arc & 0x7F) as u8];
        let mut rest = arc >> 7;
        while rest > 0 {
            chunk.push(0x80 | (rest & 0x7F) as u8);
            rest >>= 7;
        }
        chunk.reverse();
        content.extend_from_slice(&chunk);
    }
    Ok(tlv(tag::OID, &content))
}

pub fn generalized_time(time: &DateTime<Utc>) -> Vec<u8> {
    tlv(
        tag::GENERALIZED_TIME,
        time.format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
    )
}

/// `AlgorithmIdentifier` with NULL parameters.
pub fn algorithm_identifier(dotted: &str) -> Result<Vec<u8>> {
    Ok(sequence(&[oid(dotted)?, null()]))
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    &bytes[skip..]
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// One decoded element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    pub tag: u8,
    /// Content octets (for indefinite lengths, everything before end-of-contents)
    pub content: &'a [u8],
    /// Full encoding including header
    pub raw: &'a [u8],
    offset: usize,
}

impl<'a> Element<'a> {
    pub fn is_constructed(&self) -> bool {
        self.tag & tag::CONSTRUCTED != 0
    }

    pub fn expect(self, expected: u8) -> Result<Self> {
        if self.tag == expected {
            Ok(self)
        } else {
            Err(DerError::UnexpectedTag {
                expected,
                found: self.tag,
                offset: self.offset,
            })
        }
    }

    /// Reader over the children of a constructed element.
    pub fn children(&self) -> Reader<'a> {
        Reader::new(self.content)
    }

    /// INTEGER magnitude as unsigned big-endian bytes, sign padding removed.
    pub fn unsigned_bytes(&self) -> Result<&'a [u8]> {
        let element = self.expect(tag::INTEGER)?;
        if element.content.is_empty() {
            return Err(DerError::Invalid("empty INTEGER".into()));
        }
        if element.content[0] & 0x80 != 0 {
            return Err(DerError::Invalid("negative INTEGER".into()));
        }
        let trimmed = trim_leading_zeros(element.content);
        Ok(trimmed)
    }

    pub fn as_u64(&self) -> Result<u64> {
        let bytes = self.unsigned_bytes()?;
        if bytes.len() > 8 {
            return Err(DerError::Invalid("INTEGER too large".into()));
        }
        Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    pub fn as_bool(&self) -> Result<bool> {
        let element = self.expect(tag::BOOLEAN)?;
        match element.content {
            [value] => Ok(*value != 0),
            _ => Err(DerError::Invalid("BOOLEAN must be one octet".into())),
        }
    }

    /// OCTET STRING value; constructed (BER) strings are concatenated.
    pub fn octets(&self) -> Result<Vec<u8>> {
        if self.tag == tag::OCTET_STRING {
            return Ok(self.content.to_vec());
        }
        if self.tag != tag::OCTET_STRING | tag::CONSTRUCTED {
            return Err(DerError::UnexpectedTag {
                expected: tag::OCTET_STRING,
                found: self.tag,
                offset: self.offset,
            });
        }
        let mut out = Vec::new();
        let mut children = self.children();
        while !children.is_empty() {
            out.extend_from_slice(&children.next_element()?.octets()?);
        }
        Ok(out)
    }

    pub fn as_oid(&self) -> Result<String> {
        let element = self.expect(tag::OID)?;
        if element.content.is_empty() {
            return Err(DerError::Invalid("empty OBJECT IDENTIFIER".into()));
        }
        let mut arcs = Vec::new();
        let mut value = 0u64;
        for (i, &byte) in element.content.iter().enumerate() {
            if value > (u64::MAX >> 7) {
                return Err(DerError::Invalid("OBJECT IDENTIFIER arc overflow".into()));
            }
            value = (value << 7) | u64::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                if arcs.is_empty() {
                    let (first, second) = match value {
                        0..=39 => (0, value),
                        40..=79 => (1, value - 40),
                        _ => (2, value - 80),
                    };
                    arcs.push(first);
                    arcs.push(second);
                } else {
                    arcs.push(value);
                }
                value = 0;
            } else if i + 1 == element.content.len() {
                return Err(DerError::Invalid("truncated OBJECT IDENTIFIER".into()));
            }
        }
        Ok(arcs
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join("."))
    }

    /// Text of a string-typed element (UTF8String, PrintableString, IA5String...).
    pub fn as_text(&self) -> Result<String> {
        String::from_utf8(self.content.to_vec())
            .map_err(|_| DerError::Invalid("string is not valid UTF-8".into()))
    }

    /// GeneralizedTime, `YYYYMMDDHHMMSS[.f*]Z`.
    pub fn as_generalized_time(&self) -> Result<DateTime<Utc>> {
        let element = self.expect(tag::GENERALIZED_TIME)?;
        let text = std::str::from_utf8(element.content)
            .map_err(|_| DerError::Invalid("GeneralizedTime is not ASCII".into()))?;
        let text = text.strip_suffix('Z').unwrap_or(text);
        let (whole, fraction) = match text.split_once(['.', ',']) {
            Some((whole, fraction)) => (whole, Some(fraction)),
            None => (text, None),
        };
        let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
            .map_err(|e| DerError::Invalid(format!("bad GeneralizedTime '{}': {}", text, e)))?;
        let mut time = naive.and_utc();
        if let Some(fraction) = fraction {
            let digits: String = fraction.chars().take(9).collect();
            if !digits.chars().all(|c| c.is_ascii_digit()) || digits.is_empty() {
                return Err(DerError::Invalid(format!("bad fractional seconds '{}'", fraction)));
            }
            let nanos: u32 = format!("{:0<9}", digits)
                .parse()
                .map_err(|_| DerError::Invalid("bad fractional seconds".into()))?;
            time += chrono::Duration::nanoseconds(i64::from(nanos));
        }
        Ok(time)
    }
}

/// Sequential reader over concatenated elements.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn next_element(&mut self) -> Result<Element<'a>> {
        let (element, consumed) = read_element(self.data, self.pos, 0)?;
        self.pos += consumed;
        Ok(element)
    }

    /// Next element, which must carry `expected`.
    pub fn expect(&mut self, expected: u8) -> Result<Element<'a>> {
        self.next_element()?.expect(expected)
    }

    /// Next element if it carries `expected`.
    pub fn optional(&mut self, expected: u8) -> Result<Option<Element<'a>>> {
        if self.peek_tag() == Some(expected) {
            self.next_element().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Fail unless everything was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DerError::Invalid(format!(
                "{} trailing bytes after element",
                self.data.len() - self.pos
            )))
        }
    }
}

/// Decode a single element spanning all of `data`.
pub fn parse(data: &[u8]) -> Result<Element<'_>> {
    let mut reader = Reader::new(data);
    let element = reader.next_element()?;
    reader.finish()?;
    Ok(element)
}

/// Returns the element at `start` and the number of bytes it occupies.
fn read_element(data: &[u8], start: usize, depth: usize) -> Result<(Element<'_>, usize)> {
    if depth > MAX_DEPTH {
        return Err(DerError::Invalid("elements nested too deeply".into()));
    }
    let identifier = *data.get(start).ok_or(DerError::Truncated(start))?;
    if identifier & 0x1F == 0x1F {
        return Err(DerError::Invalid(format!(
            "high tag numbers are not supported (offset {})",
            start
        )));
    }
    let first = *data.get(start + 1).ok_or(DerError::Truncated(start))?;
    let mut header = 2;

    if first == 0x80 {
        // Indefinite length: children up to the end-of-contents marker
        if identifier & tag::CONSTRUCTED == 0 {
            return Err(DerError::BadLength(start));
        }
        let body = start + header;
        let mut pos = body;
        loop {
            match data.get(pos..pos + 2) {
                Some([0, 0]) => break,
                Some(_) => {
                    let (_, consumed) = read_element(data, pos, depth + 1)?;
                    pos += consumed;
                }
                None => return Err(DerError::Truncated(pos)),
            }
        }
        let total = pos + 2 - start;
        return Ok((
            Element {
                tag: identifier,
                content: &data[body..pos],
                raw: &data[start..start + total],
                offset: start,
            },
            total,
        ));
    }

    let len = if first < 0x80 {
        first as usize
    } else {
        let count = (first & 0x7F) as usize;
        if count > 8 {
            return Err(DerError::BadLength(start));
        }
        let bytes = data
            .get(start + 2..start + 2 + count)
            .ok_or(DerError::Truncated(start))?;
        header += count;
        bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
    };

    let end = (start + header)
        .checked_add(len)
        .ok_or(DerError::BadLength(start))?;
    if end > data.len() {
        return Err(DerError::Truncated(start));
    }
    Ok((
        Element {
            tag: identifier,
            content: &data[start + header..end],
            raw: &data[start..end],
            offset: start,
        },
        end - start,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_oid_round_trip() {
        for dotted in ["1.2.840.113549.1.7.2", "2.16.840.1.101.3.4.2.1", "1.2.840.113549.1.9.16.1.4"] {
            let encoded = oid(dotted).unwrap();
            assert_eq!(parse(&encoded).unwrap().as_oid().unwrap(), dotted);
        }
        assert_eq!(
            oid("2.16.840.1.101.3.4.2.1").unwrap(),
            vec![0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01]
        );
        assert!(oid("1").is_err());
    }

    #[test]
    fn test_integers_stay_positive() {
        assert_eq!(integer(0), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer(0x80), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(unsigned_integer(&[0, 0, 0x12, 0x34]), vec![0x02, 0x02, 0x12, 0x34]);

        let encoded = integer(0x80);
        let element = parse(&encoded).unwrap();
        assert_eq!(element.unsigned_bytes().unwrap(), &[0x80]);
        assert_eq!(element.as_u64().unwrap(), 0x80);
    }

    #[test]
    fn test_long_form_length() {
        let content = vec![0xAB; 300];
        let encoded = octet_string(&content);
        assert_eq!(&encoded[..4], &[0x04, 0x82, 0x01, 0x2C]);
        assert_eq!(parse(&encoded).unwrap().octets().unwrap(), content);
    }

    #[test]
    fn test_indefinite_length_and_constructed_octets() {
        // SEQUENCE (indefinite) { OCTET STRING (constructed, indefinite) { "ab", "cd" } }
        let data = [
            0x30, 0x80, 0x24, 0x80, 0x04, 0x02, b'a', b'b', 0x04, 0x02, b'c', b'd', 0x00, 0x00,
            0x00, 0x00,
        ];
        let outer = parse(&data).unwrap();
        let mut children = outer.children();
        let inner = children.next_element().unwrap();
        assert_eq!(inner.octets().unwrap(), b"abcd");
        assert!(children.is_empty());
    }

    #[test]
    fn test_generalized_time_with_fraction() {
        let element = parse(b"\x18\x1220240102030405.25Z").unwrap();
        let time = element.as_generalized_time().unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::milliseconds(250);
        assert_eq!(time, expected);

        let encoded = generalized_time(&Utc.with_ymd_and_hms(2030, 12, 31, 23, 59, 58).unwrap());
        assert_eq!(&encoded[2..], b"20301231235958Z");
    }

    #[test]
    fn test_truncated_and_unexpected() {
        assert_eq!(parse(&[0x30, 0x05, 0x01]), Err(DerError::Truncated(0)));
        let encoded = null();
        let element = parse(&encoded).unwrap();
        assert!(matches!(
            element.expect(tag::SEQUENCE),
            Err(DerError::UnexpectedTag { expected: 0x30, found: 0x05, .. })
        ));
        assert!(parse(&[0x05, 0x00, 0xFF]).is_err());
    }

    #[test]
    fn test_optional_skips_absent_fields() {
        let encoded = sequence(&[integer(1), boolean(true)]);
        let outer = parse(&encoded).unwrap();
        let mut fields = outer.children();
        assert_eq!(fields.expect(tag::INTEGER).unwrap().as_u64().unwrap(), 1);
        assert!(fields.optional(tag::OID).unwrap().is_none());
        assert!(fields.optional(tag::BOOLEAN).unwrap().unwrap().as_bool().unwrap());
        fields.finish().unwrap();
    }
}
