//! Lexer and object parser
//!
//! The parser works directly over the document bytes and is deliberately
//! forgiving about whitespace and missing `endobj` keywords; it never tries to
//! interpret content streams.

use super::object::{Dictionary, Object, ObjectId, Stream, StringFormat};
use super::{PdfError, Result};

pub fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b'\0' | b'\t' | b'\n' | b'\x0C' | b'\r' | b' ')
}

pub fn is_delimiter(byte: u8) -> bool {
    matches!(
        byte,
        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
    )
}

pub fn is_regular(byte: u8) -> bool {
    !is_whitespace(byte) && !is_delimiter(byte)
}

/// First occurrence of `needle` at or after `from`.
pub fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Last occurrence of `needle` in `haystack`.
pub fn rfind_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// Deepest array/dictionary nesting accepted before parsing gives up.
pub const MAX_NESTING: usize = 256;

pub struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at(data, 0)
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos, depth: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn eof(&self) -> PdfError {
        PdfError::UnexpectedEof(self.pos)
    }

    fn syntax(&self, offset: usize, message: impl Into<String>) -> PdfError {
        PdfError::Syntax {
            offset,
            message: message.into(),
        }
    }

    /// Skip whitespace and comments.
    pub fn skip_whitespace(&mut self) {
        while let Some(byte) = self.peek() {
            if is_whitespace(byte) {
                self.pos += 1;
            } else if byte == b'%' {
                while let Some(byte) = self.peek() {
                    if byte == b'\r' || byte == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    /// True when the bytes at the current position are `keyword` followed by
    /// a non-regular character.
    pub fn at_keyword(&self, keyword: &[u8]) -> bool {
        let rest = &self.data[self.pos.min(self.data.len())..];
        rest.starts_with(keyword)
            && rest
                .get(keyword.len())
                .map_or(true, |&next| !is_regular(next))
    }

    pub fn expect_keyword(&mut self, keyword: &[u8]) -> Result<()> {
        self.skip_whitespace();
        if self.at_keyword(keyword) {
            self.pos += keyword.len();
            Ok(())
        } else {
            Err(self.syntax(
                self.pos,
                format!("expected '{}'", String::from_utf8_lossy(keyword)),
            ))
        }
    }

    /// Read a run of regular characters.
    pub fn read_token(&mut self) -> &'a [u8] {
        self.skip_whitespace();
        let start = self.pos;
        while self.peek().is_some_and(is_regular) {
            self.pos += 1;
        }
        let data = self.data;
        &data[start..self.pos]
    }

    pub fn read_unsigned(&mut self) -> Result<u64> {
        self.skip_whitespace();
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(if self.pos >= self.data.len() {
                self.eof()
            } else {
                self.syntax(start, "expected unsigned integer")
            });
        }
        std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.syntax(start, "integer out of range"))
    }

    /// Parse one direct object (or an `N G R` reference).
    pub fn parse_object(&mut self) -> Result<Object> {
        self.skip_whitespace();
        let byte = self.peek().ok_or_else(|| self.eof())?;
        match byte {
            b'/' => Ok(Object::Name(self.parse_name()?)),
            b'(' => self.parse_literal_string(),
            b'<' if self.data.get(self.pos + 1) == Some(&b'<') => {
                self.nested(|parser| parser.parse_dictionary().map(Object::Dictionary))
            }
            b'<' => self.parse_hex_string(),
            b'[' => self.nested(Self::parse_array),
            b'+' | b'-' | b'.' | b'0'..=b'9' => self.parse_number_or_reference(),
            _ => {
                let start = self.pos;
                match self.read_token() {
                    b"true" => Ok(Object::Boolean(true)),
                    b"false" => Ok(Object::Boolean(false)),
                    b"null" => Ok(Object::Null),
                    token => Err(self.syntax(
                        start,
                        format!("unexpected token '{}'", String::from_utf8_lossy(token)),
                    )),
                }
            }
        }
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.syntax(self.pos, "containers nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_name(&mut self) -> Result<Vec<u8>> {
        self.pos += 1;
        let mut name = Vec::new();
        while let Some(byte) = self.peek() {
            if !is_regular(byte) {
                break;
            }
            if byte == b'#' {
                let hex = self.data.get(self.pos + 1..self.pos + 3);
                if let Some(value) = hex.and_then(decode_hex_pair) {
                    name.push(value);
                    self.pos += 3;
                    continue;
                }
            }
            name.push(byte);
            self.pos += 1;
        }
        Ok(name)
    }

    fn parse_literal_string(&mut self) -> Result<Object> {
        self.pos += 1;
        let mut depth = 1usize;
        let mut out = Vec::new();
        loop {
            let byte = self.peek().ok_or_else(|| self.eof())?;
            self.pos += 1;
            match byte {
                b'\\' => {
                    let escaped = self.peek().ok_or_else(|| self.eof())?;
                    self.pos += 1;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0C),
                        b'\r' => {
                            if self.peek() == Some(b'\n') {
                                self.pos += 1;
                            }
                        }
                        b'\n' => {}
                        b'0'..=b'7' => {
                            let mut value = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(digit @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(digit - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((value & 0xFF) as u8);
                        }
                        other => out.push(other),
                    }
                }
                b'(' => {
                    depth += 1;
                    out.push(byte);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    out.push(byte);
                }
                _ => out.push(byte),
            }
        }
        Ok(Object::String(out, StringFormat::Literal))
    }

    fn parse_hex_string(&mut self) -> Result<Object> {
        let start = self.pos;
        self.pos += 1;
        let mut digits = Vec::new();
        loop {
            let byte = self.peek().ok_or_else(|| self.eof())?;
            self.pos += 1;
            match byte {
                b'>' => break,
                b if b.is_ascii_hexdigit() => digits.push(b),
                b if is_whitespace(b) => {}
                _ => return Err(self.syntax(start, "invalid character in hex string")),
            }
        }
        if digits.len() % 2 == 1 {
            digits.push(b'0');
        }
        let bytes = digits
            .chunks(2)
            .filter_map(decode_hex_pair)
            .collect();
        Ok(Object::String(bytes, StringFormat::Hexadecimal))
    }

    fn parse_array(&mut self) -> Result<Object> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.eof()),
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => items.push(self.parse_object()?),
            }
        }
        Ok(Object::Array(items))
    }

    pub fn parse_dictionary(&mut self) -> Result<Dictionary> {
        let start = self.pos;
        if !self.data[self.pos.min(self.data.len())..].starts_with(b"<<") {
            return Err(self.syntax(start, "expected '<<'"));
        }
        self.pos += 2;
        let mut dict = Dictionary::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.eof()),
                Some(b'>') if self.data.get(self.pos + 1) == Some(&b'>') => {
                    self.pos += 2;
                    break;
                }
                Some(b'/') => {
                    let key = self.parse_name()?;
                    let value = self.parse_object()?;
                    dict.set(&key, value);
                }
                Some(_) => return Err(self.syntax(self.pos, "expected name key in dictionary")),
            }
        }
        Ok(dict)
    }

    fn parse_number_or_reference(&mut self) -> Result<Object> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| matches!(b, b'+' | b'-' | b'.' | b'0'..=b'9'))
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| self.syntax(start, "invalid number"))?;

        if text.contains('.') {
            return text
                .parse::<f64>()
                .map(Object::Real)
                .map_err(|_| self.syntax(start, format!("invalid real '{}'", text)));
        }

        let value = match text.parse::<i64>() {
            Ok(value) => value,
            Err(_) => {
                return text
                    .parse::<f64>()
                    .map(Object::Real)
                    .map_err(|_| self.syntax(start, format!("invalid number '{}'", text)));
            }
        };

        if value >= 0 && value <= i64::from(u32::MAX) {
            let checkpoint = self.pos;
            if let Some(generation) = self.try_reference_tail() {
                return Ok(Object::Reference((value as u32, generation)));
            }
            self.pos = checkpoint;
        }

        Ok(Object::Integer(value))
    }

    /// Consume `G R` after an object number; `None` leaves the position dirty.
    fn try_reference_tail(&mut self) -> Option<u16> {
        self.skip_whitespace();
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        let generation = std::str::from_utf8(&self.data[start..self.pos])
            .ok()?
            .parse::<u16>()
            .ok()?;
        self.skip_whitespace();
        if self.at_keyword(b"R") {
            self.pos += 1;
            Some(generation)
        } else {
            None
        }
    }

    /// Parse `N G obj <object> [stream ... endstream] endobj`.
    pub fn parse_indirect_object(&mut self) -> Result<(ObjectId, Object)> {
        let number = self.read_unsigned()?;
        let generation = self.read_unsigned()?;
        self.expect_keyword(b"obj")?;
        let id = (
            u32::try_from(number).map_err(|_| self.syntax(self.pos, "object number too large"))?,
            u16::try_from(generation)
                .map_err(|_| self.syntax(self.pos, "generation number too large"))?,
        );

        let object = self.parse_object()?;
        self.skip_whitespace();

        let object = match object {
            Object::Dictionary(dict) if self.at_keyword(b"stream") => {
                let content = self.parse_stream_body(&dict)?;
                Object::Stream(Stream::new(dict, content))
            }
            other => other,
        };

        self.skip_whitespace();
        if self.at_keyword(b"endobj") {
            self.pos += b"endobj".len();
        }

        Ok((id, object))
    }

    fn parse_stream_body(&mut self, dict: &Dictionary) -> Result<Vec<u8>> {
        let keyword_at = self.pos;
        self.pos += b"stream".len();
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
        let start = self.pos;

        // Trust a direct /Length only when endstream follows it
        if let Some(Object::Integer(length)) = dict.get(b"Length") {
            if let Ok(length) = usize::try_from(*length) {
                let end = start.saturating_add(length);
                if end <= self.data.len() {
                    let mut after = Parser::at(self.data, end);
                    after.skip_whitespace();
                    if after.at_keyword(b"endstream") {
                        self.pos = after.position() + b"endstream".len();
                        return Ok(self.data[start..end].to_vec());
                    }
                }
            }
        }

        let marker = find_bytes(self.data, b"endstream", start)
            .ok_or_else(|| self.syntax(keyword_at, "stream without endstream"))?;
        let mut end = marker;
        if end > start && self.data[end - 1] == b'\n' {
            end -= 1;
        }
        if end > start && self.data[end - 1] == b'\r' {
            end -= 1;
        }
        self.pos = marker + b"endstream".len();
        Ok(self.data[start..end].to_vec())
    }
}

fn decode_hex_pair(pair: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(pair).ok()?;
    u8::from_str_radix(text, 16).ok()
}

/// Parse the indirect object starting at `offset`.
pub fn parse_indirect_at(data: &[u8], offset: usize) -> Result<(ObjectId, Object)> {
    if offset >= data.len() {
        return Err(PdfError::UnexpectedEof(offset));
    }
    Parser::at(data, offset).parse_indirect_object()
}
