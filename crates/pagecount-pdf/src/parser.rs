//! Permissive recursive-descent parser for PDF objects.
//!
//! Malformed input degrades instead of failing wherever a caller could still
//! make use of a prefix: a missing `endobj` returns the parsed body, a stream
//! without a usable `/Length` is delimited by scanning for `endstream`, and a
//! mismatched header simply reports what was actually read.

use anyhow::{anyhow, Result};
use tracing::trace;

use crate::lexer::{is_delim, is_whitespace, Cursor};
use crate::object::{PdfAtom, PdfDict, PdfName, PdfObj, PdfStream};

const MAX_PARSE_DEPTH: usize = 64;
const MAX_ARRAY_ELEMENTS: usize = 100_000;
const MAX_DICT_ENTRIES: usize = 10_000;

#[derive(Debug)]
pub struct IndirectObject<'a> {
    pub obj: u32,
    pub gen: u16,
    pub body: PdfObj<'a>,
}

pub struct Parser<'a> {
    cur: Cursor<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { cur: Cursor::new(bytes, pos) }
    }

    pub fn position(&self) -> usize {
        self.cur.pos
    }

    pub fn skip_ws_and_comments(&mut self) {
        self.cur.skip_ws_and_comments();
    }

    pub fn parse_object(&mut self) -> Result<PdfObj<'a>> {
        self.parse_object_with_depth(0)
    }

    fn parse_object_with_depth(&mut self, depth: usize) -> Result<PdfObj<'a>> {
        if depth >= MAX_PARSE_DEPTH {
            return Err(anyhow!("parse depth exceeded"));
        }
        self.cur.skip_ws_and_comments();
        let b = self.cur.peek().ok_or_else(|| anyhow!("eof"))?;
        let atom = match b {
            b'/' => PdfAtom::Name(self.parse_name()?),
            b'<' => {
                if self.cur.peek_n(1) == Some(b'<') {
                    let dict = self.parse_dict_with_depth(depth + 1)?;
                    if self.at_stream_keyword() {
                        PdfAtom::Stream(self.parse_stream(dict)?)
                    } else {
                        PdfAtom::Dict(dict)
                    }
                } else {
                    PdfAtom::Str(self.skip_hex_string()?)
                }
            }
            b'(' => PdfAtom::Str(self.skip_literal_string()?),
            b'[' => PdfAtom::Array(self.parse_array_with_depth(depth + 1)?),
            b't' => {
                if self.cur.consume_keyword_bounded(b"true") {
                    PdfAtom::Bool(true)
                } else {
                    return Err(anyhow!("unexpected token"));
                }
            }
            b'f' => {
                if self.cur.consume_keyword_bounded(b"false") {
                    PdfAtom::Bool(false)
                } else {
                    return Err(anyhow!("unexpected token"));
                }
            }
            b'n' => {
                if self.cur.consume_keyword_bounded(b"null") {
                    PdfAtom::Null
                } else {
                    return Err(anyhow!("unexpected token"));
                }
            }
            b'+' | b'-' | b'.' | b'0'..=b'9' => self.parse_number_or_ref()?,
            other => return Err(anyhow!("unexpected byte 0x{:02x}", other)),
        };
        Ok(PdfObj { atom })
    }

    fn parse_number_or_ref(&mut self) -> Result<PdfAtom<'a>> {
        let first = self.read_number_token()?;
        let after_first = self.cur.mark();
        if let Number::Int(obj) = first {
            if obj >= 0 {
                self.cur.skip_ws_and_comments();
                if let Ok(Number::Int(gen)) = self.read_number_token() {
                    if gen >= 0 {
                        self.cur.skip_ws_and_comments();
                        if self.cur.consume_keyword_bounded(b"R") {
                            return Ok(PdfAtom::Ref {
                                obj: u32::try_from(obj).unwrap_or(u32::MAX),
                                gen: u16::try_from(gen).unwrap_or(0),
                            });
                        }
                    }
                }
                self.cur.restore(after_first);
            }
        }
        Ok(match first {
            Number::Int(v) => PdfAtom::Int(v),
            Number::Real(v) => PdfAtom::Real(v),
        })
    }

    fn read_number_token(&mut self) -> Result<Number> {
        let start = self.cur.pos;
        if matches!(self.cur.peek(), Some(b'+') | Some(b'-')) {
            self.cur.consume();
        }
        let mut saw_digit = false;
        let mut saw_dot = false;
        while let Some(b) = self.cur.peek() {
            match b {
                b'0'..=b'9' => {
                    saw_digit = true;
                    self.cur.consume();
                }
                b'.' if !saw_dot => {
                    saw_dot = true;
                    self.cur.consume();
                }
                _ => break,
            }
        }
        if !saw_digit {
            self.cur.restore(start);
            return Err(anyhow!("not a number"));
        }
        let text = String::from_utf8_lossy(&self.cur.bytes[start..self.cur.pos]);
        if saw_dot {
            text.parse::<f64>()
                .map(Number::Real)
                .map_err(|_| anyhow!("bad real {text:?}"))
        } else {
            text.parse::<i64>()
                .map(Number::Int)
                .map_err(|_| anyhow!("integer out of range {text:?}"))
        }
    }

    fn parse_array_with_depth(&mut self, depth: usize) -> Result<Vec<PdfObj<'a>>> {
        let mut out = Vec::new();
        self.cur.consume();
        loop {
            self.cur.skip_ws_and_comments();
            match self.cur.peek() {
                Some(b']') => {
                    self.cur.consume();
                    break;
                }
                None => break,
                Some(_) => {}
            }
            if out.len() >= MAX_ARRAY_ELEMENTS {
                return Err(anyhow!("array size limit exceeded"));
            }
            out.push(self.parse_object_with_depth(depth + 1)?);
        }
        Ok(out)
    }

    fn parse_dict_with_depth(&mut self, depth: usize) -> Result<PdfDict<'a>> {
        self.cur.consume_keyword(b"<<");
        let mut entries = Vec::new();
        loop {
            self.cur.skip_ws_and_comments();
            if self.cur.consume_keyword(b">>") {
                break;
            }
            if self.cur.eof() {
                break;
            }
            if self.cur.peek() != Some(b'/') {
                return Err(anyhow!("dictionary key is not a name"));
            }
            let key = self.parse_name()?;
            let value = self.parse_object_with_depth(depth + 1)?;
            entries.push((key, value));
            if entries.len() >= MAX_DICT_ENTRIES {
                return Err(anyhow!("dict size limit exceeded"));
            }
        }
        Ok(PdfDict { entries })
    }

    fn parse_name(&mut self) -> Result<PdfName> {
        let mut decoded = vec![b'/'];
        self.cur.consume();
        while let Some(b) = self.cur.peek() {
            if is_whitespace(b) || is_delim(b) {
                break;
            }
            self.cur.consume();
            if b == b'#' {
                let hi = self.cur.peek().and_then(hex_val);
                let lo = self.cur.peek_n(1).and_then(hex_val);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    self.cur.consume();
                    self.cur.consume();
                    decoded.push((hi << 4) | lo);
                    continue;
                }
            }
            decoded.push(b);
        }
        Ok(PdfName { decoded })
    }

    fn skip_literal_string(&mut self) -> Result<&'a [u8]> {
        let start = self.cur.pos;
        self.cur.consume();
        let mut depth = 1u32;
        while let Some(b) = self.cur.consume() {
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                b'\\' => {
                    self.cur.consume();
                }
                _ => {}
            }
        }
        Ok(&self.cur.bytes[start..self.cur.pos])
    }

    fn skip_hex_string(&mut self) -> Result<&'a [u8]> {
        let start = self.cur.pos;
        self.cur.consume();
        while let Some(b) = self.cur.consume() {
            if b == b'>' {
                break;
            }
        }
        Ok(&self.cur.bytes[start..self.cur.pos])
    }

    fn at_stream_keyword(&mut self) -> bool {
        let mark = self.cur.mark();
        self.cur.skip_ws_and_comments();
        let hit = self.cur.consume_keyword_bounded(b"stream");
        self.cur.restore(mark);
        hit
    }

    fn parse_stream(&mut self, dict: PdfDict<'a>) -> Result<PdfStream<'a>> {
        self.cur.skip_ws_and_comments();
        self.cur.consume_keyword(b"stream");
        self.cur.skip_eol();
        let data_start = self.cur.pos;
        let declared = dict
            .uint(b"/Length")
            .and_then(|v| usize::try_from(v).ok())
            .and_then(|len| data_start.checked_add(len));
        let data_end = match declared {
            Some(end) if end <= self.cur.bytes.len() => end,
            _ => {
                if declared.is_some() {
                    trace!(
                        domain = "pdf.parser",
                        kind = "stream_length_out_of_range",
                        start = data_start,
                        "declared /Length exceeds buffer, scanning for endstream"
                    );
                }
                find_endstream(self.cur.bytes, data_start)
                    .ok_or_else(|| anyhow!("endstream not found"))?
            }
        };
        let data = &self.cur.bytes[data_start..data_end];
        self.cur.pos = data_end;
        self.cur.skip_ws_and_comments();
        self.cur.consume_keyword_bounded(b"endstream");
        Ok(PdfStream { dict, data })
    }
}

/// Parses `N G obj <body> endobj` at the given byte offset.
///
/// The `(N, G)` pair actually read is returned as-is; it is not validated
/// against whatever the caller expected to find there. A missing `endobj`
/// is tolerated, the parsed body is returned regardless.
pub fn parse_indirect_object_at(bytes: &[u8], offset: usize) -> Result<IndirectObject<'_>> {
    if offset >= bytes.len() {
        return Err(anyhow!("object offset {offset} out of range"));
    }
    let mut cur = Cursor::new(bytes, offset);
    cur.skip_ws_and_comments();
    let obj = cur.read_uint().ok_or_else(|| anyhow!("malformed object header"))?;
    cur.skip_ws_and_comments();
    let gen = cur.read_uint().ok_or_else(|| anyhow!("malformed object header"))?;
    cur.skip_ws_and_comments();
    if !cur.consume_keyword_bounded(b"obj") {
        return Err(anyhow!("malformed object header"));
    }
    let obj = u32::try_from(obj).map_err(|_| anyhow!("object number out of range"))?;
    let gen = u16::try_from(gen).unwrap_or(0);
    let mut parser = Parser::new(bytes, cur.pos);
    let body = parser.parse_object()?;
    let mut tail = Cursor::new(bytes, parser.position());
    tail.skip_ws_and_comments();
    tail.consume_keyword_bounded(b"endobj");
    Ok(IndirectObject { obj, gen, body })
}

/// Locates the end of a stream body by scanning for the `endstream` keyword,
/// trimming the single EOL that precedes it.
fn find_endstream(bytes: &[u8], from: usize) -> Option<usize> {
    let rel = memchr::memmem::find(&bytes[from..], b"endstream")?;
    let mut end = from + rel;
    if end > from && bytes[end - 1] == b'\n' {
        end -= 1;
    }
    if end > from && bytes[end - 1] == b'\r' {
        end -= 1;
    }
    Some(end)
}

#[derive(Debug)]
enum Number {
    Int(i64),
    Real(f64),
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dictionary_object() {
        let data = b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n";
        let parsed = parse_indirect_object_at(data, 0).unwrap();
        assert_eq!(parsed.obj, 1);
        assert_eq!(parsed.gen, 0);
        let dict = parsed.body.as_dict().unwrap();
        assert!(dict.has_name(b"/Type", b"/Catalog"));
        assert_eq!(dict.reference(b"/Pages"), Some((2, 0)));
    }

    #[test]
    fn parses_array_of_refs() {
        let data = b"4 0 obj\n[3 0 R 5 0 R]\nendobj";
        let parsed = parse_indirect_object_at(data, 0).unwrap();
        match parsed.body.atom {
            PdfAtom::Array(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[0].atom, PdfAtom::Ref { obj: 3, gen: 0 }));
                assert!(matches!(items[1].atom, PdfAtom::Ref { obj: 5, gen: 0 }));
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn missing_endobj_is_tolerated() {
        let data = b"7 1 obj << /Kind /Widget >>";
        let parsed = parse_indirect_object_at(data, 0).unwrap();
        assert_eq!(parsed.gen, 1);
        assert!(parsed.body.as_dict().is_some());
    }

    #[test]
    fn rejects_garbage_header() {
        let data = b"not an object";
        assert!(parse_indirect_object_at(data, 0).is_err());
    }

    #[test]
    fn stream_body_via_length() {
        let data = b"5 0 obj << /Length 4 >> stream\nABCD\nendstream endobj";
        let parsed = parse_indirect_object_at(data, 0).unwrap();
        let st = parsed.body.as_stream().unwrap();
        assert_eq!(st.data, b"ABCD");
    }

    #[test]
    fn stream_body_via_endstream_scan() {
        let data = b"5 0 obj << /Kind /Raw >> stream\r\nXYZ\r\nendstream endobj";
        let parsed = parse_indirect_object_at(data, 0).unwrap();
        let st = parsed.body.as_stream().unwrap();
        assert_eq!(st.data, b"XYZ");
    }

    #[test]
    fn nested_dict_and_strings_are_skipped() {
        let data = b"9 0 obj << /A (paren \\) inside) /B <DEADBEEF> /C << /D 1 >> >> endobj";
        let parsed = parse_indirect_object_at(data, 0).unwrap();
        let dict = parsed.body.as_dict().unwrap();
        assert_eq!(dict.entries.len(), 3);
        let inner = dict.get_first(b"/C").and_then(|o| o.as_dict()).unwrap();
        assert_eq!(inner.int(b"/D"), Some(1));
    }

    #[test]
    fn name_escapes_decode() {
        let data = b"2 0 obj << /Ty#70e /Page >> endobj";
        let parsed = parse_indirect_object_at(data, 0).unwrap();
        let dict = parsed.body.as_dict().unwrap();
        assert!(dict.has_name(b"/Type", b"/Page"));
    }
}
