//! Cross-reference resolution: classic `xref` tables and xref streams.
//!
//! Both flavors produce the same `XrefMap`. Revisions are merged while
//! walking `/Prev` with first-seen-wins semantics for entries *and* for the
//! trailer dictionary, so the latest revision's `/Root` and offsets are the
//! ones that stick.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::count::CountOptions;
use crate::decode;
use crate::lexer::Cursor;
use crate::object::{PdfAtom, PdfDict, PdfStream};
use crate::parser::{parse_indirect_object_at, Parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefEntry {
    /// Object stored at a byte offset in the file.
    Direct { offset: u64, gen: u16 },
    /// Object stored inside a compressed object stream.
    InObjStm { host: u32, index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefFlavor {
    /// Classic ASCII tables only, along the whole `/Prev` chain.
    Classic,
    /// An xref stream at `startxref`; `/Prev` targets may be either kind,
    /// and hybrid `/XRefStm` pointers are followed too.
    Stream,
}

#[derive(Debug)]
pub struct XrefMap<'a> {
    pub entries: HashMap<u32, XrefEntry>,
    pub trailer: Option<PdfDict<'a>>,
}

impl<'a> XrefMap<'a> {
    fn new() -> Self {
        Self { entries: HashMap::new(), trailer: None }
    }

    pub fn get(&self, obj: u32) -> Option<XrefEntry> {
        self.entries.get(&obj).copied()
    }

    fn insert_first(&mut self, obj: u32, entry: XrefEntry) {
        self.entries.entry(obj).or_insert(entry);
    }

    fn keep_trailer(&mut self, dict: PdfDict<'a>) {
        if self.trailer.is_none() {
            self.trailer = Some(dict);
        }
    }
}

/// Offsets a parsed section asks us to visit next, in visit order.
struct Follow {
    offsets: Vec<u64>,
}

/// Locates the final `startxref` marker by scanning backward from the end
/// of the buffer and returns the offset it points at.
pub fn find_startxref(bytes: &[u8]) -> Option<u64> {
    let pos = memchr::memmem::rfind(bytes, b"startxref")?;
    let mut cur = Cursor::new(bytes, pos + b"startxref".len());
    cur.skip_ws_and_comments();
    cur.read_uint()
}

pub fn build_xref<'a>(
    bytes: &'a [u8],
    flavor: XrefFlavor,
    opts: &CountOptions,
) -> Result<XrefMap<'a>> {
    let start = find_startxref(bytes).ok_or_else(|| anyhow!("startxref not found"))?;
    let mut map = XrefMap::new();
    let mut queue = VecDeque::from([start]);
    let mut seen: HashSet<u64> = HashSet::new();
    let mut sections = 0usize;
    while let Some(off) = queue.pop_front() {
        if !seen.insert(off) {
            debug!(domain = "pdf.xref", kind = "xref_loop", offset = off, "revisited xref offset");
            continue;
        }
        if sections > opts.max_prev_hops {
            debug!(
                domain = "pdf.xref",
                kind = "prev_hop_limit",
                limit = opts.max_prev_hops,
                "stopping /Prev chain"
            );
            break;
        }
        let first_section = sections == 0;
        sections += 1;
        let result = parse_section(bytes, off, flavor, first_section, &mut map, opts);
        match result {
            Ok(follow) => queue.extend(follow.offsets),
            Err(err) if first_section => return Err(err),
            Err(err) => {
                debug!(
                    domain = "pdf.xref",
                    kind = "section_unparsable",
                    offset = off,
                    error = %err,
                    "skipping xref section"
                );
            }
        }
    }
    if map.trailer.is_none() {
        return Err(anyhow!("no usable trailer"));
    }
    Ok(map)
}

fn parse_section<'a>(
    bytes: &'a [u8],
    off: u64,
    flavor: XrefFlavor,
    first_section: bool,
    map: &mut XrefMap<'a>,
    opts: &CountOptions,
) -> Result<Follow> {
    let offset = usize::try_from(off).ok().filter(|&o| o < bytes.len());
    let offset = offset.ok_or_else(|| anyhow!("xref offset {off} out of range"))?;
    let classic_here = at_table_keyword(bytes, offset);
    match flavor {
        XrefFlavor::Classic => {
            if !classic_here {
                return Err(anyhow!("classic xref table expected at {off}"));
            }
            parse_table_section(bytes, offset, map, false)
        }
        XrefFlavor::Stream => {
            if classic_here {
                if first_section {
                    return Err(anyhow!("xref stream expected at {off}"));
                }
                parse_table_section(bytes, offset, map, true)
            } else {
                parse_stream_section(bytes, offset, map, opts)
            }
        }
    }
}

fn at_table_keyword(bytes: &[u8], offset: usize) -> bool {
    let mut cur = Cursor::new(bytes, offset);
    cur.skip_ws_and_comments();
    cur.consume_keyword_bounded(b"xref")
}

/// Classic table: subsection headers `first count` followed by fixed-width
/// entries (10-digit offset, 5-digit generation, `n`/`f` flag), terminated
/// by `trailer` and its dictionary. Free entries never enter the map.
fn parse_table_section<'a>(
    bytes: &'a [u8],
    offset: usize,
    map: &mut XrefMap<'a>,
    follow_hybrid: bool,
) -> Result<Follow> {
    let mut cur = Cursor::new(bytes, offset);
    cur.skip_ws_and_comments();
    if !cur.consume_keyword_bounded(b"xref") {
        return Err(anyhow!("missing xref keyword"));
    }
    loop {
        cur.skip_ws_and_comments();
        match cur.peek() {
            Some(b't') => break,
            Some(b) if b.is_ascii_digit() => {}
            other => return Err(anyhow!("unexpected byte in xref table: {other:?}")),
        }
        let first = cur.read_uint().ok_or_else(|| anyhow!("bad subsection header"))?;
        cur.skip_ws_and_comments();
        let count = cur.read_uint().ok_or_else(|| anyhow!("bad subsection header"))?;
        for i in 0..count {
            cur.skip_ws_and_comments();
            let entry_offset = cur.read_uint().ok_or_else(|| anyhow!("bad xref entry"))?;
            cur.skip_ws_and_comments();
            let gen = cur.read_uint().ok_or_else(|| anyhow!("bad xref entry"))?;
            cur.skip_ws_and_comments();
            let flag = cur.consume().ok_or_else(|| anyhow!("bad xref entry"))?;
            let obj = first
                .checked_add(i)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| anyhow!("object number overflow"))?;
            match flag {
                b'n' => map.insert_first(
                    obj,
                    XrefEntry::Direct {
                        offset: entry_offset,
                        gen: u16::try_from(gen).unwrap_or(u16::MAX),
                    },
                ),
                b'f' => {}
                other => return Err(anyhow!("bad xref entry flag 0x{other:02x}")),
            }
        }
    }
    if !cur.consume_keyword_bounded(b"trailer") {
        return Err(anyhow!("trailer keyword not found"));
    }
    let mut parser = Parser::new(bytes, cur.pos);
    let obj = parser.parse_object()?;
    let dict = match obj.atom {
        PdfAtom::Dict(d) => d,
        _ => return Err(anyhow!("trailer is not a dictionary")),
    };
    let mut offsets = Vec::new();
    if follow_hybrid {
        if let Some(stm) = dict.uint(b"/XRefStm") {
            offsets.push(stm);
        }
    }
    if let Some(prev) = dict.uint(b"/Prev") {
        offsets.push(prev);
    }
    map.keep_trailer(dict);
    Ok(Follow { offsets })
}

/// Xref stream: `/Type /XRef` with `/W [w0 w1 w2]`, optional `/Index`
/// (default `[0 Size]`), optional FlateDecode and PNG predictor. Fields are
/// big-endian; a zero-width type field defaults to type 1.
fn parse_stream_section<'a>(
    bytes: &'a [u8],
    offset: usize,
    map: &mut XrefMap<'a>,
    opts: &CountOptions,
) -> Result<Follow> {
    let ind = parse_indirect_object_at(bytes, offset)?;
    let st = ind.body.as_stream().ok_or_else(|| anyhow!("not a stream object"))?;
    if !st.dict.has_name(b"/Type", b"/XRef") {
        return Err(anyhow!("stream at {offset} is not /Type /XRef"));
    }
    let widths = field_widths(&st.dict)?;
    let entry_size: usize = widths.iter().sum();
    if entry_size == 0 {
        return Err(anyhow!("zero-width xref stream entries"));
    }
    let index = index_pairs(&st.dict)?;
    let data = decode_xref_data(st, &widths, opts)?;
    let total: u64 = index.iter().map(|&(_, count)| count).sum();
    let needed = total
        .checked_mul(entry_size as u64)
        .ok_or_else(|| anyhow!("xref stream subsection overflow"))?;
    if (data.len() as u64) < needed {
        return Err(anyhow!(
            "xref stream data short: {} bytes for {} entries of {}",
            data.len(),
            total,
            entry_size
        ));
    }
    let mut at = 0usize;
    for &(start, count) in &index {
        for i in 0..count {
            let kind = if widths[0] == 0 { 1 } else { read_be(&data[at..at + widths[0]]) };
            let f2 = read_be(&data[at + widths[0]..at + widths[0] + widths[1]]);
            let f3 = read_be(&data[at + widths[0] + widths[1]..at + entry_size]);
            at += entry_size;
            let obj = match start.checked_add(i).and_then(|n| u32::try_from(n).ok()) {
                Some(v) => v,
                None => continue,
            };
            match kind {
                0 => {}
                1 => map.insert_first(
                    obj,
                    XrefEntry::Direct { offset: f2, gen: u16::try_from(f3).unwrap_or(u16::MAX) },
                ),
                2 => map.insert_first(
                    obj,
                    XrefEntry::InObjStm {
                        host: u32::try_from(f2).unwrap_or(u32::MAX),
                        index: u32::try_from(f3).unwrap_or(u32::MAX),
                    },
                ),
                other => {
                    debug!(
                        domain = "pdf.xref",
                        kind = "unknown_entry_type",
                        entry_type = other,
                        obj,
                        "ignoring xref stream entry"
                    );
                }
            }
        }
    }
    let mut offsets = Vec::new();
    if let Some(prev) = st.dict.uint(b"/Prev") {
        offsets.push(prev);
    }
    map.keep_trailer(st.dict.clone());
    Ok(Follow { offsets })
}

fn field_widths(dict: &PdfDict<'_>) -> Result<[usize; 3]> {
    let arr = match &dict.get_first(b"/W").ok_or_else(|| anyhow!("missing /W"))?.atom {
        PdfAtom::Array(items) => items,
        _ => return Err(anyhow!("/W is not an array")),
    };
    if arr.len() != 3 {
        return Err(anyhow!("/W must have 3 elements, found {}", arr.len()));
    }
    let mut widths = [0usize; 3];
    for (slot, item) in widths.iter_mut().zip(arr) {
        match item.atom {
            PdfAtom::Int(v) if (0..=8).contains(&v) => *slot = v as usize,
            _ => return Err(anyhow!("bad /W field width")),
        }
    }
    Ok(widths)
}

fn index_pairs(dict: &PdfDict<'_>) -> Result<Vec<(u64, u64)>> {
    if let Some(obj) = dict.get_first(b"/Index") {
        let arr = match &obj.atom {
            PdfAtom::Array(items) => items,
            _ => return Err(anyhow!("/Index is not an array")),
        };
        let mut pairs = Vec::new();
        let mut it = arr.chunks_exact(2);
        for pair in &mut it {
            match (&pair[0].atom, &pair[1].atom) {
                (PdfAtom::Int(a), PdfAtom::Int(b))
                    if *a >= 0 && *b >= 0 =>
                {
                    pairs.push((*a as u64, *b as u64));
                }
                _ => return Err(anyhow!("bad /Index pair")),
            }
        }
        return Ok(pairs);
    }
    let size = dict.uint(b"/Size").ok_or_else(|| anyhow!("missing /Size"))?;
    Ok(vec![(0, size)])
}

fn decode_xref_data(
    st: &PdfStream<'_>,
    widths: &[usize; 3],
    opts: &CountOptions,
) -> Result<Vec<u8>> {
    let mut data = decode::stream_body(st, opts.max_stream_bytes)?;
    let (predictor, columns) = predictor_parms(&st.dict, widths.iter().sum());
    if predictor >= 10 {
        data = decode::undo_png_predictor(&data, columns)?;
    }
    Ok(data)
}

fn predictor_parms(dict: &PdfDict<'_>, default_columns: usize) -> (u64, usize) {
    let parms = dict.get_first(b"/DecodeParms").and_then(|obj| match &obj.atom {
        PdfAtom::Dict(d) => Some(d),
        PdfAtom::Array(items) => items.first().and_then(|o| match &o.atom {
            PdfAtom::Dict(d) => Some(d),
            _ => None,
        }),
        _ => None,
    });
    match parms {
        Some(d) => {
            let predictor = d.uint(b"/Predictor").unwrap_or(1);
            let columns = d
                .uint(b"/Columns")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|&c| c > 0)
                .unwrap_or(default_columns);
            (predictor, columns)
        }
        None => (1, default_columns),
    }
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startxref_uses_last_marker() {
        let data = b"startxref\n11\n%%EOF garbage startxref\n42\n%%EOF";
        assert_eq!(find_startxref(data), Some(42));
    }

    #[test]
    fn classic_table_parses_entries_and_skips_free() {
        let data = b"xref\n0 3\n0000000000 65535 f \n0000000100 00000 n \n0000000200 00007 n \ntrailer\n<< /Size 3 /Root 1 0 R >>\nstartxref\n0\n%%EOF";
        let map = build_xref(data, XrefFlavor::Classic, &CountOptions::default()).unwrap();
        assert_eq!(map.get(0), None);
        assert_eq!(map.get(1), Some(XrefEntry::Direct { offset: 100, gen: 0 }));
        assert_eq!(map.get(2), Some(XrefEntry::Direct { offset: 200, gen: 7 }));
        let trailer = map.trailer.unwrap();
        assert_eq!(trailer.reference(b"/Root"), Some((1, 0)));
    }

    #[test]
    fn prev_chain_keeps_first_seen() {
        let mut buf = Vec::new();
        let t1 = buf.len();
        buf.extend_from_slice(
            b"xref\n0 2\n0000000000 65535 f \n0000000111 00000 n \ntrailer\n<< /Size 2 /Root 1 0 R /ID (old) >>\n",
        );
        let t2 = buf.len();
        buf.extend_from_slice(
            format!(
                "xref\n1 1\n0000000222 00000 n \ntrailer\n<< /Size 2 /Root 1 0 R /Prev {t1} >>\nstartxref\n{t2}\n%%EOF"
            )
            .as_bytes(),
        );
        let map = build_xref(&buf, XrefFlavor::Classic, &CountOptions::default()).unwrap();
        assert_eq!(map.get(1), Some(XrefEntry::Direct { offset: 222, gen: 0 }));
        // The newest trailer is the one kept.
        assert!(map.trailer.unwrap().get_first(b"/ID").is_none());
    }

    #[test]
    fn classic_flavor_rejects_stream_at_startxref() {
        let data = b"1 0 obj << /Type /XRef >> endobj\nstartxref\n0\n%%EOF";
        assert!(build_xref(data, XrefFlavor::Classic, &CountOptions::default()).is_err());
    }

    #[test]
    fn uncompressed_xref_stream_entries() {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"5 0 obj\n<< /Type /XRef /Size 3 /W [1 2 1] /Root 1 0 R /Length 12 >>\nstream\n",
        );
        // type 0 free, type 1 offset 0x0102 gen 3, type 2 host 7 index 1
        buf.extend_from_slice(&[0, 0, 0, 0, 1, 1, 2, 3, 2, 0, 7, 1]);
        buf.extend_from_slice(b"\nendstream\nendobj\nstartxref\n0\n%%EOF");
        let map = build_xref(&buf, XrefFlavor::Stream, &CountOptions::default()).unwrap();
        assert_eq!(map.get(0), None);
        assert_eq!(map.get(1), Some(XrefEntry::Direct { offset: 258, gen: 3 }));
        assert_eq!(map.get(2), Some(XrefEntry::InObjStm { host: 7, index: 1 }));
    }

    #[test]
    fn hybrid_xrefstm_pointer_is_followed() {
        let mut buf = Vec::new();
        // A stream section carrying the entry for object 6.
        let s2 = buf.len();
        buf.extend_from_slice(
            b"7 0 obj\n<< /Type /XRef /Size 7 /Index [6 1] /W [1 2 1] /Length 4 >>\nstream\n",
        );
        buf.extend_from_slice(&[1, 0x01, 0x99, 0]);
        buf.extend_from_slice(b"\nendstream\nendobj\n");
        // A classic table whose trailer points at it.
        let c = buf.len();
        buf.extend_from_slice(
            format!(
                "xref\n0 1\n0000000000 65535 f \ntrailer\n<< /Size 7 /XRefStm {s2} >>\n"
            )
            .as_bytes(),
        );
        // The newest section: a stream with /Prev into the classic table.
        let s1 = buf.len();
        buf.extend_from_slice(
            format!(
                "5 0 obj\n<< /Type /XRef /Size 7 /Index [0 0] /W [1 2 1] /Root 1 0 R /Prev {c} /Length 0 >>\nstream\n\nendstream\nendobj\nstartxref\n{s1}\n%%EOF"
            )
            .as_bytes(),
        );
        let map = build_xref(&buf, XrefFlavor::Stream, &CountOptions::default()).unwrap();
        assert_eq!(map.get(6), Some(XrefEntry::Direct { offset: 0x0199, gen: 0 }));
        assert_eq!(map.trailer.as_ref().unwrap().reference(b"/Root"), Some((1, 0)));
    }

    #[test]
    fn cyclic_prev_terminates() {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"xref\n0 1\n0000000000 65535 f \ntrailer\n<< /Size 1 /Root 1 0 R /Prev 0 >>\nstartxref\n0\n%%EOF",
        );
        let map = build_xref(&buf, XrefFlavor::Classic, &CountOptions::default()).unwrap();
        assert!(map.trailer.is_some());
    }
}
