//! Compressed object streams (`/Type /ObjStm`).
//!
//! An object stream's inflated body starts with a directory of `2N`
//! whitespace-separated integers, `(objNum, relOffset)` pairs in order.
//! Embedded object `i` occupies `[First + rel[i], First + rel[i+1])`, the
//! last one running to the end of the body.

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::count::CountOptions;
use crate::decode;
use crate::object::PdfObj;
use crate::parser::{parse_indirect_object_at, Parser};
use crate::xref::{XrefEntry, XrefMap};

pub struct ObjStm {
    data: Vec<u8>,
    first: usize,
    pairs: Vec<(u64, u64)>,
}

impl ObjStm {
    /// Loads and inflates the host object stream named by the xref entry.
    /// The host must itself be stored at a direct offset.
    pub fn load(
        bytes: &[u8],
        xref: &XrefMap<'_>,
        host: u32,
        opts: &CountOptions,
    ) -> Result<Self> {
        let entry = xref
            .get(host)
            .ok_or_else(|| anyhow!("object stream {host} not in xref"))?;
        let offset = match entry {
            XrefEntry::Direct { offset, .. } => usize::try_from(offset)
                .map_err(|_| anyhow!("object stream offset out of range"))?,
            XrefEntry::InObjStm { .. } => {
                return Err(anyhow!("object stream {host} is itself compressed"))
            }
        };
        let ind = parse_indirect_object_at(bytes, offset)?;
        let st = ind
            .body
            .as_stream()
            .ok_or_else(|| anyhow!("object {host} is not a stream"))?;
        if !st.dict.has_name(b"/Type", b"/ObjStm") {
            return Err(anyhow!("object {host} is not /Type /ObjStm"));
        }
        let n = st
            .dict
            .uint(b"/N")
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| anyhow!("missing /N"))?;
        let first = st
            .dict
            .uint(b"/First")
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| anyhow!("missing /First"))?;
        let data = decode::stream_body(st, opts.max_stream_bytes)?;
        if data.len() < first {
            return Err(anyhow!("object stream shorter than /First"));
        }
        let pairs = directory_pairs(&data[..first], n)?;
        debug!(
            domain = "pdf.objstm",
            kind = "objstm_loaded",
            host,
            objects = pairs.len(),
            "loaded object stream"
        );
        Ok(Self { data, first, pairs })
    }

    /// Parses the embedded object at directory index `index`.
    pub fn object_at(&self, index: usize) -> Result<PdfObj<'_>> {
        let &(_, rel) = self
            .pairs
            .get(index)
            .ok_or_else(|| anyhow!("object stream index {index} out of range"))?;
        let start = self
            .first
            .checked_add(usize::try_from(rel).map_err(|_| anyhow!("offset overflow"))?)
            .filter(|&s| s < self.data.len())
            .ok_or_else(|| anyhow!("embedded object offset out of range"))?;
        let end = self
            .pairs
            .get(index + 1)
            .and_then(|&(_, next)| self.first.checked_add(next as usize))
            .unwrap_or(self.data.len())
            .clamp(start, self.data.len());
        let mut parser = Parser::new(&self.data[..end], start);
        parser.parse_object()
    }
}

fn directory_pairs(header: &[u8], n: usize) -> Result<Vec<(u64, u64)>> {
    let mut values = Vec::with_capacity(n * 2);
    let mut i = 0usize;
    while i < header.len() && values.len() < n * 2 {
        while i < header.len() && header[i].is_ascii_whitespace() {
            i += 1;
        }
        let start = i;
        while i < header.len() && header[i].is_ascii_digit() {
            i += 1;
        }
        if start == i {
            break;
        }
        let text = String::from_utf8_lossy(&header[start..i]);
        values.push(text.parse::<u64>().map_err(|_| anyhow!("directory value out of range"))?);
    }
    if values.len() < n * 2 {
        return Err(anyhow!(
            "object stream directory truncated: {} of {} values",
            values.len(),
            n * 2
        ));
    }
    Ok(values.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_entry_map(host: u32, offset: u64) -> XrefMap<'static> {
        let mut map = XrefMap { entries: Default::default(), trailer: None };
        map.entries.insert(host, XrefEntry::Direct { offset, gen: 0 });
        map
    }

    #[test]
    fn extracts_embedded_objects() {
        // Uncompressed ObjStm: directory "1 0 2 34", then two dictionaries.
        let body = b"1 0 2 34 << /Type /Catalog /Pages 2 0 R >> << /Type /Pages /Count 1 >>";
        let first = 9usize;
        assert_eq!(&body[first + 34..first + 36], b"<<");
        let mut buf = Vec::new();
        buf.extend_from_slice(
            format!(
                "4 0 obj\n<< /Type /ObjStm /N 2 /First {first} /Length {} >>\nstream\n",
                body.len()
            )
            .as_bytes(),
        );
        buf.extend_from_slice(body);
        buf.extend_from_slice(b"\nendstream\nendobj\n");
        let opts = CountOptions::default();
        let xref = single_entry_map(4, 0);
        let stm = ObjStm::load(&buf, &xref, 4, &opts).unwrap();
        let catalog = stm.object_at(0).unwrap();
        assert!(catalog.as_dict().unwrap().has_name(b"/Type", b"/Catalog"));
        let pages = stm.object_at(1).unwrap();
        assert_eq!(pages.as_dict().unwrap().int(b"/Count"), Some(1));
        assert!(stm.object_at(2).is_err());
    }

    #[test]
    fn truncated_directory_fails() {
        let body = b"1 0 << /A 1 >>";
        let mut buf = Vec::new();
        buf.extend_from_slice(
            format!("4 0 obj\n<< /Type /ObjStm /N 2 /First 4 /Length {} >>\nstream\n", body.len())
                .as_bytes(),
        );
        buf.extend_from_slice(body);
        buf.extend_from_slice(b"\nendstream\nendobj\n");
        let xref = single_entry_map(4, 0);
        let opts = CountOptions::default();
        assert!(ObjStm::load(&buf, &xref, 4, &opts).is_err());
    }
}
