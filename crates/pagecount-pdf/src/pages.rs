//! Page-tree traversal: trailer `/Root` -> catalog -> `/Pages` -> leaves.

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::count::CountOptions;
use crate::object::{PdfAtom, PdfDict, PdfObj};
use crate::objstm::ObjStm;
use crate::parser::parse_indirect_object_at;
use crate::xref::{XrefEntry, XrefMap};

const MAX_TREE_DEPTH: usize = 64;

/// Resolves an object by number, whether it sits at a direct file offset or
/// inside a compressed object stream, and hands it to `f`. The object may
/// borrow a transient inflated buffer, so callers extract what they need
/// inside the closure.
fn resolve<T>(
    bytes: &[u8],
    xref: &XrefMap<'_>,
    obj_num: u32,
    opts: &CountOptions,
    f: impl FnOnce(&PdfObj<'_>) -> Result<T>,
) -> Result<T> {
    let entry = xref
        .get(obj_num)
        .ok_or_else(|| anyhow!("object {obj_num} not in xref"))?;
    match entry {
        XrefEntry::Direct { offset, .. } => {
            let offset = usize::try_from(offset)?;
            let ind = parse_indirect_object_at(bytes, offset)?;
            f(&ind.body)
        }
        XrefEntry::InObjStm { host, index } => {
            let stm = ObjStm::load(bytes, xref, host, opts)?;
            let obj = stm.object_at(index as usize)?;
            f(&obj)
        }
    }
}

#[derive(Debug, Default)]
struct NodeFields {
    type_name: Option<Vec<u8>>,
    count: Option<i64>,
    kids_inline: Option<Vec<(u32, u16)>>,
    kids_ref: Option<(u32, u16)>,
}

fn node_fields(dict: &PdfDict<'_>) -> NodeFields {
    let mut fields = NodeFields {
        type_name: dict.name(b"/Type").map(<[u8]>::to_vec),
        count: dict.int(b"/Count"),
        ..Default::default()
    };
    match dict.get_first(b"/Kids").map(|obj| &obj.atom) {
        Some(PdfAtom::Array(items)) => {
            fields.kids_inline = Some(
                items
                    .iter()
                    .filter_map(|item| match item.atom {
                        PdfAtom::Ref { obj, gen } => Some((obj, gen)),
                        _ => None,
                    })
                    .collect(),
            );
        }
        Some(&PdfAtom::Ref { obj, gen }) => fields.kids_ref = Some((obj, gen)),
        _ => {}
    }
    fields
}

fn catalog_pages_ref(
    bytes: &[u8],
    xref: &XrefMap<'_>,
    opts: &CountOptions,
) -> Result<(u32, u16)> {
    let trailer = xref.trailer.as_ref().ok_or_else(|| anyhow!("missing trailer"))?;
    let (root, _) = trailer
        .reference(b"/Root")
        .ok_or_else(|| anyhow!("trailer has no /Root"))?;
    resolve(bytes, xref, root, opts, |obj: &PdfObj<'_>| {
        let dict = obj.as_dict().ok_or_else(|| anyhow!("catalog is not a dictionary"))?;
        dict.reference(b"/Pages").ok_or_else(|| anyhow!("catalog has no /Pages"))
    })
}

/// Walks the whole `/Pages` tree and counts `/Page` leaves. A positive
/// `/Count` is trusted only for nodes whose kids array cannot be resolved;
/// a resolvable kid that fails to load fails the traversal. Returns 0 when
/// the tree carries neither kids nor a usable `/Count`.
pub fn count_via_tree(bytes: &[u8], xref: &XrefMap<'_>, opts: &CountOptions) -> Result<u64> {
    let (pages, _) = catalog_pages_ref(bytes, xref, opts)?;
    let mut visited = HashSet::new();
    count_node(bytes, xref, pages, opts, 0, &mut visited)
}

fn count_node(
    bytes: &[u8],
    xref: &XrefMap<'_>,
    obj_num: u32,
    opts: &CountOptions,
    depth: usize,
    visited: &mut HashSet<u32>,
) -> Result<u64> {
    if depth >= MAX_TREE_DEPTH {
        return Err(anyhow!("page tree deeper than {MAX_TREE_DEPTH}"));
    }
    if !visited.insert(obj_num) {
        return Err(anyhow!("page tree cycle at object {obj_num}"));
    }
    let fields = resolve(bytes, xref, obj_num, opts, |obj: &PdfObj<'_>| {
        let dict = obj.as_dict().ok_or_else(|| anyhow!("page node is not a dictionary"))?;
        Ok(node_fields(dict))
    })?;
    match fields.type_name.as_deref() {
        Some(name) if name.eq_ignore_ascii_case(b"/Page") => return Ok(1),
        Some(name) if name.eq_ignore_ascii_case(b"/Pages") => {}
        other => return Err(anyhow!("unexpected page tree node type {other:?}")),
    }
    let kids = match (fields.kids_inline, fields.kids_ref) {
        (Some(inline), _) => Some(inline),
        (None, Some((array_obj, _))) => match load_ref_array(bytes, xref, array_obj, opts) {
            Ok(kids) => Some(kids),
            Err(err) => {
                debug!(
                    domain = "pdf.pages",
                    kind = "kids_unresolvable",
                    obj = obj_num,
                    error = %err,
                    "falling back to /Count"
                );
                None
            }
        },
        (None, None) => None,
    };
    match kids {
        Some(kids) => {
            let mut total = 0u64;
            for (kid, _) in kids {
                total += count_node(bytes, xref, kid, opts, depth + 1, visited)?;
            }
            Ok(total)
        }
        None => match fields.count {
            Some(count) if count > 0 => Ok(count as u64),
            _ => Ok(0),
        },
    }
}

fn load_ref_array(
    bytes: &[u8],
    xref: &XrefMap<'_>,
    obj_num: u32,
    opts: &CountOptions,
) -> Result<Vec<(u32, u16)>> {
    resolve(bytes, xref, obj_num, opts, |obj: &PdfObj<'_>| match &obj.atom {
        PdfAtom::Array(items) => Ok(items
            .iter()
            .filter_map(|item| match item.atom {
                PdfAtom::Ref { obj, gen } => Some((obj, gen)),
                _ => None,
            })
            .collect()),
        _ => Err(anyhow!("kids object is not an array")),
    })
}

/// Reads the root `/Pages` node's `/Count` without walking the tree.
/// Returns 0 when the count is absent or non-positive.
pub fn root_pages_count(bytes: &[u8], xref: &XrefMap<'_>, opts: &CountOptions) -> Result<u64> {
    let (pages, _) = catalog_pages_ref(bytes, xref, opts)?;
    let count = resolve(bytes, xref, pages, opts, |obj: &PdfObj<'_>| {
        let dict = obj.as_dict().ok_or_else(|| anyhow!("pages node is not a dictionary"))?;
        Ok(dict.int(b"/Count"))
    })?;
    match count {
        Some(count) if count > 0 => Ok(count as u64),
        _ => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn add_object(buf: &mut Vec<u8>, map: &mut XrefMap<'static>, num: u32, body: &str) {
        map.entries.insert(num, XrefEntry::Direct { offset: buf.len() as u64, gen: 0 });
        buf.extend_from_slice(format!("{num} 0 obj\n{body}\nendobj\n").as_bytes());
    }

    fn map_with_root() -> XrefMap<'static> {
        let trailer_bytes: &'static [u8] = b"<< /Size 9 /Root 1 0 R >>";
        let mut parser = Parser::new(trailer_bytes, 0);
        let trailer = match parser.parse_object().unwrap().atom {
            PdfAtom::Dict(d) => d,
            _ => unreachable!(),
        };
        XrefMap { entries: Default::default(), trailer: Some(trailer) }
    }

    #[test]
    fn counts_leaves_through_inline_kids() {
        let mut buf = Vec::new();
        let mut map = map_with_root();
        add_object(&mut buf, &mut map, 1, "<< /Type /Catalog /Pages 2 0 R >>");
        add_object(&mut buf, &mut map, 2, "<< /Type /Pages /Kids [3 0 R 4 0 R] /Count 2 >>");
        add_object(&mut buf, &mut map, 3, "<< /Type /Page /Parent 2 0 R >>");
        add_object(&mut buf, &mut map, 4, "<< /Type /Page /Parent 2 0 R >>");
        let n = count_via_tree(&buf, &map, &CountOptions::default()).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn kids_as_indirect_array_object() {
        let mut buf = Vec::new();
        let mut map = map_with_root();
        add_object(&mut buf, &mut map, 1, "<< /Type /Catalog /Pages 2 0 R >>");
        add_object(&mut buf, &mut map, 2, "<< /Type /Pages /Kids 5 0 R /Count 1 >>");
        add_object(&mut buf, &mut map, 3, "<< /Type /Page >>");
        add_object(&mut buf, &mut map, 5, "[3 0 R]");
        let n = count_via_tree(&buf, &map, &CountOptions::default()).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn unresolvable_kids_array_falls_back_to_count() {
        let mut buf = Vec::new();
        let mut map = map_with_root();
        add_object(&mut buf, &mut map, 1, "<< /Type /Catalog /Pages 2 0 R >>");
        add_object(&mut buf, &mut map, 2, "<< /Type /Pages /Kids 9 0 R /Count 7 >>");
        let n = count_via_tree(&buf, &map, &CountOptions::default()).unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn missing_inline_kid_fails_traversal() {
        let mut buf = Vec::new();
        let mut map = map_with_root();
        add_object(&mut buf, &mut map, 1, "<< /Type /Catalog /Pages 2 0 R >>");
        add_object(&mut buf, &mut map, 2, "<< /Type /Pages /Kids [9 0 R] /Count 1 >>");
        assert!(count_via_tree(&buf, &map, &CountOptions::default()).is_err());
    }

    #[test]
    fn self_referential_tree_errors() {
        let mut buf = Vec::new();
        let mut map = map_with_root();
        add_object(&mut buf, &mut map, 1, "<< /Type /Catalog /Pages 2 0 R >>");
        add_object(&mut buf, &mut map, 2, "<< /Type /Pages /Kids [2 0 R] >>");
        assert!(count_via_tree(&buf, &map, &CountOptions::default()).is_err());
    }

    #[test]
    fn root_count_ignores_non_positive() {
        let mut buf = Vec::new();
        let mut map = map_with_root();
        add_object(&mut buf, &mut map, 1, "<< /Type /Catalog /Pages 2 0 R >>");
        add_object(&mut buf, &mut map, 2, "<< /Type /Pages /Kids [] /Count -3 >>");
        let n = root_pages_count(&buf, &map, &CountOptions::default()).unwrap();
        assert_eq!(n, 0);
    }
}
