//! Heuristic scanners for documents whose structured path is unusable.
//!
//! All passes run over raw bytes in buffer order; where a maximum is taken
//! it is deterministic. The same passes are applied to inflated FlateDecode
//! bodies found by `inflated_stream_bodies`.

use memchr::memmem;
use tracing::debug;

use crate::decode;
use crate::lexer::{is_delim, is_whitespace, Cursor};

const COUNT_WINDOW_BEHIND: usize = 1024;
const COUNT_WINDOW_AHEAD: usize = 50 * 1024;
const FILTER_MARKER_WINDOW: usize = 1024;

/// For each `/Type /Pages` occurrence, the first `/Count N` within a window
/// around it; the maximum over all occurrences. `None` when nothing matched.
pub fn nearest_count(text: &[u8]) -> Option<u32> {
    let mut best: Option<u32> = None;
    for pos in type_name_positions(text, b"/Pages") {
        let from = pos.saturating_sub(COUNT_WINDOW_BEHIND);
        let to = pos.saturating_add(COUNT_WINDOW_AHEAD).min(text.len());
        if let Some(v) = first_count_in(&text[from..to]) {
            best = Some(best.map_or(v, |b| b.max(v)));
        }
    }
    best
}

/// Global maximum over every `/Count N` in the buffer.
pub fn max_count(text: &[u8]) -> Option<u32> {
    let mut best: Option<u32> = None;
    for pos in memmem::find_iter(text, b"/Count") {
        if let Some(v) = count_value(text, pos) {
            best = Some(best.map_or(v, |b| b.max(v)));
        }
    }
    best
}

/// Number of `/Type /Page` occurrences; `/Pages` is excluded by the word
/// boundary after the value name.
pub fn page_object_count(text: &[u8]) -> u64 {
    type_name_positions(text, b"/Page").count() as u64
}

/// Inflates every plausible FlateDecode stream body in the buffer. A
/// candidate is a `stream` keyword at a word boundary, preceded within a
/// small window by a Flate filter name. Streams that exceed `max_stream_bytes`
/// or fail to inflate are skipped.
pub fn inflated_stream_bodies(bytes: &[u8], max_stream_bytes: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for pos in memmem::find_iter(bytes, b"stream") {
        if pos > 0 {
            let before = bytes[pos - 1];
            if !is_whitespace(before) && !is_delim(before) {
                continue;
            }
        }
        let back = pos.saturating_sub(FILTER_MARKER_WINDOW);
        if memmem::find(&bytes[back..pos], b"/Fl").is_none() {
            continue;
        }
        let mut cur = Cursor::new(bytes, pos + b"stream".len());
        if !matches!(cur.peek(), Some(b'\r') | Some(b'\n')) {
            continue;
        }
        cur.skip_eol();
        let body_start = cur.pos;
        let mut body_end = memmem::find(&bytes[body_start..], b"endstream")
            .map(|rel| body_start + rel)
            .unwrap_or(bytes.len());
        if body_end > body_start && bytes[body_end - 1] == b'\n' {
            body_end -= 1;
        }
        if body_end > body_start && bytes[body_end - 1] == b'\r' {
            body_end -= 1;
        }
        match decode::inflate(&bytes[body_start..body_end], max_stream_bytes) {
            Ok(inflated) if !inflated.truncated => out.push(inflated.data),
            Ok(_) => {
                debug!(
                    domain = "pdf.scan",
                    kind = "stream_over_cap",
                    offset = body_start,
                    "skipping oversized stream"
                );
            }
            Err(_) => {}
        }
    }
    out
}

/// Byte positions of `/Type /X` with arbitrary whitespace between key and
/// value and a word boundary after the value.
fn type_name_positions<'a>(text: &'a [u8], name: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    memmem::find_iter(text, b"/Type").filter_map(move |pos| {
        let mut cur = Cursor::new(text, pos + b"/Type".len());
        cur.skip_ws_and_comments();
        if !cur.consume_keyword(name) {
            return None;
        }
        match cur.peek() {
            None => Some(pos),
            Some(b) if is_whitespace(b) || is_delim(b) => Some(pos),
            Some(_) => None,
        }
    })
}

fn first_count_in(window: &[u8]) -> Option<u32> {
    memmem::find_iter(window, b"/Count").find_map(|pos| count_value(window, pos))
}

/// Parses the positive integer after a `/Count` key; requires whitespace
/// between the name and the value.
fn count_value(text: &[u8], pos: usize) -> Option<u32> {
    let mut cur = Cursor::new(text, pos + b"/Count".len());
    match cur.peek() {
        Some(b) if is_whitespace(b) => {}
        _ => return None,
    }
    cur.skip_ws_and_comments();
    let v = cur.read_int()?;
    u32::try_from(v).ok().filter(|&v| v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn nearest_count_prefers_window_hit() {
        let text = b"<< /Type /Pages /Kids [1 0 R] /Count 17 >> trailing /Count 99";
        assert_eq!(nearest_count(text), Some(17));
    }

    #[test]
    fn nearest_count_takes_max_across_nodes() {
        let mut text = Vec::new();
        text.extend_from_slice(b"<< /Type /Pages /Count 3 >>");
        text.extend_from_slice(&vec![b' '; 60 * 1024]);
        text.extend_from_slice(b"<< /Type /Pages /Count 9 >>");
        assert_eq!(nearest_count(&text), Some(9));
    }

    #[test]
    fn nearest_count_requires_pages_marker() {
        assert_eq!(nearest_count(b"nothing here /Count 5"), None);
    }

    #[test]
    fn max_count_scans_globally() {
        let text = b"/Count 3 junk /Count 12 junk /Count -4 /CountX 99";
        assert_eq!(max_count(text), Some(12));
    }

    #[test]
    fn page_objects_exclude_pages_nodes() {
        let text = b"/Type /Page junk /Type /Pages junk /Type/Page /Type /PageLabels";
        assert_eq!(page_object_count(text), 2);
    }

    #[test]
    fn inflates_candidate_streams() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"<< /Type /Page >> << /Type /Page >>").unwrap();
        let compressed = enc.finish().unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"<< /Filter /FlateDecode >>\nstream\n");
        buf.extend_from_slice(&compressed);
        buf.extend_from_slice(b"\nendstream\n");
        let bodies = inflated_stream_bodies(&buf, 1024 * 1024);
        assert_eq!(bodies.len(), 1);
        assert_eq!(page_object_count(&bodies[0]), 2);
    }

    #[test]
    fn ignores_streams_without_flate_marker() {
        let buf = b"<< /Length 3 >>\nstream\nabc\nendstream\n";
        assert!(inflated_stream_bodies(buf, 1024).is_empty());
    }

    #[test]
    fn not_a_pdf_matches_nothing() {
        let text = b"not a pdf";
        assert_eq!(nearest_count(text), None);
        assert_eq!(max_count(text), None);
        assert_eq!(page_object_count(text), 0);
        assert!(inflated_stream_bodies(text, 1024).is_empty());
    }
}
