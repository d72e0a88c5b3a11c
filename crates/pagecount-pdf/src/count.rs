//! Strategy waterfall and the public entry points.
//!
//! Strategies run from most accurate to most heuristic; the first positive
//! count wins. Any failure inside a strategy is logged and demoted to "try
//! the next one", so the only caller-visible parse error is
//! `CountError::PageCountNotFound`.

use std::path::Path;

use tracing::debug;

use crate::error::CountError;
use crate::xref::XrefFlavor;
use crate::{pages, scan, xref};

#[derive(Debug, Clone, Copy)]
pub struct CountOptions {
    /// Per-stream inflation cap; larger streams fail the structured path
    /// and are skipped by the scanners.
    pub max_stream_bytes: usize,
    /// Maximum number of xref sections visited beyond the first while
    /// following `/Prev` (and hybrid `/XRefStm`) pointers.
    pub max_prev_hops: usize,
}

impl Default for CountOptions {
    fn default() -> Self {
        Self { max_stream_bytes: 10 * 1024 * 1024, max_prev_hops: 10 }
    }
}

/// Counts the pages of a PDF held in memory.
pub fn count_pages(bytes: &[u8]) -> Result<u32, CountError> {
    count_pages_with(bytes, &CountOptions::default())
}

pub fn count_pages_with(bytes: &[u8], opts: &CountOptions) -> Result<u32, CountError> {
    resolve_count(bytes, opts).ok_or(CountError::PageCountNotFound)
}

/// Reads the file fully into memory, then counts.
pub fn count_pages_in_file(path: impl AsRef<Path>) -> Result<u32, CountError> {
    let bytes = std::fs::read(path)?;
    count_pages(&bytes)
}

/// Identical semantics to [`count_pages_in_file`]; only the read is async.
pub async fn count_pages_in_file_async(path: impl AsRef<Path>) -> Result<u32, CountError> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    count_pages(&bytes)
}

fn resolve_count(bytes: &[u8], opts: &CountOptions) -> Option<u32> {
    let stream_xref = build_soft(bytes, XrefFlavor::Stream, opts);
    let classic_xref = build_soft(bytes, XrefFlavor::Classic, opts);
    let mut cache = ScanCache::default();

    for (label, built) in [("xref_stream", &stream_xref), ("classic_xref", &classic_xref)] {
        let Some(map) = built else { continue };
        match pages::count_via_tree(bytes, map, opts) {
            Ok(n) if n > 0 => {
                debug!(domain = "pdf.count", strategy = label, pages = n, "page tree traversal");
                return clamp(n);
            }
            Ok(_) => {}
            Err(err) => {
                debug!(domain = "pdf.count", strategy = label, error = %err, "traversal failed");
            }
        }
    }

    for (label, built) in [("classic_xref", &classic_xref), ("xref_stream", &stream_xref)] {
        let Some(map) = built else { continue };
        match pages::root_pages_count(bytes, map, opts) {
            Ok(n) if n > 0 => {
                // A stale tree can report /Count 1 while the real page
                // objects are still in the file; believe the bigger number.
                let scanned = cache.page_total(bytes, opts);
                if scanned > n {
                    debug!(
                        domain = "pdf.count",
                        strategy = label,
                        declared = n,
                        scanned,
                        "scanned page objects exceed declared /Count"
                    );
                    return clamp(scanned);
                }
                debug!(domain = "pdf.count", strategy = label, pages = n, "root /Count");
                return clamp(n);
            }
            Ok(_) => {}
            Err(err) => {
                debug!(domain = "pdf.count", strategy = label, error = %err, "root /Count failed");
            }
        }
    }

    if let Some(n) = scan::nearest_count(bytes) {
        debug!(domain = "pdf.count", strategy = "nearest_count_raw", pages = n, "scan hit");
        return Some(n);
    }
    let mut best: Option<u32> = None;
    for body in cache.bodies(bytes, opts) {
        if let Some(n) = scan::nearest_count(body) {
            best = Some(best.map_or(n, |b| b.max(n)));
        }
    }
    if let Some(n) = best {
        debug!(domain = "pdf.count", strategy = "nearest_count_streams", pages = n, "scan hit");
        return Some(n);
    }

    // Only after both nearest passes come up empty is a bare /Count,
    // wherever it sits, worth believing.
    if let Some(n) = scan::max_count(bytes) {
        debug!(domain = "pdf.count", strategy = "max_count_raw", pages = n, "scan hit");
        return Some(n);
    }
    let mut best: Option<u32> = None;
    for body in cache.bodies(bytes, opts) {
        if let Some(n) = scan::max_count(body) {
            best = Some(best.map_or(n, |b| b.max(n)));
        }
    }
    if let Some(n) = best {
        debug!(domain = "pdf.count", strategy = "max_count_streams", pages = n, "scan hit");
        return Some(n);
    }

    let total = cache.page_total(bytes, opts);
    if total > 0 {
        debug!(domain = "pdf.count", strategy = "page_objects", pages = total, "scan hit");
        return clamp(total);
    }
    None
}

fn build_soft<'a>(
    bytes: &'a [u8],
    flavor: XrefFlavor,
    opts: &CountOptions,
) -> Option<xref::XrefMap<'a>> {
    match xref::build_xref(bytes, flavor, opts) {
        Ok(map) => Some(map),
        Err(err) => {
            debug!(domain = "pdf.count", flavor = ?flavor, error = %err, "xref unavailable");
            None
        }
    }
}

fn clamp(n: u64) -> Option<u32> {
    Some(u32::try_from(n).unwrap_or(u32::MAX))
}

/// Scan results shared across strategies, computed at most once.
#[derive(Default)]
struct ScanCache {
    bodies: Option<Vec<Vec<u8>>>,
    page_total: Option<u64>,
}

impl ScanCache {
    fn bodies(&mut self, bytes: &[u8], opts: &CountOptions) -> &[Vec<u8>] {
        if self.bodies.is_none() {
            self.bodies = Some(scan::inflated_stream_bodies(bytes, opts.max_stream_bytes));
        }
        self.bodies.as_deref().unwrap_or(&[])
    }

    fn page_total(&mut self, bytes: &[u8], opts: &CountOptions) -> u64 {
        if let Some(v) = self.page_total {
            return v;
        }
        let mut total = scan::page_object_count(bytes);
        for body in self.bodies(bytes, opts) {
            total += scan::page_object_count(body);
        }
        self.page_total = Some(total);
        total
    }
}
