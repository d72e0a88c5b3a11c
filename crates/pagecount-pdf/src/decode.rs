//! Stream decoding: FlateDecode inflation and PNG predictor reversal.

use std::io::Read;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::object::{PdfAtom, PdfDict, PdfStream};

/// Inflated stream body. `truncated` is set when the output cap was hit;
/// callers on the structured path treat that as failure, the heuristic
/// scanners simply skip the stream.
#[derive(Debug)]
pub struct Inflated {
    pub data: Vec<u8>,
    pub truncated: bool,
}

/// Inflates a FlateDecode body, trying zlib framing first and falling back
/// to a raw deflate stream for producers that omit the header.
pub fn inflate(data: &[u8], max_out: usize) -> Result<Inflated> {
    let primary = inflate_with(flate2::read::ZlibDecoder::new(data), max_out);
    if let Ok(out) = primary {
        return Ok(out);
    }
    match inflate_with(flate2::read::DeflateDecoder::new(data), max_out) {
        Ok(out) => {
            debug!(
                domain = "pdf.decode",
                kind = "flate_recovery",
                "recovered Flate stream using raw deflate fallback"
            );
            Ok(out)
        }
        Err(fallback) => Err(anyhow!(
            "flate decode failed: zlib={}, deflate={}",
            primary.err().map(|e| e.to_string()).unwrap_or_else(|| "unknown".into()),
            fallback
        )),
    }
}

fn inflate_with<R: Read>(mut decoder: R, max_out: usize) -> Result<Inflated> {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if data.len() + n > max_out {
            let remaining = max_out.saturating_sub(data.len());
            data.extend_from_slice(&buf[..remaining]);
            truncated = true;
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    if data.is_empty() && !truncated {
        return Err(anyhow!("flate stream produced no output"));
    }
    Ok(Inflated { data, truncated })
}

/// Returns whether the stream advertises FlateDecode. Any other filter is
/// an error; FlateDecode is the only filter this engine decodes.
pub fn flate_advertised(dict: &PdfDict<'_>) -> Result<bool> {
    let Some(obj) = dict.get_first(b"/Filter") else {
        return Ok(false);
    };
    match &obj.atom {
        PdfAtom::Name(n) if is_flate_name(&n.decoded) => Ok(true),
        PdfAtom::Array(items) if items.is_empty() => Ok(false),
        PdfAtom::Array(items) if items.len() == 1 => match &items[0].atom {
            PdfAtom::Name(n) if is_flate_name(&n.decoded) => Ok(true),
            _ => Err(anyhow!("unsupported filter chain")),
        },
        _ => Err(anyhow!("unsupported filter chain")),
    }
}

fn is_flate_name(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"/FlateDecode") || name.eq_ignore_ascii_case(b"/Fl")
}

/// Materializes a stream body, inflating when FlateDecode is advertised.
/// Hitting the output cap is an error here; callers that can tolerate a
/// partial body use `inflate` directly.
pub fn stream_body(st: &PdfStream<'_>, max_out: usize) -> Result<Vec<u8>> {
    if flate_advertised(&st.dict)? {
        let inflated = inflate(st.data, max_out)?;
        if inflated.truncated {
            return Err(anyhow!("stream exceeds inflation cap"));
        }
        Ok(inflated.data)
    } else {
        Ok(st.data.to_vec())
    }
}

/// Reverses the PNG row filters (predictors 10..=15) over 8-bit samples.
///
/// Each row carries a leading filter byte (0 None, 1 Sub, 2 Up, 3 Average,
/// 4 Paeth) followed by `columns` data bytes; additions wrap mod 256. A
/// final partial row is dropped.
pub fn undo_png_predictor(data: &[u8], columns: usize) -> Result<Vec<u8>> {
    if columns == 0 {
        return Err(anyhow!("predictor columns must be positive"));
    }
    let mut out = Vec::with_capacity(data.len());
    let mut prev = vec![0u8; columns];
    let mut i = 0usize;
    while i + 1 + columns <= data.len() {
        let filter = data[i];
        let mut row = data[i + 1..i + 1 + columns].to_vec();
        i += 1 + columns;
        match filter {
            0 => {}
            1 => {
                for j in 1..columns {
                    row[j] = row[j].wrapping_add(row[j - 1]);
                }
            }
            2 => {
                for j in 0..columns {
                    row[j] = row[j].wrapping_add(prev[j]);
                }
            }
            3 => {
                for j in 0..columns {
                    let left = if j > 0 { row[j - 1] } else { 0 };
                    let avg = ((left as u16 + prev[j] as u16) / 2) as u8;
                    row[j] = row[j].wrapping_add(avg);
                }
            }
            4 => {
                for j in 0..columns {
                    let left = if j > 0 { row[j - 1] } else { 0 };
                    let up_left = if j > 0 { prev[j - 1] } else { 0 };
                    row[j] = row[j].wrapping_add(paeth(left, prev[j], up_left));
                }
            }
            other => return Err(anyhow!("unknown PNG filter {other}")),
        }
        out.extend_from_slice(&row);
        prev.copy_from_slice(&row);
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let (a, b, c) = (a as i32, b as i32, c as i32);
    let p = a + b - c;
    let pa = (p - a).abs();
    let pb = (p - b).abs();
    let pc = (p - c).abs();
    if pa <= pb && pa <= pc {
        a as u8
    } else if pb <= pc {
        b as u8
    } else {
        c as u8
    }
}
