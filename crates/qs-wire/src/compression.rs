//! Body compression.
//!
//! Bodies above [`COMPRESSION_THRESHOLD`] are zlib-deflated when that actually
//! shrinks them. Zlib framing matches HTTP `Content-Encoding: deflate`, so a
//! cached compressed body can be served over HTTP as-is.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{WireError, WireResult};

/// Bodies at or below this size are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 150;

/// Compress `body` if it is large enough and compression helps.
///
/// Returns the bytes to put on the wire and whether they are compressed.
pub fn maybe_deflate(body: Vec<u8>) -> (Vec<u8>, bool) {
    if body.len() <= COMPRESSION_THRESHOLD {
        return (body, false);
    }
    match deflate(&body) {
        Ok(compressed) if compressed.len() < body.len() => (compressed, true),
        Ok(_) => (body, false),
        Err(e) => {
            tracing::warn!(error = %e, size = body.len(), "deflate failed, sending uncompressed");
            (body, false)
        }
    }
}

/// Zlib-deflate `data`.
pub fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate a zlib stream, refusing to produce more than `limit` bytes.
pub fn inflate(data: &[u8], limit: usize) -> WireResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(3).min(limit));
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| WireError::Inflate(e.to_string()))?;
    if out.len() > limit {
        return Err(WireError::Inflate(format!(
            "inflated body exceeds {} bytes",
            limit
        )));
    }
    Ok(out)
}
