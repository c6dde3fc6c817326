//! HTTP body encodings.
//!
//! Request bodies may arrive gzip-, deflate- or brotli-encoded. Responses are
//! compressed when the client accepts it and the body is over the wire
//! codec's compression threshold.

use std::io::{Read, Write};

use brotli::{CompressorWriter, Decompressor};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use qs_wire::compression::COMPRESSION_THRESHOLD;

use crate::domain::error::{SyncError, SyncResult};

/// A content coding this server understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

impl Encoding {
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
            Encoding::Deflate => Some("deflate"),
            Encoding::Brotli => Some("br"),
        }
    }
}

/// Parse a request's `Content-Encoding`.
pub fn content_encoding(header: Option<&str>) -> SyncResult<Encoding> {
    let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(Encoding::Identity);
    };
    match value.to_ascii_lowercase().as_str() {
        "identity" => Ok(Encoding::Identity),
        "gzip" | "x-gzip" => Ok(Encoding::Gzip),
        "deflate" => Ok(Encoding::Deflate),
        "br" => Ok(Encoding::Brotli),
        other => Err(SyncError::UnsupportedContentEncoding {
            encoding: other.to_string(),
        }),
    }
}

/// Decode a request body, refusing to produce more than `limit` bytes.
pub fn decode(encoding: Encoding, body: &[u8], limit: usize, name: &str) -> SyncResult<Vec<u8>> {
    let mut out = Vec::new();
    let read = match encoding {
        Encoding::Identity => {
            if body.len() > limit {
                return Err(SyncError::PayloadTooLarge {
                    name: name.to_string(),
                    size: body.len(),
                    limit,
                });
            }
            return Ok(body.to_vec());
        }
        Encoding::Gzip => GzDecoder::new(body).take(limit as u64 + 1).read_to_end(&mut out),
        Encoding::Deflate => ZlibDecoder::new(body)
            .take(limit as u64 + 1)
            .read_to_end(&mut out),
        Encoding::Brotli => Decompressor::new(body, BROTLI_BUFFER)
            .take(limit as u64 + 1)
            .read_to_end(&mut out),
    };
    read.map_err(|e| SyncError::invalid_payload(name, format!("bad {encoding:?} body: {e}")))?;
    if out.len() > limit {
        return Err(SyncError::PayloadTooLarge {
            name: name.to_string(),
            size: out.len(),
            limit,
        });
    }
    Ok(out)
}

/// Pick a response coding from `Accept-Encoding`. Prefers gzip, then brotli.
pub fn negotiate(accept: Option<&str>) -> Encoding {
    let Some(accept) = accept else {
        return Encoding::Identity;
    };
    let mut gzip = false;
    let mut deflate = false;
    let mut brotli = false;
    for item in accept.split(',') {
        let mut parts = item.split(';').map(str::trim);
        let coding = parts.next().unwrap_or("").to_ascii_lowercase();
        let refused = parts.any(|p| {
            p.strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        if refused {
            continue;
        }
        match coding.as_str() {
            "gzip" | "x-gzip" | "*" => gzip = true,
            "deflate" => deflate = true,
            "br" => brotli = true,
            _ => {}
        }
    }
    if gzip {
        Encoding::Gzip
    } else if brotli {
        Encoding::Brotli
    } else if deflate {
        Encoding::Deflate
    } else {
        Encoding::Identity
    }
}

/// Compress a response body. Small bodies and failed compressions go out
/// as identity.
pub fn encode(encoding: Encoding, body: Vec<u8>) -> (Vec<u8>, Encoding) {
    if encoding == Encoding::Identity || body.len() <= COMPRESSION_THRESHOLD {
        return (body, Encoding::Identity);
    }
    let compressed = match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body).and_then(|_| encoder.finish())
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body).and_then(|_| encoder.finish())
        }
        Encoding::Brotli => {
            let mut encoder =
                CompressorWriter::new(Vec::new(), BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_WINDOW);
            encoder.write_all(&body).map(|_| encoder.into_inner())
        }
        Encoding::Identity => return (body, Encoding::Identity),
    };
    match compressed {
        Ok(out) if out.len() < body.len() => (out, encoding),
        _ => (body, Encoding::Identity),
    }
}
