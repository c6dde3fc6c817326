//! 4-byte frame header.
//!
//! ```text
//!  31                               4 3     1 0
//! ┌──────────────────────────────────┬───────┬──┐
//! │          length (28 bits)        │ type  │ c│
//! └──────────────────────────────────┴───────┴──┘
//! ```
//!
//! Stored little-endian. `length` counts the bytes after the header.

use crate::error::{WireError, WireResult};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest body length representable in 28 bits.
pub const MAX_FRAME_LENGTH: usize = (1 << 28) - 1;

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: u8,
    pub compressed: bool,
}

impl FrameHeader {
    pub fn new(kind: u8, length: usize, compressed: bool) -> WireResult<Self> {
        if length > MAX_FRAME_LENGTH {
            return Err(WireError::FrameTooLarge(length));
        }
        Ok(Self {
            length,
            kind: kind & 0b111,
            compressed,
        })
    }

    pub fn to_u32(self) -> u32 {
        ((self.length as u32) << 4) | ((self.kind as u32) << 1) | self.compressed as u32
    }

    pub fn from_u32(value: u32) -> Self {
        Self {
            length: (value >> 4) as usize,
            kind: ((value >> 1) & 0b111) as u8,
            compressed: value & 1 == 1,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        self.to_u32().to_le_bytes()
    }

    /// Read a header from the start of `buf`.
    pub fn read(buf: &[u8]) -> WireResult<Self> {
        let raw: [u8; HEADER_SIZE] = buf
            .get(..HEADER_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(WireError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            })?;
        Ok(Self::from_u32(u32::from_le_bytes(raw)))
    }

    /// Total size of the frame including the header.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length
    }
}
