//! # Quantum-Sync Wire Codec
//!
//! Binary frame format spoken between sync clients and the gateway.
//!
//! ## Frame Layout
//!
//! ```text
//! ┌────────────┬──────────────────────┬───────────────────────────────┐
//! │ header u32 │ prefix (ids, names)  │ body: tag u8 · payload bytes  │
//! └────────────┴──────────────────────┴───────────────────────────────┘
//! ```
//!
//! - Header packs `length << 4 | type << 1 | compressed`, little-endian
//! - Bodies over 150 bytes are zlib-deflated when that makes them smaller
//! - Subscription frames carry a 64-bit id and checksum; diff frames add the
//!   base checksum they apply to
//!
//! A buffer may hold several frames back to back; [`FrameReader`] walks them.

pub mod checksum;
pub mod compression;
pub mod diff;
pub mod error;
pub mod frame;
pub mod header;
pub mod payload;
pub mod receiver;

pub use checksum::{fingerprint, hash_json, hash_payload};
pub use diff::{apply_patch, diff};
pub use error::{WireError, WireResult};
pub use frame::{
    with_id, update_id, ChannelMode, FrameReader, IncomingFrame, IncomingKind, OutgoingFrame,
    OutgoingKind, RawFrame, MAX_NAME_LENGTH,
};
pub use header::{FrameHeader, HEADER_SIZE, MAX_FRAME_LENGTH};
pub use payload::{ContentType, Payload};
pub use receiver::{ReceivedValue, ReceiverCache};
