//! Frame encoding, decoding and scanning.
//!
//! Every frame is a [`FrameHeader`] followed by a fixed prefix (ids, checksums,
//! names) and an optional body. Only the body is ever compressed, so ids stay
//! patchable in an encoded frame (see [`update_id`]).

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::compression::{inflate, maybe_deflate};
use crate::error::{WireError, WireResult};
use crate::header::{FrameHeader, HEADER_SIZE, MAX_FRAME_LENGTH};
use crate::payload::Payload;

/// Longest route name a frame can carry.
pub const MAX_NAME_LENGTH: usize = u8::MAX as usize;

/// Frame types sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutgoingKind {
    FunctionResponse = 0,
    SubscriptionData = 1,
    SubscriptionDiff = 2,
    GetUpToDate = 3,
    Auth = 4,
    Error = 5,
    ChannelMessage = 6,
    Misc = 7,
}

/// Frame types sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IncomingKind {
    Function = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    Get = 3,
    Auth = 4,
    ChannelSubscribe = 5,
    ChannelPublish = 6,
    Misc = 7,
}

/// Server misc subtypes.
pub mod misc_out {
    pub const STREAM_CHUNK_ACK: u8 = 0;
    pub const DRAIN: u8 = 1;
}

/// Client misc subtypes.
pub mod misc_in {
    pub const STREAM_REGISTER: u8 = 0;
    pub const STREAM_CHUNK: u8 = 1;
}

/// Mode byte of a channel-subscribe frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelMode {
    Subscribe = 0,
    Unsubscribe = 1,
    RegisterPublisher = 2,
}

impl ChannelMode {
    pub fn from_byte(b: u8) -> WireResult<Self> {
        match b {
            0 => Ok(Self::Subscribe),
            1 => Ok(Self::Unsubscribe),
            2 => Ok(Self::RegisterPublisher),
            other => Err(WireError::UnknownChannelMode(other)),
        }
    }
}

// =============================================================================
// ENCODING
// =============================================================================

struct FrameBuilder {
    kind: u8,
    prefix: Vec<u8>,
}

impl FrameBuilder {
    fn new(kind: u8) -> Self {
        Self {
            kind,
            prefix: Vec::with_capacity(24),
        }
    }

    fn u8(mut self, v: u8) -> Self {
        self.prefix.push(v);
        self
    }

    fn u32(mut self, v: u32) -> Self {
        self.prefix.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(mut self, v: u64) -> Self {
        self.prefix.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn name(mut self, name: &str) -> WireResult<Self> {
        if name.len() > MAX_NAME_LENGTH {
            return Err(WireError::NameTooLong(name.len()));
        }
        self.prefix.push(name.len() as u8);
        self.prefix.extend_from_slice(name.as_bytes());
        Ok(self)
    }

    fn finish(self) -> WireResult<Bytes> {
        self.assemble(&[], false)
    }

    fn body(self, payload: &Payload) -> WireResult<Bytes> {
        let (body, compressed) = maybe_deflate(payload.encode_body());
        self.assemble(&body, compressed)
    }

    fn raw(self, data: &[u8], compress: bool) -> WireResult<Bytes> {
        if compress {
            let (body, compressed) = maybe_deflate(data.to_vec());
            return self.assemble(&body, compressed);
        }
        self.assemble(data, false)
    }

    fn assemble(self, body: &[u8], compressed: bool) -> WireResult<Bytes> {
        let header = FrameHeader::new(self.kind, self.prefix.len() + body.len(), compressed)?;
        let mut out = BytesMut::with_capacity(header.frame_len());
        out.put_slice(&header.to_bytes());
        out.put_slice(&self.prefix);
        out.put_slice(body);
        Ok(out.freeze())
    }
}

pub fn encode_function_response(req_id: u32, payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::FunctionResponse as u8)
        .u32(req_id)
        .body(payload)
}

pub fn encode_subscription_data(id: u64, checksum: u64, payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::SubscriptionData as u8)
        .u64(id)
        .u64(checksum)
        .body(payload)
}

pub fn encode_subscription_diff(
    id: u64,
    checksum: u64,
    previous_checksum: u64,
    patch: &Value,
) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::SubscriptionDiff as u8)
        .u64(id)
        .u64(checksum)
        .u64(previous_checksum)
        .body(&Payload::Json(patch.clone()))
}

pub fn encode_get_up_to_date(id: u64) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::GetUpToDate as u8)
        .u64(id)
        .finish()
}

/// Auth frame. Same layout in both directions.
pub fn encode_auth(payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::Auth as u8).body(payload)
}

pub fn encode_error(error: &Value) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::Error as u8).body(&Payload::Json(error.clone()))
}

pub fn encode_channel_message(id: u64, payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::ChannelMessage as u8)
        .u64(id)
        .body(payload)
}

pub fn encode_stream_chunk_ack(req_id: u32, seq: u8) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::Misc as u8)
        .u8(misc_out::STREAM_CHUNK_ACK)
        .u32(req_id)
        .u8(seq)
        .finish()
}

pub fn encode_drain(reconnect_after_ms: u32) -> WireResult<Bytes> {
    FrameBuilder::new(OutgoingKind::Misc as u8)
        .u8(misc_out::DRAIN)
        .u32(reconnect_after_ms)
        .finish()
}

pub fn encode_function_call(req_id: u32, name: &str, payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(IncomingKind::Function as u8)
        .u32(req_id)
        .name(name)?
        .body(payload)
}

pub fn encode_subscribe(id: u64, checksum: u64, name: &str, payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(IncomingKind::Subscribe as u8)
        .u64(id)
        .u64(checksum)
        .name(name)?
        .body(payload)
}

pub fn encode_unsubscribe(id: u64) -> WireResult<Bytes> {
    FrameBuilder::new(IncomingKind::Unsubscribe as u8)
        .u64(id)
        .finish()
}

pub fn encode_get(id: u64, checksum: u64, name: &str, payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(IncomingKind::Get as u8)
        .u64(id)
        .u64(checksum)
        .name(name)?
        .body(payload)
}

pub fn encode_channel_subscribe(
    id: u64,
    mode: ChannelMode,
    name: &str,
    payload: &Payload,
) -> WireResult<Bytes> {
    let builder = FrameBuilder::new(IncomingKind::ChannelSubscribe as u8)
        .u64(id)
        .u8(mode as u8);
    match mode {
        ChannelMode::Unsubscribe => builder.finish(),
        _ => builder.name(name)?.body(payload),
    }
}

pub fn encode_channel_publish(id: u64, payload: &Payload) -> WireResult<Bytes> {
    FrameBuilder::new(IncomingKind::ChannelPublish as u8)
        .u64(id)
        .body(payload)
}

pub fn encode_stream_register(
    req_id: u32,
    content_size: u32,
    name: &str,
    metadata: &Payload,
) -> WireResult<Bytes> {
    FrameBuilder::new(IncomingKind::Misc as u8)
        .u8(misc_in::STREAM_REGISTER)
        .u32(req_id)
        .u32(content_size)
        .name(name)?
        .body(metadata)
}

pub fn encode_stream_chunk(req_id: u32, seq: u8, chunk: &[u8], compress: bool) -> WireResult<Bytes> {
    FrameBuilder::new(IncomingKind::Misc as u8)
        .u8(misc_in::STREAM_CHUNK)
        .u32(req_id)
        .u8(seq)
        .raw(chunk, compress)
}

/// Rewrite the subscription/channel id of an encoded frame in place.
///
/// The buffer must not be shared with another writer while the id is swapped.
pub fn update_id(frame: &mut BytesMut, id: u64) -> WireResult<()> {
    let header = FrameHeader::read(frame)?;
    let has_id = matches!(header.kind, 1 | 2 | 3 | 6);
    if !has_id {
        return Err(WireError::UnknownType(header.kind));
    }
    let end = HEADER_SIZE + 8;
    if frame.len() < end {
        return Err(WireError::Truncated {
            needed: end,
            available: frame.len(),
        });
    }
    frame[HEADER_SIZE..end].copy_from_slice(&id.to_le_bytes());
    Ok(())
}

/// Copy of `frame` carrying `id` instead of its original id.
pub fn with_id(frame: &[u8], id: u64) -> WireResult<Bytes> {
    let mut copy = BytesMut::from(frame);
    update_id(&mut copy, id)?;
    Ok(copy.freeze())
}

// =============================================================================
// DECODING
// =============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        let end = self.pos + n;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated {
            needed: end,
            available: self.buf.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> WireResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> WireResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn name(&mut self) -> WireResult<String> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidName)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

fn body_bytes(raw: &[u8], compressed: bool, limit: usize) -> WireResult<Vec<u8>> {
    if compressed {
        inflate(raw, limit)
    } else {
        Ok(raw.to_vec())
    }
}

fn payload(raw: &[u8], compressed: bool, limit: usize) -> WireResult<Payload> {
    if compressed {
        Payload::decode_body(&inflate(raw, limit)?)
    } else {
        Payload::decode_body(raw)
    }
}

/// One frame located by [`FrameReader`].
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub header: FrameHeader,
    /// Bytes after the header.
    pub content: &'a [u8],
    /// Offset of the header inside the scanned buffer.
    pub offset: usize,
}

/// Walks a buffer holding one or more concatenated frames.
///
/// Stops after the first error; a malformed stream cannot resynchronise.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = WireResult<RawFrame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let remaining = &self.buf[self.pos..];
        let result = FrameHeader::read(remaining).and_then(|header| {
            // always >= HEADER_SIZE, so every step makes progress
            let end = header.frame_len();
            let content = remaining.get(HEADER_SIZE..end).ok_or(WireError::Truncated {
                needed: end,
                available: remaining.len(),
            })?;
            Ok((
                RawFrame {
                    header,
                    content,
                    offset: self.pos,
                },
                end,
            ))
        });
        match result {
            Ok((frame, advance)) => {
                self.pos += advance;
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    Function {
        req_id: u32,
        name: String,
        payload: Payload,
    },
    Subscribe {
        id: u64,
        checksum: u64,
        name: String,
        payload: Payload,
    },
    Unsubscribe {
        id: u64,
    },
    Get {
        id: u64,
        checksum: u64,
        name: String,
        payload: Payload,
    },
    Auth {
        payload: Payload,
    },
    ChannelSubscribe {
        id: u64,
        name: String,
        payload: Payload,
    },
    ChannelUnsubscribe {
        id: u64,
    },
    ChannelRegisterPublisher {
        id: u64,
        name: String,
        payload: Payload,
    },
    ChannelPublish {
        id: u64,
        payload: Payload,
    },
    StreamRegister {
        req_id: u32,
        content_size: u32,
        name: String,
        metadata: Payload,
    },
    StreamChunk {
        req_id: u32,
        seq: u8,
        data: Bytes,
    },
}

impl IncomingFrame {
    /// Decode a located frame. `limit` caps inflated body size.
    pub fn decode(frame: &RawFrame<'_>, limit: usize) -> WireResult<Self> {
        let compressed = frame.header.compressed;
        let mut c = Cursor::new(frame.content);
        let decoded = match frame.header.kind {
            0 => IncomingFrame::Function {
                req_id: c.u32()?,
                name: c.name()?,
                payload: payload(c.rest(), compressed, limit)?,
            },
            1 => IncomingFrame::Subscribe {
                id: c.u64()?,
                checksum: c.u64()?,
                name: c.name()?,
                payload: payload(c.rest(), compressed, limit)?,
            },
            2 => IncomingFrame::Unsubscribe { id: c.u64()? },
            3 => IncomingFrame::Get {
                id: c.u64()?,
                checksum: c.u64()?,
                name: c.name()?,
                payload: payload(c.rest(), compressed, limit)?,
            },
            4 => IncomingFrame::Auth {
                payload: payload(c.rest(), compressed, limit)?,
            },
            5 => {
                let id = c.u64()?;
                match ChannelMode::from_byte(c.u8()?)? {
                    ChannelMode::Unsubscribe => IncomingFrame::ChannelUnsubscribe { id },
                    ChannelMode::Subscribe => IncomingFrame::ChannelSubscribe {
                        id,
                        name: c.name()?,
                        payload: payload(c.rest(), compressed, limit)?,
                    },
                    ChannelMode::RegisterPublisher => IncomingFrame::ChannelRegisterPublisher {
                        id,
                        name: c.name()?,
                        payload: payload(c.rest(), compressed, limit)?,
                    },
                }
            }
            6 => IncomingFrame::ChannelPublish {
                id: c.u64()?,
                payload: payload(c.rest(), compressed, limit)?,
            },
            7 => match c.u8()? {
                misc_in::STREAM_REGISTER => IncomingFrame::StreamRegister {
                    req_id: c.u32()?,
                    content_size: c.u32()?,
                    name: c.name()?,
                    metadata: payload(c.rest(), compressed, limit)?,
                },
                misc_in::STREAM_CHUNK => IncomingFrame::StreamChunk {
                    req_id: c.u32()?,
                    seq: c.u8()?,
                    data: Bytes::from(body_bytes(c.rest(), compressed, limit)?),
                },
                other => return Err(WireError::UnknownSubtype(other)),
            },
            other => return Err(WireError::UnknownType(other)),
        };
        Ok(decoded)
    }

    /// Route name carried by the frame, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            IncomingFrame::Function { name, .. }
            | IncomingFrame::Subscribe { name, .. }
            | IncomingFrame::Get { name, .. }
            | IncomingFrame::ChannelSubscribe { name, .. }
            | IncomingFrame::ChannelRegisterPublisher { name, .. }
            | IncomingFrame::StreamRegister { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A decoded server frame, as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingFrame {
    FunctionResponse {
        req_id: u32,
        payload: Payload,
    },
    SubscriptionData {
        id: u64,
        checksum: u64,
        payload: Payload,
    },
    SubscriptionDiff {
        id: u64,
        checksum: u64,
        previous_checksum: u64,
        patch: Value,
    },
    GetUpToDate {
        id: u64,
    },
    Auth {
        payload: Payload,
    },
    Error {
        error: Value,
    },
    ChannelMessage {
        id: u64,
        payload: Payload,
    },
    StreamChunkAck {
        req_id: u32,
        seq: u8,
    },
    Drain {
        reconnect_after_ms: u32,
    },
}

impl OutgoingFrame {
    pub fn decode(frame: &RawFrame<'_>) -> WireResult<Self> {
        let compressed = frame.header.compressed;
        let limit = MAX_FRAME_LENGTH;
        let mut c = Cursor::new(frame.content);
        let decoded = match frame.header.kind {
            0 => OutgoingFrame::FunctionResponse {
                req_id: c.u32()?,
                payload: payload(c.rest(), compressed, limit)?,
            },
            1 => OutgoingFrame::SubscriptionData {
                id: c.u64()?,
                checksum: c.u64()?,
                payload: payload(c.rest(), compressed, limit)?,
            },
            2 => {
                let id = c.u64()?;
                let checksum = c.u64()?;
                let previous_checksum = c.u64()?;
                let patch = match payload(c.rest(), compressed, limit)? {
                    Payload::Json(v) => v,
                    Payload::Null => Value::Null,
                    _ => return Err(WireError::InvalidPatch("diff body is not json".into())),
                };
                OutgoingFrame::SubscriptionDiff {
                    id,
                    checksum,
                    previous_checksum,
                    patch,
                }
            }
            3 => OutgoingFrame::GetUpToDate { id: c.u64()? },
            4 => OutgoingFrame::Auth {
                payload: payload(c.rest(), compressed, limit)?,
            },
            5 => OutgoingFrame::Error {
                error: payload(c.rest(), compressed, limit)?.to_json(),
            },
            6 => OutgoingFrame::ChannelMessage {
                id: c.u64()?,
                payload: payload(c.rest(), compressed, limit)?,
            },
            7 => match c.u8()? {
                misc_out::STREAM_CHUNK_ACK => OutgoingFrame::StreamChunkAck {
                    req_id: c.u32()?,
                    seq: c.u8()?,
                },
                misc_out::DRAIN => OutgoingFrame::Drain {
                    reconnect_after_ms: c.u32()?,
                },
                other => return Err(WireError::UnknownSubtype(other)),
            },
            other => return Err(WireError::UnknownType(other)),
        };
        Ok(decoded)
    }

    /// Decode every frame in `buf`.
    pub fn decode_all(buf: &[u8]) -> WireResult<Vec<Self>> {
        FrameReader::new(buf)
            .map(|raw| raw.and_then(|f| Self::decode(&f)))
            .collect()
    }
}
