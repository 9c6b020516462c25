//! Binary frame codec: 9-byte header plus typed payloads.
//!
//! DATA payloads are kept opaque (padding included) since they are relayed
//! byte for byte; every other frame is fully decoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::processor::ProcessError;

pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const HEADER_LEN: usize = 9;
/// Largest payload accepted from any peer.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
pub const MAX_WINDOW: i64 = (1 << 31) - 1;

pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;
pub const PADDED: u8 = 0x8;
pub const PRIORITY: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
}

impl FrameType {
    pub fn code(&self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, FrameError> {
        Ok(match code {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::GoAway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("unknown frame type {0:#x}")]
    UnknownType(u8),
    #[error("truncated frame header")]
    Truncated,
    #[error("malformed {kind:?} frame: {reason}")]
    Malformed {
        kind: FrameType,
        reason: &'static str,
    },
    #[error("header block: {0}")]
    Compression(String),
}

impl FrameError {
    fn malformed(kind: FrameType, reason: &'static str) -> Self {
        FrameError::Malformed { kind, reason }
    }
}

impl From<FrameError> for ProcessError {
    fn from(err: FrameError) -> Self {
        ProcessError::Violation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(kind: FrameType, flags: u8, stream_id: u32, length: usize) -> Self {
        Self {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    /// Parse the first nine bytes of `src`.
    pub fn parse(src: &[u8]) -> Result<Self, FrameError> {
        if src.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let length = (usize::from(src[0]) << 16) | (usize::from(src[1]) << 8) | usize::from(src[2]);
        let kind = FrameType::try_from(src[3])?;
        if length > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(length));
        }
        let stream_id = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) & 0x7fff_ffff;
        Ok(Self {
            length,
            kind,
            flags: src[4],
            stream_id,
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        let len = self.length as u32;
        dst.put_u8((len >> 16) as u8);
        dst.put_u8((len >> 8) as u8);
        dst.put_u8(len as u8);
        dst.put_u8(self.kind.code());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(HEADER_LEN);
        self.encode(&mut dst);
        dst.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub dependency: u32,
    pub exclusive: bool,
    pub weight: u8,
}

impl PrioritySpec {
    fn parse(src: &mut Bytes) -> Self {
        let raw = src.get_u32();
        Self {
            dependency: raw & 0x7fff_ffff,
            exclusive: raw & 0x8000_0000 != 0,
            weight: src.get_u8(),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let mut raw = self.dependency & 0x7fff_ffff;
        if self.exclusive {
            raw |= 0x8000_0000;
        }
        dst.put_u32(raw);
        dst.put_u8(self.weight);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: u16,
    pub value: u32,
}

impl Setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
    pub const ENABLE_CONNECT_PROTOCOL: u16 = 0x8;

    pub fn new(id: u16, value: u32) -> Self {
        Self { id, value }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub ack: bool,
    pub params: Vec<Setting>,
}

impl Settings {
    pub fn ack() -> Self {
        Self {
            ack: true,
            params: Vec::new(),
        }
    }

    /// Last value sent for `id`.
    pub fn get(&self, id: u16) -> Option<u32> {
        self.params.iter().rev().find(|s| s.id == id).map(|s| s.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub stream_id: u32,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PrioritySpec>,
    pub pad_len: Option<u8>,
    pub fragment: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromise {
    pub stream_id: u32,
    pub end_headers: bool,
    pub promised_id: u32,
    pub pad_len: Option<u8>,
    pub fragment: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        flags: u8,
        payload: Bytes,
    },
    Headers(Headers),
    Priority {
        stream_id: u32,
        spec: PrioritySpec,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    Settings(Settings),
    PushPromise(PushPromise),
    Ping {
        ack: bool,
        opaque: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        end_headers: bool,
        fragment: Bytes,
    },
}

fn strip_padding(kind: FrameType, padded: bool, payload: &mut Bytes) -> Result<Option<u8>, FrameError> {
    if !padded {
        return Ok(None);
    }
    if payload.is_empty() {
        return Err(FrameError::malformed(kind, "missing pad length"));
    }
    let pad = payload.get_u8();
    if usize::from(pad) > payload.len() {
        return Err(FrameError::malformed(kind, "padding exceeds payload"));
    }
    payload.truncate(payload.len() - usize::from(pad));
    Ok(Some(pad))
}

fn require_stream(kind: FrameType, stream_id: u32) -> Result<(), FrameError> {
    if stream_id == 0 {
        return Err(FrameError::malformed(kind, "stream id must not be zero"));
    }
    Ok(())
}

fn require_connection(kind: FrameType, stream_id: u32) -> Result<(), FrameError> {
    if stream_id != 0 {
        return Err(FrameError::malformed(kind, "stream id must be zero"));
    }
    Ok(())
}

impl Frame {
    pub fn kind(&self) -> FrameType {
        match self {
            Frame::Data { .. } => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::Priority { .. } => FrameType::Priority,
            Frame::RstStream { .. } => FrameType::RstStream,
            Frame::Settings(_) => FrameType::Settings,
            Frame::PushPromise(_) => FrameType::PushPromise,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::GoAway { .. } => FrameType::GoAway,
            Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
            Frame::Continuation { .. } => FrameType::Continuation,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. } => *stream_id,
            Frame::Headers(h) => h.stream_id,
            Frame::PushPromise(p) => p.stream_id,
            Frame::Settings(_) | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    pub fn flags(&self) -> u8 {
        let flag = |on: bool, bit: u8| if on { bit } else { 0 };
        match self {
            Frame::Data { flags, .. } => *flags,
            Frame::Headers(h) => {
                flag(h.end_stream, END_STREAM)
                    | flag(h.end_headers, END_HEADERS)
                    | flag(h.pad_len.is_some(), PADDED)
                    | flag(h.priority.is_some(), PRIORITY)
            }
            Frame::PushPromise(p) => flag(p.end_headers, END_HEADERS) | flag(p.pad_len.is_some(), PADDED),
            Frame::Settings(s) => flag(s.ack, ACK),
            Frame::Ping { ack, .. } => flag(*ack, ACK),
            Frame::Continuation { end_headers, .. } => flag(*end_headers, END_HEADERS),
            Frame::Priority { .. }
            | Frame::RstStream { .. }
            | Frame::GoAway { .. }
            | Frame::WindowUpdate { .. } => 0,
        }
    }

    /// Decode a payload whose header has already been parsed.
    pub fn decode(header: &FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        let kind = header.kind;
        if payload.len() != header.length {
            return Err(FrameError::malformed(kind, "payload length mismatch"));
        }
        let stream_id = header.stream_id;

        let frame = match kind {
            FrameType::Data => {
                require_stream(kind, stream_id)?;
                Frame::Data {
                    stream_id,
                    flags: header.flags,
                    payload,
                }
            }
            FrameType::Headers => {
                require_stream(kind, stream_id)?;
                let pad_len = strip_padding(kind, header.has(PADDED), &mut payload)?;
                let priority = if header.has(PRIORITY) {
                    if payload.len() < 5 {
                        return Err(FrameError::malformed(kind, "truncated priority"));
                    }
                    Some(PrioritySpec::parse(&mut payload))
                } else {
                    None
                };
                Frame::Headers(Headers {
                    stream_id,
                    end_stream: header.has(END_STREAM),
                    end_headers: header.has(END_HEADERS),
                    priority,
                    pad_len,
                    fragment: payload,
                })
            }
            FrameType::Priority => {
                require_stream(kind, stream_id)?;
                if payload.len() != 5 {
                    return Err(FrameError::malformed(kind, "length must be 5"));
                }
                Frame::Priority {
                    stream_id,
                    spec: PrioritySpec::parse(&mut payload),
                }
            }
            FrameType::RstStream => {
                require_stream(kind, stream_id)?;
                if payload.len() != 4 {
                    return Err(FrameError::malformed(kind, "length must be 4"));
                }
                Frame::RstStream {
                    stream_id,
                    error_code: payload.get_u32(),
                }
            }
            FrameType::Settings => {
                require_connection(kind, stream_id)?;
                let ack = header.has(ACK);
                if ack && !payload.is_empty() {
                    return Err(FrameError::malformed(kind, "ack with payload"));
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameError::malformed(kind, "length must be a multiple of 6"));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    let id = payload.get_u16();
                    let value = payload.get_u32();
                    params.push(Setting { id, value });
                }
                Frame::Settings(Settings { ack, params })
            }
            FrameType::PushPromise => {
                require_stream(kind, stream_id)?;
                let pad_len = strip_padding(kind, header.has(PADDED), &mut payload)?;
                if payload.len() < 4 {
                    return Err(FrameError::malformed(kind, "missing promised stream id"));
                }
                let promised_id = payload.get_u32() & 0x7fff_ffff;
                Frame::PushPromise(PushPromise {
                    stream_id,
                    end_headers: header.has(END_HEADERS),
                    promised_id,
                    pad_len,
                    fragment: payload,
                })
            }
            FrameType::Ping => {
                require_connection(kind, stream_id)?;
                if payload.len() != 8 {
                    return Err(FrameError::malformed(kind, "length must be 8"));
                }
                let mut opaque = [0u8; 8];
                payload.copy_to_slice(&mut opaque);
                Frame::Ping {
                    ack: header.has(ACK),
                    opaque,
                }
            }
            FrameType::GoAway => {
                require_connection(kind, stream_id)?;
                if payload.len() < 8 {
                    return Err(FrameError::malformed(kind, "length must be at least 8"));
                }
                let last_stream_id = payload.get_u32() & 0x7fff_ffff;
                let error_code = payload.get_u32();
                Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug: payload,
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameError::malformed(kind, "length must be 4"));
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment: payload.get_u32() & 0x7fff_ffff,
                }
            }
            FrameType::Continuation => {
                require_stream(kind, stream_id)?;
                Frame::Continuation {
                    stream_id,
                    end_headers: header.has(END_HEADERS),
                    fragment: payload,
                }
            }
        };
        Ok(frame)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        match self {
            Frame::Data { payload: data, .. } => payload.extend_from_slice(data),
            Frame::Headers(h) => {
                if let Some(pad) = h.pad_len {
                    payload.put_u8(pad);
                }
                if let Some(spec) = h.priority {
                    spec.encode(&mut payload);
                }
                payload.extend_from_slice(&h.fragment);
                if let Some(pad) = h.pad_len {
                    payload.put_bytes(0, usize::from(pad));
                }
            }
            Frame::Priority { spec, .. } => spec.encode(&mut payload),
            Frame::RstStream { error_code, .. } => payload.put_u32(*error_code),
            Frame::Settings(s) => {
                for param in &s.params {
                    payload.put_u16(param.id);
                    payload.put_u32(param.value);
                }
            }
            Frame::PushPromise(p) => {
                if let Some(pad) = p.pad_len {
                    payload.put_u8(pad);
                }
                payload.put_u32(p.promised_id & 0x7fff_ffff);
                payload.extend_from_slice(&p.fragment);
                if let Some(pad) = p.pad_len {
                    payload.put_bytes(0, usize::from(pad));
                }
            }
            Frame::Ping { opaque, .. } => payload.extend_from_slice(opaque),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug,
            } => {
                payload.put_u32(*last_stream_id & 0x7fff_ffff);
                payload.put_u32(*error_code);
                payload.extend_from_slice(debug);
            }
            Frame::WindowUpdate { increment, .. } => payload.put_u32(*increment & 0x7fff_ffff),
            Frame::Continuation { fragment, .. } => payload.extend_from_slice(fragment),
        }

        FrameHeader::new(self.kind(), self.flags(), self.stream_id(), payload.len()).encode(dst);
        dst.extend_from_slice(&payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }
}
