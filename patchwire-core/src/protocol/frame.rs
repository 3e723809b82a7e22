//! Frame envelope.
//!
//! # How Framing Works
//!
//! Every frame is `[type: u8][len: u32][payload: len bytes]`. The type tag
//! decides which codec reads the payload. Message transports (WebSocket)
//! carry exactly one frame per message and use [`Frame::decode`]; byte
//! streams feed a [`FrameDecoder`], which yields frames as they complete.
//!
//! Failures are scoped as follows:
//!
//! - [`FrameDecoder`]: a frame with an unknown type tag or a bad payload is
//!   consumed whole and reported, and decoding continues with the next
//!   frame. A length above the limit cannot be skipped, so the buffer is
//!   dropped and the stream is lost.
//! - [`Frame::decode`] on one message: the message is dropped. A session
//!   answers it with a single Error frame and keeps its state.

use std::fmt;

use super::codec::{WireReader, WireWriter};
use super::event::EventFrame;
use super::handshake::{HandshakeReply, Hello, KIND_HELLO, KIND_REPLY};
use super::patch::PatchFrame;
use crate::error::ProtocolError;

/// Bytes in the frame header.
pub const HEADER_LEN: usize = 5;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 1,
    Event = 2,
    Patches = 3,
    Error = 4,
    Ack = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(FrameType::Handshake),
            2 => Ok(FrameType::Event),
            3 => Ok(FrameType::Patches),
            4 => Ok(FrameType::Error),
            5 => Ok(FrameType::Ack),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Handshake => "handshake",
            FrameType::Event => "event",
            FrameType::Patches => "patches",
            FrameType::Error => "error",
            FrameType::Ack => "ack",
        };
        f.write_str(name)
    }
}

/// Error codes carried by Error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Malformed = 1,
    UnknownFrameType = 2,
    SequenceGap = 3,
    UnknownTarget = 4,
    RenderFailed = 5,
    HandlerFailed = 6,
    BudgetExceeded = 7,
    InvalidState = 8,
    ResourceLimit = 9,
    Internal = 10,
    ResumeFailed = 11,
    VersionMismatch = 12,
    UnexpectedFrame = 13,
}

impl TryFrom<u16> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => ErrorCode::Malformed,
            2 => ErrorCode::UnknownFrameType,
            3 => ErrorCode::SequenceGap,
            4 => ErrorCode::UnknownTarget,
            5 => ErrorCode::RenderFailed,
            6 => ErrorCode::HandlerFailed,
            7 => ErrorCode::BudgetExceeded,
            8 => ErrorCode::InvalidState,
            9 => ErrorCode::ResourceLimit,
            10 => ErrorCode::Internal,
            11 => ErrorCode::ResumeFailed,
            12 => ErrorCode::VersionMismatch,
            13 => ErrorCode::UnexpectedFrame,
            other => return Err(ProtocolError::UnknownErrorCode(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    /// Event sequence that caused the error, when there is one.
    pub sequence: Option<u64>,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: ErrorCode, sequence: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            code,
            sequence,
            message: message.into(),
        }
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.u16(self.code as u16);
        w.opt_u64(self.sequence);
        // Messages are informational; clip rather than fail.
        let mut end = self.message.len().min(u16::MAX as usize);
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        w.str16("message", &self.message[..end])
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            code: ErrorCode::try_from(r.u16()?)?,
            sequence: r.opt_u64()?,
            message: r.str16()?,
        })
    }
}

/// Acknowledges an event that produced no patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    HandshakeReply(HandshakeReply),
    Event(EventFrame),
    Patches(PatchFrame),
    Error(ErrorFrame),
    Ack(AckFrame),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello(_) | Frame::HandshakeReply(_) => FrameType::Handshake,
            Frame::Event(_) => FrameType::Event,
            Frame::Patches(_) => FrameType::Patches,
            Frame::Error(_) => FrameType::Error,
            Frame::Ack(_) => FrameType::Ack,
        }
    }

    /// Encode header and payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = WireWriter::with_capacity(64);
        match self {
            Frame::Hello(hello) => hello.encode(&mut w)?,
            Frame::HandshakeReply(reply) => reply.encode(&mut w)?,
            Frame::Event(event) => event.encode(&mut w)?,
            Frame::Patches(patches) => patches.encode(&mut w)?,
            Frame::Error(error) => error.encode(&mut w)?,
            Frame::Ack(ack) => w.u64(ack.sequence),
        }
        let payload = w.finish();
        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(self.frame_type() as u8);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode exactly one frame; trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(bytes);
        let tag = r.u8()?;
        let len = r.u32()? as usize;
        let frame_type = FrameType::try_from(tag)?;
        let payload = r.take(len)?;
        r.finish()?;
        Self::decode_payload(frame_type, payload)
    }

    fn decode_payload(frame_type: FrameType, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let frame = match frame_type {
            FrameType::Handshake => match r.u8()? {
                KIND_HELLO => Frame::Hello(Hello::decode(&mut r)?),
                KIND_REPLY => Frame::HandshakeReply(HandshakeReply::decode(&mut r)?),
                other => return Err(ProtocolError::UnknownHandshakeKind(other)),
            },
            FrameType::Event => Frame::Event(EventFrame::decode(&mut r)?),
            FrameType::Patches => Frame::Patches(PatchFrame::decode(&mut r)?),
            FrameType::Error => Frame::Error(ErrorFrame::decode(&mut r)?),
            FrameType::Ack => Frame::Ack(AckFrame { sequence: r.u64()? }),
        };
        r.finish()?;
        Ok(frame)
    }
}

/// Incremental decoder for byte-stream transports.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, or `None` if more input is needed.
    ///
    /// An oversized frame clears the buffer: the stream cannot be
    /// resynchronized after it.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let tag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_len {
            self.buf.clear();
            return Some(Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_len,
            }));
        }
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }

        let frame: Vec<u8> = self.buf.drain(..HEADER_LEN + len).collect();
        let result = FrameType::try_from(tag)
            .and_then(|frame_type| Frame::decode_payload(frame_type, &frame[HEADER_LEN..]));
        Some(result)
    }
}
