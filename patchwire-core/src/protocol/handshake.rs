//! Handshake payloads.
//!
//! A handshake frame's payload starts with a kind byte: `0` for the client
//! hello, `1` for the server reply.

use bitflags::bitflags;

use super::codec::{WireReader, WireWriter};
use crate::error::ProtocolError;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

pub(crate) const KIND_HELLO: u8 = 0;
pub(crate) const KIND_REPLY: u8 = 1;

bitflags! {
    /// Optional client features. Without them the session falls back to
    /// plainer output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Client understands `SetValue` patches; otherwise it gets
        /// `SetAttr("value")`.
        const SET_VALUE = 1 << 0;
        /// Client can render raw markup nodes; otherwise they arrive as text.
        const RAW_HTML = 1 << 1;
        /// Client may resume a session by token. Resumes from clients
        /// without it are refused.
        const RESUME = 1 << 2;
        /// Client wants Ack frames for events that changed nothing and for
        /// retransmits of applied events.
        const ACKS = 1 << 3;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub width: u16,
    pub height: u16,
}

/// Client hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub capabilities: Capabilities,
    pub viewport: Viewport,
    pub tz_offset_minutes: i16,
    pub resume_token: Option<String>,
}

impl Default for Hello {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            capabilities: Capabilities::default(),
            viewport: Viewport::default(),
            tz_offset_minutes: 0,
            resume_token: None,
        }
    }
}

impl Hello {
    #[inline]
    #[must_use]
    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_viewport(mut self, width: u16, height: u16) -> Self {
        self.viewport = Viewport { width, height };
        self
    }

    pub(crate) fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.u8(KIND_HELLO);
        w.u16(self.version);
        w.u32(self.capabilities.bits());
        w.u16(self.viewport.width);
        w.u16(self.viewport.height);
        w.i16(self.tz_offset_minutes);
        w.opt_str8("resume_token", self.resume_token.as_deref())
    }

    /// Decode after the kind byte.
    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: r.u16()?,
            capabilities: Capabilities::from_bits_truncate(r.u32()?),
            viewport: Viewport {
                width: r.u16()?,
                height: r.u16()?,
            },
            tz_offset_minutes: r.i16()?,
            resume_token: r.opt_str8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStatus {
    Ok = 0,
    Rejected = 1,
    ResumeFailed = 2,
    VersionMismatch = 3,
}

impl TryFrom<u8> for HandshakeStatus {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Rejected),
            2 => Ok(Self::ResumeFailed),
            3 => Ok(Self::VersionMismatch),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Server reply to a hello.
///
/// On `Ok` it is followed by a Patches frame carrying the full tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub status: HandshakeStatus,
    pub version: u16,
    pub token: Option<String>,
    pub resumed: bool,
    /// Last event sequence the server applied, so the client can drop
    /// buffered events it no longer needs to resend.
    pub last_event_seq: u64,
    pub reason: Option<String>,
}

impl HandshakeReply {
    pub fn accepted(token: impl Into<String>, resumed: bool, last_event_seq: u64) -> Self {
        Self {
            status: HandshakeStatus::Ok,
            version: PROTOCOL_VERSION,
            token: Some(token.into()),
            resumed,
            last_event_seq,
            reason: None,
        }
    }

    pub fn refused(status: HandshakeStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            version: PROTOCOL_VERSION,
            token: None,
            resumed: false,
            last_event_seq: 0,
            reason: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HandshakeStatus::Ok
    }

    pub(crate) fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.u8(KIND_REPLY);
        w.u8(self.status as u8);
        w.u16(self.version);
        w.opt_str8("token", self.token.as_deref())?;
        w.bool(self.resumed);
        w.u64(self.last_event_seq);
        match &self.reason {
            Some(reason) => {
                w.u8(1);
                w.str16("reason", reason)
            }
            None => {
                w.u8(0);
                Ok(())
            }
        }
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: HandshakeStatus::try_from(r.u8()?)?,
            version: r.u16()?,
            token: r.opt_str8()?,
            resumed: r.bool()?,
            last_event_seq: r.u64()?,
            reason: if r.bool()? { Some(r.str16()?) } else { None },
        })
    }
}
