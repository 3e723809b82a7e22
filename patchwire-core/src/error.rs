//! Error types for Patchwire
//!
//! Each layer owns its error enum:
//! - [`ReactiveError`]: graph misuse (disposed handles, hook order, illegal writes)
//! - [`RenderError`]: failures caught at the render boundary
//! - [`ProtocolError`]: malformed or unexpected wire input
//! - [`BudgetError`]: storm budget rejections
//! - [`StoreError`]: persistence backend failures
//! - [`ConfigError`]: configuration loading and validation
//! - [`SessionError`]: everything a session can surface to its transport
//! - [`TransportError`]: WebSocket and socket failures
//! - [`ClientError`]: a patch the client tree model cannot apply

use std::any::Any;
use std::time::Duration;

use crate::graph::NodeId;
use crate::protocol::{ErrorCode, FrameType};
use crate::reactive::{HookKind, OwnerId};
use crate::render::Hid;
use crate::session::SessionState;

/// Misuse of the reactive graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReactiveError {
    /// The handle points at a node that was disposed with its owner.
    #[error("reactive node {node} was disposed")]
    Disposed { node: NodeId },

    /// The owner was disposed before the operation ran.
    #[error("owner {owner} was disposed")]
    OwnerDisposed { owner: OwnerId },

    /// A node held a value of a different type than the handle expects.
    #[error("reactive node {node} holds a value of another type")]
    TypeMismatch { node: NodeId },

    /// A computation wrote a signal it had already read during the same run.
    #[error("signal {node} written during a tracked read of itself")]
    WriteDuringRead { node: NodeId },

    /// A hook slot was reused by a different kind of primitive.
    #[error("hook slot {slot} changed from {expected:?} to {found:?} between renders")]
    HookKindMismatch {
        slot: usize,
        expected: HookKind,
        found: HookKind,
    },

    /// A render called fewer hooks than the previous render did.
    #[error("render called {found} hooks, previous render called {expected}")]
    HookCountMismatch { expected: usize, found: usize },
}

/// A render pass failed. The previous tree stays in place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A render closure or a memo it read panicked.
    #[error("render panicked: {message}")]
    Panicked { message: String },

    /// The render violated a reactive precondition.
    #[error("render failed: {0}")]
    Reactive(#[from] ReactiveError),

    /// The rendered tree cannot be expressed on the wire.
    #[error("render output cannot be encoded: {0}")]
    Unencodable(ProtocolError),
}

impl RenderError {
    /// Convert a caught panic payload into a render error.
    ///
    /// Payloads raised with `panic_any(ReactiveError)` keep their type.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<ReactiveError>() {
            Ok(err) => Self::Reactive(*err),
            Err(payload) => Self::Panicked {
                message: panic_message(payload.as_ref()),
            },
        }
    }
}

/// Malformed or unexpected wire input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("unknown handshake kind {0}")]
    UnknownHandshakeKind(u8),

    #[error("unknown patch opcode {0}")]
    UnknownOpcode(u8),

    #[error("unknown event kind {0}")]
    UnknownEventKind(u8),

    #[error("unknown node kind {0}")]
    UnknownNodeKind(u8),

    #[error("unknown handshake status {0}")]
    UnknownStatus(u8),

    #[error("unknown error code {0}")]
    UnknownErrorCode(u16),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid handle identifier {0:?}")]
    InvalidHid(String),

    #[error("field {field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("node tree nested deeper than {0}")]
    TooDeep(usize),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(FrameType),

    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
}

/// Storm budget rejection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    #[error("storm budget exceeded: {limit} triggers per {window:?}")]
    Exceeded { limit: u32, window: Duration },
}

/// Persistence backend failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode session state: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode session state: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Configuration loading or validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Anything a session can surface to its transport.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Reactive(#[from] ReactiveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("resume failed: {0}")]
    ResumeFailed(String),

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch { client: u16, server: u16 },

    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("no {event} handler on {hid}")]
    UnknownTarget { hid: Hid, event: String },

    #[error("event handler panicked: {0}")]
    HandlerPanicked(String),
}

impl SessionError {
    /// Wire code carried by the Error frame for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(ProtocolError::UnknownFrameType(_)) => ErrorCode::UnknownFrameType,
            Self::Protocol(ProtocolError::SequenceGap { .. }) => ErrorCode::SequenceGap,
            Self::Protocol(ProtocolError::UnexpectedFrame(_)) => ErrorCode::UnexpectedFrame,
            Self::Protocol(_) => ErrorCode::Malformed,
            Self::Render(_) | Self::Reactive(_) => ErrorCode::RenderFailed,
            Self::Budget(_) => ErrorCode::BudgetExceeded,
            Self::Store(_) => ErrorCode::Internal,
            Self::ResumeFailed(_) => ErrorCode::ResumeFailed,
            Self::ResourceLimit(_) => ErrorCode::ResourceLimit,
            Self::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::UnknownTarget { .. } => ErrorCode::UnknownTarget,
            Self::HandlerPanicked(_) => ErrorCode::HandlerFailed,
        }
    }
}

/// WebSocket transport failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection closed before handshake")]
    HandshakeRequired,
}

/// A patch that does not fit the client tree it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("no node {0} in client tree")]
    UnknownHid(Hid),

    #[error("node {0} is not an element")]
    NotAnElement(Hid),

    #[error("node {0} is not a text node")]
    NotText(Hid),

    #[error("anchor {anchor} is not a child of {parent}")]
    UnknownAnchor { parent: Hid, anchor: Hid },

    #[error("node {0} already exists in client tree")]
    DuplicateHid(Hid),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<ReactiveError>() {
        err.to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_error_keeps_typed_reactive_payload() {
        let payload: Box<dyn Any + Send> = Box::new(ReactiveError::HookCountMismatch {
            expected: 3,
            found: 2,
        });
        assert_eq!(
            RenderError::from_panic(payload),
            RenderError::Reactive(ReactiveError::HookCountMismatch {
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn render_error_reads_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            RenderError::from_panic(payload),
            RenderError::Panicked {
                message: "boom".to_string()
            }
        );

        let payload: Box<dyn Any + Send> = Box::new(String::from("formatted boom"));
        assert!(matches!(
            RenderError::from_panic(payload),
            RenderError::Panicked { message } if message == "formatted boom"
        ));
    }

    #[test]
    fn session_errors_map_to_wire_codes() {
        let gap = SessionError::from(ProtocolError::SequenceGap { expected: 2, got: 5 });
        assert_eq!(gap.code(), ErrorCode::SequenceGap);

        let budget = SessionError::from(BudgetError::Exceeded {
            limit: 10,
            window: Duration::from_secs(1),
        });
        assert_eq!(budget.code(), ErrorCode::BudgetExceeded);

        let unknown = SessionError::from(ProtocolError::UnknownFrameType(0x7f));
        assert_eq!(unknown.code(), ErrorCode::UnknownFrameType);
    }
}
