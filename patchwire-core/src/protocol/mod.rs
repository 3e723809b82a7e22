//! Binary wire protocol.
//!
//! Frames are `[type: u8][len: u32][payload]`, big-endian throughout:
//! - [`handshake`]: client hello and server reply
//! - [`event`]: input events addressed to a hid
//! - [`patch`]: patch records and serialized subtrees
//! - [`frame`]: the envelope, error and ack frames, stream decoding

pub mod codec;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod patch;

pub use codec::{HidWidth, WireReader, WireWriter};
pub use event::{EventFrame, EventKind};
pub use frame::{
    AckFrame, ErrorCode, ErrorFrame, Frame, FrameDecoder, FrameType, DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
};
pub use handshake::{Capabilities, HandshakeReply, HandshakeStatus, Hello, Viewport, PROTOCOL_VERSION};
pub use patch::{Patch, PatchFrame, WireNode, MAX_TREE_DEPTH};
