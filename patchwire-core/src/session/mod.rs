//! Sessions
//!
//! A session is one client's live view: a reactive runtime, the mounted
//! component tree, the hid allocator and the sequence counters of the patch
//! stream. Sessions survive a dropped transport for a resume window.
//!
//! # How a Session Moves
//!
//! ```text
//! Connecting --start--> Active --detach--> Detached --resume--> Active
//!                          |                   |
//!                          +------expire-------+----window ends----> Expired
//! ```
//!
//! [`SessionManager`] owns the sessions of a server and applies the resume
//! window and resource limits. [`SessionStore`] keeps what a session needs
//! to be rebuilt after it has left memory.

mod core;
mod listener;
mod manager;
mod store;

pub use self::core::{Session, SessionHandle, SessionState, MAX_SETTLE_PASSES};
pub use listener::RenderListener;
pub use manager::{HandshakeOutcome, RootFactory, SessionManager, TokenValidator, UuidTokens};
pub use store::{MemoryStore, PersistedSession, SessionStore};
