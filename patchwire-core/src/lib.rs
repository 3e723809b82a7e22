//! Patchwire Core
//!
//! Server-side reactive rendering with a binary patch stream. Application
//! state lives on the server; the client holds a mirror of the rendered tree
//! and applies the minimal patches the server sends after every change.
//!
//! - Reactive primitives (signals, memos, effects) scoped by an owner tree
//! - Keyed tree diffing with stable handle ids (HIDs)
//! - A compact binary wire protocol
//! - Sessions that survive a dropped connection, with storm budgets
//! - A WebSocket transport
//!
//! # Architecture
//!
//! - `reactive`: signals, memos, effects, owners and component hooks
//! - `graph`: the dependency graph and effect scheduler behind `reactive`
//! - `render`: virtual nodes, the tree builder, the differ and a client model
//! - `protocol`: frames and their binary encoding
//! - `session`: per-client state, the session manager and persistence
//! - `budget`: the sliding-window storm budget
//! - `config`: session and server settings
//! - `server`: the WebSocket transport
//!
//! # Example
//!
//! ```rust,ignore
//! use patchwire_core::render::{component, el, text};
//! use patchwire_core::{server, ServerConfig};
//!
//! let app = |_: &patchwire_core::protocol::Hello| {
//!     component("counter", |cx| {
//!         let count = cx.use_signal(|| 0);
//!         el("div")
//!             .child(el("button").text("+").on("click", move |_| count.update(|n| *n += 1)))
//!             .child(text(count.get().to_string()))
//!             .into()
//!     })
//! };
//! server::run(ServerConfig::default(), app).await?;
//! ```

pub mod budget;
pub mod config;
pub mod error;
pub mod graph;
pub mod protocol;
pub mod reactive;
pub mod render;
pub mod server;
pub mod session;

pub use budget::{BudgetConfig, StormBudget};
pub use config::{AddrLimitPolicy, ServerConfig, SessionConfig};
pub use error::{
    BudgetError, ClientError, ConfigError, ProtocolError, ReactiveError, RenderError, SessionError, StoreError,
    TransportError,
};
pub use reactive::{Effect, GlobalSignal, Memo, Runtime, Scope, Signal};
pub use session::{Session, SessionManager, SessionState};
