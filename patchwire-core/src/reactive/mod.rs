//! Reactive Primitives
//!
//! This module implements the reactive system: signals, memos, effects, the
//! owner tree that scopes their lifetime, and the hooks components use to
//! keep state across renders.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (a memo, effect or render), the signal
//! automatically becomes a dependency of that context. When the signal's
//! value changes, all dependents are notified.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result. It re-evaluates only
//! when one of its dependencies changes, and only when read.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! ## Owners
//!
//! Every primitive belongs to the owner that was current when it was
//! created. Disposing an owner disposes its children first, then runs its
//! cleanups, then drops its primitives.
//!
//! # Implementation Notes
//!
//! Each session has its own [`Runtime`]: an arena graph behind one lock plus
//! a thread-local tracking context. Sessions share nothing but
//! [`GlobalSignal`]s, which live in a process-wide registry.

mod context;
mod effect;
mod global;
mod memo;
mod owner;
mod runtime;
mod scope;
mod signal;
mod subscriber;

pub use context::ReactiveContext;
pub use effect::Effect;
pub use global::{GlobalId, GlobalRegistry, GlobalSignal};
pub use memo::Memo;
pub use owner::OwnerId;
pub use runtime::{MemoState, Runtime};
pub use scope::{HookKind, Scope};
pub use signal::Signal;
pub use subscriber::{Listener, SubscriberId};
