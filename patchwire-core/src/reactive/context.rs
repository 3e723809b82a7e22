//! Reactive Context
//!
//! The reactive context tracks which computation is currently running, and
//! which owner new primitives attach to.
//!
//! # Implementation
//!
//! We use two thread-local stacks. The context stack holds one entry per
//! running computation (memo, effect, render observer) and collects the nodes
//! it reads. The owner stack holds the owner made current by
//! [`Runtime::with_owner`]. Both entries are tagged with the runtime they
//! belong to, so a session's computation never records reads from another
//! session's graph.
//!
//! Guards pop their entry when dropped, so the stacks stay balanced even when
//! the computation panics.

use std::cell::RefCell;

use smallvec::SmallVec;

use super::owner::OwnerId;
use super::runtime::Runtime;
use crate::error::ReactiveError;
use crate::graph::NodeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
    static OWNER_STACK: RefCell<Vec<(u64, OwnerId)>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
struct ContextEntry {
    /// `None` for an untracked section.
    runtime: Option<Runtime>,
    subscriber: Option<NodeId>,
    /// Nodes read so far, deduplicated, in first-read order.
    reads: SmallVec<[NodeId; 8]>,
    allow_writes: bool,
}

/// Guard that pops the context when dropped.
pub struct ReactiveContext {
    depth: usize,
    finished: bool,
}

impl ReactiveContext {
    /// Enter a new reactive context for `subscriber`.
    ///
    /// While this context is active, every node of `runtime` that is read is
    /// recorded. Call [`ReactiveContext::finish`] to collect the reads.
    pub(crate) fn enter(runtime: &Runtime, subscriber: NodeId, allow_writes: bool) -> Self {
        Self::push(ContextEntry {
            runtime: Some(runtime.clone()),
            subscriber: Some(subscriber),
            reads: SmallVec::new(),
            allow_writes,
        })
    }

    fn push(entry: ContextEntry) -> Self {
        let depth = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(entry);
            stack.len()
        });
        Self {
            depth,
            finished: false,
        }
    }

    /// Pop the context and return the nodes it read.
    pub(crate) fn finish(mut self) -> SmallVec<[NodeId; 8]> {
        self.finished = true;
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "ReactiveContext popped out of order");
            stack.pop().map(|entry| entry.reads).unwrap_or_default()
        })
    }

    /// Check if a tracking computation is running.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .is_some_and(|entry| entry.subscriber.is_some())
        })
    }

    /// Node of the computation currently running, if any.
    pub fn current_subscriber() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.subscriber))
    }

    /// Runtime of the computation currently running, if any.
    pub fn current_runtime() -> Option<Runtime> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.runtime.clone()))
    }

    /// Record a read of `node` in the innermost computation.
    ///
    /// Reads from another runtime and reads inside an untracked section are
    /// ignored.
    pub(crate) fn track(runtime_id: u64, node: NodeId) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let Some(entry) = stack.last_mut() else {
                return;
            };
            let same_runtime = entry
                .runtime
                .as_ref()
                .is_some_and(|runtime| runtime.id() == runtime_id);
            if same_runtime && entry.subscriber != Some(node) && !entry.reads.contains(&node) {
                entry.reads.push(node);
            }
        });
    }

    /// Refuse a write to a node the running computation already read,
    /// unless it opted in.
    pub(crate) fn check_write(runtime_id: u64, node: NodeId) -> Result<(), ReactiveError> {
        CONTEXT_STACK.with(|stack| {
            let stack = stack.borrow();
            match stack.last() {
                Some(entry)
                    if !entry.allow_writes
                        && entry
                            .runtime
                            .as_ref()
                            .is_some_and(|runtime| runtime.id() == runtime_id)
                        && entry.reads.contains(&node) =>
                {
                    Err(ReactiveError::WriteDuringRead { node })
                }
                _ => Ok(()),
            }
        })
    }

    /// Run `f` without recording any reads.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        let guard = Self::push(ContextEntry {
            runtime: None,
            subscriber: None,
            reads: SmallVec::new(),
            allow_writes: true,
        });
        let result = f();
        drop(guard.finish());
        result
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() >= self.depth {
                stack.truncate(self.depth - 1);
            }
        });
    }
}

/// Guard that keeps an owner current until dropped.
pub(crate) struct OwnerGuard {
    depth: usize,
}

impl OwnerGuard {
    pub(crate) fn push(runtime_id: u64, owner: OwnerId) -> Self {
        let depth = OWNER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push((runtime_id, owner));
            stack.len()
        });
        Self { depth }
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        OWNER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() >= self.depth {
                stack.truncate(self.depth - 1);
            }
        });
    }
}

/// The innermost owner made current for `runtime_id` on this thread.
pub(crate) fn current_owner(runtime_id: u64) -> Option<OwnerId> {
    OWNER_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|(id, _)| *id == runtime_id)
            .map(|(_, owner)| *owner)
    })
}
