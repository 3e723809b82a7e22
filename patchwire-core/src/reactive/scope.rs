//! Component Scope and Hooks
//!
//! A [`Scope`] is what a component's render closure receives. Primitives
//! created through it are stored in numbered slots of the component's owner,
//! so the same instance gets the same signal back on every re-render.
//!
//! # Hook Order
//!
//! Slots are matched by call order. A render must call the same hooks in the
//! same order every time: calling `use_signal` where the previous render
//! called `use_memo` fails with [`ReactiveError::HookKindMismatch`]. Calling
//! a different number of hooks fails with
//! [`ReactiveError::HookCountMismatch`], checked in debug builds only.
//!
//! Both failures are raised as panics carrying the typed error; the render
//! boundary turns them back into a [`RenderError`](crate::error::RenderError).

use std::any::Any;
use std::cell::Cell;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::effect::Effect;
use super::memo::Memo;
use super::owner::{HookSlot, OwnerId};
use super::runtime::Runtime;
use super::signal::Signal;
use crate::error::ReactiveError;
use crate::graph::NodeId;

/// Kind of primitive stored in a hook slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Signal,
    Memo,
    Effect,
    Persisted,
    Cleanup,
}

/// Render-time handle to a component instance.
pub struct Scope {
    rt: Runtime,
    owner: OwnerId,
    cursor: Cell<usize>,
    initial_len: usize,
}

impl Scope {
    pub(crate) fn new(rt: &Runtime, owner: OwnerId) -> Self {
        Self {
            rt: rt.clone(),
            owner,
            cursor: Cell::new(0),
            initial_len: rt.hook_count(owner),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// True until the instance has completed a render that called hooks.
    pub fn is_first_render(&self) -> bool {
        self.initial_len == 0
    }

    /// Take the next slot. Returns the stored node, or `None` if the slot is
    /// new and must be filled with [`Scope::fill`].
    fn next(&self, kind: HookKind) -> Option<Option<NodeId>> {
        let slot = self.cursor.get();
        self.cursor.set(slot + 1);

        let existing = self
            .rt
            .hook_at(self.owner, slot)
            .unwrap_or_else(|err| std::panic::panic_any(err));
        match existing {
            Some(stored) if stored.kind == kind => Some(stored.node),
            Some(stored) => std::panic::panic_any(ReactiveError::HookKindMismatch {
                slot,
                expected: stored.kind,
                found: kind,
            }),
            None => None,
        }
    }

    fn fill(&self, kind: HookKind, node: Option<NodeId>) {
        self.rt.push_hook(self.owner, HookSlot { kind, node });
    }

    fn create<R>(&self, f: impl FnOnce() -> R) -> R {
        // Hook primitives belong to the instance, not to the render pass.
        self.rt.untrack(|| self.rt.with_owner(self.owner, f))
    }

    /// A signal that keeps its value across re-renders.
    pub fn use_signal<T>(&self, init: impl FnOnce() -> T) -> Signal<T>
    where
        T: Clone + PartialEq + Send + 'static,
    {
        match self.next(HookKind::Signal) {
            Some(Some(node)) => Signal::from_id(&self.rt, node),
            _ => {
                let signal = self.create(|| Signal::new(&self.rt, init()));
                self.fill(HookKind::Signal, Some(signal.id()));
                signal
            }
        }
    }

    /// A memo created on first render and reused afterwards.
    pub fn use_memo<T, F>(&self, compute: F) -> Memo<T>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        match self.next(HookKind::Memo) {
            Some(Some(node)) => Memo::from_id(&self.rt, node),
            _ => {
                let memo = self.create(|| Memo::new(&self.rt, compute));
                self.fill(HookKind::Memo, Some(memo.id()));
                memo
            }
        }
    }

    /// An effect created on first render. It runs after the render pass.
    pub fn use_effect<F>(&self, f: F) -> Effect
    where
        F: FnMut() + Send + 'static,
    {
        match self.next(HookKind::Effect) {
            Some(Some(node)) => Effect::from_id(&self.rt, node),
            _ => {
                let effect = self.create(|| Effect::new(&self.rt, f));
                self.fill(HookKind::Effect, Some(effect.id()));
                effect
            }
        }
    }

    /// A signal whose value survives session reconstruction.
    ///
    /// On first render the value is restored from the session store under
    /// `key` if present, otherwise `init` is used. The value is saved with
    /// the session's other persisted signals on detach.
    pub fn use_persisted<T>(&self, key: &str, init: impl FnOnce() -> T) -> Signal<T>
    where
        T: Clone + PartialEq + Send + Serialize + DeserializeOwned + 'static,
    {
        match self.next(HookKind::Persisted) {
            Some(Some(node)) => Signal::from_id(&self.rt, node),
            _ => {
                let restored = self.rt.take_restored(key).and_then(|bytes| {
                    match rmp_serde::from_slice::<T>(&bytes) {
                        Ok(value) => Some(value),
                        Err(err) => {
                            tracing::warn!(key, error = %err, "discarding undecodable persisted value");
                            None
                        }
                    }
                });
                let value = restored.unwrap_or_else(init);
                let signal = self.create(|| Signal::new(&self.rt, value));
                self.rt
                    .register_persisted(key.to_string(), signal.id(), encode_persisted::<T>);
                self.fill(HookKind::Persisted, Some(signal.id()));
                signal
            }
        }
    }

    /// Run `f` when this component instance is unmounted.
    ///
    /// Registered once, on the first render.
    pub fn on_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        if self.next(HookKind::Cleanup).is_none() {
            self.rt.with_owner(self.owner, || self.rt.on_cleanup(f));
            self.fill(HookKind::Cleanup, None);
        }
    }

    /// Validate the number of hooks called during this render.
    pub(crate) fn finish(&self) {
        let found = self.cursor.get();
        if cfg!(debug_assertions) && self.initial_len > 0 && found != self.initial_len {
            std::panic::panic_any(ReactiveError::HookCountMismatch {
                expected: self.initial_len,
                found,
            });
        }
    }
}

fn encode_persisted<T: Serialize + 'static>(value: &(dyn Any + Send)) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    match value.downcast_ref::<T>() {
        Some(value) => rmp_serde::to_vec_named(value),
        None => Err(rmp_serde::encode::Error::Syntax(
            "persisted signal changed type".to_string(),
        )),
    }
}
