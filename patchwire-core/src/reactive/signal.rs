//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (memo, effect, render),
//!    the read is recorded and becomes a dependency edge once the computation
//!    finishes.
//!
//! 2. When a signal is written, the new value is compared with the old one
//!    by `PartialEq`. Equal values are a no-op; a different value marks all
//!    dependents dirty.
//!
//! 3. Outside a batch, dirty dependents are delivered right away. Inside
//!    [`Runtime::batch`], delivery waits for the outermost batch to end.
//!
//! # Handles
//!
//! A `Signal<T>` is a typed handle to a node in its runtime's graph. Cloning
//! the handle does not clone the value. Once the owning scope is disposed the
//! handle stops resolving and `try_get`/`try_set` return
//! [`ReactiveError::Disposed`].

use std::fmt;
use std::marker::PhantomData;

use super::runtime::Runtime;
use crate::error::ReactiveError;
use crate::graph::NodeId;

/// A reactive signal holding a value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// ```
pub struct Signal<T> {
    id: NodeId,
    rt: Runtime,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rt: self.rt.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("runtime", &self.rt.id())
            .finish()
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Create a new signal owned by the runtime's current owner.
    pub fn new(rt: &Runtime, value: T) -> Self {
        let id = rt.create_signal_node(value);
        Self::from_id(rt, id)
    }

    pub(crate) fn from_id(rt: &Runtime, id: NodeId) -> Self {
        Self {
            id,
            rt: rt.clone(),
            _marker: PhantomData,
        }
    }

    /// Get the signal's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the
    /// current computation as a subscriber.
    ///
    /// # Panics
    ///
    /// Panics with a [`ReactiveError`] payload if the signal was disposed.
    /// Inside a render the panic is caught and becomes a render error.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| std::panic::panic_any(err))
    }

    pub fn try_get(&self) -> Result<T, ReactiveError> {
        self.rt.read_signal(self.id, true)
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> Result<T, ReactiveError> {
        self.rt.read_signal(self.id, false)
    }

    /// Set a new value. Failures are logged and otherwise ignored.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            tracing::warn!(signal = %self.id, error = %err, "signal write ignored");
        }
    }

    /// Set a new value; returns whether it differed from the old one.
    pub fn try_set(&self, value: T) -> Result<bool, ReactiveError> {
        self.rt.write_signal(self.id, value)
    }

    /// Update the value in place. Subscribers are notified only if the
    /// result differs from the previous value.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        if let Err(err) = self.try_update(f) {
            tracing::warn!(signal = %self.id, error = %err, "signal update ignored");
        }
    }

    pub fn try_update(&self, f: impl FnOnce(&mut T)) -> Result<bool, ReactiveError> {
        let mut value = self.rt.read_signal::<T>(self.id, false)?;
        f(&mut value);
        self.rt.write_signal(self.id, value)
    }

    /// Number of computations that read this signal in their last run.
    pub fn subscriber_count(&self) -> usize {
        self.rt.subscriber_count(self.id)
    }

    pub fn is_disposed(&self) -> bool {
        !self.rt.contains_node(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Effect, Memo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn signal_get_set() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 42);
        assert_eq!(signal.get(), 42);

        signal.set(100);
        assert_eq!(signal.get(), 100);
    }

    #[test]
    fn signal_update() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, vec![1, 2, 3]);
        signal.update(|v| v.push(4));
        assert_eq!(signal.get(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn equal_write_does_not_notify() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, vec![String::from("a")]);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_clone = runs.clone();
        let reader = signal.clone();
        let _effect = Effect::new(&rt, move || {
            reader.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Structurally equal, different allocation
        assert_eq!(signal.try_set(vec![String::from("a")]), Ok(false));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(signal.try_set(vec![String::from("b")]), Ok(true));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn untracked_read_registers_nothing() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 1);
        let reader = signal.clone();
        let memo = Memo::new(&rt, move || reader.get_untracked().unwrap_or_default() * 2);

        assert_eq!(memo.get(), 2);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn disposed_signal_reports_error() {
        let rt = Runtime::new();
        let owner = rt.create_owner(None);
        let signal = rt.with_owner(owner, || Signal::new(&rt, 0_u8));
        rt.dispose_owner(owner);

        assert!(signal.is_disposed());
        assert_eq!(signal.try_get(), Err(ReactiveError::Disposed { node: signal.id() }));
        assert!(signal.try_set(1).is_err());
    }

    #[test]
    fn effect_cannot_write_what_it_read() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0_u32);
        let outcome = Arc::new(parking_lot::Mutex::new(None));

        let reader = signal.clone();
        let outcome_clone = outcome.clone();
        let _effect = Effect::new(&rt, move || {
            let value = reader.get();
            *outcome_clone.lock() = Some(reader.try_set(value + 1));
        });

        assert_eq!(
            *outcome.lock(),
            Some(Err(ReactiveError::WriteDuringRead { node: signal.id() }))
        );
        assert_eq!(signal.get(), 0);
    }
}
