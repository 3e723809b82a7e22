//! Memo Implementation
//!
//! A Memo is a derived reactive value that caches its result. It only
//! recomputes when its dependencies change.
//!
//! # How Memos Work
//!
//! 1. On first read, the memo runs its computation function, tracking
//!    which signals are accessed.
//!
//! 2. The result is cached and the memo records the version of every
//!    dependency it read.
//!
//! 3. When a dependency changes, the memo is marked dirty (directly) or
//!    maybe-dirty (through another memo). Nothing recomputes yet.
//!
//! 4. On next read, a maybe-dirty memo first brings its memo inputs up to
//!    date and only recomputes if one of their versions moved.
//!
//! 5. A recomputation that yields a value equal to the cached one keeps the
//!    memo's version, so its own dependents stay clean.
//!
//! # Example
//!
//! ```rust,ignore
//! let first = Signal::new(&rt, "John".to_string());
//! let last = Signal::new(&rt, "Doe".to_string());
//!
//! let full = {
//!     let (first, last) = (first.clone(), last.clone());
//!     Memo::new(&rt, move || format!("{} {}", first.get(), last.get()))
//! };
//!
//! assert_eq!(full.get(), "John Doe");
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::runtime::{MemoState, Runtime};
use crate::error::ReactiveError;
use crate::graph::{any_eq, AnyValue, NodeId};

/// A cached, derived reactive value.
pub struct Memo<T> {
    id: NodeId,
    rt: Runtime,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rt: self.rt.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.id)
            .field("runtime", &self.rt.id())
            .finish()
    }
}

impl<T> Memo<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Create a memo. Nothing is computed until the first read.
    pub fn new<F>(rt: &Runtime, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let compute = Arc::new(move || Box::new(compute()) as AnyValue);
        let id = rt.create_memo_node(compute, any_eq::<T>);
        Self::from_id(rt, id)
    }

    pub(crate) fn from_id(rt: &Runtime, id: NodeId) -> Self {
        Self {
            id,
            rt: rt.clone(),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the memoized value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics if the computation panics, or with a [`ReactiveError`] payload
    /// if the memo was disposed.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| std::panic::panic_any(err))
    }

    pub fn try_get(&self) -> Result<T, ReactiveError> {
        self.rt.read_memo(self.id, true)
    }

    pub fn get_untracked(&self) -> Result<T, ReactiveError> {
        self.rt.read_memo(self.id, false)
    }

    /// Current state, `None` once disposed.
    pub fn state(&self) -> Option<MemoState> {
        self.rt.memo_state(self.id)
    }

    pub fn has_value(&self) -> bool {
        !matches!(self.state(), None | Some(MemoState::Uncomputed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted<T, F>(rt: &Runtime, counter: &Arc<AtomicUsize>, f: F) -> Memo<T>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let counter = counter.clone();
        Memo::new(rt, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            f()
        })
    }

    #[test]
    fn memo_is_lazy_and_cached() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counted(&rt, &calls, || 42);

        assert_eq!(memo.state(), Some(MemoState::Uncomputed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(memo.get(), 42);
        assert_eq!(memo.get(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.state(), Some(MemoState::Clean));
    }

    #[test]
    fn memo_recomputes_after_change() {
        let rt = Runtime::new();
        let count = Signal::new(&rt, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let reader = count.clone();
        let doubled = counted(&rt, &calls, move || reader.get() * 2);

        assert_eq!(doubled.get(), 4);
        count.set(5);
        assert_eq!(doubled.state(), Some(MemoState::Dirty));
        assert_eq!(doubled.get(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unchanged_intermediate_stops_propagation() {
        let rt = Runtime::new();
        let count = Signal::new(&rt, 1);
        let parity_calls = Arc::new(AtomicUsize::new(0));
        let label_calls = Arc::new(AtomicUsize::new(0));

        let reader = count.clone();
        let parity = counted(&rt, &parity_calls, move || reader.get() % 2);
        let parity_reader = parity.clone();
        let label = counted(&rt, &label_calls, move || {
            if parity_reader.get() == 0 { "even" } else { "odd" }
        });

        assert_eq!(label.get(), "odd");
        count.set(3);
        assert_eq!(label.state(), Some(MemoState::MaybeDirty));

        // Parity recomputes to the same value; label is validated, not rerun
        assert_eq!(label.get(), "odd");
        assert_eq!(parity_calls.load(Ordering::SeqCst), 2);
        assert_eq!(label_calls.load(Ordering::SeqCst), 1);

        count.set(4);
        assert_eq!(label.get(), "even");
        assert_eq!(label_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_compute_recovers() {
        let rt = Runtime::new();
        let fail = Signal::new(&rt, true);
        let reader = fail.clone();
        let memo = Memo::new(&rt, move || {
            if reader.get() {
                panic!("not ready");
            }
            7
        });

        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| memo.get()));
        assert!(first.is_err());
        assert!(!memo.has_value());

        // The failed run registered nothing, so the memo stays dirty and
        // retries on the next read.
        fail.set(false);
        assert_eq!(memo.get(), 7);
    }

    #[test]
    fn disposed_memo_reports_error() {
        let rt = Runtime::new();
        let owner = rt.create_owner(None);
        let memo = rt.with_owner(owner, || Memo::new(&rt, || 1));
        rt.dispose_owner(owner);
        assert_eq!(memo.try_get(), Err(ReactiveError::Disposed { node: memo.id() }));
        assert_eq!(memo.state(), None);
    }
}
