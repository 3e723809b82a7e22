//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. Created outside a render, batch or detached session, the effect runs
//!    immediately to establish its dependencies. Otherwise the first run is
//!    queued until the runtime flushes.
//!
//! 2. When any dependency changes, the effect is queued. A flush runs it
//!    once, however many of its dependencies changed.
//!
//! 3. Before re-running, everything the previous run created is disposed and
//!    the cleanups it registered with [`Runtime::on_cleanup`] are run.
//!
//! # Writes
//!
//! An effect may not write a signal it has read in the same run, since that
//! would re-queue itself forever. Effects that genuinely need to (clamping a
//! value, for example) opt in with [`Effect::new_with_writes`].

use std::fmt;

use super::runtime::Runtime;
use crate::graph::NodeId;

/// A side-effecting computation that runs when dependencies change.
///
/// Dropping the handle does not stop the effect; it lives as long as its
/// owner. Call [`Effect::dispose`] to stop it early.
#[derive(Clone)]
pub struct Effect {
    id: NodeId,
    rt: Runtime,
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("runtime", &self.rt.id())
            .finish()
    }
}

impl Effect {
    pub fn new<F>(rt: &Runtime, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let id = rt.create_effect_node(Box::new(f), false);
        Self { id, rt: rt.clone() }
    }

    /// Like [`Effect::new`], but the body may write signals it reads.
    pub fn new_with_writes<F>(rt: &Runtime, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let id = rt.create_effect_node(Box::new(f), true);
        Self { id, rt: rt.clone() }
    }

    pub(crate) fn from_id(rt: &Runtime, id: NodeId) -> Self {
        Self { id, rt: rt.clone() }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Completed runs, `0` while the first run is still queued.
    pub fn run_count(&self) -> u64 {
        self.rt.effect_runs(self.id).unwrap_or(0)
    }

    /// Stop the effect and run the cleanups of its last run.
    pub fn dispose(&self) {
        self.rt.dispose_node(self.id);
    }

    pub fn is_disposed(&self) -> bool {
        !self.rt.contains_node(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Memo, Signal};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn effect_runs_on_creation_and_change() {
        let rt = Runtime::new();
        let count = Signal::new(&rt, 0);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let reader = count.clone();
        let sink = seen.clone();
        let effect = Effect::new(&rt, move || sink.lock().push(reader.get()));

        count.set(1);
        count.set(2);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(effect.run_count(), 3);
    }

    #[test]
    fn batched_writes_run_effect_once() {
        let rt = Runtime::new();
        let a = Signal::new(&rt, 0);
        let b = Signal::new(&rt, 0);
        let runs = Arc::new(AtomicUsize::new(0));

        let (ra, rb, counter) = (a.clone(), b.clone(), runs.clone());
        let _effect = Effect::new(&rt, move || {
            ra.get();
            rb.get();
            counter.fetch_add(1, Ordering::SeqCst);
        });

        rt.batch(|| {
            for i in 1..=10 {
                a.set(i);
                b.set(i * 2);
            }
            // Nested batches flatten into the outer one
            rt.batch(|| a.set(100));
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn diamond_runs_effect_once() {
        let rt = Runtime::new();
        let source = Signal::new(&rt, 1);
        let left = {
            let s = source.clone();
            Memo::new(&rt, move || s.get() + 1)
        };
        let right = {
            let s = source.clone();
            Memo::new(&rt, move || s.get() * 2)
        };
        let runs = Arc::new(AtomicUsize::new(0));
        let (l, r, counter) = (left.clone(), right.clone(), runs.clone());
        let _effect = Effect::new(&rt, move || {
            l.get();
            r.get();
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.set(2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_dispose() {
        let rt = Runtime::new();
        let count = Signal::new(&rt, 0);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let (reader, sink, rt_inner) = (count.clone(), log.clone(), rt.clone());
        let effect = Effect::new(&rt, move || {
            let value = reader.get();
            sink.lock().push(format!("run {value}"));
            let sink = sink.clone();
            rt_inner.on_cleanup(move || sink.lock().push(format!("cleanup {value}")));
        });

        count.set(1);
        effect.dispose();
        count.set(2);

        assert_eq!(
            *log.lock(),
            vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
        );
        assert!(effect.is_disposed());
    }

    #[test]
    fn effects_wait_while_rendering() {
        let rt = Runtime::new();
        let runs = Arc::new(AtomicUsize::new(0));

        rt.start_render();
        let counter = runs.clone();
        let effect = Effect::new(&rt, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        rt.end_render();
        assert_eq!(effect.run_count(), 0);

        rt.run_pending_effects();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suspended_effects_run_on_resume() {
        let rt = Runtime::new();
        let count = Signal::new(&rt, 0);
        let runs = Arc::new(AtomicUsize::new(0));
        let (reader, counter) = (count.clone(), runs.clone());
        let _effect = Effect::new(&rt, move || {
            reader.get();
            counter.fetch_add(1, Ordering::SeqCst);
        });

        rt.suspend_effects();
        count.set(1);
        count.set(2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        rt.resume_effects();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn opt_in_effect_may_clamp_its_input() {
        let rt = Runtime::new();
        let value = Signal::new(&rt, 50);
        let reader = value.clone();
        let _clamp = Effect::new_with_writes(&rt, move || {
            let v = reader.get();
            if v > 10 {
                reader.set(10);
            }
        });
        assert_eq!(value.get(), 10);

        value.set(99);
        assert_eq!(value.get(), 10);
    }

    #[test]
    fn panicking_effect_is_contained() {
        let rt = Runtime::new();
        let count = Signal::new(&rt, 0);
        let reader = count.clone();
        let effect = Effect::new(&rt, move || {
            if reader.get() == 1 {
                panic!("effect failure");
            }
        });

        count.set(1);
        // Runtime still works and the effect keeps its last good edges
        count.set(2);
        assert_eq!(effect.run_count(), 3);
    }
}
