//! Global Signals
//!
//! A [`GlobalSignal`] is shared by every session in the process. Values and
//! listener lists live in one registry behind one lock, held only to read or
//! store a value. User closures and listeners run outside it.
//!
//! # How Sessions Observe Globals
//!
//! The first tracked read of a global inside a session's runtime creates a
//! local proxy node and subscribes a bridge listener. A write marks the bridge
//! dirty from whatever thread performed it; the bridge queues the global id on
//! the runtime and calls the runtime's waker. The session task then calls
//! [`Runtime::drain_external`], which marks the proxy changed and propagates
//! inside the session like any local write.
//!
//! The registry only holds weak references to bridges; a disposed runtime
//! drops its bridges and they are pruned on the next write.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::context::ReactiveContext;
use super::runtime::{Runtime, RuntimeInner};
use super::subscriber::{Listener, SubscriberId};

/// Identifier of a global signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u64);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

struct GlobalEntry {
    value: Box<dyn Any + Send + Sync>,
    version: u64,
    listeners: IndexMap<SubscriberId, Weak<dyn Listener>>,
}

/// Process-wide table of global values and their listeners.
pub struct GlobalRegistry {
    entries: Mutex<HashMap<GlobalId, GlobalEntry>>,
    next_id: AtomicU64,
}

impl GlobalRegistry {
    /// The registry shared by the whole process.
    pub fn shared() -> &'static GlobalRegistry {
        static REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| GlobalRegistry {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn register(&self, value: Box<dyn Any + Send + Sync>) -> GlobalId {
        let id = GlobalId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(
            id,
            GlobalEntry {
                value,
                version: 0,
                listeners: IndexMap::new(),
            },
        );
        id
    }

    pub(crate) fn subscribe(&self, global: GlobalId, listener: &Arc<dyn Listener>) {
        if let Some(entry) = self.entries.lock().get_mut(&global) {
            entry.listeners.insert(listener.id(), Arc::downgrade(listener));
        }
    }

    /// Live listeners of `global`.
    pub fn listener_count(&self, global: GlobalId) -> usize {
        self.entries.lock().get(&global).map_or(0, |entry| {
            entry
                .listeners
                .values()
                .filter(|listener| listener.strong_count() > 0)
                .count()
        })
    }

    pub fn version(&self, global: GlobalId) -> Option<u64> {
        self.entries.lock().get(&global).map(|entry| entry.version)
    }
}

/// Handle to a value shared by all sessions.
pub struct GlobalSignal<T> {
    id: GlobalId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for GlobalSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GlobalSignal<T> {}

impl<T> fmt::Debug for GlobalSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobalSignal").field(&self.id).finish()
    }
}

impl<T> GlobalSignal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            id: GlobalRegistry::shared().register(Box::new(value)),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> GlobalId {
        self.id
    }

    /// Read the value, subscribing the running computation's session.
    pub fn get(&self) -> T {
        if let Some(runtime) = ReactiveContext::current_runtime() {
            runtime.track_global(self.id);
        }
        self.get_untracked()
    }

    pub fn get_untracked(&self) -> T {
        let entries = GlobalRegistry::shared().entries.lock();
        entries
            .get(&self.id)
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .cloned()
            .unwrap_or_else(|| unreachable!("global {} registered with another type", self.id))
    }

    /// Replace the value; returns whether it changed.
    pub fn set(&self, value: T) -> bool {
        self.update(|current| *current = value)
    }

    /// Mutate a copy of the value and store it; listeners hear about it only
    /// if the result differs from the value current at store time.
    ///
    /// `f` and the listeners run without the registry lock, so either may
    /// read or write other globals. Concurrent updates of one global race and
    /// the last store wins.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let mut next = self.get_untracked();
        f(&mut next);

        let (listeners, version, pruned) = {
            let mut entries = GlobalRegistry::shared().entries.lock();
            let Some(entry) = entries.get_mut(&self.id) else {
                return false;
            };
            let Some(current) = entry.value.downcast_mut::<T>() else {
                return false;
            };
            if *current == next {
                return false;
            }
            *current = next;
            entry.version += 1;

            let before = entry.listeners.len();
            entry.listeners.retain(|_, listener| listener.strong_count() > 0);
            let listeners: Vec<Arc<dyn Listener>> = entry.listeners.values().filter_map(Weak::upgrade).collect();
            (listeners, entry.version, before - entry.listeners.len())
        };

        for listener in &listeners {
            listener.mark_dirty();
        }
        tracing::debug!(
            global = %self.id,
            version,
            listeners = listeners.len(),
            pruned,
            "global signal changed"
        );
        true
    }
}

/// Listener that forwards a global change into one runtime.
pub(crate) struct GlobalBridge {
    id: SubscriberId,
    runtime: Weak<RuntimeInner>,
    global: GlobalId,
}

impl GlobalBridge {
    pub(crate) fn new(runtime: Weak<RuntimeInner>, global: GlobalId) -> Self {
        Self {
            id: SubscriberId::new(),
            runtime,
            global,
        }
    }
}

impl Listener for GlobalBridge {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn mark_dirty(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            Runtime::push_external(&runtime, self.global);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Effect;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_reports_change() {
        let global = GlobalSignal::new(1_u32);
        assert!(!global.set(1));
        assert!(global.set(2));
        assert_eq!(global.get_untracked(), 2);
        assert_eq!(GlobalRegistry::shared().version(global.id()), Some(1));
    }

    #[test]
    fn write_wakes_subscribed_runtime() {
        let global = GlobalSignal::new(String::from("a"));
        let rt = Runtime::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let wakes = wakes.clone();
            rt.set_waker(move || {
                wakes.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let seen = seen.clone();
            Effect::new(&rt, move || seen.lock().push(global.get()));
        }
        assert_eq!(GlobalRegistry::shared().listener_count(global.id()), 1);

        // Written from another thread
        std::thread::spawn(move || {
            global.set(String::from("b"));
        })
        .join()
        .unwrap();

        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        assert!(rt.has_external());
        assert_eq!(rt.drain_external(), 1);
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn disposed_runtime_is_pruned() {
        let global = GlobalSignal::new(0_i64);
        let rt = Runtime::new();
        Effect::new(&rt, move || {
            global.get();
        });
        assert_eq!(GlobalRegistry::shared().listener_count(global.id()), 1);

        rt.dispose();
        assert_eq!(GlobalRegistry::shared().listener_count(global.id()), 0);
        assert!(global.set(5));
    }

    #[test]
    fn update_may_read_other_globals() {
        let a = GlobalSignal::new(1_u32);
        let b = GlobalSignal::new(10_u32);
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let changed = a.update(|v| *v += b.get_untracked());
            let _ = done.send(changed);
        });
        let changed = finished
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("update finished while reading another global");
        assert!(changed);
        assert_eq!(a.get_untracked(), 11);
    }

    #[test]
    fn update_may_write_other_globals() {
        let a = GlobalSignal::new(0_u32);
        let b = GlobalSignal::new(0_u32);
        assert!(a.update(|v| {
            b.set(5);
            *v = b.get_untracked() + 1;
        }));
        assert_eq!((a.get_untracked(), b.get_untracked()), (6, 5));
    }
}
