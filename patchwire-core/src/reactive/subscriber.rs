//! Listener types for the reactive system.
//!
//! A Listener is anything outside the graph that wants to hear about
//! invalidation: a session waiting to re-render, or a runtime mirroring a
//! global signal.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a listener.
///
/// The same listener can be reachable through many signals; its ID is what
/// lets one flush deliver to it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver of dirty notifications.
pub trait Listener: Send + Sync {
    /// Stable identity used to deduplicate deliveries.
    fn id(&self) -> SubscriberId;

    /// Called once per flush in which anything this listener watches changed.
    fn mark_dirty(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        id: SubscriberId,
        hits: AtomicUsize,
    }

    impl Listener for Counting {
        fn id(&self) -> SubscriberId {
            self.id
        }

        fn mark_dirty(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn listener_is_object_safe() {
        let listener: Box<dyn Listener> = Box::new(Counting {
            id: SubscriberId::new(),
            hits: AtomicUsize::new(0),
        });
        listener.mark_dirty();
        listener.mark_dirty();
        assert!(listener.id().raw() > 0);
    }
}
