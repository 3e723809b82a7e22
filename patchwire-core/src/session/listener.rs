//! Render invalidation listener.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::reactive::{Listener, SubscriberId};

/// Collects "something a component read has changed" for one session.
///
/// Every component observer of the session reports here, so a flush that
/// touches many components still delivers once.
#[derive(Debug)]
pub struct RenderListener {
    id: SubscriberId,
    dirty: AtomicBool,
    deliveries: AtomicU64,
}

impl Default for RenderListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderListener {
    pub fn new() -> Self {
        Self {
            id: SubscriberId::new(),
            dirty: AtomicBool::new(false),
            deliveries: AtomicU64::new(0),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Force the next cycle to render.
    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Total dirty notifications received.
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }
}

impl Listener for RenderListener {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn mark_dirty(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }
}
