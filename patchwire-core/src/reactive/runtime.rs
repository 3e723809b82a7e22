//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, memos,
//! effects and render observers. Each session owns exactly one runtime; the
//! only thing runtimes share is the process-wide global signal registry.
//!
//! # How It Works
//!
//! 1. Every primitive is a node in the runtime's [`Graph`] and is attached to
//!    the owner that was current when it was created.
//!
//! 2. When a memo, effect or observer runs, a [`ReactiveContext`] collects
//!    the nodes it reads. On success the reads become its sources; a run that
//!    panics keeps the sources of its last good run.
//!
//! 3. When a signal's value changes, the runtime:
//!    a. Bumps its version and marks dependents dirty (see [`Graph`])
//!    b. Outside a batch, flushes: delivers each dirty listener once and runs
//!       the effects whose inputs really moved
//!    c. Memos are lazy - they recompute on next access
//!
//! # Locking
//!
//! All tables sit behind one `parking_lot::Mutex`. It is never held while
//! user code runs (compute functions, effect bodies, cleanups, listeners),
//! so user code is free to read and write other signals.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use super::context::{self, OwnerGuard, ReactiveContext};
use super::global::{GlobalBridge, GlobalId, GlobalRegistry};
use super::owner::{Cleanup, HookSlot, OwnerId, OwnerTable};
use super::subscriber::{Listener, SubscriberId};
use crate::budget::{BudgetConfig, StormBudget};
use crate::error::{panic_message, BudgetError, ReactiveError, StoreError};
use crate::graph::{ComputeFn, DirtyState, EffectFn, EqFn, Graph, Node, NodeId, NodeKind, Payload};

/// Upper bound on flush rounds before pending effects are dropped.
const MAX_FLUSH_ROUNDS: usize = 100;

pub(crate) type Waker = Arc<dyn Fn() + Send + Sync>;
pub(crate) type EncodeFn = fn(&(dyn Any + Send)) -> Result<Vec<u8>, rmp_serde::encode::Error>;

/// State of a memo as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoState {
    /// Never computed.
    Uncomputed,
    /// Cached value is current.
    Clean,
    /// An input might have changed.
    MaybeDirty,
    /// An input changed.
    Dirty,
}

struct RuntimeState {
    graph: Graph,
    owners: OwnerTable,
    root: OwnerId,
    batch_depth: usize,
    render_depth: usize,
    effects_suspended: bool,
    flushing: bool,
    /// Local mirror node and bridge listener per global signal read here.
    proxies: HashMap<GlobalId, (NodeId, Arc<GlobalBridge>)>,
    persisted: IndexMap<String, (NodeId, EncodeFn)>,
    /// Values loaded from a store, claimed by `use_persisted` on mount.
    restored: HashMap<String, Vec<u8>>,
}

pub(crate) struct RuntimeInner {
    id: u64,
    state: Mutex<RuntimeState>,
    /// Globals changed by other threads, waiting for `drain_external`.
    inbox: Mutex<IndexSet<GlobalId>>,
    waker: Mutex<Option<Waker>>,
    trigger_budget: Mutex<Option<StormBudget>>,
}

/// Handle to one reactive graph. Cloning shares the graph.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("id", &self.inner.id).finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let mut owners = OwnerTable::default();
        let root = owners.create(None);
        Self {
            inner: Arc::new(RuntimeInner {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(RuntimeState {
                    graph: Graph::new(),
                    owners,
                    root,
                    batch_depth: 0,
                    render_depth: 0,
                    effects_suspended: false,
                    flushing: false,
                    proxies: HashMap::new(),
                    persisted: IndexMap::new(),
                    restored: HashMap::new(),
                }),
                inbox: Mutex::new(IndexSet::new()),
                waker: Mutex::new(None),
                trigger_budget: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Runtime of the computation running on this thread, if any.
    pub fn current() -> Option<Runtime> {
        ReactiveContext::current_runtime()
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Arc::downgrade(&self.inner)
    }

    // ---- Owners ----

    pub fn root_owner(&self) -> OwnerId {
        self.inner.state.lock().root
    }

    /// Owner new primitives attach to right now.
    pub fn current_owner(&self) -> OwnerId {
        let state = self.inner.state.lock();
        self.resolve_owner(&state)
    }

    fn resolve_owner(&self, state: &RuntimeState) -> OwnerId {
        context::current_owner(self.id())
            .filter(|owner| state.owners.contains(*owner))
            .unwrap_or(state.root)
    }

    /// Create an owner under `parent`, or under the current owner.
    pub fn create_owner(&self, parent: Option<OwnerId>) -> OwnerId {
        let mut state = self.inner.state.lock();
        let parent = parent.unwrap_or_else(|| self.resolve_owner(&state));
        state.owners.create(Some(parent))
    }

    pub fn owner_exists(&self, owner: OwnerId) -> bool {
        self.inner.state.lock().owners.contains(owner)
    }

    /// Make `owner` current while `f` runs.
    pub fn with_owner<R>(&self, owner: OwnerId, f: impl FnOnce() -> R) -> R {
        let _guard = OwnerGuard::push(self.id(), owner);
        f()
    }

    /// Dispose `owner` and everything below it, children first.
    ///
    /// Disposing an owner twice is a no-op.
    pub fn dispose_owner(&self, owner: OwnerId) {
        self.dispose_owner_inner(owner, true);
    }

    /// Dispose everything below `owner` but keep the owner and its hooks.
    pub(crate) fn reset_owner(&self, owner: OwnerId) {
        self.dispose_owner_inner(owner, false);
    }

    fn dispose_owner_inner(&self, owner: OwnerId, remove_self: bool) {
        let order = self.inner.state.lock().owners.post_order(owner);
        if order.is_empty() {
            return;
        }
        tracing::trace!(runtime = self.id(), %owner, owners = order.len(), "disposing owner tree");

        for id in order {
            let contents = self.inner.state.lock().owners.take_contents(id);
            run_cleanups(contents.cleanups);

            let mut removed: Vec<Node> = Vec::with_capacity(contents.nodes.len());
            {
                let mut state = self.inner.state.lock();
                for node in contents.nodes {
                    if let Some(node) = state.graph.remove(node) {
                        removed.push(node);
                    }
                }
                if id != owner || remove_self {
                    state.owners.remove(id);
                }
            }
            // Node payloads own user closures; drop them unlocked.
            drop(removed);
        }
    }

    /// Register `f` to run when the current owner is disposed or reset.
    pub fn on_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        let rejected = {
            let mut state = self.inner.state.lock();
            let owner = self.resolve_owner(&state);
            state.owners.push_cleanup(owner, Box::new(f)).err()
        };
        if let Some(cleanup) = rejected {
            run_cleanups(vec![cleanup]);
        }
    }

    pub fn owner_count(&self) -> usize {
        self.inner.state.lock().owners.len()
    }

    pub(crate) fn hook_at(&self, owner: OwnerId, index: usize) -> Result<Option<HookSlot>, ReactiveError> {
        let state = self.inner.state.lock();
        let entry = state
            .owners
            .get(owner)
            .ok_or(ReactiveError::OwnerDisposed { owner })?;
        Ok(entry.hooks.get(index).copied())
    }

    pub(crate) fn hook_count(&self, owner: OwnerId) -> usize {
        let state = self.inner.state.lock();
        state.owners.get(owner).map_or(0, |entry| entry.hooks.len())
    }

    pub(crate) fn push_hook(&self, owner: OwnerId, slot: HookSlot) {
        if let Some(entry) = self.inner.state.lock().owners.get_mut(owner) {
            entry.hooks.push(slot);
        }
    }

    // ---- Batching and render windows ----

    /// Defer delivery until `f` returns. Nested batches flatten into the
    /// outermost one.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.state.lock().batch_depth += 1;
        let guard = BatchGuard { rt: self };
        let result = f();
        drop(guard);
        result
    }

    pub fn is_batching(&self) -> bool {
        self.inner.state.lock().batch_depth > 0
    }

    /// Run `f` without recording reads.
    pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
        ReactiveContext::untracked(f)
    }

    /// Open a render window: effects created or invalidated until
    /// [`Runtime::end_render`] are queued instead of run.
    pub fn start_render(&self) {
        self.inner.state.lock().render_depth += 1;
    }

    pub fn end_render(&self) {
        let mut state = self.inner.state.lock();
        state.render_depth = state.render_depth.saturating_sub(1);
    }

    pub fn is_rendering(&self) -> bool {
        self.inner.state.lock().render_depth > 0
    }

    /// Run effects queued during a render window.
    pub fn run_pending_effects(&self) {
        self.flush();
    }

    pub fn has_pending_effects(&self) -> bool {
        self.inner.state.lock().graph.has_pending_effects()
    }

    /// Stop running effects. Invalidations keep queueing.
    pub fn suspend_effects(&self) {
        self.inner.state.lock().effects_suspended = true;
    }

    /// Resume running effects and flush whatever queued meanwhile.
    pub fn resume_effects(&self) {
        self.inner.state.lock().effects_suspended = false;
        self.flush();
    }

    pub fn effects_suspended(&self) -> bool {
        self.inner.state.lock().effects_suspended
    }

    // ---- Storm budget ----

    /// Cap [`Runtime::trigger`] calls. `None` removes the cap.
    pub fn set_trigger_budget(&self, config: Option<BudgetConfig>) {
        *self.inner.trigger_budget.lock() = config.map(StormBudget::new);
    }

    /// Run an asynchronous fan-out as one batch, if the budget allows.
    ///
    /// A rejected trigger does not run `f`.
    pub fn trigger<R>(&self, f: impl FnOnce() -> R) -> Result<R, BudgetError> {
        if let Some(budget) = self.inner.trigger_budget.lock().as_mut() {
            budget.try_acquire()?;
        }
        Ok(self.batch(f))
    }

    // ---- Global signal bridge ----

    /// Called from the thread that wakes this runtime's session.
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self.inner.waker.lock() = Some(Arc::new(waker));
    }

    pub(crate) fn push_external(inner: &Arc<RuntimeInner>, global: GlobalId) {
        inner.inbox.lock().insert(global);
        let waker = inner.waker.lock().clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    pub fn has_external(&self) -> bool {
        !self.inner.inbox.lock().is_empty()
    }

    /// Apply global signal changes queued by other threads.
    ///
    /// Returns how many globals changed.
    pub fn drain_external(&self) -> usize {
        let changed: Vec<GlobalId> = self.inner.inbox.lock().drain(..).collect();
        if changed.is_empty() {
            return 0;
        }
        {
            let mut state = self.inner.state.lock();
            for global in &changed {
                if let Some(node) = state.proxies.get(global).map(|(node, _)| *node) {
                    state.graph.mark_changed(node);
                }
            }
        }
        self.flush();
        changed.len()
    }

    /// Record a read of `global` in the running computation.
    pub(crate) fn track_global(&self, global: GlobalId) {
        let (node, new_bridge) = {
            let mut state = self.inner.state.lock();
            match state.proxies.get(&global) {
                Some((node, _)) => (*node, None),
                None => {
                    let root = state.root;
                    let node = state
                        .graph
                        .insert(NodeKind::Source, Some(root), Payload::Proxy);
                    state.owners.attach_node(root, node);
                    let bridge = Arc::new(GlobalBridge::new(self.downgrade(), global));
                    state.proxies.insert(global, (node, bridge.clone()));
                    (node, Some(bridge))
                }
            }
        };
        if let Some(bridge) = new_bridge {
            let listener: Arc<dyn Listener> = bridge;
            GlobalRegistry::shared().subscribe(global, &listener);
        }
        ReactiveContext::track(self.id(), node);
    }

    // ---- Persisted signals ----

    pub(crate) fn register_persisted(&self, key: String, node: NodeId, encode: EncodeFn) {
        self.inner.state.lock().persisted.insert(key, (node, encode));
    }

    pub(crate) fn take_restored(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.state.lock().restored.remove(key)
    }

    /// Values to hand to `use_persisted` on the next mount.
    pub fn restore_persisted(&self, values: BTreeMap<String, Vec<u8>>) {
        self.inner.state.lock().restored.extend(values);
    }

    /// Encode every live persisted signal. Restored values nobody claimed yet
    /// are carried over unchanged.
    pub fn snapshot_persisted(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let state = self.inner.state.lock();
        let mut out = BTreeMap::new();
        for (key, (node, encode)) in &state.persisted {
            if let Some(Payload::Signal { value }) = state.graph.get(*node).map(|node| &node.payload) {
                out.insert(key.clone(), encode(value.as_ref())?);
            }
        }
        for (key, bytes) in &state.restored {
            out.entry(key.clone()).or_insert_with(|| bytes.clone());
        }
        Ok(out)
    }

    // ---- Nodes ----

    pub fn node_count(&self) -> usize {
        self.inner.state.lock().graph.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.inner.state.lock().graph.contains(node)
    }

    pub(crate) fn subscriber_count(&self, node: NodeId) -> usize {
        let state = self.inner.state.lock();
        state.graph.get(node).map_or(0, |node| node.dependents().len())
    }

    fn insert_owned(&self, kind: NodeKind, payload: Payload) -> NodeId {
        let mut state = self.inner.state.lock();
        let owner = self.resolve_owner(&state);
        let id = state.graph.insert(kind, Some(owner), payload);
        state.owners.attach_node(owner, id);
        id
    }

    /// Remove one node. Disposing an effect also disposes what its last run
    /// created.
    pub fn dispose_node(&self, id: NodeId) {
        let removed = {
            let mut state = self.inner.state.lock();
            let node = state.graph.remove(id);
            if let Some(owner) = node.as_ref().and_then(Node::owner) {
                state.owners.detach_node(owner, id);
            }
            node
        };
        if let Some(node) = removed {
            if let Payload::Effect { scope, .. } = node.payload {
                self.dispose_owner(scope);
            }
        }
    }

    /// Dispose every owner and node. The runtime stays usable afterwards.
    pub fn dispose(&self) {
        let root = self.root_owner();
        self.reset_owner(root);
        let bridges: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.persisted.clear();
            state.proxies.drain().collect()
        };
        drop(bridges);
        self.inner.inbox.lock().clear();
        tracing::debug!(runtime = self.id(), "runtime disposed");
    }

    // ---- Signals ----

    pub(crate) fn create_signal_node<T: Send + 'static>(&self, value: T) -> NodeId {
        self.insert_owned(
            NodeKind::Source,
            Payload::Signal {
                value: Box::new(value),
            },
        )
    }

    pub(crate) fn read_signal<T: Clone + 'static>(&self, id: NodeId, track: bool) -> Result<T, ReactiveError> {
        if track {
            ReactiveContext::track(self.id(), id);
        }
        let state = self.inner.state.lock();
        let node = state.graph.get(id).ok_or(ReactiveError::Disposed { node: id })?;
        match &node.payload {
            Payload::Signal { value } => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or(ReactiveError::TypeMismatch { node: id }),
            _ => Err(ReactiveError::TypeMismatch { node: id }),
        }
    }

    /// Store `value`; returns whether it differed from the current value.
    pub(crate) fn write_signal<T: PartialEq + Send + 'static>(
        &self,
        id: NodeId,
        value: T,
    ) -> Result<bool, ReactiveError> {
        ReactiveContext::check_write(self.id(), id)?;
        let previous = {
            let mut state = self.inner.state.lock();
            let node = state
                .graph
                .get_mut(id)
                .ok_or(ReactiveError::Disposed { node: id })?;
            let Payload::Signal { value: slot } = &mut node.payload else {
                return Err(ReactiveError::TypeMismatch { node: id });
            };
            let slot = slot
                .downcast_mut::<T>()
                .ok_or(ReactiveError::TypeMismatch { node: id })?;
            if *slot == value {
                return Ok(false);
            }
            let previous = std::mem::replace(slot, value);
            let reached = state.graph.mark_changed(id);
            tracing::trace!(runtime = self.id(), node = %id, reached, "signal changed");
            previous
        };
        drop(previous);
        self.flush();
        Ok(true)
    }

    // ---- Memos ----

    pub(crate) fn create_memo_node(&self, compute: ComputeFn, eq: EqFn) -> NodeId {
        self.insert_owned(
            NodeKind::Derived,
            Payload::Memo {
                value: None,
                compute,
                eq,
            },
        )
    }

    pub(crate) fn read_memo<T: Clone + 'static>(&self, id: NodeId, track: bool) -> Result<T, ReactiveError> {
        if track {
            ReactiveContext::track(self.id(), id);
        }
        if !self.contains_node(id) {
            return Err(ReactiveError::Disposed { node: id });
        }
        if self.is_stale(id) {
            self.recompute_memo(id);
        }
        let state = self.inner.state.lock();
        let node = state.graph.get(id).ok_or(ReactiveError::Disposed { node: id })?;
        match &node.payload {
            Payload::Memo { value: Some(value), .. } => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or(ReactiveError::TypeMismatch { node: id }),
            Payload::Memo { value: None, .. } => Err(ReactiveError::Disposed { node: id }),
            _ => Err(ReactiveError::TypeMismatch { node: id }),
        }
    }

    pub(crate) fn memo_state(&self, id: NodeId) -> Option<MemoState> {
        let state = self.inner.state.lock();
        let node = state.graph.get(id)?;
        match &node.payload {
            Payload::Memo { value: None, .. } => Some(MemoState::Uncomputed),
            Payload::Memo { .. } => Some(match node.dirty_state() {
                DirtyState::Clean => MemoState::Clean,
                DirtyState::MaybeDirty => MemoState::MaybeDirty,
                DirtyState::Dirty => MemoState::Dirty,
            }),
            _ => None,
        }
    }

    fn recompute_memo(&self, id: NodeId) {
        let compute = {
            let state = self.inner.state.lock();
            match state.graph.get(id).map(|node| &node.payload) {
                Some(Payload::Memo { compute, .. }) => compute.clone(),
                _ => return,
            }
        };

        let ctx = ReactiveContext::enter(self, id, false);
        let result = panic::catch_unwind(AssertUnwindSafe(|| compute()));
        let reads = ctx.finish();

        match result {
            Ok(value) => {
                let replaced = {
                    let mut state = self.inner.state.lock();
                    state.graph.set_sources(id, &reads);
                    let Some(node) = state.graph.get_mut(id) else {
                        return;
                    };
                    let mut changed = false;
                    let mut replaced = None;
                    if let Payload::Memo { value: slot, eq, .. } = &mut node.payload {
                        let eq = *eq;
                        changed = slot.as_ref().map_or(true, |old| !eq(old.as_ref(), value.as_ref()));
                        replaced = if changed { slot.replace(value) } else { Some(value) };
                    }
                    if changed {
                        node.bump_version();
                    }
                    node.mark_clean();
                    replaced
                };
                drop(replaced);
            }
            Err(payload) => {
                // Reads of the failed run are discarded; the node stays dirty.
                tracing::debug!(runtime = self.id(), node = %id, "memo computation panicked");
                panic::resume_unwind(payload);
            }
        }
    }

    /// Whether `id` must re-run. Pulls upstream memos up to date on the way
    /// and marks `id` clean when none of its inputs moved.
    fn is_stale(&self, id: NodeId) -> bool {
        let (dirty, sources) = {
            let state = self.inner.state.lock();
            match state.graph.get(id) {
                Some(node) => (node.dirty_state(), node.sources().to_vec()),
                None => return false,
            }
        };

        match dirty {
            DirtyState::Clean => false,
            DirtyState::Dirty => true,
            DirtyState::MaybeDirty => {
                for (source, seen) in sources {
                    let kind = self.inner.state.lock().graph.get(source).map(Node::kind);
                    match kind {
                        None => return true,
                        Some(NodeKind::Derived) => {
                            if self.is_stale(source) {
                                self.recompute_memo(source);
                            }
                        }
                        Some(_) => {}
                    }
                    if self.inner.state.lock().graph.version(source) != Some(seen) {
                        return true;
                    }
                }
                if let Some(node) = self.inner.state.lock().graph.get_mut(id) {
                    node.mark_clean();
                }
                false
            }
        }
    }

    // ---- Effects ----

    pub(crate) fn create_effect_node(&self, run: EffectFn, allow_writes: bool) -> NodeId {
        let (id, run_now) = {
            let mut state = self.inner.state.lock();
            let parent = self.resolve_owner(&state);
            let scope = state.owners.create(Some(parent));
            let id = state.graph.insert(
                NodeKind::Effect,
                Some(parent),
                Payload::Effect {
                    run: Some(run),
                    scope,
                    allow_writes,
                    runs: 0,
                },
            );
            state.owners.attach_node(parent, id);

            let run_now = state.render_depth == 0
                && state.batch_depth == 0
                && !state.effects_suspended
                && !state.flushing;
            if !run_now {
                state.graph.schedule_effect(id);
            }
            (id, run_now)
        };
        if run_now {
            self.run_effect(id);
        }
        id
    }

    pub(crate) fn effect_runs(&self, id: NodeId) -> Option<u64> {
        let state = self.inner.state.lock();
        match state.graph.get(id).map(|node| &node.payload) {
            Some(Payload::Effect { runs, .. }) => Some(*runs),
            _ => None,
        }
    }

    fn run_effect(&self, id: NodeId) {
        let (run, scope, allow_writes) = {
            let mut state = self.inner.state.lock();
            match state.graph.get_mut(id).map(|node| &mut node.payload) {
                Some(Payload::Effect {
                    run,
                    scope,
                    allow_writes,
                    ..
                }) => (run.take(), *scope, *allow_writes),
                _ => return,
            }
        };
        // Already running further up the stack.
        let Some(mut run) = run else {
            return;
        };

        self.reset_owner(scope);

        let ctx = ReactiveContext::enter(self, id, allow_writes);
        let guard = OwnerGuard::push(self.id(), scope);
        let result = panic::catch_unwind(AssertUnwindSafe(|| run()));
        drop(guard);
        let reads = ctx.finish();

        let leftover = {
            let mut state = self.inner.state.lock();
            if result.is_ok() {
                state.graph.set_sources(id, &reads);
            }
            match state.graph.get_mut(id) {
                Some(node) => {
                    node.mark_clean();
                    if let Payload::Effect { run: slot, runs, .. } = &mut node.payload {
                        *slot = Some(run);
                        *runs += 1;
                    }
                    None
                }
                // The effect disposed itself while running.
                None => Some(run),
            }
        };
        drop(leftover);

        if let Err(payload) = result {
            tracing::error!(
                runtime = self.id(),
                effect = %id,
                error = %panic_message(payload.as_ref()),
                "effect panicked"
            );
        }
    }

    // ---- Render observers ----

    /// Register a render scope that forwards invalidation to `listener`.
    pub fn create_observer(&self, listener: Arc<dyn Listener>) -> NodeId {
        self.insert_owned(NodeKind::Observer, Payload::Observer { listener })
    }

    /// Run `f` as the tracked body of `observer`.
    ///
    /// The reads of `f` replace the observer's sources only when `f`
    /// returns; a panic keeps the previous sources and is resumed.
    pub fn run_observed<R>(&self, observer: NodeId, f: impl FnOnce() -> R) -> R {
        let ctx = ReactiveContext::enter(self, observer, false);
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        let reads = ctx.finish();
        match result {
            Ok(value) => {
                let mut state = self.inner.state.lock();
                state.graph.set_sources(observer, &reads);
                if let Some(node) = state.graph.get_mut(observer) {
                    node.mark_clean();
                }
                value
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Whether the last run of `observer` is still valid. Validation may
    /// recompute upstream memos; one that panics counts as a change.
    pub fn observer_is_current(&self, observer: NodeId) -> bool {
        if !self.contains_node(observer) {
            return false;
        }
        panic::catch_unwind(AssertUnwindSafe(|| !self.is_stale(observer))).unwrap_or(false)
    }

    // ---- Flush ----

    fn flush(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.flushing || state.batch_depth > 0 {
                return;
            }
            state.flushing = true;
        }
        let _guard = FlushGuard { rt: self };
        let mut delivered: HashSet<SubscriberId> = HashSet::new();

        for _ in 0..MAX_FLUSH_ROUNDS {
            let (observers, effects) = {
                let mut state = self.inner.state.lock();
                let observers = state.graph.take_pending_observers();
                let effects = if state.render_depth == 0 && !state.effects_suspended {
                    state.graph.take_pending_effects()
                } else {
                    Vec::new()
                };
                (observers, effects)
            };
            if observers.is_empty() && effects.is_empty() {
                return;
            }

            for id in observers {
                // A memo that panics while validating counts as changed; the
                // render will surface the panic.
                let stale = panic::catch_unwind(AssertUnwindSafe(|| self.is_stale(id))).unwrap_or(true);
                if !stale {
                    continue;
                }
                let listener = {
                    let state = self.inner.state.lock();
                    match state.graph.get(id).map(|node| &node.payload) {
                        Some(Payload::Observer { listener }) => Some(listener.clone()),
                        _ => None,
                    }
                };
                if let Some(listener) = listener {
                    if delivered.insert(listener.id()) {
                        listener.mark_dirty();
                    }
                }
            }

            for id in effects {
                let stale = panic::catch_unwind(AssertUnwindSafe(|| self.is_stale(id))).unwrap_or(true);
                if stale {
                    self.run_effect(id);
                }
            }
        }

        let dropped = self.inner.state.lock().graph.take_pending_effects();
        tracing::error!(
            runtime = self.id(),
            rounds = MAX_FLUSH_ROUNDS,
            dropped = dropped.len(),
            "effects did not settle, dropping pending runs"
        );
    }
}

struct BatchGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let depth = {
            let mut state = self.rt.inner.state.lock();
            state.batch_depth = state.batch_depth.saturating_sub(1);
            state.batch_depth
        };
        if depth == 0 && !std::thread::panicking() {
            self.rt.flush();
        }
    }
}

struct FlushGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.rt.inner.state.lock().flushing = false;
    }
}

/// Run cleanups last-registered first. A panicking cleanup is logged and
/// does not stop the others.
fn run_cleanups(mut cleanups: Vec<Cleanup>) {
    while let Some(cleanup) = cleanups.pop() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
            tracing::error!(error = %panic_message(payload.as_ref()), "cleanup panicked");
        }
    }
}
