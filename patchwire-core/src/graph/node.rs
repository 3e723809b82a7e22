//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//! Nodes are addressed by integer handles; the payload carries whatever the
//! node kind needs at runtime (a value, a compute function, an effect body,
//! or a listener).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::reactive::{Listener, OwnerId};

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A source node (signal, or the local mirror of a global signal).
    /// These are the roots of the graph.
    Source,

    /// A derived node (memo). These have dependencies and may have dependents.
    /// They cache their computed value.
    Derived,

    /// An effect node. These are leaves of the graph.
    Effect,

    /// A render scope. A leaf that forwards invalidation to a [`Listener`].
    Observer,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// The node might need to recompute. One of its transitive dependencies
    /// changed, but we have not yet verified if its direct inputs differ.
    MaybeDirty,

    /// The node definitely needs to recompute. A direct input changed.
    Dirty,
}

pub(crate) type AnyValue = Box<dyn Any + Send>;
pub(crate) type ComputeFn = Arc<dyn Fn() -> AnyValue + Send + Sync>;
pub(crate) type EqFn = fn(&(dyn Any + Send), &(dyn Any + Send)) -> bool;
pub(crate) type EffectFn = Box<dyn FnMut() + Send>;

/// Structural equality between two type-erased values of the same type.
pub(crate) fn any_eq<T: PartialEq + 'static>(a: &(dyn Any + Send), b: &(dyn Any + Send)) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Runtime data carried by a node.
pub(crate) enum Payload {
    Signal {
        value: AnyValue,
    },
    Memo {
        value: Option<AnyValue>,
        compute: ComputeFn,
        eq: EqFn,
    },
    Effect {
        /// Taken out while the effect body runs.
        run: Option<EffectFn>,
        /// Owner that collects cleanups and children of the last run.
        scope: OwnerId,
        allow_writes: bool,
        runs: u64,
    },
    Observer {
        listener: Arc<dyn Listener>,
    },
    /// Local stand-in for a global signal. The runtime maps globals to
    /// their proxies; the node itself only carries a version.
    Proxy,
}

/// A node in the dependency graph.
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// What kind of node this is.
    kind: NodeKind,

    /// Current dirty state.
    dirty: DirtyState,

    /// Bumped whenever the node's value changes.
    version: u64,

    /// Owner this node is attached to, if any.
    owner: Option<OwnerId>,

    /// Nodes this node read during its last successful run, with the
    /// version observed at that time.
    sources: SmallVec<[(NodeId, u64); 4]>,

    /// Nodes that read this node.
    dependents: IndexSet<NodeId>,

    pub(crate) payload: Payload,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind, owner: Option<OwnerId>, payload: Payload) -> Self {
        Self {
            id,
            kind,
            dirty: match kind {
                NodeKind::Source => DirtyState::Clean,
                // Start dirty to ensure first computation
                NodeKind::Derived | NodeKind::Effect | NodeKind::Observer => DirtyState::Dirty,
            },
            version: 0,
            owner,
            sources: SmallVec::new(),
            dependents: IndexSet::new(),
            payload,
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Get the current dirty state.
    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    /// Version of the node's value.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    /// Check if the node needs any processing.
    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    /// Mark the node as clean.
    pub fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    /// Mark the node as maybe dirty (a dependency might have changed).
    pub fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    /// Mark the node as definitely dirty (needs recomputation).
    pub fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Sources read during the last run, with observed versions.
    pub fn sources(&self) -> &[(NodeId, u64)] {
        &self.sources
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    pub(crate) fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    pub(crate) fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    pub(crate) fn replace_sources(
        &mut self,
        sources: SmallVec<[(NodeId, u64); 4]>,
    ) -> SmallVec<[(NodeId, u64); 4]> {
        std::mem::replace(&mut self.sources, sources)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dirty", &self.dirty)
            .field("version", &self.version)
            .field("sources", &self.sources.len())
            .field("dependents", &self.dependents.len())
            .finish()
    }
}
