//! Dirty Propagation
//!
//! The graph table owns every node of one runtime and decides which nodes
//! a change reaches. It never runs user code: computing values and running
//! effects is the runtime's job, done with the table unlocked.
//!
//! # Algorithm
//!
//! We use a push-pull approach:
//!
//! 1. When a source node changes, its version is bumped and its direct
//!    dependents are marked `Dirty`
//! 2. Dependents reached through a derived node are marked `MaybeDirty`,
//!    recursively (a memo might recompute to the same value)
//! 3. Effects and observers reached by the walk are queued, each once
//! 4. At flush time the runtime pulls: a `MaybeDirty` node compares the
//!    versions it saw during its last run with the current ones and only
//!    re-runs if one of them moved
//!
//! The pending queues are insertion-ordered sets, so a listener marked dirty
//! many times before a flush is delivered once.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeKind, Payload};
use crate::reactive::OwnerId;

/// Arena of graph nodes keyed by integer handle.
#[derive(Debug, Default)]
pub struct Graph {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    pending_effects: IndexSet<NodeId>,
    pending_observers: IndexSet<NodeId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, kind: NodeKind, owner: Option<OwnerId>, payload: Payload) -> NodeId {
        self.next_id += 1;
        let id = NodeId::from_raw(self.next_id);
        self.nodes.insert(id, Node::new(id, kind, owner, payload));
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node and any queued run.
    pub(crate) fn remove(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;

        for (source, _) in node.sources() {
            if let Some(source) = self.nodes.get_mut(source) {
                source.remove_dependent(node_id);
            }
        }
        for dependent in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent) {
                // A vanished source counts as changed on the next validation.
                dependent.mark_dirty();
            }
        }

        self.pending_effects.shift_remove(&node_id);
        self.pending_observers.shift_remove(&node_id);
        Some(node)
    }

    /// Get a reference to a node.
    pub fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub(crate) fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Current version of a node, `None` once it is gone.
    pub fn version(&self, node_id: NodeId) -> Option<u64> {
        self.nodes.get(&node_id).map(Node::version)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replace the edges of `node_id` with the reads of its last run.
    ///
    /// The version each source has right now is recorded, so the next
    /// validation can tell whether it moved since.
    pub(crate) fn set_sources(&mut self, node_id: NodeId, reads: &[NodeId]) {
        let mut sources: SmallVec<[(NodeId, u64); 4]> = SmallVec::new();
        for &read in reads {
            if read == node_id {
                continue;
            }
            if let Some(version) = self.version(read) {
                sources.push((read, version));
            }
        }

        let previous = match self.nodes.get_mut(&node_id) {
            Some(node) => node.replace_sources(sources.clone()),
            None => return,
        };
        for (old, _) in previous {
            if let Some(old) = self.nodes.get_mut(&old) {
                old.remove_dependent(node_id);
            }
        }
        for (new, _) in sources {
            if let Some(new) = self.nodes.get_mut(&new) {
                new.add_dependent(node_id);
            }
        }
    }

    /// Record that the value of `source` changed and propagate dirtiness.
    ///
    /// Returns the number of nodes the change reached.
    pub(crate) fn mark_changed(&mut self, source: NodeId) -> usize {
        let Some(node) = self.nodes.get_mut(&source) else {
            return 0;
        };
        node.bump_version();

        let mut queue: VecDeque<(NodeId, bool)> = node
            .dependents()
            .iter()
            .map(|&dependent| (dependent, true))
            .collect();
        let mut visited = HashSet::new();
        visited.insert(source);

        while let Some((id, direct)) = queue.pop_front() {
            if !visited.insert(id) {
                // Reached again directly after a maybe-dirty visit.
                if direct {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.mark_dirty();
                    }
                }
                continue;
            }
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if direct {
                node.mark_dirty();
            } else {
                node.mark_maybe_dirty();
            }

            match node.kind() {
                NodeKind::Derived => {
                    queue.extend(node.dependents().iter().map(|&dependent| (dependent, false)));
                }
                NodeKind::Effect => {
                    self.pending_effects.insert(id);
                }
                NodeKind::Observer => {
                    self.pending_observers.insert(id);
                }
                NodeKind::Source => {}
            }
        }

        visited.len() - 1
    }

    /// Queue an effect without a change, used for first runs that must wait.
    pub(crate) fn schedule_effect(&mut self, node_id: NodeId) {
        if self.nodes.contains_key(&node_id) {
            self.pending_effects.insert(node_id);
        }
    }

    pub(crate) fn take_pending_effects(&mut self) -> Vec<NodeId> {
        self.pending_effects.drain(..).collect()
    }

    pub(crate) fn take_pending_observers(&mut self) -> Vec<NodeId> {
        self.pending_observers.drain(..).collect()
    }

    pub fn has_pending_effects(&self) -> bool {
        !self.pending_effects.is_empty()
    }

    pub fn has_pending_observers(&self) -> bool {
        !self.pending_observers.is_empty()
    }
}
