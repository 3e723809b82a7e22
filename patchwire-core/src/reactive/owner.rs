//! Owner Tree
//!
//! Owners mirror component instantiation. Every signal, memo, effect and
//! render observer is attached to the owner that was current when it was
//! created; disposing an owner disposes everything below it.
//!
//! This module only holds the table. Running cleanups and removing graph
//! nodes happens in the runtime, which walks [`OwnerTable::post_order`] and
//! drains each owner with [`OwnerTable::take_contents`].

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use super::scope::HookKind;
use crate::graph::NodeId;

/// Unique identifier for an owner within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

pub(crate) type Cleanup = Box<dyn FnOnce() + Send>;

/// One hook slot of a component owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HookSlot {
    pub kind: HookKind,
    pub node: Option<NodeId>,
}

#[derive(Default)]
pub(crate) struct OwnerNode {
    parent: Option<OwnerId>,
    children: SmallVec<[OwnerId; 4]>,
    nodes: Vec<NodeId>,
    cleanups: Vec<Cleanup>,
    pub(crate) hooks: Vec<HookSlot>,
}

/// What an owner held when it was drained.
#[derive(Default)]
pub(crate) struct OwnerContents {
    pub nodes: Vec<NodeId>,
    pub cleanups: Vec<Cleanup>,
}

#[derive(Default)]
pub(crate) struct OwnerTable {
    owners: HashMap<OwnerId, OwnerNode>,
    next_id: u64,
}

impl OwnerTable {
    pub fn create(&mut self, parent: Option<OwnerId>) -> OwnerId {
        self.next_id += 1;
        let id = OwnerId(self.next_id);
        let parent = parent.filter(|parent| self.owners.contains_key(parent));
        if let Some(parent) = parent.and_then(|parent| self.owners.get_mut(&parent)) {
            parent.children.push(id);
        }
        self.owners.insert(
            id,
            OwnerNode {
                parent,
                ..OwnerNode::default()
            },
        );
        id
    }

    pub fn contains(&self, owner: OwnerId) -> bool {
        self.owners.contains_key(&owner)
    }

    pub fn get_mut(&mut self, owner: OwnerId) -> Option<&mut OwnerNode> {
        self.owners.get_mut(&owner)
    }

    pub fn get(&self, owner: OwnerId) -> Option<&OwnerNode> {
        self.owners.get(&owner)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn attach_node(&mut self, owner: OwnerId, node: NodeId) -> bool {
        match self.owners.get_mut(&owner) {
            Some(entry) => {
                entry.nodes.push(node);
                true
            }
            None => false,
        }
    }

    pub fn detach_node(&mut self, owner: OwnerId, node: NodeId) {
        if let Some(entry) = self.owners.get_mut(&owner) {
            entry.nodes.retain(|n| *n != node);
        }
    }

    pub fn push_cleanup(&mut self, owner: OwnerId, cleanup: Cleanup) -> Result<(), Cleanup> {
        match self.owners.get_mut(&owner) {
            Some(entry) => {
                entry.cleanups.push(cleanup);
                Ok(())
            }
            None => Err(cleanup),
        }
    }

    /// `owner` and all of its descendants, children before parents.
    pub fn post_order(&self, owner: OwnerId) -> Vec<OwnerId> {
        let mut out = Vec::new();
        if !self.owners.contains_key(&owner) {
            return out;
        }
        // Iterative DFS; the second visit of a frame emits it.
        let mut stack = vec![(owner, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            if let Some(node) = self.owners.get(&id) {
                for child in node.children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        out
    }

    /// Drain nodes and cleanups of `owner`, keeping the owner itself.
    pub fn take_contents(&mut self, owner: OwnerId) -> OwnerContents {
        match self.owners.get_mut(&owner) {
            Some(entry) => OwnerContents {
                nodes: std::mem::take(&mut entry.nodes),
                cleanups: std::mem::take(&mut entry.cleanups),
            },
            None => OwnerContents::default(),
        }
    }

    /// Remove `owner` from the table and from its parent's child list.
    pub fn remove(&mut self, owner: OwnerId) {
        if let Some(node) = self.owners.remove(&owner) {
            if let Some(parent) = node.parent.and_then(|parent| self.owners.get_mut(&parent)) {
                parent.children.retain(|child| *child != owner);
            }
        }
    }
}
