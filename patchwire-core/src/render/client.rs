//! Client tree model.
//!
//! A plain tree that applies patches the way a browser client would. Tests
//! use it to check that a patch stream really turns one tree into another,
//! and it is handy for headless clients.

use std::collections::HashSet;

use super::hid::Hid;
use crate::error::ClientError;
use crate::protocol::{Patch, WireNode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientTree {
    roots: Vec<WireNode>,
    known: HashSet<Hid>,
}

impl ClientTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes mounted under [`Hid::ROOT`].
    pub fn roots(&self) -> &[WireNode] {
        &self.roots
    }

    pub fn contains(&self, hid: Hid) -> bool {
        self.known.contains(&hid)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Drop everything, as a client does before a full-tree resend.
    pub fn reset(&mut self) {
        self.roots.clear();
        self.known.clear();
    }

    pub fn find(&self, hid: Hid) -> Option<&WireNode> {
        fn search(nodes: &[WireNode], hid: Hid) -> Option<&WireNode> {
            nodes.iter().find_map(|node| {
                if node.hid() == hid {
                    Some(node)
                } else {
                    search(node.children(), hid)
                }
            })
        }
        search(&self.roots, hid)
    }

    pub fn apply_all<'a>(&mut self, patches: impl IntoIterator<Item = &'a Patch>) -> Result<(), ClientError> {
        patches.into_iter().try_for_each(|patch| self.apply(patch))
    }

    pub fn apply(&mut self, patch: &Patch) -> Result<(), ClientError> {
        match patch {
            Patch::InsertNode { parent, before, node } => {
                self.register(node)?;
                self.place(*parent, *before, node.clone())
            }
            Patch::RemoveNode { hid } => {
                let node = detach(&mut self.roots, *hid).ok_or(ClientError::UnknownHid(*hid))?;
                self.forget(&node);
                Ok(())
            }
            Patch::MoveNode { hid, parent, before } => {
                let node = detach(&mut self.roots, *hid).ok_or(ClientError::UnknownHid(*hid))?;
                self.place(*parent, *before, node)
            }
            Patch::SetText { hid, text } => match self.find_mut(*hid)? {
                WireNode::Text { text: current, .. } => {
                    current.clone_from(text);
                    Ok(())
                }
                _ => Err(ClientError::NotText(*hid)),
            },
            Patch::SetAttr { hid, name, value } => {
                self.attrs_mut(*hid)?.insert(name.clone(), value.clone());
                Ok(())
            }
            Patch::SetValue { hid, value } => {
                self.attrs_mut(*hid)?.insert("value".to_string(), value.clone());
                Ok(())
            }
            Patch::RemoveAttr { hid, name } => {
                self.attrs_mut(*hid)?.shift_remove(name);
                Ok(())
            }
            Patch::ReplaceNode { hid, node } => {
                let slot = self.find_mut(*hid)?;
                let old = std::mem::replace(slot, node.clone());
                self.forget(&old);
                self.register(node)
            }
        }
    }

    fn register(&mut self, node: &WireNode) -> Result<(), ClientError> {
        if !self.known.insert(node.hid()) {
            return Err(ClientError::DuplicateHid(node.hid()));
        }
        node.children().iter().try_for_each(|child| self.register(child))
    }

    fn forget(&mut self, node: &WireNode) {
        self.known.remove(&node.hid());
        for child in node.children() {
            self.forget(child);
        }
    }

    fn find_mut(&mut self, hid: Hid) -> Result<&mut WireNode, ClientError> {
        find_mut(&mut self.roots, hid).ok_or(ClientError::UnknownHid(hid))
    }

    fn attrs_mut(&mut self, hid: Hid) -> Result<&mut indexmap::IndexMap<String, String>, ClientError> {
        match self.find_mut(hid)? {
            WireNode::Element { attrs, .. } => Ok(attrs),
            _ => Err(ClientError::NotAnElement(hid)),
        }
    }

    fn place(&mut self, parent: Hid, before: Option<Hid>, node: WireNode) -> Result<(), ClientError> {
        let children = if parent == Hid::ROOT {
            &mut self.roots
        } else {
            match find_mut(&mut self.roots, parent) {
                Some(WireNode::Element { children, .. }) => children,
                Some(_) => return Err(ClientError::NotAnElement(parent)),
                None => return Err(ClientError::UnknownHid(parent)),
            }
        };
        let index = match before {
            Some(anchor) => children
                .iter()
                .position(|child| child.hid() == anchor)
                .ok_or(ClientError::UnknownAnchor { parent, anchor })?,
            None => children.len(),
        };
        children.insert(index, node);
        Ok(())
    }
}

fn find_mut(nodes: &mut [WireNode], hid: Hid) -> Option<&mut WireNode> {
    for node in nodes {
        if node.hid() == hid {
            return Some(node);
        }
        if let WireNode::Element { children, .. } = node {
            if let Some(found) = find_mut(children, hid) {
                return Some(found);
            }
        }
    }
    None
}

fn detach(nodes: &mut Vec<WireNode>, hid: Hid) -> Option<WireNode> {
    if let Some(index) = nodes.iter().position(|node| node.hid() == hid) {
        return Some(nodes.remove(index));
    }
    nodes.iter_mut().find_map(|node| match node {
        WireNode::Element { children, .. } => detach(children, hid),
        _ => None,
    })
}
