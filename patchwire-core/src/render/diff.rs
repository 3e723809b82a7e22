//! Tree Differ
//!
//! Compares the previous live tree with a freshly built one and emits the
//! patches that turn the first into the second. New nodes arrive with
//! [`Hid::UNASSIGNED`]; the differ either carries over the hid of the node
//! they match or allocates a fresh one.
//!
//! # How Child Lists Are Reconciled
//!
//! 1. Match new children to old ones: by key when the new child has one,
//!    otherwise the n-th unkeyed new child pairs with the n-th unkeyed old
//!    child. A pair whose kinds or tags differ is replaced in place.
//! 2. Remove old children nobody matched.
//! 3. Left to right, update matched children and give new ones fresh hids
//!    in pre-order.
//! 4. Right to left, using the next sibling as the anchor, insert new
//!    children and move matched ones. Matched children on the longest
//!    increasing run of old positions stay where they are, so reordering a
//!    list moves as few nodes as possible.

use std::collections::HashMap;

use super::hid::{Hid, HidAllocator};
use super::node::{ElementNode, Node, NodeData};
use super::vnode::Key;
use crate::protocol::Patch;

/// Patches turning `old` into `new`. Hids are written into `new`.
pub fn diff(old: &[Node], new: &mut [Node], hids: &mut HidAllocator) -> Vec<Patch> {
    let mut patches = Vec::new();
    diff_children(Hid::ROOT, old, new, hids, &mut patches);
    patches
}

/// Patches that mount `roots` into an empty client.
pub fn full_tree(roots: &[Node]) -> Vec<Patch> {
    roots
        .iter()
        .map(|root| Patch::InsertNode {
            parent: Hid::ROOT,
            before: None,
            node: root.to_wire(),
        })
        .collect()
}

/// Give `node` and its descendants fresh hids in pre-order.
pub(crate) fn assign_hids(node: &mut Node, hids: &mut HidAllocator) {
    node.hid = hids.allocate();
    if let NodeData::Element(el) = &mut node.data {
        for child in &mut el.children {
            assign_hids(child, hids);
        }
    }
}

fn release_hids(node: &Node, hids: &mut HidAllocator) {
    node.visit(&mut |n| hids.release(n.hid));
}

#[derive(Clone, Copy)]
enum Pairing {
    Update(usize),
    Replace(usize),
}

impl Pairing {
    fn old_index(self) -> usize {
        match self {
            Pairing::Update(i) | Pairing::Replace(i) => i,
        }
    }
}

fn diff_children(parent: Hid, old: &[Node], new: &mut [Node], hids: &mut HidAllocator, patches: &mut Vec<Patch>) {
    // 1. Match.
    let mut by_key: HashMap<&Key, usize> = HashMap::new();
    let mut unkeyed = Vec::new();
    for (i, node) in old.iter().enumerate() {
        match node.key() {
            Some(key) => {
                by_key.entry(key).or_insert(i);
            }
            None => unkeyed.push(i),
        }
    }

    let mut used = vec![false; old.len()];
    let mut pairs: Vec<Option<Pairing>> = Vec::with_capacity(new.len());
    let mut next_unkeyed = unkeyed.into_iter();
    for node in new.iter() {
        let candidate = match node.key() {
            Some(key) => by_key.get(key).copied().filter(|&i| !used[i]),
            None => next_unkeyed.next(),
        };
        pairs.push(candidate.map(|i| {
            used[i] = true;
            if old[i].same_kind(node) {
                Pairing::Update(i)
            } else {
                Pairing::Replace(i)
            }
        }));
    }

    // 2. Remove.
    for (i, node) in old.iter().enumerate() {
        if !used[i] {
            patches.push(Patch::RemoveNode { hid: node.hid });
            release_hids(node, hids);
        }
    }

    // 3. Update in place, number new subtrees.
    for (node, pair) in new.iter_mut().zip(&pairs) {
        match pair {
            Some(Pairing::Update(i)) => diff_node(&old[*i], node, hids, patches),
            Some(Pairing::Replace(i)) => replace(&old[*i], node, hids, patches),
            None => assign_hids(node, hids),
        }
    }

    // 4. Place.
    let matched: Vec<(usize, usize)> = pairs
        .iter()
        .enumerate()
        .filter_map(|(j, pair)| pair.map(|p| (j, p.old_index())))
        .collect();
    let stable = longest_increasing(&matched, new.len());

    let mut anchor: Option<Hid> = None;
    for j in (0..new.len()).rev() {
        let hid = new[j].hid;
        match pairs[j] {
            None => patches.push(Patch::InsertNode {
                parent,
                before: anchor,
                node: new[j].to_wire(),
            }),
            Some(_) if !stable[j] => patches.push(Patch::MoveNode {
                hid,
                parent,
                before: anchor,
            }),
            Some(_) => {}
        }
        anchor = Some(hid);
    }
}

fn replace(old: &Node, new: &mut Node, hids: &mut HidAllocator, patches: &mut Vec<Patch>) {
    release_hids(old, hids);
    assign_hids(new, hids);
    patches.push(Patch::ReplaceNode {
        hid: old.hid,
        node: new.to_wire(),
    });
}

fn diff_node(old: &Node, new: &mut Node, hids: &mut HidAllocator, patches: &mut Vec<Patch>) {
    if let (NodeData::Raw(a), NodeData::Raw(b)) = (&old.data, &new.data) {
        if a != b {
            replace(old, new, hids, patches);
        } else {
            new.hid = old.hid;
        }
        return;
    }

    new.hid = old.hid;
    match (&old.data, &mut new.data) {
        (NodeData::Text(a), NodeData::Text(b)) => {
            if a != b {
                patches.push(Patch::SetText {
                    hid: old.hid,
                    text: b.clone(),
                });
            }
        }
        (NodeData::Element(a), NodeData::Element(b)) => {
            diff_attrs(old.hid, a, b, patches);
            diff_children(old.hid, &a.children, &mut b.children, hids, patches);
        }
        // Kinds were checked when pairing.
        _ => {}
    }
}

fn is_form_control(tag: &str) -> bool {
    matches!(tag, "input" | "textarea" | "select")
}

fn diff_attrs(hid: Hid, old: &ElementNode, new: &ElementNode, patches: &mut Vec<Patch>) {
    for (name, value) in &new.attrs {
        if old.attrs.get(name) == Some(value) {
            continue;
        }
        if name == "value" && is_form_control(&new.tag) {
            patches.push(Patch::SetValue {
                hid,
                value: value.clone(),
            });
        } else {
            patches.push(Patch::SetAttr {
                hid,
                name: name.clone(),
                value: value.clone(),
            });
        }
    }
    for name in old.attrs.keys() {
        if !new.attrs.contains_key(name) {
            patches.push(Patch::RemoveAttr {
                hid,
                name: name.clone(),
            });
        }
    }
}

/// Mark the entries of `seq` (pairs of new index and old index, in new
/// order) that lie on a longest strictly increasing run of old indices.
/// The result has `len` entries and is indexed by new index.
fn longest_increasing(seq: &[(usize, usize)], len: usize) -> Vec<bool> {
    let mut on_run = vec![false; len];
    if seq.is_empty() {
        return on_run;
    }

    // tails[k]: position in `seq` of the smallest tail of a run of length k+1.
    let mut tails: Vec<usize> = Vec::with_capacity(seq.len());
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (pos, &(_, value)) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t].1 < value);
        if k > 0 {
            prev[pos] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(pos);
        } else {
            tails[k] = pos;
        }
    }

    let mut cursor = tails.last().copied();
    while let Some(pos) = cursor {
        on_run[seq[pos].0] = true;
        cursor = prev[pos];
    }
    on_run
}
