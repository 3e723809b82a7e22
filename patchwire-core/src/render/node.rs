//! Live tree nodes.
//!
//! The builder turns a [`VNode`](super::VNode) tree into [`Node`]s: only
//! elements, text and raw markup remain, and each one carries a [`Hid`].

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;

use super::hid::Hid;
use super::vnode::{Element, Handler, Key};
use crate::protocol::WireNode;

#[derive(Clone)]
pub struct Node {
    pub hid: Hid,
    pub data: NodeData,
}

#[derive(Clone)]
pub enum NodeData {
    Element(ElementNode),
    Text(String),
    Raw(String),
}

#[derive(Clone)]
pub struct ElementNode {
    pub tag: String,
    pub key: Option<Key>,
    pub attrs: IndexMap<String, String>,
    pub handlers: IndexMap<String, Handler>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            hid: Hid::UNASSIGNED,
            data: NodeData::Text(content.into()),
        }
    }

    pub fn raw(markup: impl Into<String>) -> Self {
        Self {
            hid: Hid::UNASSIGNED,
            data: NodeData::Raw(markup.into()),
        }
    }

    pub(crate) fn element(el: &Element, children: Vec<Node>) -> Self {
        Self {
            hid: Hid::UNASSIGNED,
            data: NodeData::Element(ElementNode {
                tag: el.tag.to_string(),
                key: el.key.clone(),
                attrs: el.attrs.clone(),
                handlers: el.handlers.clone(),
                children,
            }),
        }
    }

    pub fn key(&self) -> Option<&Key> {
        match &self.data {
            NodeData::Element(el) => el.key.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn set_key_if_absent(&mut self, key: &Key) {
        if let NodeData::Element(el) = &mut self.data {
            el.key.get_or_insert_with(|| key.clone());
        }
    }

    /// Same variant, and the same tag for elements.
    pub fn same_kind(&self, other: &Node) -> bool {
        match (&self.data, &other.data) {
            (NodeData::Element(a), NodeData::Element(b)) => a.tag == b.tag,
            (NodeData::Text(_), NodeData::Text(_)) => true,
            (NodeData::Raw(_), NodeData::Raw(_)) => true,
            _ => false,
        }
    }

    pub fn children(&self) -> &[Node] {
        match &self.data {
            NodeData::Element(el) => &el.children,
            _ => &[],
        }
    }

    /// Visit this node and its descendants in pre-order.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Full serialized subtree.
    pub fn to_wire(&self) -> WireNode {
        match &self.data {
            NodeData::Element(el) => WireNode::Element {
                hid: self.hid,
                tag: el.tag.clone(),
                attrs: el.attrs.clone(),
                children: el.children.iter().map(Node::to_wire).collect(),
            },
            NodeData::Text(text) => WireNode::Text {
                hid: self.hid,
                text: text.clone(),
            },
            NodeData::Raw(html) => WireNode::Raw {
                hid: self.hid,
                html: html.clone(),
            },
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            NodeData::Element(el) => f
                .debug_struct("Element")
                .field("hid", &self.hid)
                .field("tag", &el.tag)
                .field("key", &el.key)
                .field("attrs", &el.attrs)
                .field("children", &el.children)
                .finish(),
            NodeData::Text(text) => f.debug_tuple("Text").field(&self.hid).field(text).finish(),
            NodeData::Raw(html) => f.debug_tuple("Raw").field(&self.hid).field(html).finish(),
        }
    }
}

/// Handlers of a tree, indexed by element hid.
#[derive(Clone, Default)]
pub struct HandlerIndex {
    by_hid: HashMap<Hid, IndexMap<String, Handler>>,
}

impl HandlerIndex {
    pub fn build(roots: &[Node]) -> Self {
        let mut by_hid = HashMap::new();
        for root in roots {
            root.visit(&mut |node| {
                if let NodeData::Element(el) = &node.data {
                    if !el.handlers.is_empty() {
                        by_hid.insert(node.hid, el.handlers.clone());
                    }
                }
            });
        }
        Self { by_hid }
    }

    pub fn get(&self, hid: Hid, event: &str) -> Option<&Handler> {
        self.by_hid.get(&hid).and_then(|handlers| handlers.get(event))
    }

    pub fn len(&self) -> usize {
        self.by_hid.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hid.is_empty()
    }
}

impl fmt::Debug for HandlerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.by_hid
                    .iter()
                    .map(|(hid, handlers)| (hid, handlers.keys().collect::<Vec<_>>())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vnode::el;

    #[test]
    fn same_kind_compares_tags() {
        let div = Node::element(&el("div"), Vec::new());
        let span = Node::element(&el("span"), Vec::new());
        assert!(div.same_kind(&div.clone()));
        assert!(!div.same_kind(&span));
        assert!(Node::text("a").same_kind(&Node::text("b")));
        assert!(!Node::text("a").same_kind(&Node::raw("a")));
    }

    #[test]
    fn handler_index_finds_by_hid_and_event() {
        let mut button = Node::element(&el("button").on("click", |_| {}), Vec::new());
        button.hid = Hid::new(4);
        let index = HandlerIndex::build(&[button]);

        assert!(index.get(Hid::new(4), "click").is_some());
        assert!(index.get(Hid::new(4), "input").is_none());
        assert!(index.get(Hid::new(5), "click").is_none());
        assert_eq!(index.len(), 1);
    }
}
