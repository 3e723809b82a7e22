//! Virtual Nodes
//!
//! A render closure returns a [`VNode`] tree. It is a closed set of variants:
//! elements, text, fragments, component instances and raw markup. The
//! builder expands components and fragments away, leaving a tree of
//! [`Node`](super::Node)s the differ can compare.
//!
//! # Example
//!
//! ```rust,ignore
//! let counter = component("counter", |cx| {
//!     let count = cx.use_signal(|| 0);
//!     let inc = count.clone();
//!     el("div")
//!         .child(el("button").text("+").on("click", move |_| inc.update(|n| *n += 1)))
//!         .child(text(count.get().to_string()))
//!         .into()
//! });
//! ```

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::protocol::EventFrame;
use crate::reactive::Scope;

/// Event handler attached to an element.
pub type Handler = Arc<dyn Fn(&EventFrame) + Send + Sync>;

/// Render closure of a component.
pub type RenderFn = Arc<dyn Fn(&Scope) -> VNode + Send + Sync>;

/// Prefix of the attribute that advertises a handler to the client.
pub const HANDLER_ATTR_PREFIX: &str = "on:";

/// Programmer-supplied identity of a list item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub String);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key(value)
    }
}

macro_rules! key_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Key {
            fn from(value: $ty) -> Self {
                Key(value.to_string())
            }
        })*
    };
}

key_from_int!(u32, u64, usize, i32, i64);

#[derive(Clone)]
pub enum VNode {
    Element(Element),
    Text(String),
    Fragment(Vec<VNode>),
    Component(Component),
    /// Markup sent to the client unescaped.
    Raw(String),
}

impl VNode {
    /// Key of an element or component, used to match list items.
    pub fn key(&self) -> Option<&Key> {
        match self {
            VNode::Element(el) => el.key.as_ref(),
            VNode::Component(c) => c.key.as_ref(),
            _ => None,
        }
    }

    /// Attach a key. Text, fragment and raw nodes cannot be keyed.
    pub fn with_key(self, key: impl Into<Key>) -> Self {
        match self {
            VNode::Element(el) => VNode::Element(el.key(key)),
            VNode::Component(c) => VNode::Component(c.key(key)),
            other => other,
        }
    }
}

impl fmt::Debug for VNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VNode::Element(el) => el.fmt(f),
            VNode::Text(s) => f.debug_tuple("Text").field(s).finish(),
            VNode::Fragment(children) => f.debug_tuple("Fragment").field(children).finish(),
            VNode::Component(c) => c.fmt(f),
            VNode::Raw(s) => f.debug_tuple("Raw").field(s).finish(),
        }
    }
}

/// An element under construction.
#[derive(Clone)]
pub struct Element {
    pub(crate) tag: Cow<'static, str>,
    pub(crate) key: Option<Key>,
    pub(crate) attrs: IndexMap<String, String>,
    pub(crate) handlers: IndexMap<String, Handler>,
    pub(crate) children: Vec<VNode>,
}

impl Element {
    pub fn new(tag: impl Into<Cow<'static, str>>) -> Self {
        Self {
            tag: tag.into(),
            key: None,
            attrs: IndexMap::new(),
            handlers: IndexMap::new(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn child(mut self, child: impl Into<VNode>) -> Self {
        self.children.push(child.into());
        self
    }

    #[must_use]
    pub fn children<I>(mut self, children: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<VNode>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn text(self, content: impl Into<String>) -> Self {
        self.child(VNode::Text(content.into()))
    }

    /// Attach a handler for `event`. The client sees an `on:<event>`
    /// attribute so it knows to forward the event.
    #[must_use]
    pub fn on(mut self, event: impl Into<String>, handler: impl Fn(&EventFrame) + Send + Sync + 'static) -> Self {
        let event = event.into();
        self.attrs
            .insert(format!("{HANDLER_ATTR_PREFIX}{event}"), String::new());
        self.handlers.insert(event, Arc::new(handler));
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.tag)
            .field("key", &self.key)
            .field("attrs", &self.attrs)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("children", &self.children)
            .finish()
    }
}

/// A component instance: a named render closure with its own owner.
#[derive(Clone)]
pub struct Component {
    pub(crate) name: Cow<'static, str>,
    pub(crate) key: Option<Key>,
    pub(crate) render: RenderFn,
}

impl Component {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, render: F) -> Self
    where
        F: Fn(&Scope) -> VNode + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            key: None,
            render: Arc::new(render),
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl From<Element> for VNode {
    fn from(value: Element) -> Self {
        VNode::Element(value)
    }
}

impl From<Component> for VNode {
    fn from(value: Component) -> Self {
        VNode::Component(value)
    }
}

impl From<&str> for VNode {
    fn from(value: &str) -> Self {
        VNode::Text(value.to_string())
    }
}

impl From<String> for VNode {
    fn from(value: String) -> Self {
        VNode::Text(value)
    }
}

pub fn el(tag: impl Into<Cow<'static, str>>) -> Element {
    Element::new(tag)
}

pub fn text(content: impl Into<String>) -> VNode {
    VNode::Text(content.into())
}

pub fn raw(markup: impl Into<String>) -> VNode {
    VNode::Raw(markup.into())
}

pub fn fragment<I>(children: I) -> VNode
where
    I: IntoIterator,
    I::Item: Into<VNode>,
{
    VNode::Fragment(children.into_iter().map(Into::into).collect())
}

pub fn component<F>(name: impl Into<Cow<'static, str>>, render: F) -> Component
where
    F: Fn(&Scope) -> VNode + Send + Sync + 'static,
{
    Component::new(name, render)
}

/// Render `items` as a keyed fragment.
///
/// Duplicate keys are logged; the differ matches the first occurrence and
/// treats later ones as new items.
pub fn keyed_list<T, K, KF, RF>(items: impl IntoIterator<Item = T>, key_fn: KF, render_fn: RF) -> VNode
where
    K: Into<Key>,
    KF: Fn(&T) -> K,
    RF: Fn(T) -> VNode,
{
    let mut seen = HashSet::new();
    let children = items
        .into_iter()
        .map(|item| {
            let key: Key = key_fn(&item).into();
            if !seen.insert(key.clone()) {
                tracing::warn!(key = %key, "duplicate key in keyed list");
            }
            render_fn(item).with_key(key)
        })
        .collect();
    VNode::Fragment(children)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_is_advertised_as_attribute() {
        let node = el("button").on("click", |_| {});
        assert_eq!(node.attrs.get("on:click").map(String::as_str), Some(""));
        assert!(node.handlers.contains_key("click"));
    }

    #[test]
    fn keyed_list_sets_keys() {
        let list = keyed_list(vec!["a", "b"], |s| *s, |s| el("li").text(s).into());
        let VNode::Fragment(children) = list else {
            panic!("expected fragment");
        };
        let keys: Vec<_> = children.iter().map(|c| c.key().cloned()).collect();
        assert_eq!(keys, vec![Some(Key::from("a")), Some(Key::from("b"))]);
    }

    #[test]
    fn text_cannot_be_keyed() {
        assert!(text("x").with_key("k").key().is_none());
    }
}
