//! Rendering: virtual nodes, the live tree, and the differ.
//!
//! A session's root [`Component`] is expanded by the [`TreeBuilder`] into
//! [`Node`]s, which [`diff`] compares against the previous tree to produce
//! [`Patch`](crate::protocol::Patch)es addressed by [`Hid`].

pub mod builder;
pub mod client;
pub mod diff;
pub mod hid;
pub mod node;
pub mod vnode;

pub use builder::TreeBuilder;
pub use client::ClientTree;
pub use diff::{diff, full_tree};
pub use hid::{Hid, HidAllocator};
pub use node::{ElementNode, HandlerIndex, Node, NodeData};
pub use vnode::{
    component, el, fragment, keyed_list, raw, text, Component, Element, Handler, Key, RenderFn, VNode,
    HANDLER_ATTR_PREFIX,
};
