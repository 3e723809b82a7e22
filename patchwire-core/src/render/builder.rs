//! Tree Builder
//!
//! Expands a [`VNode`] tree into live [`Node`]s, running component render
//! closures along the way.
//!
//! # How Components Are Tracked
//!
//! A component instance is identified by its path: the positions (or keys)
//! of the nodes above it plus its name. Each mounted instance keeps
//!
//! - a hook owner, which holds the primitives created through its [`Scope`]
//!   and the owners of its child components;
//! - a render owner under it, reset before every render, which holds
//!   anything the render body creates directly;
//! - an observer node, which records what the render read and reports
//!   invalidation to the session's listener.
//!
//! A component whose observer is still current and whose render closure is
//! the same one as last time is not re-rendered: its previous output is
//! expanded again, which gives its children the chance to re-render on their
//! own. Instances that do not appear in a successful build are disposed.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::node::Node;
use super::vnode::{Component, Key, RenderFn, VNode};
use crate::error::RenderError;
use crate::graph::NodeId;
use crate::reactive::{Listener, OwnerId, Runtime, Scope};

/// One step in a component path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PathSeg {
    Index(u32),
    Key(Key),
    Component(Cow<'static, str>),
    /// Disambiguates instances that landed on the same path in one build.
    Dup(u32),
}

type ComponentPath = Vec<PathSeg>;

struct Mounted {
    name: Cow<'static, str>,
    owner: OwnerId,
    render_owner: OwnerId,
    observer: NodeId,
    last: Option<(RenderFn, VNode)>,
}

/// Bookkeeping for a single build.
#[derive(Default)]
struct Pass {
    seen: HashSet<ComponentPath>,
    created: Vec<ComponentPath>,
    rendered: usize,
}

pub struct TreeBuilder {
    rt: Runtime,
    owner: OwnerId,
    listener: Arc<dyn Listener>,
    mounted: HashMap<ComponentPath, Mounted>,
    renders: u64,
}

impl TreeBuilder {
    /// Builder whose components report invalidation to `listener`.
    pub fn new(rt: &Runtime, listener: Arc<dyn Listener>) -> Self {
        let owner = rt.create_owner(Some(rt.root_owner()));
        Self {
            rt: rt.clone(),
            owner,
            listener,
            mounted: HashMap::new(),
            renders: 0,
        }
    }

    /// Expand `root`. On failure, instances first mounted by this build are
    /// disposed and the others keep their state.
    pub fn build(&mut self, root: &VNode) -> Result<Vec<Node>, RenderError> {
        let mut pass = Pass::default();
        let mut out = Vec::new();
        let parent = self.owner;

        self.rt.start_render();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.expand(root, &mut Vec::new(), parent, &mut pass, &mut out);
        }));
        self.rt.end_render();

        match result {
            Ok(()) => {
                let stale: Vec<ComponentPath> = self
                    .mounted
                    .keys()
                    .filter(|path| !pass.seen.contains(*path))
                    .cloned()
                    .collect();
                for path in stale {
                    self.unmount(&path);
                }
                self.renders += pass.rendered as u64;
                tracing::trace!(
                    rendered = pass.rendered,
                    mounted = self.mounted.len(),
                    "tree built"
                );
                Ok(out)
            }
            Err(payload) => {
                for path in &pass.created {
                    self.unmount(path);
                }
                let err = RenderError::from_panic(payload);
                tracing::error!(error = %err, "render failed");
                Err(err)
            }
        }
    }

    /// Number of mounted component instances.
    pub fn mounted(&self) -> usize {
        self.mounted.len()
    }

    /// Total component renders across all successful builds.
    pub fn render_count(&self) -> u64 {
        self.renders
    }

    /// Unmount everything.
    pub fn clear(&mut self) {
        self.mounted.clear();
        self.rt.reset_owner(self.owner);
    }

    fn unmount(&mut self, path: &[PathSeg]) {
        if let Some(mounted) = self.mounted.remove(path) {
            tracing::trace!(component = %mounted.name, "unmounting component");
            // Children owners live under this one.
            self.rt.dispose_owner(mounted.owner);
        }
    }

    fn expand(&mut self, vnode: &VNode, path: &mut ComponentPath, parent: OwnerId, pass: &mut Pass, out: &mut Vec<Node>) {
        match vnode {
            VNode::Text(content) => out.push(Node::text(content.clone())),
            VNode::Raw(markup) => out.push(Node::raw(markup.clone())),
            VNode::Fragment(children) => self.expand_children(children, path, parent, pass, out),
            VNode::Element(el) => {
                let mut children = Vec::with_capacity(el.children.len());
                self.expand_children(&el.children, path, parent, pass, &mut children);
                out.push(Node::element(el, children));
            }
            VNode::Component(component) => {
                path.push(PathSeg::Component(component.name.clone()));
                let mut dup = 0;
                while pass.seen.contains(path.as_slice()) {
                    if dup > 0 {
                        path.pop();
                    }
                    path.push(PathSeg::Dup(dup));
                    dup += 1;
                }

                let (owner, output) = self.render_component(component, path, parent, pass);
                let start = out.len();
                self.expand(&output, path, owner, pass, out);
                if let (Some(key), Some(first)) = (&component.key, out.get_mut(start)) {
                    first.set_key_if_absent(key);
                }

                if dup > 0 {
                    path.pop();
                }
                path.pop();
            }
        }
    }

    fn expand_children(
        &mut self,
        children: &[VNode],
        path: &mut ComponentPath,
        parent: OwnerId,
        pass: &mut Pass,
        out: &mut Vec<Node>,
    ) {
        for (index, child) in children.iter().enumerate() {
            let seg = match child.key() {
                Some(key) => PathSeg::Key(key.clone()),
                None => PathSeg::Index(index as u32),
            };
            path.push(seg);
            self.expand(child, path, parent, pass, out);
            path.pop();
        }
    }

    fn render_component(
        &mut self,
        component: &Component,
        path: &[PathSeg],
        parent: OwnerId,
        pass: &mut Pass,
    ) -> (OwnerId, VNode) {
        pass.seen.insert(path.to_vec());
        let rt = self.rt.clone();

        let replaced = self
            .mounted
            .get(path)
            .is_some_and(|m| m.name != component.name || !rt.owner_exists(m.owner));
        if replaced {
            self.unmount(path);
        }

        let mounted = self.mounted.entry(path.to_vec()).or_insert_with(|| {
            let owner = rt.create_owner(Some(parent));
            let render_owner = rt.create_owner(Some(owner));
            let observer = rt.with_owner(owner, || rt.create_observer(self.listener.clone()));
            pass.created.push(path.to_vec());
            tracing::trace!(component = %component.name, %owner, "mounting component");
            Mounted {
                name: component.name.clone(),
                owner,
                render_owner,
                observer,
                last: None,
            }
        });

        if let Some((render, output)) = &mounted.last {
            if Arc::ptr_eq(render, &component.render) && rt.observer_is_current(mounted.observer) {
                return (mounted.owner, output.clone());
            }
        }

        rt.reset_owner(mounted.render_owner);
        let owner = mounted.owner;
        let render = component.render.clone();
        let output = rt.with_owner(mounted.render_owner, || {
            rt.run_observed(mounted.observer, || {
                let scope = Scope::new(&rt, owner);
                let output = render(&scope);
                scope.finish();
                output
            })
        });
        pass.rendered += 1;
        mounted.last = Some((render, output.clone()));
        (owner, output)
    }
}

impl Drop for TreeBuilder {
    fn drop(&mut self) {
        self.rt.dispose_owner(self.owner);
    }
}
