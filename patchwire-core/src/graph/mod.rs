//! Dependency Graph
//!
//! This module implements the computational dependency graph that tracks
//! relationships between reactive values and computations.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent reactive values (signals) or computations (memos,
//!   effects, render observers)
//! - Edges represent dependencies: if A depends on B, there is an edge from B to A
//!
//! When a signal changes, we traverse the graph to find all affected nodes
//! and mark them as dirty. The runtime then determines which dirty nodes
//! actually need to recompute.
//!
//! # Design Decisions
//!
//! 1. Nodes live in one arena table per runtime, keyed by integer handle.
//!    Disposing a node is a table removal; handles to it simply stop resolving.
//!
//! 2. Each node records the version of every source it read, so validation
//!    is a version comparison instead of a value comparison.
//!
//! 3. We maintain both forward (sources) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod node;
mod scheduler;

pub use node::{DirtyState, Node, NodeId, NodeKind};
pub use scheduler::Graph;

pub(crate) use node::{any_eq, AnyValue, ComputeFn, EffectFn, EqFn, Payload};
