//! Dependency Graph
//!
//! This module models the dependency relation between world entities and
//! keeps a local cache of it.
//!
//! # Overview
//!
//! The graph is stored denormalized, as two rows per entity:
//!
//! - Ancestry: the entities this one depends on
//! - Descent: the entities that depend on this one
//!
//! An edge `(A→B)` in `Descent(A)` is mirrored by `(B→A)` in `Ancestry(B)`.
//! The two rows are written separately and converge through the
//! propagator; nothing ever writes both in one atomic step.
//!
//! # Design Decisions
//!
//! 1. Edges carry the set of assets contributing them, so layered content
//!    can add and withdraw the same dependency independently.
//!
//! 2. Each edge carries a one-level copy of its target's own edges. A
//!    reader can see two hops from a single row read.
//!
//! 3. The cache is a single struct with named sub-caches rather than a
//!    stack of per-capability layers.

mod cache;
mod edge;
mod generation;
mod node;

pub use cache::{DependencyTree, GraphCache};
pub use edge::{edges_from_item, put_edge, withdraw_edge, AssetSet, DependencyEdge, Direction};
pub use generation::GenerationPlan;
pub use node::{Completeness, DependencyNode};
