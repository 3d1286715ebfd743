//! Graph Nodes
//!
//! This module defines the node type that lives in the dependency cache.

use serde::{Deserialize, Serialize};

use super::edge::{put_edge, withdraw_edge, DependencyEdge};
use crate::ids::{AssetId, EntityId};

/// How much of a node the cache has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completeness {
    /// Only edges learned second-hand are known (mirrors, denormalized
    /// connections). The stored row may hold more.
    Partial,

    /// The node's own stored row has been read; its edge list is
    /// authoritative as of that read.
    Complete,
}

/// A node in the dependency cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    /// The entity this node describes.
    pub id: EntityId,

    /// Whether `connections` came from the node's own row.
    pub completeness: Completeness,

    /// Outgoing edges in the direction of the tree that holds the node.
    pub connections: Vec<DependencyEdge>,
}

impl DependencyNode {
    /// Create a node with no known edges.
    pub fn partial(id: EntityId) -> Self {
        Self {
            id,
            completeness: Completeness::Partial,
            connections: Vec::new(),
        }
    }

    /// Create a node from its own stored edge list.
    pub fn complete(id: EntityId, connections: Vec<DependencyEdge>) -> Self {
        Self {
            id,
            completeness: Completeness::Complete,
            connections,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }

    /// Find the edge addressed by `(target, key)`.
    pub fn edge(&self, target: &EntityId, key: Option<&str>) -> Option<&DependencyEdge> {
        self.connections.iter().find(|edge| edge.matches(target, key))
    }

    /// Merge an edge in; see [`put_edge`].
    pub fn put(&mut self, edge: DependencyEdge) -> bool {
        put_edge(&mut self.connections, edge)
    }

    /// Withdraw an asset from an edge; see [`withdraw_edge`].
    pub fn withdraw(&mut self, target: &EntityId, key: Option<&str>, asset: Option<&AssetId>) -> bool {
        withdraw_edge(&mut self.connections, target, key, asset)
    }

    /// Ids of the direct neighbours.
    pub fn targets(&self) -> impl Iterator<Item = &EntityId> {
        self.connections.iter().map(|edge| &edge.target_id)
    }
}
