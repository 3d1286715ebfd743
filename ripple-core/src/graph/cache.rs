//! Dependency Graph Cache
//!
//! A local, memoized copy of the Ancestry and Descent subtrees the handlers
//! are working with, plus the values they have read or written.
//!
//! # Structure
//!
//! [`GraphCache`] holds three named sub-caches:
//!
//! - `ancestry`: one [`DependencyNode`] per entity, edges pointing upstream
//! - `descent`: one [`DependencyNode`] per entity, edges pointing downstream
//! - `values`: recently read values and values overridden by this process
//!
//! # Invariant
//!
//! Whenever an edge `(A→B)` enters one tree, the mirrored edge `(B→A)` is
//! backpopulated into the other, so the local copy never shows one side of
//! a dependency without the other.
//!
//! # Network Access
//!
//! Only [`GraphCache::get`] talks to the store. Every other operation is a
//! synchronous local lookup or mutation, and no lock is held across an
//! `.await`.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::edge::{edges_from_item, DependencyEdge, Direction};
use super::node::{Completeness, DependencyNode};
use crate::error::CoreResult;
use crate::ids::{AssetId, EntityId};
use crate::store::{StoreClient, EDGES_FIELD};

/// One direction's worth of cached nodes.
#[derive(Debug)]
pub struct DependencyTree {
    direction: Direction,
    nodes: RwLock<IndexMap<EntityId, DependencyNode>>,
}

impl DependencyTree {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            nodes: RwLock::new(IndexMap::new()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn node(&self, id: &EntityId) -> Option<DependencyNode> {
        self.nodes.read().get(id).cloned()
    }

    /// Ids reachable from `root` (excluding it), breadth first.
    fn reachable(&self, root: &EntityId) -> Vec<EntityId> {
        reachable(&self.nodes.read(), root)
    }

    /// Nodes in the subtree of `root` (root included) that still need their
    /// own row fetched.
    fn incomplete(&self, root: &EntityId) -> Vec<EntityId> {
        let nodes = self.nodes.read();
        std::iter::once(root.clone())
            .chain(reachable(&nodes, root))
            .filter(|id| nodes.get(id).map_or(true, |node| !node.is_complete()))
            .collect()
    }

    /// Merge a node in. Complete nodes replace what is cached; partial
    /// knowledge never overrides a complete node's edge list.
    fn merge(&self, incoming: DependencyNode) {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&incoming.id) {
            None => {
                nodes.insert(incoming.id.clone(), incoming);
            }
            Some(existing) if incoming.is_complete() => {
                *existing = incoming;
            }
            Some(existing) => {
                if !existing.is_complete() {
                    for edge in incoming.connections {
                        existing.put(edge);
                    }
                }
            }
        }
    }

    /// Add a mirrored edge, creating a partial node when needed.
    fn mirror(&self, id: &EntityId, edge: DependencyEdge) {
        self.nodes
            .write()
            .entry(id.clone())
            .or_insert_with(|| DependencyNode::partial(id.clone()))
            .put(edge);
    }

    fn withdraw(&self, id: &EntityId, target: &EntityId, key: Option<&str>, asset: Option<&AssetId>) -> bool {
        self.nodes
            .write()
            .get_mut(id)
            .map_or(false, |node| node.withdraw(target, key, asset))
    }

    fn mark_partial(&self, id: &EntityId) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.completeness = Completeness::Partial;
        }
    }
}

fn reachable(nodes: &IndexMap<EntityId, DependencyNode>, root: &EntityId) -> Vec<EntityId> {
    let mut visited = HashSet::from([root.clone()]);
    let mut queue = VecDeque::from([root.clone()]);
    let mut order = Vec::new();

    while let Some(id) = queue.pop_front() {
        let Some(node) = nodes.get(&id) else {
            continue;
        };
        for target in node.targets() {
            if visited.insert(target.clone()) {
                order.push(target.clone());
                queue.push_back(target.clone());
            }
        }
    }
    order
}

/// Local cache of dependency subtrees and values.
#[derive(Debug)]
pub struct GraphCache {
    ancestry: DependencyTree,
    descent: DependencyTree,
    /// Values written by a cascade in this process. They are newer than
    /// anything a re-read could confirm and are trusted as-is.
    overrides: DashMap<EntityId, Value>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self {
            ancestry: DependencyTree::new(Direction::Ancestry),
            descent: DependencyTree::new(Direction::Descent),
            overrides: DashMap::new(),
        }
    }

    pub fn tree(&self, direction: Direction) -> &DependencyTree {
        match direction {
            Direction::Ancestry => &self.ancestry,
            Direction::Descent => &self.descent,
        }
    }

    /// Return the subtree roots for `ids`, hydrating from the store first.
    ///
    /// Each round fetches one level: the rows of every node in the requested
    /// subtrees that is not yet complete. Rounds repeat until every subtree
    /// is complete. Store failures propagate.
    pub async fn get<S>(&self, store: &S, direction: Direction, ids: &[EntityId]) -> CoreResult<Vec<DependencyNode>>
    where
        S: StoreClient + ?Sized,
    {
        let tree = self.tree(direction);
        let mut rounds = 0usize;
        loop {
            let mut frontier: Vec<EntityId> = Vec::new();
            for id in ids {
                for pending in tree.incomplete(id) {
                    if !frontier.contains(&pending) {
                        frontier.push(pending);
                    }
                }
            }
            if frontier.is_empty() {
                break;
            }

            rounds += 1;
            let keys: Vec<_> = frontier.iter().map(|id| direction.row_key(id)).collect();
            let rows = store.batch_get(&keys, &[EDGES_FIELD.to_string()]).await?;

            let mut fetched = Vec::with_capacity(frontier.len());
            for id in frontier {
                let key = direction.row_key(&id);
                let edges = match rows.iter().find(|item| item.key == key) {
                    Some(item) => edges_from_item(item)?,
                    None => Vec::new(),
                };
                fetched.push(DependencyNode::complete(id, edges));
            }
            self.put(direction, fetched);
        }

        if rounds > 0 {
            debug!(%direction, rounds, roots = ids.len(), "hydrated dependency subtrees");
        }
        Ok(ids.iter().filter_map(|id| tree.node(id)).collect())
    }

    /// Best-effort local lookup; never touches the store.
    pub fn get_partial(&self, direction: Direction, id: &EntityId) -> Option<DependencyNode> {
        self.tree(direction).node(id)
    }

    /// Merge a batch of nodes, backpopulating mirrored edges into the
    /// opposite tree and recording denormalized connections as partial
    /// knowledge about each edge's target.
    pub fn put(&self, direction: Direction, nodes: Vec<DependencyNode>) {
        let tree = self.tree(direction);
        let opposite = self.tree(direction.opposite());

        for node in nodes {
            let source = node.id.clone();
            let mut mirrors = Vec::new();
            let mut seconds = Vec::new();
            for edge in &node.connections {
                mirrors.push((
                    edge.target_id.clone(),
                    DependencyEdge::new(source.clone(), edge.key.clone(), edge.assets.iter().cloned()),
                ));
                if !edge.connections.is_empty() {
                    seconds.push(DependencyNode {
                        id: edge.target_id.clone(),
                        completeness: Completeness::Partial,
                        connections: edge.connections.clone(),
                    });
                }
            }

            tree.merge(node);
            for (target, mirrored) in mirrors {
                opposite.mirror(&target, mirrored);
            }
            for second in seconds {
                tree.merge(second);
            }
        }
    }

    /// Withdraw `asset` from the cached edge `(id→target)` and its mirror.
    pub fn delete(
        &self,
        direction: Direction,
        id: &EntityId,
        target: &EntityId,
        key: Option<&str>,
        asset: Option<&AssetId>,
    ) -> bool {
        let changed = self.tree(direction).withdraw(id, target, key, asset);
        self.tree(direction.opposite()).withdraw(target, id, key, asset);
        changed
    }

    /// Whether the node and every cached node below it are complete.
    pub fn is_complete(&self, direction: Direction, id: &EntityId) -> bool {
        self.tree(direction).incomplete(id).is_empty()
    }

    /// Every cached id reachable from `id`, excluding `id` itself.
    pub fn subtree(&self, direction: Direction, id: &EntityId) -> Vec<EntityId> {
        self.tree(direction).reachable(id)
    }

    /// Force the next [`get`](Self::get) to re-read this node's row.
    pub fn invalidate(&self, direction: Direction, id: &EntityId) {
        self.tree(direction).mark_partial(id);
    }

    /// Record a value this process has just written.
    pub fn override_value(&self, id: &EntityId, value: Value) {
        self.overrides.insert(id.clone(), value);
    }

    /// The overridden value for `id`, if this process wrote one.
    pub fn overridden(&self, id: &EntityId) -> Option<Value> {
        self.overrides.get(id).map(|value| value.clone())
    }

    /// Stop trusting a value this process wrote earlier.
    pub fn invalidate_value(&self, id: &EntityId) {
        self.overrides.remove(id);
    }
}

impl Default for GraphCache {
    fn default() -> Self {
        Self::new()
    }
}
