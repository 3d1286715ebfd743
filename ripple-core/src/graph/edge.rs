//! Dependency Edges
//!
//! One hop of a dependency relation, plus the asset set that keeps it alive.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{CoreError, CoreResult};
use crate::ids::{AssetId, EntityId};
use crate::store::{Item, ItemKey, EDGES_FIELD};

/// Which side of the dependency relation a row or message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// What an entity depends on (upstream).
    Ancestry,
    /// What depends on an entity (downstream). Cascades travel this way.
    Descent,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Ancestry => Direction::Descent,
            Direction::Descent => Direction::Ancestry,
        }
    }

    /// Range key of the row holding this side's edges.
    pub fn range(self) -> &'static str {
        match self {
            Direction::Ancestry => "Graph::Ancestry",
            Direction::Descent => "Graph::Descent",
        }
    }

    pub fn row_key(self, id: &EntityId) -> ItemKey {
        ItemKey::new(id.to_string(), self.range())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ancestry => f.write_str("Ancestry"),
            Direction::Descent => f.write_str("Descent"),
        }
    }
}

/// Sorted, duplicate-free set of contributing assets.
///
/// Most edges are contributed by one or two assets, so the set lives inline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetSet(SmallVec<[AssetId; 2]>);

impl AssetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: AssetId) -> bool {
        match self.0.binary_search(&asset) {
            Ok(_) => false,
            Err(index) => {
                self.0.insert(index, asset);
                true
            }
        }
    }

    pub fn remove(&mut self, asset: &AssetId) -> bool {
        match self.0.binary_search(asset) {
            Ok(index) => {
                self.0.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    /// Set union; returns whether anything was added.
    pub fn union(&mut self, other: &AssetSet) -> bool {
        let mut changed = false;
        for asset in other.iter() {
            changed |= self.insert(asset.clone());
        }
        changed
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.0.binary_search(asset).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetId> {
        self.0.iter()
    }
}

impl FromIterator<AssetId> for AssetSet {
    fn from_iter<I: IntoIterator<Item = AssetId>>(iter: I) -> Self {
        let mut set = AssetSet::new();
        for asset in iter {
            set.insert(asset);
        }
        set
    }
}

/// One hop of a dependency relation.
///
/// The edge exists only while `assets` is non-empty. `connections` is a
/// denormalized, one-level copy of the target's own edges in the same
/// direction; nested connections are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub target_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub assets: AssetSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<DependencyEdge>,
}

impl DependencyEdge {
    pub fn new<I>(target_id: EntityId, key: Option<String>, assets: I) -> Self
    where
        I: IntoIterator<Item = AssetId>,
    {
        Self {
            target_id,
            key,
            assets: assets.into_iter().collect(),
            connections: Vec::new(),
        }
    }

    /// An edge without assets. As a put it only refreshes an existing
    /// edge; as a delete it addresses one.
    pub fn bare(target_id: EntityId, key: Option<String>) -> Self {
        Self {
            target_id,
            key,
            assets: AssetSet::new(),
            connections: Vec::new(),
        }
    }

    pub fn with_connections(mut self, connections: Vec<DependencyEdge>) -> Self {
        self.connections = connections.into_iter().map(DependencyEdge::shallow).collect();
        self
    }

    /// Whether this edge is the one addressed by `(target, key)`.
    pub fn matches(&self, target: &EntityId, key: Option<&str>) -> bool {
        &self.target_id == target && self.key.as_deref() == key
    }

    fn with_shallow_connections(self) -> Self {
        let connections = self.connections.clone();
        self.with_connections(connections)
    }

    /// Copy of the edge without its own connections.
    pub fn shallow(self) -> Self {
        Self {
            connections: Vec::new(),
            ..self
        }
    }
}

/// Merge `incoming` into an edge list.
///
/// A matching edge gets the asset union and `incoming`'s connections; an
/// unknown edge is appended if it carries any asset. Returns whether the
/// list changed.
pub fn put_edge(edges: &mut Vec<DependencyEdge>, incoming: DependencyEdge) -> bool {
    match edges
        .iter_mut()
        .find(|edge| edge.matches(&incoming.target_id, incoming.key.as_deref()))
    {
        Some(edge) => {
            let mut changed = edge.assets.union(&incoming.assets);
            let connections: Vec<_> = incoming
                .connections
                .into_iter()
                .map(DependencyEdge::shallow)
                .collect();
            if edge.connections != connections {
                edge.connections = connections;
                changed = true;
            }
            changed
        }
        None if incoming.assets.is_empty() => false,
        None => {
            edges.push(incoming.with_shallow_connections());
            true
        }
    }
}

/// Withdraw `asset` from the edge addressed by `(target, key)`.
///
/// The edge is dropped once its asset set is empty. Without an asset the
/// edge is dropped outright. Returns whether the list changed.
pub fn withdraw_edge(
    edges: &mut Vec<DependencyEdge>,
    target: &EntityId,
    key: Option<&str>,
    asset: Option<&AssetId>,
) -> bool {
    let Some(index) = edges.iter().position(|edge| edge.matches(target, key)) else {
        return false;
    };
    let changed = match asset {
        Some(asset) => edges[index].assets.remove(asset),
        None => {
            edges[index].assets = AssetSet::new();
            true
        }
    };
    if edges[index].assets.is_empty() {
        edges.remove(index);
    }
    changed
}

/// Parse the edge list out of a graph row. A row without edges is empty.
pub fn edges_from_item(item: &Item) -> CoreResult<Vec<DependencyEdge>> {
    match item.get(EDGES_FIELD) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| CoreError::malformed(&item.key, err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(target: &str, assets: &[&str]) -> DependencyEdge {
        DependencyEdge::new(
            target.parse().unwrap(),
            None,
            assets.iter().map(|a| AssetId::new(*a)),
        )
    }

    #[test]
    fn asset_sets_stay_sorted_and_unique() {
        let mut set: AssetSet = ["b", "a", "b"].into_iter().map(AssetId::new).collect();
        assert_eq!(set.len(), 2);
        assert!(!set.insert(AssetId::new("a")));
        let order: Vec<_> = set.iter().map(AssetId::as_str).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert!(set.remove(&AssetId::new("a")));
        assert!(!set.contains(&AssetId::new("a")));
    }

    #[test]
    fn put_unions_assets_of_matching_edge() {
        let mut edges = vec![edge("COMPUTED#active", &["base"])];
        assert!(put_edge(&mut edges, edge("COMPUTED#active", &["layer"])));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].assets.len(), 2);
        // Same payload again is a no-op.
        assert!(!put_edge(&mut edges, edge("COMPUTED#active", &["layer"])));
    }

    #[test]
    fn put_distinguishes_keys() {
        let mut edges = vec![edge("ROOM#lobby", &["base"])];
        let mut keyed = edge("ROOM#lobby", &["base"]);
        keyed.key = Some("exit".into());
        assert!(put_edge(&mut edges, keyed));
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn put_without_assets_only_refreshes() {
        let mut edges = Vec::new();
        assert!(!put_edge(&mut edges, edge("ROOM#lobby", &[])));
        assert!(edges.is_empty());

        edges.push(edge("ROOM#lobby", &["base"]));
        let refresh = edge("ROOM#lobby", &[]).with_connections(vec![edge("MAP#town", &["base"])]);
        assert!(put_edge(&mut edges, refresh));
        assert_eq!(edges[0].connections.len(), 1);
        assert_eq!(edges[0].assets.len(), 1);
    }

    #[test]
    fn connections_are_one_level_deep() {
        let nested = edge("MAP#town", &["base"]).with_connections(vec![edge("ROOM#far", &["base"])]);
        let mut edges = Vec::new();
        put_edge(&mut edges, edge("ROOM#lobby", &["base"]).with_connections(vec![nested]));
        assert!(edges[0].connections[0].connections.is_empty());
    }

    #[test]
    fn withdraw_keeps_edge_until_last_asset_leaves() {
        let target: EntityId = "COMPUTED#active".parse().unwrap();
        let mut edges = vec![edge("COMPUTED#active", &["a", "b"])];

        assert!(withdraw_edge(&mut edges, &target, None, Some(&AssetId::new("a"))));
        assert_eq!(edges.len(), 1);
        assert!(edges[0].assets.contains(&AssetId::new("b")));

        assert!(withdraw_edge(&mut edges, &target, None, Some(&AssetId::new("b"))));
        assert!(edges.is_empty());

        assert!(!withdraw_edge(&mut edges, &target, None, Some(&AssetId::new("b"))));
    }

    #[test]
    fn row_keys_follow_direction() {
        let id = EntityId::variable("power");
        assert_eq!(Direction::Descent.row_key(&id).range, "Graph::Descent");
        assert_eq!(Direction::Ancestry.opposite(), Direction::Descent);
    }
}
