//! Dependent-Update Propagation
//!
//! Maintains the stored Ancestry and Descent edge rows. One [`Propagator`]
//! is registered per direction; it receives every update message of its
//! direction in a wave at once.
//!
//! # Algorithm
//!
//! For each batch:
//!
//! 1. Collect the ids being updated in this batch.
//! 2. Defer (re-enqueue unchanged) every payload whose edge destination is
//!    itself being updated, so nothing reads a half-written row. When every
//!    payload waits on another one the batch is a cycle and runs as is.
//! 3. Group the rest by target. Each group reads the target's row in the
//!    opposite direction and, for every put, the destination's own row in
//!    this direction (the one-level `connections` copy).
//! 4. Rewrite the target's row with an optimistic update. Puts union assets
//!    into a matching `(target_id, key)` edge or append a new one; deletes
//!    withdraw an asset and drop edges left without assets. The row is
//!    deleted once no edges remain.
//! 5. If the row changed, send every node found in the opposite row a
//!    refresh of its edge back to the target. The refresh carries no
//!    assets, so it can update `connections` but never resurrect an edge.
//!    An unchanged row ends the ripple.
//!
//! A payload whose tag does not match its target is rejected on its own,
//! before grouping. Groups run concurrently and a failing group does not
//! stop its siblings; the first error is returned once all of them are done.

use std::collections::HashSet;

use async_trait::async_trait;
use futures_util::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{DependentUpdate, HandlerContext, Message, MessageHandler};
use crate::error::{CoreError, CoreResult};
use crate::graph::{edges_from_item, put_edge, withdraw_edge, DependencyEdge, DependencyNode, Direction};
use crate::ids::{AssetId, EntityId, EntityTag};
use crate::store::{Attributes, ItemKey, OptimisticUpdate, EDGES_FIELD};

/// One resolved change to an edge list.
#[derive(Debug, Clone, PartialEq)]
enum EdgeChange {
    Put(DependencyEdge),
    Withdraw {
        target: EntityId,
        key: Option<String>,
        asset: Option<AssetId>,
    },
}

impl EdgeChange {
    fn apply(&self, edges: &mut Vec<DependencyEdge>) -> bool {
        match self {
            EdgeChange::Put(edge) => put_edge(edges, edge.clone()),
            EdgeChange::Withdraw { target, key, asset } => {
                withdraw_edge(edges, target, key.as_deref(), asset.as_ref())
            }
        }
    }
}

/// Edge-row maintenance for one direction.
#[derive(Debug, Clone)]
pub struct Propagator {
    direction: Direction,
    name: String,
}

impl Propagator {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            name: format!("propagate::{direction}"),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    async fn apply_group(
        &self,
        ctx: &HandlerContext,
        target: &EntityId,
        updates: &[DependentUpdate],
    ) -> CoreResult<()> {
        let direction = self.direction;
        let row_key = direction.row_key(target);
        let anti_key = direction.opposite().row_key(target);

        let mut keys = vec![anti_key.clone()];
        for edge in updates.iter().filter_map(|update| update.put_item.as_ref()) {
            let key = direction.row_key(&edge.target_id);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let rows = ctx.store.batch_get(&keys, &[EDGES_FIELD.to_string()]).await?;
        let edges_at = |key: &ItemKey| -> CoreResult<Vec<DependencyEdge>> {
            match rows.iter().find(|item| &item.key == key) {
                Some(item) => edges_from_item(item),
                None => Ok(Vec::new()),
            }
        };
        let anti_edges = edges_at(&anti_key)?;

        let mut changes = Vec::with_capacity(updates.len());
        for update in updates {
            if let Some(edge) = &update.put_item {
                let mut edge = edge
                    .clone()
                    .with_connections(edges_at(&direction.row_key(&edge.target_id))?);
                if let Some(asset) = &update.asset_id {
                    edge.assets.insert(asset.clone());
                }
                changes.push(EdgeChange::Put(edge));
            } else if let Some(edge) = &update.delete_item {
                changes.push(EdgeChange::Withdraw {
                    target: edge.target_id.clone(),
                    key: edge.key.clone(),
                    asset: update.asset_id.clone(),
                });
            } else {
                debug!(%target, %direction, "update without put or delete ignored");
            }
        }
        if changes.is_empty() {
            return Ok(());
        }

        let outcome = OptimisticUpdate::new(row_key.clone(), [EDGES_FIELD])
            .config(&ctx.config)
            .delete_when(edges_empty)
            .run(ctx.store.as_ref(), |draft| {
                let mut edges = read_edges(draft, &row_key)?;
                for change in &changes {
                    change.apply(&mut edges);
                }
                write_edges(draft, &edges)
            })
            .await?;

        let edges = match &outcome.state {
            Some(state) => read_edges(state, &row_key)?,
            None => Vec::new(),
        };
        debug!(
            %target,
            %direction,
            changes = changes.len(),
            edges = edges.len(),
            written = outcome.written,
            deleted = outcome.deleted,
            "edge row updated"
        );

        ctx.cache.put(direction, vec![DependencyNode::complete(target.clone(), edges)]);
        ctx.cache.put(
            direction.opposite(),
            vec![DependencyNode::complete(target.clone(), anti_edges.clone())],
        );
        for change in &changes {
            if let EdgeChange::Withdraw { target: to, key, asset } = change {
                ctx.cache.delete(direction, target, to, key.as_deref(), asset.as_ref());
            }
        }

        if !outcome.written {
            return Ok(());
        }

        for anti in &anti_edges {
            let refresh = DependencyEdge::bare(target.clone(), anti.key.clone());
            ctx.enqueue(Message::dependent(
                direction,
                DependentUpdate::put(anti.target_id.clone(), refresh),
            ));
        }
        if direction == Direction::Ancestry && target.tag() == EntityTag::Room {
            ctx.enqueue(Message::RoomUpdate {
                room_id: target.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Propagator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &HandlerContext, batch: Vec<Message>) -> CoreResult<()> {
        let mut first = None;
        let mut updates = Vec::with_capacity(batch.len());
        for message in batch {
            match message.into_dependent() {
                Some((direction, update)) if direction == self.direction => match check_tag(&update) {
                    Ok(()) => updates.push(update),
                    Err(err) => {
                        warn!(target = %update.target_id, direction = %self.direction, error = %err, "update rejected");
                        first.get_or_insert(err);
                    }
                },
                Some((direction, update)) => {
                    warn!(handler = %self.name, %direction, target = %update.target_id, "misrouted update");
                }
                None => {}
            }
        }

        let (workable, deferred) = partition(updates);
        if !deferred.is_empty() {
            debug!(
                generation = ctx.generation,
                direction = %self.direction,
                deferred = deferred.len(),
                "deferring updates whose destination is mid-update"
            );
            for update in deferred {
                ctx.enqueue(Message::dependent(self.direction, update));
            }
        }

        let mut groups: IndexMap<EntityId, Vec<DependentUpdate>> = IndexMap::new();
        for update in workable {
            groups.entry(update.target_id.clone()).or_default().push(update);
        }

        let results = join_all(
            groups
                .iter()
                .map(|(target, updates)| self.apply_group(ctx, target, updates)),
        )
        .await;

        for ((target, _), result) in groups.iter().zip(results) {
            if let Err(err) = result {
                warn!(%target, direction = %self.direction, error = %err, "edge update failed");
                // The row may have moved on without us; read it afresh next time.
                ctx.cache.invalidate(self.direction, target);
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// The reported tag must name the target's own tag.
fn check_tag(update: &DependentUpdate) -> CoreResult<()> {
    let tag: EntityTag = update.tag.parse()?;
    if tag != update.target_id.tag() {
        return Err(CoreError::UnknownTag(format!("{} for {}", update.tag, update.target_id)));
    }
    Ok(())
}

/// Split a batch into payloads that may run now and payloads that must
/// wait for their destination to settle.
fn partition(updates: Vec<DependentUpdate>) -> (Vec<DependentUpdate>, Vec<DependentUpdate>) {
    let updating: HashSet<EntityId> = updates.iter().map(|update| update.target_id.clone()).collect();
    let (workable, deferred): (Vec<_>, Vec<_>) = updates
        .into_iter()
        .partition(|update| update.destination().map_or(true, |to| !updating.contains(to)));

    if workable.is_empty() {
        return (deferred, Vec::new());
    }
    (workable, deferred)
}

fn read_edges(state: &Attributes, key: &ItemKey) -> CoreResult<Vec<DependencyEdge>> {
    match state.get(EDGES_FIELD) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| CoreError::malformed(key, err.to_string())),
    }
}

fn write_edges(draft: &mut Attributes, edges: &[DependencyEdge]) -> CoreResult<()> {
    if edges.is_empty() {
        draft.remove(EDGES_FIELD);
    } else {
        draft.insert(EDGES_FIELD.to_string(), serde_json::to_value(edges)?);
    }
    Ok(())
}

fn edges_empty(state: &Attributes) -> bool {
    match state.get(EDGES_FIELD) {
        None | Some(Value::Null) => true,
        Some(Value::Array(edges)) => edges.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::bus::{MessageBus, MessageType};
    use crate::store::MemoryStore;
    use crate::testing::{context, seed_dependency, stored_edges, FlakyStore};

    fn id(raw: &str) -> EntityId {
        raw.parse().unwrap()
    }

    /// Per-destination lookup used by tests to check denormalized copies.
    fn connections_of(edges: &[DependencyEdge]) -> HashMap<EntityId, Vec<EntityId>> {
        edges
            .iter()
            .map(|edge| {
                (
                    edge.target_id.clone(),
                    edge.connections.iter().map(|c| c.target_id.clone()).collect(),
                )
            })
            .collect()
    }

    fn asset(key: &str) -> AssetId {
        AssetId::new(key)
    }

    fn assets_of(edges: &[DependencyEdge], target: &EntityId) -> Vec<String> {
        edges
            .iter()
            .find(|edge| &edge.target_id == target)
            .map(|edge| edge.assets.iter().map(|a| a.as_str().to_string()).collect())
            .unwrap_or_default()
    }

    async fn run(store: &Arc<MemoryStore>, messages: impl IntoIterator<Item = Message>) -> crate::bus::BusReport {
        let bus = MessageBus::with_core_handlers();
        bus.enqueue_all(messages);
        bus.run(&context(store.clone())).await.unwrap()
    }

    #[tokio::test]
    async fn link_writes_both_rows() {
        let store = Arc::new(MemoryStore::new());
        let (power, active) = (id("VARIABLE#power"), id("COMPUTED#active"));

        let report = run(&store, DependentUpdate::link(&power, &active, None, &asset("base"))).await;
        assert!(report.is_clean());

        assert_eq!(assets_of(&stored_edges(&store, Direction::Descent, &power), &active), ["base"]);
        assert_eq!(assets_of(&stored_edges(&store, Direction::Ancestry, &active), &power), ["base"]);
    }

    #[tokio::test]
    async fn applying_the_same_update_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let (power, active) = (id("VARIABLE#power"), id("COMPUTED#active"));
        let [descent, _] = DependentUpdate::link(&power, &active, None, &asset("base"));

        run(&store, [descent.clone()]).await;
        let once = stored_edges(&store, Direction::Descent, &power);
        let writes = store.stats().updates;

        run(&store, [descent]).await;
        assert_eq!(stored_edges(&store, Direction::Descent, &power), once);
        assert_eq!(store.stats().updates, writes);
    }

    #[tokio::test]
    async fn edges_survive_until_their_last_asset_is_withdrawn() {
        let store = Arc::new(MemoryStore::new());
        let (room, map) = (id("ROOM#lobby"), id("MAP#town"));

        let mut messages = DependentUpdate::link(&room, &map, None, &asset("base")).to_vec();
        messages.extend(DependentUpdate::link(&room, &map, None, &asset("layer")));
        run(&store, messages).await;
        assert_eq!(
            assets_of(&stored_edges(&store, Direction::Descent, &room), &map),
            ["base", "layer"]
        );

        run(&store, DependentUpdate::unlink(&room, &map, None, &asset("base"))).await;
        assert_eq!(assets_of(&stored_edges(&store, Direction::Descent, &room), &map), ["layer"]);
        assert_eq!(assets_of(&stored_edges(&store, Direction::Ancestry, &map), &room), ["layer"]);

        run(&store, DependentUpdate::unlink(&room, &map, None, &asset("layer"))).await;
        assert!(store.snapshot(&Direction::Descent.row_key(&room)).is_none());
        assert!(store.snapshot(&Direction::Ancestry.row_key(&map)).is_none());
    }

    /// Withdrawing from one direction's row must only touch that row, and
    /// must follow the same rule in both directions.
    #[tokio::test]
    async fn delete_rule_is_the_same_for_both_directions() {
        for direction in [Direction::Ancestry, Direction::Descent] {
            let store = Arc::new(MemoryStore::new());
            let node = id("COMPUTED#active");
            let (kept, shared) = (id("VARIABLE#power"), id("VARIABLE#switchedOn"));
            // Seed the row under test and the opposite row independently.
            for other in [&kept, &shared] {
                match direction {
                    Direction::Descent => seed_dependency(&store, &node, other, "base"),
                    Direction::Ancestry => seed_dependency(&store, other, &node, "base"),
                }
            }
            match direction {
                Direction::Descent => {
                    seed_dependency(&store, &node, &shared, "layer");
                    seed_dependency(&store, &id("VARIABLE#upstream"), &node, "base");
                }
                Direction::Ancestry => {
                    seed_dependency(&store, &shared, &node, "layer");
                    seed_dependency(&store, &node, &id("ROOM#downstream"), "base");
                }
            }
            let opposite_before = stored_edges(&store, direction.opposite(), &node);

            let ctx = context(store.clone());
            let withdraw = DependentUpdate::delete(
                node.clone(),
                DependencyEdge::bare(shared.clone(), None),
                Some(asset("base")),
            );
            Propagator::new(direction)
                .handle(&ctx, vec![Message::dependent(direction, withdraw.clone())])
                .await
                .unwrap();

            let edges = stored_edges(&store, direction, &node);
            assert_eq!(assets_of(&edges, &kept), ["base"], "{direction}");
            assert_eq!(assets_of(&edges, &shared), ["layer"], "{direction}");
            assert_eq!(stored_edges(&store, direction.opposite(), &node), opposite_before, "{direction}");

            let withdraw_last = DependentUpdate {
                asset_id: Some(asset("layer")),
                ..withdraw
            };
            Propagator::new(direction)
                .handle(&ctx, vec![Message::dependent(direction, withdraw_last)])
                .await
                .unwrap();
            let edges = stored_edges(&store, direction, &node);
            assert_eq!(edges.len(), 1, "{direction}");
            assert_eq!(edges[0].target_id, kept, "{direction}");
        }
    }

    #[tokio::test]
    async fn payloads_whose_destination_is_mid_update_are_deferred() {
        let store = Arc::new(MemoryStore::new());
        let (x, y, z) = (id("COMPUTED#x"), id("COMPUTED#y"), id("COMPUTED#z"));
        let p1 = DependentUpdate::put(x.clone(), DependencyEdge::new(y.clone(), None, [asset("base")]));
        let p2 = DependentUpdate::put(y.clone(), DependencyEdge::new(z.clone(), None, [asset("base")]));

        let ctx = context(store.clone());
        Propagator::new(Direction::Descent)
            .handle(
                &ctx,
                vec![
                    Message::DescentUpdate(p1.clone()),
                    Message::DescentUpdate(p2),
                ],
            )
            .await
            .unwrap();

        assert!(stored_edges(&store, Direction::Descent, &x).is_empty());
        assert_eq!(stored_edges(&store, Direction::Descent, &y).len(), 1);
        assert_eq!(ctx.take_outbox(), vec![Message::DescentUpdate(p1)]);
    }

    #[test]
    fn a_batch_that_only_waits_on_itself_runs() {
        let (x, y) = (id("COMPUTED#x"), id("COMPUTED#y"));
        let p1 = DependentUpdate::put(x.clone(), DependencyEdge::new(y.clone(), None, [asset("base")]));
        let p2 = DependentUpdate::put(y, DependencyEdge::new(x, None, [asset("base")]));
        let (workable, deferred) = partition(vec![p1, p2]);
        assert_eq!(workable.len(), 2);
        assert!(deferred.is_empty());
    }

    #[tokio::test]
    async fn connections_ripple_outward() {
        let store = Arc::new(MemoryStore::new());
        let (power, active, lobby) = (id("VARIABLE#power"), id("COMPUTED#active"), id("ROOM#lobby"));
        seed_dependency(&store, &power, &active, "base");

        let report = run(&store, DependentUpdate::link(&active, &lobby, None, &asset("base"))).await;

        // power's copy of active's Descent now names the room.
        let power_edges = stored_edges(&store, Direction::Descent, &power);
        assert_eq!(connections_of(&power_edges)[&active], vec![lobby.clone()]);
        // The room's copy of active's Ancestry names power.
        let lobby_edges = stored_edges(&store, Direction::Ancestry, &lobby);
        assert_eq!(connections_of(&lobby_edges)[&active], vec![power.clone()]);
        // The ripple never adds assets.
        assert_eq!(assets_of(&power_edges, &active), ["base"]);

        assert_eq!(report.outbound_of(MessageType::RoomUpdate).count(), 1);
        assert_eq!(report.waves, 2);
    }

    #[tokio::test]
    async fn refreshes_never_resurrect_withdrawn_edges() {
        let store = Arc::new(MemoryStore::new());
        let (power, active) = (id("VARIABLE#power"), id("COMPUTED#active"));
        let refresh = DependentUpdate::put(power.clone(), DependencyEdge::bare(active, None));
        run(&store, [Message::DescentUpdate(refresh)]).await;
        assert!(stored_edges(&store, Direction::Descent, &power).is_empty());
    }

    #[tokio::test]
    async fn a_bad_tag_fails_only_its_message() {
        let store = Arc::new(MemoryStore::new());
        let (power, active, lamp) = (id("VARIABLE#power"), id("COMPUTED#active"), id("COMPUTED#lamp"));
        let mut bad = DependentUpdate::put(power.clone(), DependencyEdge::new(lamp.clone(), None, [asset("base")]));
        bad.tag = "Dragon".into();
        let mut mismatched = DependentUpdate::put(lamp.clone(), DependencyEdge::new(power.clone(), None, [asset("base")]));
        mismatched.tag = "Room".into();
        let same_target = DependentUpdate::put(power.clone(), DependencyEdge::new(active.clone(), None, [asset("base")]));
        let other_target = DependentUpdate::put(lamp.clone(), DependencyEdge::new(active.clone(), None, [asset("base")]));

        let ctx = context(store.clone());
        let err = Propagator::new(Direction::Descent)
            .handle(
                &ctx,
                vec![
                    Message::DescentUpdate(bad),
                    Message::DescentUpdate(same_target),
                    Message::DescentUpdate(mismatched),
                    Message::DescentUpdate(other_target),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::UnknownTag(_)), "{err}");
        let power_edges = stored_edges(&store, Direction::Descent, &power);
        assert_eq!(power_edges.len(), 1);
        assert_eq!(power_edges[0].target_id, active);
        let lamp_edges = stored_edges(&store, Direction::Descent, &lamp);
        assert_eq!(lamp_edges.len(), 1);
        assert_eq!(lamp_edges[0].target_id, active);
    }

    #[tokio::test]
    async fn lost_races_are_retried() {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()).fail_updates(2));
        let (power, active) = (id("VARIABLE#power"), id("COMPUTED#active"));
        let [descent, _] = DependentUpdate::link(&power, &active, None, &asset("base"));

        let ctx = context(flaky);
        Propagator::new(Direction::Descent)
            .handle(&ctx, vec![descent])
            .await
            .unwrap();
        assert_eq!(stored_edges(&memory, Direction::Descent, &power).len(), 1);
    }

    #[tokio::test]
    async fn a_failed_group_forgets_its_cached_row() {
        let memory = Arc::new(MemoryStore::new());
        let (power, active) = (id("VARIABLE#power"), id("COMPUTED#active"));
        let ctx = context(Arc::new(FlakyStore::new(memory.clone()).fail_updates(100)));
        ctx.cache
            .put(Direction::Descent, vec![DependencyNode::complete(power.clone(), Vec::new())]);

        let [descent, _] = DependentUpdate::link(&power, &active, None, &asset("base"));
        let err = Propagator::new(Direction::Descent)
            .handle(&ctx, vec![descent])
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::RetriesExhausted { .. }));
        assert!(!ctx.cache.is_complete(Direction::Descent, &power));
    }

    #[tokio::test]
    async fn cache_follows_the_store() {
        let store = Arc::new(MemoryStore::new());
        let (power, active) = (id("VARIABLE#power"), id("COMPUTED#active"));
        let ctx = context(store.clone());
        let [descent, _] = DependentUpdate::link(&power, &active, None, &asset("base"));
        Propagator::new(Direction::Descent)
            .handle(&ctx, vec![descent])
            .await
            .unwrap();

        let node = ctx.cache.get_partial(Direction::Descent, &power).unwrap();
        assert!(node.is_complete());
        assert!(node.edge(&active, None).is_some());
        let mirror = ctx.cache.get_partial(Direction::Ancestry, &active).unwrap();
        assert!(mirror.edge(&power, None).is_some());

        let [withdraw, _] = DependentUpdate::unlink(&power, &active, None, &asset("base"));
        Propagator::new(Direction::Descent)
            .handle(&ctx, vec![withdraw])
            .await
            .unwrap();
        let mirror = ctx.cache.get_partial(Direction::Ancestry, &active).unwrap();
        assert!(mirror.edge(&power, None).is_none());
    }
}
