//! Message Payloads
//!
//! Everything that travels over the bus, plus the envelope the hosting
//! ingestion layer hands us on the wire.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::HandlerContext;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::evaluate::Evaluate;
use crate::graph::{DependencyEdge, Direction, GraphCache};
use crate::ids::{AssetId, EntityId};
use crate::store::StoreClient;

/// Discriminant used to route messages to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    AncestryUpdate,
    DescentUpdate,
    Recompute,
    RoomUpdate,
    MapUpdate,
    Perception,
}

impl MessageType {
    /// The update message type that maintains rows of `direction`.
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Ancestry => MessageType::AncestryUpdate,
            Direction::Descent => MessageType::DescentUpdate,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A change to one node's edge row.
///
/// `target_id` names the node whose row is mutated; the direction comes from
/// the carrying [`Message`] variant. Exactly one of `put_item` and
/// `delete_item` is expected. For a put, `asset_id` joins the edge's asset
/// set; for a delete, it is the asset being withdrawn (none withdraws the
/// edge outright).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentUpdate {
    pub target_id: EntityId,

    /// Tag of the target as reported by the producer. Checked against the
    /// id before anything is written.
    pub tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<AssetId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put_item: Option<DependencyEdge>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_item: Option<DependencyEdge>,
}

impl DependentUpdate {
    pub fn put(target_id: EntityId, edge: DependencyEdge) -> Self {
        Self {
            tag: target_id.tag().name().to_string(),
            target_id,
            asset_id: None,
            put_item: Some(edge),
            delete_item: None,
        }
    }

    pub fn delete(target_id: EntityId, edge: DependencyEdge, asset_id: Option<AssetId>) -> Self {
        Self {
            tag: target_id.tag().name().to_string(),
            target_id,
            asset_id,
            put_item: None,
            delete_item: Some(edge),
        }
    }

    /// The node on the far end of the edge being changed.
    pub fn destination(&self) -> Option<&EntityId> {
        self.put_item
            .as_ref()
            .or(self.delete_item.as_ref())
            .map(|edge| &edge.target_id)
    }

    /// Both halves of a new dependency `upstream → downstream` contributed
    /// by `asset`: the Descent row of `upstream` and the Ancestry row of
    /// `downstream`.
    pub fn link(upstream: &EntityId, downstream: &EntityId, key: Option<&str>, asset: &AssetId) -> [Message; 2] {
        let key = key.map(str::to_string);
        [
            Message::DescentUpdate(Self::put(
                upstream.clone(),
                DependencyEdge::new(downstream.clone(), key.clone(), [asset.clone()]),
            )),
            Message::AncestryUpdate(Self::put(
                downstream.clone(),
                DependencyEdge::new(upstream.clone(), key, [asset.clone()]),
            )),
        ]
    }

    /// Withdraw `asset`'s contribution to `upstream → downstream` from both
    /// rows.
    pub fn unlink(upstream: &EntityId, downstream: &EntityId, key: Option<&str>, asset: &AssetId) -> [Message; 2] {
        let key = key.map(str::to_string);
        [
            Message::DescentUpdate(Self::delete(
                upstream.clone(),
                DependencyEdge::bare(downstream.clone(), key.clone()),
                Some(asset.clone()),
            )),
            Message::AncestryUpdate(Self::delete(
                downstream.clone(),
                DependencyEdge::bare(upstream.clone(), key),
                Some(asset.clone()),
            )),
        ]
    }
}

/// Every message the bus routes.
///
/// The last three are outward notifications for the presentation layer;
/// when no handler is registered for them they surface in the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    AncestryUpdate(DependentUpdate),
    DescentUpdate(DependentUpdate),
    Recompute { target_id: EntityId },
    RoomUpdate { room_id: EntityId },
    MapUpdate { map_id: EntityId },
    Perception { room_id: EntityId },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AncestryUpdate(_) => MessageType::AncestryUpdate,
            Message::DescentUpdate(_) => MessageType::DescentUpdate,
            Message::Recompute { .. } => MessageType::Recompute,
            Message::RoomUpdate { .. } => MessageType::RoomUpdate,
            Message::MapUpdate { .. } => MessageType::MapUpdate,
            Message::Perception { .. } => MessageType::Perception,
        }
    }

    pub fn recompute(target_id: EntityId) -> Self {
        Message::Recompute { target_id }
    }

    /// Wrap an update in the variant for `direction`.
    pub fn dependent(direction: Direction, update: DependentUpdate) -> Self {
        match direction {
            Direction::Ancestry => Message::AncestryUpdate(update),
            Direction::Descent => Message::DescentUpdate(update),
        }
    }

    /// The update payload, for either direction.
    pub fn as_dependent(&self) -> Option<(Direction, &DependentUpdate)> {
        match self {
            Message::AncestryUpdate(update) => Some((Direction::Ancestry, update)),
            Message::DescentUpdate(update) => Some((Direction::Descent, update)),
            _ => None,
        }
    }

    pub fn into_dependent(self) -> Option<(Direction, DependentUpdate)> {
        match self {
            Message::AncestryUpdate(update) => Some((Direction::Ancestry, update)),
            Message::DescentUpdate(update) => Some((Direction::Descent, update)),
            _ => None,
        }
    }

    /// The entity the message is about.
    pub fn subject(&self) -> &EntityId {
        match self {
            Message::AncestryUpdate(update) | Message::DescentUpdate(update) => &update.target_id,
            Message::Recompute { target_id } => target_id,
            Message::RoomUpdate { room_id } | Message::Perception { room_id } => room_id,
            Message::MapUpdate { map_id } => map_id,
        }
    }
}

/// A batch of messages as delivered by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub messages: Vec<Message>,
}

impl Envelope {
    pub fn new(request_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            request_id: request_id.into(),
            connection_id: None,
            messages,
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Encode as MessagePack with field names.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// A handler context carrying this envelope's request and connection.
    pub fn context(
        &self,
        store: Arc<dyn StoreClient>,
        cache: Arc<GraphCache>,
        evaluator: Arc<dyn Evaluate>,
        config: Arc<CoreConfig>,
    ) -> HandlerContext {
        let ctx = HandlerContext::new(self.request_id.clone(), store, cache, evaluator, config);
        match &self.connection_id {
            Some(connection_id) => ctx.with_connection(connection_id.clone()),
            None => ctx,
        }
    }
}
