//! Store Client
//!
//! The remote key-value store is the only shared mutable resource in the
//! system. Everything that mutates it goes through the narrow
//! [`StoreClient`] trait: single and batched reads, queries, conditional
//! updates, bounded batch writes and bounded multi-item transactions.
//!
//! # Layers
//!
//! - [`StoreClient`]: the raw capability set, one trait instead of a stack
//!   of capability mixins.
//! - [`optimistic`]: the read-modify-conditional-write cycle that makes
//!   single-row mutation safe under concurrent writers.
//! - [`merge`]: reconciliation of a query result set against a desired set
//!   of rows.
//! - [`memory`]: an in-process implementation with the same conditional
//!   semantics, used by tests and embedders.
//!
//! # Row Layout
//!
//! Entity rows live at `(ENTITY_ID, "Meta::{Tag}")`; dependency edges live
//! in separate rows at `(ENTITY_ID, "Graph::Ancestry")` and
//! `(ENTITY_ID, "Graph::Descent")`.

mod types;
pub mod memory;
pub mod merge;
pub mod optimistic;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::ids::{EntityId, EntityTag};

pub use memory::MemoryStore;
pub use merge::{merge, merge_transact, MergeAction, MergeCandidate, MergeReport};
pub use optimistic::{OptimisticOutcome, OptimisticUpdate};
pub use types::{
    project, Attributes, Condition, Expected, Item, ItemKey, Query, QueryIndex, TransactOp,
    UpdateRequest, WriteOp,
};

/// Attribute holding the edge list of a graph row.
pub const EDGES_FIELD: &str = "edges";

/// Attribute holding the current value of a Variable or Computed row.
pub const VALUE_FIELD: &str = "value";

/// Key of an entity's meta row.
pub fn meta_key(id: &EntityId) -> ItemKey {
    ItemKey::new(id.to_string(), meta_range(id.tag()))
}

/// Range key of meta rows for a tag.
pub fn meta_range(tag: EntityTag) -> String {
    format!("Meta::{}", tag.name())
}

/// Capability set of the remote key-value store.
///
/// All writes are all-or-nothing at their own granularity: one row for
/// [`update`](StoreClient::update) and [`delete`](StoreClient::delete), the
/// whole request for [`transact_write`](StoreClient::transact_write).
/// [`batch_write`](StoreClient::batch_write) is unconditional and applies
/// operations independently.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetch one row, restricted to `projection` (empty = all attributes).
    async fn get(&self, key: &ItemKey, projection: &[String]) -> StoreResult<Option<Item>>;

    /// Fetch several rows; missing rows are simply absent from the result.
    async fn batch_get(&self, keys: &[ItemKey], projection: &[String]) -> StoreResult<Vec<Item>>;

    /// Run a single-index query.
    async fn query(&self, query: &Query) -> StoreResult<Vec<Item>>;

    /// Conditionally set/remove attributes; returns the row after the write.
    async fn update(&self, request: UpdateRequest) -> StoreResult<Item>;

    /// Conditionally delete a row. Deleting a missing row succeeds when the
    /// conditions hold against "no row".
    async fn delete(&self, key: &ItemKey, conditions: &[Condition]) -> StoreResult<()>;

    /// Unconditional bounded batch of puts and deletes.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Bounded atomic multi-item transaction.
    async fn transact_write(&self, ops: Vec<TransactOp>) -> StoreResult<()>;
}

#[async_trait]
impl<T: StoreClient + ?Sized> StoreClient for Arc<T> {
    async fn get(&self, key: &ItemKey, projection: &[String]) -> StoreResult<Option<Item>> {
        (**self).get(key, projection).await
    }

    async fn batch_get(&self, keys: &[ItemKey], projection: &[String]) -> StoreResult<Vec<Item>> {
        (**self).batch_get(keys, projection).await
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Item>> {
        (**self).query(query).await
    }

    async fn update(&self, request: UpdateRequest) -> StoreResult<Item> {
        (**self).update(request).await
    }

    async fn delete(&self, key: &ItemKey, conditions: &[Condition]) -> StoreResult<()> {
        (**self).delete(key, conditions).await
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        (**self).batch_write(ops).await
    }

    async fn transact_write(&self, ops: Vec<TransactOp>) -> StoreResult<()> {
        (**self).transact_write(ops).await
    }
}
