//! In-memory Store
//!
//! A [`StoreClient`] backed by an ordered map behind a single lock. It keeps
//! the semantics the rest of the crate relies on: per-row conditional
//! writes, all-or-nothing transactions, bounded batch sizes, and query
//! results sorted by key.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::types::{project, Attributes, Condition, Item, ItemKey, Query, TransactOp, UpdateRequest, WriteOp};
use super::StoreClient;
use crate::config::CoreConfig;
use crate::error::{StoreError, StoreResult};

/// Counters of the write traffic a store has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub updates: usize,
    pub deletes: usize,
    pub batch_writes: usize,
    pub transactions: usize,
    pub rejected: usize,
}

/// Process-local store with conditional-write semantics.
#[derive(Debug)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<ItemKey, Attributes>>,
    batch_write_limit: usize,
    transact_limit: usize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    batch_writes: AtomicUsize,
    transactions: AtomicUsize,
    rejected: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store with the default batch bounds.
    pub fn new() -> Self {
        Self::with_config(&CoreConfig::default())
    }

    /// Create an empty store bounded like the configuration says.
    pub fn with_config(config: &CoreConfig) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            batch_write_limit: config.batch_write_limit,
            transact_limit: config.transact_limit,
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            batch_writes: AtomicUsize::new(0),
            transactions: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Seed a row directly, bypassing conditions and counters.
    pub fn insert(&self, item: Item) {
        self.rows.write().insert(item.key, item.attributes);
    }

    /// Synchronous read of a row's attributes.
    pub fn snapshot(&self, key: &ItemKey) -> Option<Attributes> {
        self.rows.read().get(key).cloned()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn stats(&self) -> WriteStats {
        WriteStats {
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            batch_writes: self.batch_writes.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, err: StoreError) -> StoreError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        err
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn all_hold(conditions: &[Condition], current: Option<&Attributes>) -> bool {
    conditions.iter().all(|condition| condition.holds(current))
}

fn apply_update(rows: &mut BTreeMap<ItemKey, Attributes>, request: &UpdateRequest) -> Attributes {
    let row = rows.entry(request.key.clone()).or_default();
    for (field, value) in &request.set {
        row.insert(field.clone(), value.clone());
    }
    for field in &request.remove {
        row.remove(field);
    }
    row.clone()
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, key: &ItemKey, projection: &[String]) -> StoreResult<Option<Item>> {
        Ok(self
            .rows
            .read()
            .get(key)
            .map(|attributes| Item::new(key.clone(), project(attributes, projection))))
    }

    async fn batch_get(&self, keys: &[ItemKey], projection: &[String]) -> StoreResult<Vec<Item>> {
        let rows = self.rows.read();
        Ok(keys
            .iter()
            .filter_map(|key| {
                rows.get(key)
                    .map(|attributes| Item::new(key.clone(), project(attributes, projection)))
            })
            .collect())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Item>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(key, _)| query.selects(key))
            .map(|(key, attributes)| Item::new(key.clone(), project(attributes, &query.projection)))
            .collect())
    }

    async fn update(&self, request: UpdateRequest) -> StoreResult<Item> {
        let mut rows = self.rows.write();
        if !all_hold(&request.conditions, rows.get(&request.key)) {
            drop(rows);
            return Err(self.reject(StoreError::ConditionFailed { key: request.key }));
        }
        let attributes = apply_update(&mut rows, &request);
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(Item::new(request.key, attributes))
    }

    async fn delete(&self, key: &ItemKey, conditions: &[Condition]) -> StoreResult<()> {
        let mut rows = self.rows.write();
        if !all_hold(conditions, rows.get(key)) {
            drop(rows);
            return Err(self.reject(StoreError::ConditionFailed { key: key.clone() }));
        }
        rows.remove(key);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        if ops.len() > self.batch_write_limit {
            return Err(self.reject(StoreError::BatchTooLarge {
                len: ops.len(),
                limit: self.batch_write_limit,
            }));
        }
        let mut rows = self.rows.write();
        for op in ops {
            match op {
                WriteOp::Put(item) => {
                    rows.insert(item.key, item.attributes);
                }
                WriteOp::Delete(key) => {
                    rows.remove(&key);
                }
            }
        }
        self.batch_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn transact_write(&self, ops: Vec<TransactOp>) -> StoreResult<()> {
        if ops.len() > self.transact_limit {
            return Err(self.reject(StoreError::BatchTooLarge {
                len: ops.len(),
                limit: self.transact_limit,
            }));
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = ops.iter().map(TransactOp::key).find(|key| !seen.insert(*key)) {
            let reason = format!("multiple operations on {duplicate}");
            return Err(self.reject(StoreError::TransactionCanceled { reason }));
        }

        // Check every condition before touching anything.
        let mut rows = self.rows.write();
        if let Some(failed) = ops
            .iter()
            .find(|op| !all_hold(op.conditions(), rows.get(op.key())))
        {
            let reason = format!("condition failed for {}", failed.key());
            drop(rows);
            return Err(self.reject(StoreError::TransactionCanceled { reason }));
        }

        for op in ops {
            match op {
                TransactOp::Put { item, .. } => {
                    rows.insert(item.key, item.attributes);
                }
                TransactOp::Delete { key, .. } => {
                    rows.remove(&key);
                }
                TransactOp::Update(request) => {
                    apply_update(&mut rows, &request);
                }
                TransactOp::ConditionCheck { .. } => {}
            }
        }
        self.transactions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(range: &str) -> ItemKey {
        ItemKey::new("VARIABLE#power", range)
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_expectation() {
        let store = MemoryStore::new();
        store
            .update(UpdateRequest::new(key("Meta::Variable")).set("value", json!(true)))
            .await
            .unwrap();

        let stale = UpdateRequest::new(key("Meta::Variable"))
            .set("value", json!(false))
            .condition(Condition::equals("value", json!(false)));
        let err = store.update(stale).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        let fresh = UpdateRequest::new(key("Meta::Variable"))
            .set("value", json!(false))
            .condition(Condition::equals("value", json!(true)));
        let item = store.update(fresh).await.unwrap();
        assert_eq!(item.get("value"), Some(&json!(false)));
        assert_eq!(store.stats().rejected, 1);
    }

    #[tokio::test]
    async fn transactions_are_all_or_nothing() {
        let store = MemoryStore::new();
        store.insert(Item::new(key("Meta::Variable"), Attributes::new()).with("value", json!(1)));

        let ops = vec![
            TransactOp::Update(UpdateRequest::new(key("a")).set("value", json!("written"))),
            TransactOp::ConditionCheck {
                key: key("Meta::Variable"),
                conditions: vec![Condition::equals("value", json!(2))],
            },
        ];
        let err = store.transact_write(ops).await.unwrap_err();
        assert!(matches!(err, StoreError::TransactionCanceled { .. }));
        assert!(store.snapshot(&key("a")).is_none());
    }

    #[tokio::test]
    async fn transactions_reject_duplicate_keys() {
        let store = MemoryStore::new();
        let ops = vec![
            TransactOp::Update(UpdateRequest::new(key("a")).set("x", json!(1))),
            TransactOp::Delete {
                key: key("a"),
                conditions: vec![],
            },
        ];
        assert!(store.transact_write(ops).await.is_err());
    }

    #[tokio::test]
    async fn batch_writes_are_bounded() {
        let config = CoreConfig {
            batch_write_limit: 2,
            ..CoreConfig::default()
        };
        let store = MemoryStore::with_config(&config);
        let ops = (0..3)
            .map(|i| WriteOp::Put(Item::new(key(&format!("r{i}")), Attributes::new())))
            .collect();
        let err = store.batch_write(ops).await.unwrap_err();
        assert_eq!(err, StoreError::BatchTooLarge { len: 3, limit: 2 });
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn query_returns_rows_in_key_order() {
        let store = MemoryStore::new();
        for range in ["Graph::Descent", "Meta::Variable", "Graph::Ancestry"] {
            store.insert(Item::new(key(range), Attributes::new()));
        }
        let rows = store
            .query(&Query::partition("VARIABLE#power").begins_with("Graph::"))
            .await
            .unwrap();
        let ranges: Vec<_> = rows.iter().map(|item| item.key.range.as_str()).collect();
        assert_eq!(ranges, vec!["Graph::Ancestry", "Graph::Descent"]);
    }
}
