//! Test Support
//!
//! Helpers for exercising the propagation machinery against a store that
//! misbehaves on purpose, plus small fixtures for seeding graph rows.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bus::HandlerContext;
use crate::config::CoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::evaluate::LuaEvaluator;
use crate::graph::{put_edge, DependencyEdge, Direction, GraphCache};
use crate::ids::{AssetId, EntityId};
use crate::store::{
    meta_key, Attributes, Condition, Item, ItemKey, MemoryStore, Query, StoreClient, TransactOp,
    UpdateRequest, WriteOp, EDGES_FIELD, VALUE_FIELD,
};

type Interloper = Box<dyn Fn(&MemoryStore) + Send + Sync>;

/// A [`StoreClient`] wrapper that loses conditional writes on demand.
///
/// - `fail_updates(n)` rejects the next `n` conditional updates outright.
/// - `fail_transactions(n)` cancels the next `n` transactions outright.
/// - `interleave(n, f)` runs `f` against the inner store right before each
///   of the next `n` writes is forwarded, simulating a concurrent writer
///   that sneaks in between our read and our write.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    update_failures: AtomicUsize,
    transaction_failures: AtomicUsize,
    interleavings: AtomicUsize,
    interloper: Option<Interloper>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            update_failures: AtomicUsize::new(0),
            transaction_failures: AtomicUsize::new(0),
            interleavings: AtomicUsize::new(0),
            interloper: None,
        }
    }

    pub fn fail_updates(self, count: usize) -> Self {
        self.update_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_transactions(self, count: usize) -> Self {
        self.transaction_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn interleave<F>(mut self, count: usize, interloper: F) -> Self
    where
        F: Fn(&MemoryStore) + Send + Sync + 'static,
    {
        self.interleavings.store(count, Ordering::SeqCst);
        self.interloper = Some(Box::new(interloper));
        self
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn before_write(&self) {
        if let Some(interloper) = &self.interloper {
            if Self::take(&self.interleavings) {
                interloper(&self.inner);
            }
        }
    }
}

#[async_trait]
impl StoreClient for FlakyStore {
    async fn get(&self, key: &ItemKey, projection: &[String]) -> StoreResult<Option<Item>> {
        self.inner.get(key, projection).await
    }

    async fn batch_get(&self, keys: &[ItemKey], projection: &[String]) -> StoreResult<Vec<Item>> {
        self.inner.batch_get(keys, projection).await
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Item>> {
        self.inner.query(query).await
    }

    async fn update(&self, request: UpdateRequest) -> StoreResult<Item> {
        if Self::take(&self.update_failures) {
            return Err(StoreError::ConditionFailed { key: request.key });
        }
        self.before_write();
        self.inner.update(request).await
    }

    async fn delete(&self, key: &ItemKey, conditions: &[Condition]) -> StoreResult<()> {
        self.before_write();
        self.inner.delete(key, conditions).await
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        self.inner.batch_write(ops).await
    }

    async fn transact_write(&self, ops: Vec<TransactOp>) -> StoreResult<()> {
        if Self::take(&self.transaction_failures) {
            return Err(StoreError::TransactionCanceled {
                reason: "injected failure".into(),
            });
        }
        self.before_write();
        self.inner.transact_write(ops).await
    }
}

/// Configuration with millisecond backoff, for tests that provoke retries.
pub fn fast_config() -> CoreConfig {
    CoreConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 4,
        ..CoreConfig::default()
    }
}

/// A context over `store` with a fresh cache and the Lua evaluator.
pub fn context_with(store: Arc<dyn StoreClient>, config: CoreConfig) -> HandlerContext {
    HandlerContext::new(
        "test-request",
        store,
        Arc::new(GraphCache::new()),
        Arc::new(LuaEvaluator::new()),
        Arc::new(config),
    )
}

/// [`context_with`] using [`fast_config`].
pub fn context(store: Arc<dyn StoreClient>) -> HandlerContext {
    context_with(store, fast_config())
}

/// Seed a Variable row.
pub fn seed_variable(store: &MemoryStore, id: &EntityId, value: Value) {
    store.insert(Item::new(meta_key(id), Attributes::new()).with(VALUE_FIELD, value));
}

/// Seed a Computed row with its formula and name bindings.
pub fn seed_computed(
    store: &MemoryStore,
    id: &EntityId,
    src: &str,
    dependencies: &[(&str, &EntityId)],
    value: Value,
) {
    let bindings: serde_json::Map<String, Value> = dependencies
        .iter()
        .map(|(name, dep)| (name.to_string(), json!(dep.to_string())))
        .collect();
    store.insert(
        Item::new(meta_key(id), Attributes::new())
            .with("src", json!(src))
            .with("dependencies", Value::Object(bindings))
            .with(VALUE_FIELD, value),
    );
}

/// Seed a meta row with no value (rooms, maps, ...).
pub fn seed_entity(store: &MemoryStore, id: &EntityId) {
    store.insert(Item::new(meta_key(id), Attributes::new()));
}

/// Seed both mirrored rows of a dependency `upstream → downstream` directly,
/// without going through the propagator.
pub fn seed_dependency(store: &MemoryStore, upstream: &EntityId, downstream: &EntityId, asset: &str) {
    append_edge(store, Direction::Descent, upstream, downstream, asset);
    append_edge(store, Direction::Ancestry, downstream, upstream, asset);
}

fn append_edge(store: &MemoryStore, direction: Direction, from: &EntityId, to: &EntityId, asset: &str) {
    let key = direction.row_key(from);
    let mut attrs = store.snapshot(&key).unwrap_or_default();
    let mut edges: Vec<DependencyEdge> = attrs
        .get(EDGES_FIELD)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();
    put_edge(&mut edges, DependencyEdge::new(to.clone(), None, [AssetId::new(asset)]));
    attrs.insert(EDGES_FIELD.into(), json!(edges));
    store.insert(Item::new(key, attrs));
}

/// Read the stored edge list of a node.
pub fn stored_edges(store: &MemoryStore, direction: Direction, id: &EntityId) -> Vec<DependencyEdge> {
    store
        .snapshot(&direction.row_key(id))
        .and_then(|attrs| attrs.get(EDGES_FIELD).cloned())
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}
