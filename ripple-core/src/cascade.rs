//! Cascade Scheduler
//!
//! Re-evaluates computed entities when something they depend on changed,
//! and pushes the change further down the Descent graph.
//!
//! # Algorithm
//!
//! For each batch of `Recompute` messages:
//!
//! 1. Deduplicate the requested ids and hydrate their Descent subtrees. An
//!    id whose subtree cannot be read fails alone; the rest carry on.
//! 2. Layer the ids with a [`GenerationPlan`]. Only the first generation
//!    runs now; the rest are re-enqueued for the next wave, after their
//!    prerequisites' writes have settled.
//! 3. Each first-generation id is handled by tag:
//!    - Computed: read the formula and inputs, evaluate, and write the new
//!      value in one transaction that also checks every input read from the
//!      store is unchanged. Values this process overrode are trusted as-is.
//!    - Variable: nothing to evaluate.
//!    - Room: also emit a `Perception` refresh.
//!    - Map: emit a `MapUpdate` instead of writing anything.
//! 4. After a value changed (or for entities without a value), enqueue a
//!    `Recompute` for every id in the Descent subtree.
//!
//! A formula that fails to evaluate stores `{"error": message}` in place of
//! a value, so the rest of the wave carries on.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::future::join_all;
use indexmap::{IndexMap, IndexSet};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::{HandlerContext, Message, MessageHandler};
use crate::error::{CoreError, CoreResult};
use crate::evaluate::Bindings;
use crate::graph::{Direction, GenerationPlan};
use crate::ids::{EntityId, EntityTag};
use crate::store::{
    meta_key, Condition, Item, ItemKey, OptimisticUpdate, TransactOp, UpdateRequest, VALUE_FIELD,
};

/// Attribute holding a computed entity's formula.
pub const SRC_FIELD: &str = "src";

/// Attribute mapping a computed entity's free names to entity ids.
pub const DEPENDENCIES_FIELD: &str = "dependencies";

/// A computed entity's record as read for one evaluation attempt.
#[derive(Debug)]
struct ComputedRecord {
    src: String,
    value: Option<Value>,
    dependencies: IndexMap<String, EntityId>,
}

impl ComputedRecord {
    fn from_item(item: &Item) -> CoreResult<Self> {
        let src = item
            .get(SRC_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::malformed(&item.key, "missing formula source"))?
            .to_string();

        let mut dependencies = IndexMap::new();
        match item.get(DEPENDENCIES_FIELD) {
            None | Some(Value::Null) => {}
            Some(Value::Object(names)) => {
                for (name, raw) in names {
                    let raw = raw
                        .as_str()
                        .ok_or_else(|| CoreError::malformed(&item.key, format!("dependency {name} is not an id")))?;
                    dependencies.insert(name.clone(), raw.parse()?);
                }
            }
            Some(_) => return Err(CoreError::malformed(&item.key, "dependencies is not a map")),
        }

        Ok(Self {
            src,
            value: item.get(VALUE_FIELD).cloned(),
            dependencies,
        })
    }
}

/// An input value and whether it came from this process's overrides.
#[derive(Debug)]
struct Input {
    value: Option<Value>,
    trusted: bool,
}

/// The `Recompute` handler.
#[derive(Debug, Clone, Default)]
pub struct CascadeScheduler;

impl CascadeScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Set a Variable's value and start a cascade from it.
    ///
    /// The write is an optimistic update of the Variable's `value`. When it
    /// changes anything, the new value becomes an override in the context's
    /// cache and a `Recompute` is queued on the context. Returns whether a
    /// write happened.
    pub async fn set_variable(ctx: &HandlerContext, id: &EntityId, value: Value) -> CoreResult<bool> {
        if id.tag() != EntityTag::Variable {
            return Err(CoreError::handler("cascade", format!("{id} is not a variable")));
        }

        let outcome = OptimisticUpdate::new(meta_key(id), [VALUE_FIELD])
            .config(&ctx.config)
            .run(ctx.store.as_ref(), |draft| {
                draft.insert(VALUE_FIELD.to_string(), value.clone());
                Ok(())
            })
            .await
            .inspect_err(|_| ctx.cache.invalidate_value(id))?;

        if outcome.written {
            info!(%id, attempts = outcome.attempts, "variable set");
            ctx.cache.override_value(id, value);
            ctx.enqueue(Message::recompute(id.clone()));
        }
        Ok(outcome.written)
    }

    async fn recompute(&self, ctx: &HandlerContext, id: &EntityId) -> CoreResult<()> {
        match id.tag() {
            EntityTag::Computed => {
                if self.recompute_computed(ctx, id).await? {
                    cascade(ctx, id);
                }
            }
            EntityTag::Room => {
                cascade(ctx, id);
                ctx.enqueue(Message::Perception { room_id: id.clone() });
            }
            EntityTag::Map => {
                ctx.enqueue(Message::MapUpdate { map_id: id.clone() });
            }
            _ => cascade(ctx, id),
        }
        Ok(())
    }

    /// Evaluate and store a computed value. Returns whether it changed.
    async fn recompute_computed(&self, ctx: &HandlerContext, id: &EntityId) -> CoreResult<bool> {
        let key = meta_key(id);
        let fields = [SRC_FIELD, VALUE_FIELD, DEPENDENCIES_FIELD].map(String::from);
        let attempts = ctx.config.max_retries + 1;

        for attempt in 0..attempts {
            let Some(item) = ctx.store.get(&key, &fields).await? else {
                warn!(%id, "recompute requested for a computed entity without a record");
                return Ok(false);
            };
            let record = ComputedRecord::from_item(&item)?;
            let inputs = read_inputs(ctx, &record).await?;

            let bindings: Bindings = record
                .dependencies
                .iter()
                .map(|(name, dep)| {
                    let value = inputs
                        .get(dep)
                        .and_then(|input| input.value.clone())
                        .unwrap_or(Value::Null);
                    (name.clone(), value)
                })
                .collect();
            let result = match ctx.evaluator.evaluate(&record.src, &bindings) {
                Ok(value) => value,
                Err(err) => {
                    warn!(%id, error = %err, "formula failed to evaluate");
                    json!({ "error": err.to_string() })
                }
            };

            if record.value.as_ref() == Some(&result) {
                debug!(%id, "computed value unchanged");
                return Ok(false);
            }

            let mut ops: Vec<TransactOp> = inputs
                .iter()
                .filter(|(dep, input)| !input.trusted && *dep != id)
                .map(|(dep, input)| TransactOp::ConditionCheck {
                    key: meta_key(dep),
                    conditions: vec![Condition::unchanged(VALUE_FIELD, input.value.as_ref())],
                })
                .collect();
            ops.push(TransactOp::Update(
                UpdateRequest::new(key.clone())
                    .set(VALUE_FIELD, result.clone())
                    .condition(Condition::unchanged(VALUE_FIELD, record.value.as_ref()))
                    .condition(Condition::equals(SRC_FIELD, json!(record.src))),
            ));

            match ctx.store.transact_write(ops).await {
                Ok(()) => {
                    info!(%id, attempt, value = %result, "computed value written");
                    ctx.cache.override_value(id, result);
                    return Ok(true);
                }
                Err(err) if err.is_conflict() => {
                    if attempt + 1 < attempts {
                        let delay = ctx.config.backoff(attempt);
                        debug!(%id, attempt, ?delay, error = %err, "recompute lost a race, retrying");
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(%id, attempts, error = %err, "recompute exhausted its retries");
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(CoreError::RetriesExhausted { key, attempts })
    }
}

/// Read every input of `record`, preferring this process's overrides.
async fn read_inputs(ctx: &HandlerContext, record: &ComputedRecord) -> CoreResult<IndexMap<EntityId, Input>> {
    let mut inputs = IndexMap::new();
    let mut to_read: Vec<ItemKey> = Vec::new();
    for dep in record.dependencies.values() {
        if inputs.contains_key(dep) {
            continue;
        }
        match ctx.cache.overridden(dep) {
            Some(value) => {
                inputs.insert(
                    dep.clone(),
                    Input {
                        value: Some(value),
                        trusted: true,
                    },
                );
            }
            None => {
                to_read.push(meta_key(dep));
                inputs.insert(
                    dep.clone(),
                    Input {
                        value: None,
                        trusted: false,
                    },
                );
            }
        }
    }

    if !to_read.is_empty() {
        let rows = ctx.store.batch_get(&to_read, &[VALUE_FIELD.to_string()]).await?;
        for (dep, input) in inputs.iter_mut().filter(|(_, input)| !input.trusted) {
            let key = meta_key(dep);
            input.value = rows
                .iter()
                .find(|item| item.key == key)
                .and_then(|item| item.get(VALUE_FIELD))
                .cloned();
        }
    }
    Ok(inputs)
}

/// Queue a recompute for everything below `id`.
fn cascade(ctx: &HandlerContext, id: &EntityId) {
    let below = ctx.cache.subtree(Direction::Descent, id);
    if !below.is_empty() {
        debug!(%id, descendants = below.len(), "cascading");
    }
    ctx.enqueue_all(below.into_iter().map(Message::recompute));
}

impl CascadeScheduler {
    /// Load the Descent subtrees of `requested`, dropping the ids whose
    /// subtree cannot be read. Their errors land in `first`.
    async fn hydrate(
        &self,
        ctx: &HandlerContext,
        requested: Vec<EntityId>,
        first: &mut Option<CoreError>,
    ) -> Vec<EntityId> {
        let store = ctx.store.as_ref();
        if ctx.cache.get(store, Direction::Descent, &requested).await.is_ok() {
            return requested;
        }

        // Retry one id at a time to find the subtrees that are broken.
        let results = join_all(requested.iter().map(|id| {
            ctx.cache
                .get(store, Direction::Descent, std::slice::from_ref(id))
        }))
        .await;
        let mut readable = Vec::with_capacity(requested.len());
        for (id, result) in requested.into_iter().zip(results) {
            match result {
                Ok(_) => readable.push(id),
                Err(err) => {
                    warn!(%id, error = %err, "descent subtree unreadable, skipping recompute");
                    first.get_or_insert(err);
                }
            }
        }
        readable
    }
}

#[async_trait]
impl MessageHandler for CascadeScheduler {
    fn name(&self) -> &str {
        "cascade"
    }

    async fn handle(&self, ctx: &HandlerContext, batch: Vec<Message>) -> CoreResult<()> {
        let requested: IndexSet<EntityId> = batch
            .into_iter()
            .filter_map(|message| match message {
                Message::Recompute { target_id } => Some(target_id),
                _ => None,
            })
            .collect();
        let requested: Vec<EntityId> = requested.into_iter().collect();
        if requested.is_empty() {
            return Ok(());
        }

        let mut first = None;
        let requested = self.hydrate(ctx, requested, &mut first).await;
        let subtrees: HashMap<EntityId, Vec<EntityId>> = requested
            .iter()
            .map(|id| (id.clone(), ctx.cache.subtree(Direction::Descent, id)))
            .collect();

        let plan = GenerationPlan::build(&requested, &subtrees);
        let deferred = plan.deferred();
        debug!(
            generation = ctx.generation,
            requested = requested.len(),
            running = plan.first().len(),
            deferred = deferred.len(),
            cyclic = plan.is_cyclic(),
            "recompute wave"
        );
        ctx.enqueue_all(deferred.into_iter().map(Message::recompute));

        let results = join_all(plan.first().iter().map(|id| self.recompute(ctx, id))).await;

        for (id, result) in plan.first().iter().zip(results) {
            if let Err(err) = result {
                warn!(%id, error = %err, "recompute failed");
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
