//! Merge Reconciliation
//!
//! Brings the rows selected by a query in line with a desired set of rows.
//!
//! Both sides are keyed by `(partition, range)`. Every key of the union is
//! classified as matched, incoming-only or current-only and handed to a
//! merge function, which decides to ignore it, delete it, or put a
//! replacement. Non-ignore actions are written in bounded batches.
//!
//! The transactional variant lets a factory attach extra operations to an
//! action. Actions without extras still share ordinary batch writes; each
//! action with extras commits atomically with them in its own transaction.
//!
//! A put is always written under the key of the candidate it answers,
//! whatever key the returned item carries. A put that reproduces the
//! current row exactly is counted as ignored, so a second run over
//! reconciled data writes nothing.

use indexmap::IndexMap;
use tracing::debug;

use super::types::{Item, ItemKey, Query, TransactOp, WriteOp};
use super::StoreClient;
use crate::config::CoreConfig;
use crate::error::CoreResult;

/// One key of the union handed to the merge function.
#[derive(Debug, Clone, Copy)]
pub struct MergeCandidate<'a> {
    pub key: &'a ItemKey,
    pub incoming: Option<&'a Item>,
    pub current: Option<&'a Item>,
}

impl MergeCandidate<'_> {
    pub fn is_matched(&self) -> bool {
        self.incoming.is_some() && self.current.is_some()
    }
}

/// What to do with one key.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    Ignore,
    Delete,
    Put(Item),
}

/// Tally of a reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub puts: usize,
    pub deletes: usize,
    pub ignored: usize,
    pub batches: usize,
    pub transactions: usize,
}

impl MergeReport {
    /// Number of writes the run performed.
    pub fn actions(&self) -> usize {
        self.puts + self.deletes
    }
}

/// Reconcile the rows selected by `query` with `items`.
pub async fn merge<S, F>(
    store: &S,
    query: &Query,
    items: Vec<Item>,
    config: &CoreConfig,
    merge_fn: F,
) -> CoreResult<MergeReport>
where
    S: StoreClient + ?Sized,
    F: FnMut(MergeCandidate<'_>) -> MergeAction + Send,
{
    merge_transact(store, query, items, config, merge_fn, |_, _| Vec::new()).await
}

/// Reconcile like [`merge`], committing each action that carries extra
/// operations atomically with them.
pub async fn merge_transact<S, F, T>(
    store: &S,
    query: &Query,
    items: Vec<Item>,
    config: &CoreConfig,
    merge_fn: F,
    mut transact_factory: T,
) -> CoreResult<MergeReport>
where
    S: StoreClient + ?Sized,
    F: FnMut(MergeCandidate<'_>) -> MergeAction + Send,
    T: FnMut(&ItemKey, &MergeAction) -> Vec<TransactOp> + Send,
{
    let current = store.query(query).await?;
    let (actions, mut report) = resolve(current, items, merge_fn);

    let mut plain = Vec::new();
    let mut transactions = Vec::new();
    for (key, action) in actions {
        let extras = transact_factory(&key, &action);
        match &action {
            MergeAction::Put(_) => report.puts += 1,
            MergeAction::Delete => report.deletes += 1,
            MergeAction::Ignore => continue,
        }
        let op = match action {
            MergeAction::Put(item) => WriteOp::Put(item),
            MergeAction::Delete => WriteOp::Delete(key),
            MergeAction::Ignore => continue,
        };
        if extras.is_empty() {
            plain.push(op);
        } else {
            let mut ops = Vec::with_capacity(extras.len() + 1);
            ops.push(TransactOp::from(op));
            ops.extend(extras);
            transactions.push(ops);
        }
    }

    let limit = config.batch_write_limit.max(1);
    for chunk in plain.chunks(limit) {
        store.batch_write(chunk.to_vec()).await?;
        report.batches += 1;
    }
    for ops in transactions {
        store.transact_write(ops).await?;
        report.transactions += 1;
    }

    debug!(
        puts = report.puts,
        deletes = report.deletes,
        ignored = report.ignored,
        batches = report.batches,
        transactions = report.transactions,
        "merge reconciled"
    );
    Ok(report)
}

/// Classify the union of both sides and collect non-ignore actions.
fn resolve<F>(current: Vec<Item>, incoming: Vec<Item>, mut merge_fn: F) -> (Vec<(ItemKey, MergeAction)>, MergeReport)
where
    F: FnMut(MergeCandidate<'_>) -> MergeAction,
{
    let current: IndexMap<ItemKey, Item> = current
        .into_iter()
        .map(|item| (item.key.clone(), item))
        .collect();
    let incoming: IndexMap<ItemKey, Item> = incoming
        .into_iter()
        .map(|item| (item.key.clone(), item))
        .collect();

    let mut keys: Vec<&ItemKey> = current.keys().collect();
    keys.extend(incoming.keys().filter(|key| !current.contains_key(*key)));

    let mut report = MergeReport::default();
    let mut actions = Vec::new();
    for key in keys {
        let existing = current.get(key);
        let action = merge_fn(MergeCandidate {
            key,
            incoming: incoming.get(key),
            current: existing,
        });
        let action = match action {
            MergeAction::Put(item) if &item.key != key => {
                debug!(candidate = %key, returned = %item.key, "merge put rekeyed to its candidate");
                MergeAction::Put(Item::new(key.clone(), item.attributes))
            }
            other => other,
        };
        let effective = match action {
            MergeAction::Put(item) if existing == Some(&item) => MergeAction::Ignore,
            MergeAction::Delete if existing.is_none() => MergeAction::Ignore,
            other => other,
        };
        if effective == MergeAction::Ignore {
            report.ignored += 1;
        } else {
            actions.push((key.clone(), effective));
        }
    }
    (actions, report)
}
