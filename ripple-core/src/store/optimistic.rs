//! Optimistic Update
//!
//! A compare-and-swap cycle with field-level granularity over a single row.
//!
//! # Algorithm
//!
//! 1. Fetch the projection of the update keys (or reuse a prior fetch on the
//!    first attempt).
//! 2. Run the reducer over a mutable draft of the fetched state.
//! 3. Diff the draft against the fetched state. An empty diff returns the
//!    fetched state without writing.
//! 4. Write conditionally: every changed or removed field must still hold
//!    its old value, every added field must still be absent, and every
//!    check key must still hold whatever was read for it.
//! 5. On a failed precondition, back off exponentially, re-fetch and run the
//!    reducer again from fresh state. The number of retries is bounded;
//!    running out is an error for the caller.
//!
//! Reducers must be pure: a retry recomputes from re-fetched state, so a
//! reducer that depends on anything else could write a value derived from
//! data that no longer exists.

use std::fmt;

use tracing::{debug, warn};

use super::types::{project, Attributes, Condition, ItemKey, UpdateRequest};
use super::StoreClient;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, StoreError};

type DeletePredicate = Box<dyn Fn(&Attributes) -> bool + Send + Sync>;
type CascadeKeys = Box<dyn Fn(&Attributes) -> Vec<ItemKey> + Send + Sync>;

/// Result of a completed optimistic cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticOutcome {
    /// The row's projected state after the cycle; `None` if it does not exist.
    pub state: Option<Attributes>,
    /// Whether a write (update or delete) was issued and accepted.
    pub written: bool,
    /// Whether the row was deleted.
    pub deleted: bool,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// A single-row read-modify-conditional-write request.
///
/// ```rust,ignore
/// let outcome = OptimisticUpdate::new(key, ["edges"])
///     .delete_when(|state| edges_empty(state))
///     .run(&store, |draft| {
///         draft.insert("edges".into(), json!([]));
///         Ok(())
///     })
///     .await?;
/// ```
pub struct OptimisticUpdate {
    key: ItemKey,
    update_keys: Vec<String>,
    check_keys: Vec<String>,
    prior_fetch: Option<Option<Attributes>>,
    delete_when: Option<DeletePredicate>,
    delete_cascade: Option<CascadeKeys>,
    config: CoreConfig,
}

impl fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("key", &self.key)
            .field("update_keys", &self.update_keys)
            .field("check_keys", &self.check_keys)
            .field("has_prior_fetch", &self.prior_fetch.is_some())
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}

impl OptimisticUpdate {
    /// Start a request for `key` that may modify `update_keys`.
    pub fn new<I, S>(key: ItemKey, update_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key,
            update_keys: update_keys.into_iter().map(Into::into).collect(),
            check_keys: Vec::new(),
            prior_fetch: None,
            delete_when: None,
            delete_cascade: None,
            config: CoreConfig::default(),
        }
    }

    /// Fields that must be unchanged for the write to land, even when the
    /// reducer leaves them alone.
    pub fn check_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Use an already-fetched state for the first attempt.
    pub fn prior_fetch(mut self, state: Option<Attributes>) -> Self {
        self.prior_fetch = Some(state);
        self
    }

    /// Delete the row instead of updating it when the new state matches.
    pub fn delete_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Attributes) -> bool + Send + Sync + 'static,
    {
        self.delete_when = Some(Box::new(predicate));
        self
    }

    /// Extra rows to delete after the primary delete. Not transactional.
    pub fn delete_cascade<F>(mut self, keys: F) -> Self
    where
        F: Fn(&Attributes) -> Vec<ItemKey> + Send + Sync + 'static,
    {
        self.delete_cascade = Some(Box::new(keys));
        self
    }

    /// Take retry bound and backoff from a configuration.
    pub fn config(mut self, config: &CoreConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    fn projection(&self) -> Vec<String> {
        let mut fields = self.update_keys.clone();
        for key in &self.check_keys {
            if !fields.contains(key) {
                fields.push(key.clone());
            }
        }
        fields
    }

    /// Run the cycle until a write lands, nothing needs writing, or the
    /// retry bound is exhausted.
    pub async fn run<S, R>(mut self, store: &S, reducer: R) -> CoreResult<OptimisticOutcome>
    where
        S: StoreClient + ?Sized,
        R: Fn(&mut Attributes) -> CoreResult<()> + Send + Sync,
    {
        let projection = self.projection();
        let mut prior = self.prior_fetch.take();
        let attempts = self.config.max_retries + 1;

        for attempt in 0..attempts {
            let fetched = match prior.take() {
                Some(state) => state.map(|attrs| project(&attrs, &projection)),
                None => store
                    .get(&self.key, &projection)
                    .await?
                    .map(|item| item.attributes),
            };
            let old = fetched.clone().unwrap_or_default();
            let mut draft = old.clone();
            reducer(&mut draft)?;

            let result = if self.should_delete(&draft) {
                if fetched.is_none() {
                    return Ok(OptimisticOutcome {
                        state: None,
                        written: false,
                        deleted: false,
                        attempts: attempt + 1,
                    });
                }
                self.try_delete(store, &projection, &old, &draft, attempt)
                    .await
            } else {
                let request = self.build_request(&old, &draft);
                if request.is_empty() {
                    return Ok(OptimisticOutcome {
                        state: fetched,
                        written: false,
                        deleted: false,
                        attempts: attempt + 1,
                    });
                }
                store.update(request).await.map(|item| OptimisticOutcome {
                    state: Some(project(&item.attributes, &projection)),
                    written: true,
                    deleted: false,
                    attempts: attempt + 1,
                })
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_conflict() => {
                    if attempt + 1 < attempts {
                        let delay = self.config.backoff(attempt);
                        debug!(key = %self.key, attempt, ?delay, "optimistic write lost a race, retrying");
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(key = %self.key, attempts, "optimistic write exhausted its retries");
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(CoreError::RetriesExhausted {
            key: self.key,
            attempts,
        })
    }

    fn should_delete(&self, state: &Attributes) -> bool {
        self.delete_when
            .as_ref()
            .map_or(false, |predicate| predicate(state))
    }

    async fn try_delete<S>(
        &self,
        store: &S,
        projection: &[String],
        old: &Attributes,
        draft: &Attributes,
        attempt: u32,
    ) -> Result<OptimisticOutcome, StoreError>
    where
        S: StoreClient + ?Sized,
    {
        let conditions: Vec<_> = projection
            .iter()
            .map(|field| Condition::unchanged(field.as_str(), old.get(field)))
            .collect();
        store.delete(&self.key, &conditions).await?;

        if let Some(cascade) = &self.delete_cascade {
            for key in cascade(draft) {
                if let Err(err) = store.delete(&key, &[]).await {
                    warn!(primary = %self.key, cascade = %key, error = %err, "cascade delete failed");
                }
            }
        }

        Ok(OptimisticOutcome {
            state: None,
            written: true,
            deleted: true,
            attempts: attempt + 1,
        })
    }

    fn build_request(&self, old: &Attributes, new: &Attributes) -> UpdateRequest {
        let mut request = UpdateRequest::new(self.key.clone());

        for (field, value) in new {
            if old.get(field) != Some(value) {
                request.set.insert(field.clone(), value.clone());
                request
                    .conditions
                    .push(Condition::unchanged(field.as_str(), old.get(field)));
            }
        }
        for (field, value) in old {
            if !new.contains_key(field) {
                request.remove.push(field.clone());
                request
                    .conditions
                    .push(Condition::equals(field.as_str(), value.clone()));
            }
        }
        for field in &self.check_keys {
            let touched = request.set.contains_key(field) || request.remove.contains(field);
            if !touched {
                request
                    .conditions
                    .push(Condition::unchanged(field.as_str(), old.get(field)));
            }
        }

        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Item, MemoryStore};
    use crate::testing::{fast_config as fast, FlakyStore};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn key() -> ItemKey {
        ItemKey::new("VARIABLE#count", "Meta::Variable")
    }

    fn increment(draft: &mut Attributes) -> CoreResult<()> {
        let next = draft.get("value").and_then(Value::as_i64).unwrap_or(0) + 1;
        draft.insert("value".into(), json!(next));
        Ok(())
    }

    #[tokio::test]
    async fn creates_missing_row() {
        let store = MemoryStore::new();
        let outcome = OptimisticUpdate::new(key(), ["value"])
            .run(&store, increment)
            .await
            .unwrap();
        assert!(outcome.written);
        assert_eq!(outcome.state.unwrap().get("value"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn empty_diff_issues_no_write() {
        let store = MemoryStore::new();
        store.insert(Item::new(key(), Attributes::new()).with("value", json!(3)));

        let outcome = OptimisticUpdate::new(key(), ["value"])
            .run(&store, |_draft| Ok(()))
            .await
            .unwrap();

        assert!(!outcome.written);
        assert_eq!(outcome.state.unwrap().get("value"), Some(&json!(3)));
        assert_eq!(store.stats().updates, 0);
    }

    #[tokio::test]
    async fn converges_after_repeated_conflicts() {
        let inner = Arc::new(MemoryStore::new());
        inner.insert(Item::new(key(), Attributes::new()).with("value", json!(10)));
        let store = FlakyStore::new(inner.clone()).fail_updates(3);

        let outcome = OptimisticUpdate::new(key(), ["value"])
            .config(&fast())
            .run(&store, increment)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 4);
        assert_eq!(inner.snapshot(&key()).unwrap().get("value"), Some(&json!(11)));
    }

    #[tokio::test]
    async fn retries_recompute_from_fresh_state() {
        let inner = Arc::new(MemoryStore::new());
        inner.insert(Item::new(key(), Attributes::new()).with("value", json!(10)));
        // Another writer bumps the counter right before our first write lands.
        let store = FlakyStore::new(inner.clone()).interleave(1, |store| {
            let mut attrs = store.snapshot(&key()).unwrap_or_default();
            attrs.insert("value".into(), json!(20));
            store.insert(Item::new(key(), attrs));
        });

        OptimisticUpdate::new(key(), ["value"])
            .config(&fast())
            .run(&store, increment)
            .await
            .unwrap();

        assert_eq!(inner.snapshot(&key()).unwrap().get("value"), Some(&json!(21)));
    }

    #[tokio::test]
    async fn exhausting_retries_is_an_error() {
        let inner = Arc::new(MemoryStore::new());
        let store = FlakyStore::new(inner).fail_updates(10);

        let err = OptimisticUpdate::new(key(), ["value"])
            .config(&fast())
            .max_retries(2)
            .run(&store, increment)
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn check_keys_guard_unchanged_fields() {
        let inner = Arc::new(MemoryStore::new());
        inner.insert(
            Item::new(key(), Attributes::new())
                .with("value", json!(1))
                .with("src", json!("a")),
        );
        let store = FlakyStore::new(inner.clone()).interleave(1, |store| {
            let mut attrs = store.snapshot(&key()).unwrap_or_default();
            attrs.insert("src".into(), json!("b"));
            store.insert(Item::new(key(), attrs));
        });

        let outcome = OptimisticUpdate::new(key(), ["value"])
            .check_keys(["src"])
            .config(&fast())
            .run(&store, increment)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        let state = outcome.state.unwrap();
        assert_eq!(state.get("src"), Some(&json!("b")));
        assert_eq!(state.get("value"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn delete_condition_removes_row_and_cascades() {
        let store = MemoryStore::new();
        let side = ItemKey::new("VARIABLE#count", "Graph::Descent");
        store.insert(Item::new(key(), Attributes::new()).with("value", json!(1)));
        store.insert(Item::new(side.clone(), Attributes::new()));

        let cascade_key = side.clone();
        let outcome = OptimisticUpdate::new(key(), ["value"])
            .delete_when(|state| state.get("value") == Some(&json!(0)))
            .delete_cascade(move |_| vec![cascade_key.clone()])
            .run(&store, |draft| {
                draft.insert("value".into(), json!(0));
                Ok(())
            })
            .await
            .unwrap();

        assert!(outcome.deleted);
        assert!(store.snapshot(&key()).is_none());
        assert!(store.snapshot(&side).is_none());
    }

    #[tokio::test]
    async fn prior_fetch_skips_first_read() {
        let store = MemoryStore::new();
        store.insert(Item::new(key(), Attributes::new()).with("value", json!(5)));
        let prior = store.snapshot(&key());

        let outcome = OptimisticUpdate::new(key(), ["value"])
            .prior_fetch(prior)
            .run(&store, increment)
            .await
            .unwrap();

        assert_eq!(outcome.state.unwrap().get("value"), Some(&json!(6)));
    }
}
