//! Error Types
//!
//! Two layers of errors flow through the crate:
//!
//! - [`StoreError`] is what a [`StoreClient`](crate::store::StoreClient)
//!   reports. Conditional-write failures live here and are usually recovered
//!   by the optimistic-update retry loop before anybody else sees them.
//! - [`CoreError`] is what handlers and entry points return. It wraps store
//!   failures and adds the errors that are fatal to a single message
//!   (unknown tags, malformed rows, exhausted retries).
//! - [`EvaluationError`] is what a formula evaluation reports. It never
//!   leaves the cascade scheduler as an error; a failed formula becomes an
//!   error value stored in place of a result.

use thiserror::Error;

use crate::store::ItemKey;

/// Errors reported by a store backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// A conditional update or delete found a field that no longer holds the
    /// expected value.
    #[error("condition failed for {key}")]
    ConditionFailed { key: ItemKey },

    /// A multi-item transaction was rejected as a whole.
    #[error("transaction canceled: {reason}")]
    TransactionCanceled { reason: String },

    /// A batch or transaction exceeded the backend's size bound.
    #[error("batch of {len} operations exceeds limit of {limit}")]
    BatchTooLarge { len: usize, limit: usize },

    /// Anything else the backend failed on.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for the errors a retry against fresh state may clear.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::ConditionFailed { .. } | StoreError::TransactionCanceled { .. }
        )
    }
}

/// Errors surfaced by the propagation and cascade machinery.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The optimistic cycle lost every race it ran.
    #[error("gave up on {key} after {attempts} attempts")]
    RetriesExhausted { key: ItemKey, attempts: u32 },

    #[error("unknown entity tag: {0}")]
    UnknownTag(String),

    #[error("malformed entity id: {0}")]
    MalformedId(String),

    /// A stored row did not have the shape its range key promises.
    #[error("malformed item {key}: {reason}")]
    MalformedItem { key: ItemKey, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("envelope error: {0}")]
    Envelope(String),

    /// The bus kept producing waves past its configured bound.
    #[error("message bus exceeded {0} waves")]
    WaveLimitExceeded(u32),

    /// A handler failed for a reason of its own.
    #[error("handler {handler} failed: {reason}")]
    Handler { handler: String, reason: String },
}

impl CoreError {
    pub fn malformed(key: &ItemKey, reason: impl Into<String>) -> Self {
        Self::MalformedItem {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    pub fn handler(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for CoreError {
    fn from(value: rmp_serde::encode::Error) -> Self {
        CoreError::Envelope(value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CoreError {
    fn from(value: rmp_serde::decode::Error) -> Self {
        CoreError::Envelope(value.to_string())
    }
}

/// Errors from evaluating a formula.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    /// The formula read a name that is not among its bindings.
    #[error("unbound name '{0}'")]
    UnboundName(String),

    /// The formula tried to assign to a global.
    #[error("assignment to '{0}' is not allowed")]
    Assignment(String),

    #[error("instruction limit of {0} exceeded")]
    InstructionLimit(u32),

    /// The result (or a binding) has no JSON representation.
    #[error("value conversion failed: {0}")]
    Conversion(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type CoreResult<T> = Result<T, CoreError>;
