//! Handler Context
//!
//! Everything a handler may touch is passed to it explicitly. There is no
//! process-wide bus and no ambient "current request"; the request and
//! connection identifiers travel with the context.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::message::Message;
use crate::config::CoreConfig;
use crate::evaluate::Evaluate;
use crate::graph::GraphCache;
use crate::store::StoreClient;

/// Per-wave view of the services and the outbox for the next wave.
pub struct HandlerContext {
    pub request_id: String,
    pub connection_id: Option<String>,

    /// Wave number within the current bus run, starting at 1. Zero outside
    /// of a run.
    pub generation: u32,

    pub store: Arc<dyn StoreClient>,
    pub cache: Arc<GraphCache>,
    pub evaluator: Arc<dyn Evaluate>,
    pub config: Arc<CoreConfig>,

    outbox: Mutex<Vec<Message>>,
}

impl HandlerContext {
    pub fn new(
        request_id: impl Into<String>,
        store: Arc<dyn StoreClient>,
        cache: Arc<GraphCache>,
        evaluator: Arc<dyn Evaluate>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            connection_id: None,
            generation: 0,
            store,
            cache,
            evaluator,
            config,
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// A context for wave `generation` sharing this one's services, with
    /// an empty outbox.
    pub fn for_generation(&self, generation: u32) -> Self {
        Self {
            request_id: self.request_id.clone(),
            connection_id: self.connection_id.clone(),
            generation,
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            evaluator: Arc::clone(&self.evaluator),
            config: Arc::clone(&self.config),
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// Queue a message for the next wave.
    pub fn enqueue(&self, message: Message) {
        self.outbox.lock().push(message);
    }

    pub fn enqueue_all<I: IntoIterator<Item = Message>>(&self, messages: I) {
        self.outbox.lock().extend(messages);
    }

    /// Drain everything queued so far.
    pub fn take_outbox(&self) -> Vec<Message> {
        std::mem::take(&mut *self.outbox.lock())
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().len()
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("request_id", &self.request_id)
            .field("connection_id", &self.connection_id)
            .field("generation", &self.generation)
            .field("pending", &self.pending())
            .finish()
    }
}
