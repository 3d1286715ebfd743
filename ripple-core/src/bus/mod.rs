//! Message Bus
//!
//! A priority-ordered, type-filtered dispatcher that sequences the
//! propagator and the cascade scheduler into discrete waves.
//!
//! # Waves
//!
//! One dispatch pass takes everything pending, groups it by
//! [`MessageType`], and hands each matching handler the whole batch of its
//! type in one call, in ascending priority. Handlers enqueue follow-up
//! messages on their [`HandlerContext`]; those are held back until the pass
//! is over and form the next wave. No handler is ever re-entered from
//! within its own call.
//!
//! ```text
//! wave 1: [DescentUpdate x3] ──► Propagator ──┐
//!                                             │ outbox
//! wave 2: [DescentUpdate x1, Recompute x2] ◄──┘
//! ```
//!
//! [`MessageBus::run`] repeats passes until nothing is pending. A generation
//! counter bounds the number of waves; running past the bound is an error.
//!
//! # Failures
//!
//! A failing handler is logged and recorded in the [`BusReport`]; the rest
//! of the wave proceeds. The bus never retries a message. Retries live in
//! the store-write primitives, and redelivery is the ingestion layer's job.
//!
//! # Outward Notifications
//!
//! Messages of a type with no registered handler (room, map and perception
//! refreshes, unless the host registers something for them) are not
//! dropped: they are returned in [`BusReport::outbound`].

mod context;
mod message;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::cascade::CascadeScheduler;
use crate::error::{CoreError, CoreResult};
use crate::graph::Direction;
use crate::propagate::Propagator;

pub use context::HandlerContext;
pub use message::{DependentUpdate, Envelope, Message, MessageType};

/// Priority of the two edge-maintenance handlers.
pub const PROPAGATE_PRIORITY: i32 = 10;

/// Priority of the cascade scheduler. Runs after edges settled in a wave.
pub const CASCADE_PRIORITY: i32 = 20;

/// A bus callback. Receives every matching message of one wave at once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &HandlerContext, batch: Vec<Message>) -> CoreResult<()>;
}

type Predicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// A handler bound to a message type.
pub struct HandlerRegistration {
    message_type: MessageType,
    priority: i32,
    predicate: Option<Predicate>,
    handler: Arc<dyn MessageHandler>,
}

impl HandlerRegistration {
    pub fn new(message_type: MessageType, priority: i32, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            message_type,
            priority,
            predicate: None,
            handler,
        }
    }

    /// Only deliver messages the predicate accepts.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, message: &Message) -> bool {
        self.predicate.as_ref().map_or(true, |predicate| predicate(message))
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("message_type", &self.message_type)
            .field("priority", &self.priority)
            .field("handler", &self.handler.name())
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}

/// A handler call that returned an error.
#[derive(Debug, Clone, PartialEq)]
pub struct BusFailure {
    pub generation: u32,
    pub handler: String,
    pub error: String,
}

/// What a [`MessageBus::run`] did.
#[derive(Debug, Default)]
pub struct BusReport {
    /// Waves dispatched.
    pub waves: u32,
    /// Handler invocations.
    pub dispatched: usize,
    pub failures: Vec<BusFailure>,
    /// Messages no handler was registered for, in emission order.
    pub outbound: Vec<Message>,
}

impl BusReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Outbound messages of one type.
    pub fn outbound_of(&self, message_type: MessageType) -> impl Iterator<Item = &Message> {
        self.outbound
            .iter()
            .filter(move |message| message.message_type() == message_type)
    }
}

/// The wave dispatcher.
#[derive(Debug, Default)]
pub struct MessageBus {
    handlers: Vec<HandlerRegistration>,
    queue: Mutex<Vec<Message>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with the propagator for both directions and the cascade
    /// scheduler registered.
    pub fn with_core_handlers() -> Self {
        let mut bus = Self::new();
        bus.register(HandlerRegistration::new(
            MessageType::AncestryUpdate,
            PROPAGATE_PRIORITY,
            Arc::new(Propagator::new(Direction::Ancestry)),
        ));
        bus.register(HandlerRegistration::new(
            MessageType::DescentUpdate,
            PROPAGATE_PRIORITY,
            Arc::new(Propagator::new(Direction::Descent)),
        ));
        bus.register(HandlerRegistration::new(
            MessageType::Recompute,
            CASCADE_PRIORITY,
            Arc::new(CascadeScheduler::new()),
        ));
        bus
    }

    /// Add a handler. Handlers of equal priority run in registration order.
    pub fn register(&mut self, registration: HandlerRegistration) {
        let index = self
            .handlers
            .partition_point(|existing| existing.priority <= registration.priority);
        self.handlers.insert(index, registration);
    }

    pub fn enqueue(&self, message: Message) {
        self.queue.lock().push(message);
    }

    pub fn enqueue_all<I: IntoIterator<Item = Message>>(&self, messages: I) {
        self.queue.lock().extend(messages);
    }

    /// Decode a MessagePack [`Envelope`] and queue its messages.
    ///
    /// The envelope is handed back so the caller can build the run's
    /// context from it with [`Envelope::context`].
    pub fn enqueue_encoded(&self, bytes: &[u8]) -> CoreResult<Envelope> {
        let envelope = Envelope::decode(bytes)?;
        debug!(
            request_id = %envelope.request_id,
            messages = envelope.messages.len(),
            "enqueued envelope"
        );
        self.enqueue_all(envelope.messages.iter().cloned());
        Ok(envelope)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn handles(&self, message_type: MessageType) -> bool {
        self.handlers
            .iter()
            .any(|registration| registration.message_type == message_type)
    }

    /// Dispatch waves until the queue drains.
    ///
    /// Messages already sitting in `ctx`'s outbox are queued first, so an
    /// entry point such as
    /// [`CascadeScheduler::set_variable`](crate::cascade::CascadeScheduler::set_variable)
    /// can be followed directly by a run.
    pub async fn run(&self, ctx: &HandlerContext) -> CoreResult<BusReport> {
        self.enqueue_all(ctx.take_outbox());

        let mut report = BusReport::default();
        loop {
            let pending = std::mem::take(&mut *self.queue.lock());
            if pending.is_empty() {
                break;
            }
            if report.waves >= ctx.config.max_waves {
                // Put the work back so the caller can inspect what looped.
                self.enqueue_all(pending);
                return Err(CoreError::WaveLimitExceeded(ctx.config.max_waves));
            }
            report.waves += 1;
            let wave = ctx.for_generation(report.waves);

            let mut by_type: IndexMap<MessageType, Vec<Message>> = IndexMap::new();
            for message in pending {
                if self.handles(message.message_type()) {
                    by_type.entry(message.message_type()).or_default().push(message);
                } else {
                    report.outbound.push(message);
                }
            }
            debug!(
                generation = wave.generation,
                types = by_type.len(),
                messages = by_type.values().map(Vec::len).sum::<usize>(),
                "dispatching wave"
            );

            for registration in &self.handlers {
                let Some(messages) = by_type.get(&registration.message_type) else {
                    continue;
                };
                let batch: Vec<Message> = messages
                    .iter()
                    .filter(|message| registration.accepts(message))
                    .cloned()
                    .collect();
                if batch.is_empty() {
                    continue;
                }

                let handler = registration.handler.name().to_string();
                report.dispatched += 1;
                if let Err(err) = registration.handler.handle(&wave, batch).await {
                    error!(generation = wave.generation, %handler, error = %err, "handler failed");
                    report.failures.push(BusFailure {
                        generation: wave.generation,
                        handler,
                        error: err.to_string(),
                    });
                }
            }

            self.enqueue_all(wave.take_outbox());
        }

        debug!(
            waves = report.waves,
            dispatched = report.dispatched,
            failures = report.failures.len(),
            "bus drained"
        );
        Ok(report)
    }
}
