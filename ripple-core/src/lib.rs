//! Ripple Core
//!
//! This crate keeps a multiplayer world's derived state consistent. Entities
//! (variables, computed values, rooms, maps, ...) depend on each other; when
//! one changes, everything downstream must be re-evaluated and the clients
//! looking at it told. It implements:
//!
//! - A two-directional dependency graph stored as mirrored edge rows, with a
//!   local cache that hydrates whole subtrees
//! - An optimistic read-modify-conditional-write cycle for single rows
//! - Reconciliation of a stored row set against a desired one
//! - Propagation of edge changes, with connections rippling outward
//! - Ordered re-evaluation of computed values in a sandboxed Lua engine
//! - A priority message bus that runs it all in waves
//!
//! The remote key-value store is the only shared mutable resource; every
//! write to it is conditional, so any number of processes may run the same
//! handlers against it at once.
//!
//! # Architecture
//!
//! - `store`: the store capability trait, optimistic updates, merging, and an
//!   in-memory implementation
//! - `graph`: edges, nodes, the subtree cache and generation ordering
//! - `bus`: messages, the per-request context and the wave loop
//! - `propagate`: the `AncestryUpdate`/`DescentUpdate` handler
//! - `cascade`: the `Recompute` handler and variable writes
//! - `evaluate`: formula evaluation
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ripple_core::{CascadeScheduler, CoreConfig, DependentUpdate, EntityId, AssetId};
//! use ripple_core::{GraphCache, HandlerContext, LuaEvaluator, MemoryStore, MessageBus, MessageType};
//!
//! let store = Arc::new(MemoryStore::new());
//! let ctx = HandlerContext::new(
//!     "req-1",
//!     store,
//!     Arc::new(GraphCache::new()),
//!     Arc::new(LuaEvaluator::new()),
//!     Arc::new(CoreConfig::default()),
//! );
//!
//! let bus = MessageBus::with_core_handlers();
//! let power = EntityId::variable("power");
//! let active = EntityId::computed("active");
//! bus.enqueue_all(DependentUpdate::link(&power, &active, None, &AssetId::new("base")));
//! bus.run(&ctx).await?;
//!
//! CascadeScheduler::set_variable(&ctx, &power, serde_json::json!(false)).await?;
//! let report = bus.run(&ctx).await?;
//! for perception in report.outbound_of(MessageType::Perception) {
//!     // hand to the presentation layer
//! }
//! ```

pub mod bus;
pub mod cascade;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod graph;
pub mod ids;
pub mod propagate;
pub mod store;

#[doc(hidden)]
pub mod testing;

pub use bus::{
    BusReport, DependentUpdate, Envelope, HandlerContext, HandlerRegistration, Message, MessageBus,
    MessageHandler, MessageType,
};
pub use cascade::CascadeScheduler;
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, EvaluationError, StoreError};
pub use evaluate::{Bindings, Evaluate, LuaEvaluator};
pub use graph::{DependencyEdge, Direction, GraphCache};
pub use ids::{AssetId, EntityId, EntityTag};
pub use propagate::Propagator;
pub use store::{MemoryStore, StoreClient};
