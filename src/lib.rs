//! # LayerDB - Layered Contexts over an Embedded Store
//!
//! LayerDB manages a hierarchy of thread-confined mutation contexts over one
//! SQLite-backed object store, and compiles declarative queries into fetches
//! over it. It provides:
//!
//! - **Per-thread contexts**: each thread stages changes in its own context
//! - **Save propagation**: a child's save merges into the primary at once and
//!   is committed asynchronously by the primary's worker
//! - **Save notifications**: every save reports success or failure on a
//!   broadcast notifier
//! - **A query builder**: predicates, ordering, paging, counts and aggregates
//! - **Live observations**: query results that push incremental deltas
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      ContextRegistry                            │
//! │        (thread → context map, perform on the primary)           │
//! └──────┬──────────────────┬──────────────────┬────────────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//!   ┌─────────┐        ┌─────────┐        ┌─────────┐
//!   │  ctx-1  │        │  ctx-2  │        │  ctx-3  │   QueryBuilder reads
//!   └────┬────┘        └────┬────┘        └────┬────┘   through any of these
//!        └──── save: merge ─┼──────────────────┘
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Primary Context + Worker                      │
//! │     (single thread, serializes every commit to the store)       │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ commit            ┌──────────────┐
//!                               ├──────────────────►│   Notifier   │──► save events,
//!                               ▼                   └──────────────┘    observations
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   StoreHandle (SQLite)                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Thread confinement**: a context is only used from the thread it is
//!    bound to; anything else is a `ThreadAffinityViolation`
//! 2. **One event per save**: every `save()` publishes exactly one success or
//!    failure event
//! 3. **Ordered propagation**: saves from one context reach the store in the
//!    order they were made
//! 4. **Atomic commits**: a context's save is committed in one transaction
//! 5. **Stable identity**: object ids never change across saves or restarts
//!
//! ## Module Organization
//!
//! - [`error`]: the error enum and its numeric codes
//! - [`types`]: ids, generations, values and records
//! - [`model`]: entity descriptors
//! - [`schema`] / [`codec`] / [`store`]: SQLite persistence
//! - [`context`] / [`entity`]: contexts and the entities they hand out
//! - [`actor`]: the primary context's worker thread
//! - [`registry`]: the entry point
//! - [`notify`]: save notifications
//! - [`query`]: the query builder and fetch compiler
//! - [`observe`]: live observation handles
//! - [`import`]: bulk import through a context
//! - [`config`] / [`observability`]: configuration and tracing setup
//!
//! ## Example
//!
//! ```rust,no_run
//! use layerdb::{AttributeType, ContextRegistry, EntityDescriptor, Model, Result};
//!
//! fn main() -> Result<()> {
//!     let model = Model::new("music").with_entity(
//!         EntityDescriptor::new("Artist").required("name", AttributeType::Text),
//!     );
//!     let registry = ContextRegistry::open_in_memory(model)?;
//!
//!     let ctx = registry.current();
//!     let mut artist = ctx.create_named("Artist")?;
//!     artist.set("name", "Nina Simone")?;
//!     ctx.save()?;
//!
//!     let count = ctx.query("Artist")?.count(&ctx)?;
//!     assert_eq!(count, 1);
//!     Ok(())
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types and the `layerdb` error domain.
pub mod error;

/// Identity tokens, generations, attribute values and records.
pub mod types;

/// Entity and relationship descriptors.
pub mod model;

/// SQLite schema and database initialization.
pub mod schema;

/// Record payload encoding and checksums.
pub mod codec;

/// The shared persistent store.
pub mod store;

/// Thread-confined mutation contexts and save propagation.
pub mod context;

/// Handles to entities staged or fetched in a context.
pub mod entity;

/// The primary context's worker thread.
pub mod actor;

/// Thread-to-context registry.
pub mod registry;

/// Save and commit notifications.
pub mod notify;

/// The query builder and fetch compiler.
pub mod query;

/// Live observation of query results.
pub mod observe;

/// Bulk import through a context.
pub mod import;

/// Store configuration.
pub mod config;

/// Tracing subscriber setup.
pub mod observability;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConfigCell, StoreConfig};
pub use context::Context;
pub use entity::ManagedEntity;
pub use error::{Error, ErrorInfo, Result, ERROR_DOMAIN};
pub use import::{FieldHooks, ImportBuilder, ImportReport, ImportSource, Record};
pub use model::{AttributeDescriptor, Cardinality, EntityDescriptor, Model, RelationshipDescriptor};
pub use notify::{Notifier, SaveEvent, SaveSubscription, SaveTicket, SaveTopic};
pub use observe::{ChangeBatch, Delta, ObservationHandle, Section};
pub use query::{
    Aggregate, CompareOp, Direction, ErrorHandler, Predicate, QueryBuilder, QuerySpec, SortKey,
    SortOrder,
};
pub use registry::ContextRegistry;
pub use schema::Database;
pub use store::StoreHandle;

pub use types::{
    AttributeType, ContextId, Generation, ObjectId, ObjectRecord, ThreadKey, Value,
};
