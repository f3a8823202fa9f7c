//! # The Query Compiler
//!
//! Queries are built with [`QueryBuilder`], compiled into a [`FetchPlan`] and
//! executed against a [`Context`](crate::Context), reading through the
//! context's pending changes. See each submodule for details:
//!
//! - [`predicate`]: expression trees and LIKE matching
//! - [`plan`]: specs, compilation, sorting, paging, aggregates, plan cache
//! - [`builder`]: the fluent builder and its terminals
//! - [`shortcuts`]: one-call helpers for the most common fetches

pub mod builder;
pub mod plan;
pub mod predicate;
pub mod shortcuts;

pub use builder::{ErrorHandler, QueryBuilder};
pub use plan::{
    Aggregate, Direction, FetchPlan, PlanCache, QuerySpec, SortKey, SortOrder,
    DEFAULT_PLAN_CACHE_CAPACITY,
};
pub use predicate::{CompareOp, Predicate};
