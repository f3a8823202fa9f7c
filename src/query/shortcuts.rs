//! One-call fetch helpers.
//!
//! Each helper is a thin composition over [`QueryBuilder`] for a fetch that
//! application code writes over and over: everything of a type, everything in
//! an order, the rows where one attribute equals or resembles a value, the
//! first such row, and a sectioned live view.

use crate::context::Context;
use crate::entity::ManagedEntity;
use crate::error::Result;
use crate::observe::ObservationHandle;
use crate::types::Value;

use super::plan::SortOrder;
use super::predicate::Predicate;

/// Every visible entity of a type, in identity order.
pub fn all_of(ctx: &Context, entity: &str) -> Result<Vec<ManagedEntity>> {
    ctx.query(entity)?.all(ctx)
}

/// Every visible entity of a type, sorted.
pub fn all_ordered_by(
    ctx: &Context,
    entity: &str,
    order: impl Into<SortOrder>,
) -> Result<Vec<ManagedEntity>> {
    ctx.query(entity)?.order(order).all(ctx)
}

/// Entities where `attribute = value`.
pub fn where_eq(
    ctx: &Context,
    entity: &str,
    attribute: &str,
    value: impl Into<Value>,
) -> Result<Vec<ManagedEntity>> {
    ctx.query(entity)?.where_eq(attribute, value).all(ctx)
}

/// Entities where `attribute = value`, sorted.
pub fn where_eq_ordered(
    ctx: &Context,
    entity: &str,
    attribute: &str,
    value: impl Into<Value>,
    order: impl Into<SortOrder>,
) -> Result<Vec<ManagedEntity>> {
    ctx.query(entity)?
        .where_eq(attribute, value)
        .order(order)
        .all(ctx)
}

/// Entities where `attribute LIKE pattern` (case-insensitive), sorted.
pub fn where_like_ordered(
    ctx: &Context,
    entity: &str,
    attribute: &str,
    pattern: &str,
    order: impl Into<SortOrder>,
) -> Result<Vec<ManagedEntity>> {
    ctx.query(entity)?
        .filter(Predicate::ilike(attribute, pattern))
        .order(order)
        .all(ctx)
}

/// The first entity (by identity) where `attribute = value`.
pub fn one_where(
    ctx: &Context,
    entity: &str,
    attribute: &str,
    value: impl Into<Value>,
) -> Result<Option<ManagedEntity>> {
    ctx.query(entity)?.where_eq(attribute, value).first(ctx)
}

/// Number of visible entities of a type.
pub fn count_of(ctx: &Context, entity: &str) -> Result<usize> {
    ctx.query(entity)?.count(ctx)
}

/// Marks every visible entity of a type for deletion.
pub fn delete_all_of(ctx: &Context, entity: &str) -> Result<usize> {
    let descriptor = ctx.entity(entity)?;
    ctx.delete_all(&descriptor)
}

/// A sorted live view grouped into sections by `section_by`.
pub fn observe_sectioned(
    ctx: &Context,
    entity: &str,
    order: impl Into<SortOrder>,
    section_by: &str,
) -> Result<ObservationHandle> {
    ctx.query(entity)?
        .order(order)
        .section_by(section_by)
        .observe(ctx)
}
