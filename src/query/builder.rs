//! # QueryBuilder
//!
//! The fluent front end of the fetch compiler. Builder methods only record
//! intent; nothing is checked or fetched until a terminal runs:
//!
//! ```text
//!  QueryBuilder ── filter / order / limit / offset / section_by / cache_token
//!       │
//!       │ terminal (first, all, each, count, min, max, sum, observe)
//!       ▼
//!  FetchPlan::compile   name and type checks, no store access
//!       │
//!       ▼
//!  ctx.view(entity)     store rows + the context's pending changes
//!       │
//!       ▼
//!  plan.execute / count / aggregate
//! ```
//!
//! ## Accumulation Rules
//!
//! Every setter replaces the previous value except [`QueryBuilder::filter`],
//! whose calls are ANDed together.
//!
//! ## Errors
//!
//! Terminals return `Result`. If an `on_error` handler is installed, errors go
//! to the handler instead and the terminal returns an empty result (`None`,
//! an empty `Vec`, `0`, or `Null`). `observe` has no empty form, so it calls
//! the handler and still returns the error.
//!
//! ```rust,no_run
//! # use layerdb::{ContextRegistry, Predicate, Result};
//! # fn demo(registry: &ContextRegistry) -> Result<()> {
//! let ctx = registry.current();
//! let top = ctx
//!     .query("Album")?
//!     .filter(Predicate::gt("score", 1))
//!     .order("score desc")
//!     .limit(10)
//!     .all(&ctx)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use super::plan::{Aggregate, FetchPlan, QuerySpec, SortOrder};
use super::predicate::Predicate;
use crate::context::Context;
use crate::entity::ManagedEntity;
use crate::error::{Error, Result};
use crate::model::EntityDescriptor;
use crate::observe::ObservationHandle;
use crate::types::Value;

/// Receives errors from terminals when installed with
/// [`QueryBuilder::on_error`].
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Accumulates a query against one entity.
#[derive(Clone)]
pub struct QueryBuilder {
    entity: Arc<EntityDescriptor>,
    spec: QuerySpec,
    on_error: Option<ErrorHandler>,
}

impl fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("spec", &self.spec)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl Context {
    /// Starts a query on an entity of this context's model.
    pub fn query(&self, entity: &str) -> Result<QueryBuilder> {
        Ok(QueryBuilder::new(self.entity(entity)?))
    }
}

impl QueryBuilder {
    pub fn new(entity: Arc<EntityDescriptor>) -> Self {
        let spec = QuerySpec::new(entity.name());
        Self {
            entity,
            spec,
            on_error: None,
        }
    }

    // =========================================================================
    // Builder Methods
    // =========================================================================

    /// Adds a predicate, ANDed with any previous ones.
    ///
    /// Accepts a [`Predicate`], an `(attribute, value)` pair, or an equality
    /// map.
    pub fn filter(mut self, predicate: impl Into<Predicate>) -> Self {
        let current = std::mem::take(&mut self.spec.predicate);
        self.spec.predicate = current.and(predicate);
        self
    }

    /// `attribute = value`.
    pub fn where_eq(self, attribute: &str, value: impl Into<Value>) -> Self {
        self.filter(Predicate::eq(attribute, value))
    }

    /// `attribute LIKE pattern`.
    pub fn where_like(self, attribute: &str, pattern: &str) -> Self {
        self.filter(Predicate::like(attribute, pattern))
    }

    /// Sets the sort order, replacing any previous one.
    pub fn order(mut self, order: impl Into<SortOrder>) -> Self {
        self.spec.sort = order.into().0;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.spec.offset = Some(offset);
        self
    }

    /// Routes terminal errors to `handler` instead of returning them.
    pub fn on_error(mut self, handler: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Groups observed results into sections by an attribute.
    pub fn section_by(mut self, attribute: &str) -> Self {
        self.spec.section_by = Some(attribute.to_string());
        self
    }

    /// Names this query so observations of an identical query share one
    /// compiled plan.
    pub fn cache_token(mut self, token: &str) -> Self {
        self.spec.cache_token = Some(token.to_string());
        self
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn entity(&self) -> &Arc<EntityDescriptor> {
        &self.entity
    }

    /// Compiles the query without running it.
    pub fn validate(&self) -> Result<FetchPlan> {
        FetchPlan::compile(Arc::clone(&self.entity), self.spec.clone())
    }

    // =========================================================================
    // Terminals
    // =========================================================================

    /// The first match in order. Any explicit limit is ignored.
    pub fn first(&self, ctx: &Context) -> Result<Option<ManagedEntity>> {
        let result = self.fetch_first(ctx);
        self.route(result, || None)
    }

    /// All matches, honoring order, offset and limit.
    pub fn all(&self, ctx: &Context) -> Result<Vec<ManagedEntity>> {
        let result = self.fetch(ctx);
        self.route(result, Vec::new)
    }

    /// Calls `f` for each match in the same order as [`QueryBuilder::all`].
    /// Returns how many were delivered.
    pub fn each(&self, ctx: &Context, mut f: impl FnMut(ManagedEntity)) -> Result<usize> {
        let result = self.fetch(ctx).map(|rows| {
            let n = rows.len();
            rows.into_iter().for_each(&mut f);
            n
        });
        self.route(result, || 0)
    }

    /// Number of predicate matches. Limit and offset do not apply.
    pub fn count(&self, ctx: &Context) -> Result<usize> {
        let result = self
            .validate()
            .and_then(|plan| Ok(plan.count(&ctx.view(self.entity.name())?)));
        self.route(result, || 0)
    }

    pub fn min(&self, ctx: &Context, attribute: &str) -> Result<Value> {
        self.aggregate(ctx, Aggregate::Min, attribute)
    }

    pub fn max(&self, ctx: &Context, attribute: &str) -> Result<Value> {
        self.aggregate(ctx, Aggregate::Max, attribute)
    }

    pub fn sum(&self, ctx: &Context, attribute: &str) -> Result<Value> {
        self.aggregate(ctx, Aggregate::Sum, attribute)
    }

    /// A live view of this query over the shared store.
    ///
    /// With a cache token, the compiled plan comes from the registry's plan
    /// cache. The handle's result buffer is always its own.
    pub fn observe(&self, ctx: &Context) -> Result<ObservationHandle> {
        let result = self.open_observation(ctx);
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    fn aggregate(&self, ctx: &Context, aggregate: Aggregate, attribute: &str) -> Result<Value> {
        let result = self.validate().and_then(|plan| {
            // Checked before the fetch so a bad attribute never touches the store.
            plan.check_aggregate(aggregate, attribute)?;
            plan.aggregate(&ctx.view(self.entity.name())?, aggregate, attribute)
        });
        self.route(result, || Value::Null)
    }

    fn fetch_first(&self, ctx: &Context) -> Result<Option<ManagedEntity>> {
        let mut spec = self.spec.clone();
        spec.limit = Some(1);
        let plan = FetchPlan::compile(Arc::clone(&self.entity), spec)?;
        let rows = plan.execute(ctx.view(self.entity.name())?);
        rows.into_iter().next().map(|r| ctx.materialize(r)).transpose()
    }

    fn open_observation(&self, ctx: &Context) -> Result<ObservationHandle> {
        let plan = match &self.spec.cache_token {
            Some(token) => {
                ctx.plans()
                    .get_or_compile(token, Arc::clone(&self.entity), self.spec.clone())?
            }
            None => Arc::new(self.validate()?),
        };
        ObservationHandle::open(plan, Arc::clone(ctx.store()), ctx.notifier())
    }

    fn fetch(&self, ctx: &Context) -> Result<Vec<ManagedEntity>> {
        let plan = self.validate()?;
        plan.execute(ctx.view(self.entity.name())?)
            .into_iter()
            .map(|r| ctx.materialize(r))
            .collect()
    }

    fn report(&self, err: &Error) {
        if let Some(handler) = &self.on_error {
            handler(err);
        }
    }

    fn route<T>(&self, result: Result<T>, empty: impl FnOnce() -> T) -> Result<T> {
        match result {
            Err(err) if self.on_error.is_some() => {
                self.report(&err);
                Ok(empty())
            }
            other => other,
        }
    }
}
