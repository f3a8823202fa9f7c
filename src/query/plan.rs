//! # Fetch Plans
//!
//! A [`QuerySpec`] is what a builder accumulated. A [`FetchPlan`] is that spec
//! checked against the entity and compiled, ready to run over any snapshot of
//! records:
//!
//! ```text
//! QuerySpec ──compile──► FetchPlan
//!                          │
//!   records (id order) ────┤
//!                          ├─ filter    predicate matcher
//!                          ├─ sort      sort keys, then ObjectId ascending
//!                          └─ window    skip(offset).take(limit)
//! ```
//!
//! Compilation does every name and type check, so a plan that exists can only
//! fail on store access. Ties in the sort are broken by identity token, which
//! makes paging deterministic: page `[o, o+k)` is always the same slice of the
//! same full ordering.
//!
//! ## Plan Cache
//!
//! Observations with a cache token reuse one compiled plan through the
//! [`PlanCache`]. Only the immutable plan is shared; result buffers always
//! belong to a single handle. Reusing a token with a different spec replaces
//! the cached plan.

use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use serde::Serialize;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use super::predicate::{Matcher, Predicate};
use crate::error::{Error, Result};
use crate::model::EntityDescriptor;
use crate::types::{AttributeType, ObjectRecord, Value};

/// Default number of compiled plans kept per registry.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

// =============================================================================
// Query Spec
// =============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub attribute: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            direction: Direction::Descending,
        }
    }
}

/// An ordered list of sort keys.
///
/// Converts from a single key, a list of keys, `(attribute, Direction)` pairs,
/// or a string like `"score desc, name"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SortOrder(pub Vec<SortKey>);

impl From<SortKey> for SortOrder {
    fn from(key: SortKey) -> Self {
        SortOrder(vec![key])
    }
}

impl From<Vec<SortKey>> for SortOrder {
    fn from(keys: Vec<SortKey>) -> Self {
        SortOrder(keys)
    }
}

impl<S: Into<String>> From<Vec<(S, Direction)>> for SortOrder {
    fn from(pairs: Vec<(S, Direction)>) -> Self {
        SortOrder(
            pairs
                .into_iter()
                .map(|(attribute, direction)| SortKey {
                    attribute: attribute.into(),
                    direction,
                })
                .collect(),
        )
    }
}

impl From<&str> for SortOrder {
    /// Parses `"a, b desc, c asc"`. A term whose second word is not a
    /// direction keeps the whole term as its attribute name, which then fails
    /// validation as unknown.
    fn from(text: &str) -> Self {
        let keys = text
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(|term| {
                let words: Vec<&str> = term.split_whitespace().collect();
                match words.as_slice() {
                    [name] => SortKey::asc(*name),
                    [name, dir] if dir.eq_ignore_ascii_case("asc") => SortKey::asc(*name),
                    [name, dir] if dir.eq_ignore_ascii_case("desc") => SortKey::desc(*name),
                    _ => SortKey::asc(term),
                }
            })
            .collect();
        SortOrder(keys)
    }
}

impl From<String> for SortOrder {
    fn from(text: String) -> Self {
        SortOrder::from(text.as_str())
    }
}

/// Everything a query builder accumulated, as plain data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpec {
    pub entity: String,
    pub predicate: Predicate,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub section_by: Option<String>,
    pub cache_token: Option<String>,
}

impl QuerySpec {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: Predicate::True,
            sort: Vec::new(),
            limit: None,
            offset: None,
            section_by: None,
            cache_token: None,
        }
    }
}

// =============================================================================
// Fetch Plan
// =============================================================================

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Min,
    Max,
    Sum,
}

/// A compiled, validated query.
#[derive(Debug)]
pub struct FetchPlan {
    spec: QuerySpec,
    entity: Arc<EntityDescriptor>,
    matcher: Matcher,
    sort: Vec<SortKey>,
    fingerprint: u64,
}

impl FetchPlan {
    /// Validates a spec against its entity and compiles it.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidAttribute` for unknown attribute, sort or section names
    /// - `Error::TypeMismatch` for predicate values of the wrong type
    pub fn compile(entity: Arc<EntityDescriptor>, spec: QuerySpec) -> Result<Self> {
        if entity.name() != spec.entity {
            return Err(Error::UnknownEntity(spec.entity.clone()));
        }
        let matcher = spec.predicate.compile(&entity)?;

        let mut sort = Vec::with_capacity(spec.sort.len() + 1);
        // Sections must be contiguous, so the section key sorts first.
        if let Some(section) = &spec.section_by {
            entity.attribute_named(section)?;
            if spec.sort.first().map(|k| &k.attribute) != Some(section) {
                sort.push(SortKey::asc(section.clone()));
            }
        }
        for key in &spec.sort {
            entity.attribute_named(&key.attribute)?;
            sort.push(key.clone());
        }

        let fingerprint = xxh3_64(&serde_json::to_vec(&spec)?);
        Ok(Self {
            spec,
            entity,
            matcher,
            sort,
            fingerprint,
        })
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn entity(&self) -> &Arc<EntityDescriptor> {
        &self.entity
    }

    /// Stable hash of the [`QuerySpec`].
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub(crate) fn matches(&self, record: &ObjectRecord) -> bool {
        self.matcher.matches(record)
    }

    fn compare(&self, a: &ObjectRecord, b: &ObjectRecord) -> Ordering {
        for key in &self.sort {
            let ord = a.value(&key.attribute).sort_cmp(b.value(&key.attribute));
            let ord = match key.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    }

    /// Matching records in final order, before limit and offset.
    pub(crate) fn filter_sorted(&self, records: Vec<ObjectRecord>) -> Vec<ObjectRecord> {
        let mut matched: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
    }

    /// The full result: filter, sort, then the `[offset, offset + limit)` window.
    pub(crate) fn execute(&self, records: Vec<ObjectRecord>) -> Vec<ObjectRecord> {
        let offset = self.spec.offset.unwrap_or(0);
        let limit = self.spec.limit.unwrap_or(usize::MAX);
        self.filter_sorted(records)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    /// Matches of the predicate alone; limit and offset do not apply.
    pub(crate) fn count(&self, records: &[ObjectRecord]) -> usize {
        records.iter().filter(|r| self.matches(r)).count()
    }

    /// Checks that an aggregate makes sense for an attribute.
    pub fn check_aggregate(&self, aggregate: Aggregate, attribute: &str) -> Result<()> {
        let attr = self.entity.attribute_named(attribute)?;
        let ok = match aggregate {
            Aggregate::Sum => attr.ty.is_numeric(),
            Aggregate::Min | Aggregate::Max => attr.ty.is_ordered(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::invalid_attribute(
                self.entity.name(),
                attribute,
                format!("{aggregate:?} is not defined for {} attributes", attr.ty).to_lowercase(),
            ))
        }
    }

    /// Aggregates an attribute over the predicate's matches.
    ///
    /// The result has the attribute's type. Nulls are skipped. An empty match
    /// set gives `Null` for min and max, and zero for sum.
    pub(crate) fn aggregate(
        &self,
        records: &[ObjectRecord],
        aggregate: Aggregate,
        attribute: &str,
    ) -> Result<Value> {
        self.check_aggregate(aggregate, attribute)?;
        let ty = self.entity.attribute_named(attribute)?.ty;
        let values = records
            .iter()
            .filter(|r| self.matches(r))
            .map(|r| r.value(attribute))
            .filter(|v| !v.is_null());

        match aggregate {
            Aggregate::Min => Ok(values
                .min_by(|a, b| a.sort_cmp(b))
                .cloned()
                .unwrap_or(Value::Null)),
            Aggregate::Max => Ok(values
                .max_by(|a, b| a.sort_cmp(b))
                .cloned()
                .unwrap_or(Value::Null)),
            Aggregate::Sum => match ty {
                AttributeType::Integer => {
                    let mut total: i64 = 0;
                    for v in values {
                        let n = v.as_integer().unwrap_or(0);
                        total = total.checked_add(n).ok_or_else(|| {
                            Error::invalid_attribute(self.entity.name(), attribute, "integer sum overflowed")
                        })?;
                    }
                    Ok(Value::Integer(total))
                }
                _ => Ok(Value::Float(values.filter_map(Value::as_f64).sum())),
            },
        }
    }
}

// =============================================================================
// Plan Cache
// =============================================================================

/// LRU cache of compiled plans, keyed by cache token.
#[derive(Debug)]
pub struct PlanCache {
    plans: Mutex<LruCache<String, Arc<FetchPlan>>>,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            plans: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the plan cached under `token` if its spec is identical,
    /// otherwise compiles and caches a new one.
    pub fn get_or_compile(
        &self,
        token: &str,
        entity: Arc<EntityDescriptor>,
        spec: QuerySpec,
    ) -> Result<Arc<FetchPlan>> {
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = plans.get(token) {
            if plan.spec == spec {
                return Ok(Arc::clone(plan));
            }
            debug!(token, "cache token reused with a different query, recompiling");
        }
        let plan = Arc::new(FetchPlan::compile(entity, spec)?);
        plans.put(token.to_string(), Arc::clone(&plan));
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.plans.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(DEFAULT_PLAN_CACHE_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectId;

    fn item() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::new("Item")
                .required("name", AttributeType::Text)
                .attribute("score", AttributeType::Integer)
                .attribute("weight", AttributeType::Float)
                .attribute("active", AttributeType::Boolean),
        )
    }

    fn records() -> Vec<ObjectRecord> {
        [("A", 1), ("B", 3), ("C", 2), ("D", 3)]
            .iter()
            .enumerate()
            .map(|(i, (name, score))| {
                let mut r = ObjectRecord::new(ObjectId::from_raw(i as u64 + 1), "Item");
                r.attributes.insert("name".into(), (*name).into());
                r.attributes.insert("score".into(), (*score).into());
                r
            })
            .collect()
    }

    fn names(rows: &[ObjectRecord]) -> Vec<String> {
        rows.iter().map(|r| r.value("name").to_string()).collect()
    }

    fn plan(spec: QuerySpec) -> FetchPlan {
        FetchPlan::compile(item(), spec).unwrap()
    }

    #[test]
    fn test_sort_order_parsing() {
        let order = SortOrder::from("score desc, name");
        assert_eq!(order.0, vec![SortKey::desc("score"), SortKey::asc("name")]);

        let bad = SortOrder::from("score sideways");
        assert_eq!(bad.0[0].attribute, "score sideways");
    }

    #[test]
    fn test_ties_break_by_identity() {
        let mut spec = QuerySpec::new("Item");
        spec.sort = vec![SortKey::desc("score")];
        assert_eq!(names(&plan(spec).execute(records())), vec!["B", "D", "C", "A"]);
    }

    #[test]
    fn test_window_is_slice_of_full_order() {
        let mut full = QuerySpec::new("Item");
        full.sort = vec![SortKey::asc("score")];
        let all = plan(full.clone()).execute(records());

        for offset in 0..5 {
            for limit in 0..5 {
                let mut spec = full.clone();
                spec.offset = Some(offset);
                spec.limit = Some(limit);
                let page = plan(spec).execute(records());
                let end = (offset + limit).min(all.len());
                let expected = if offset < all.len() { &all[offset..end] } else { &[][..] };
                assert_eq!(page, expected, "offset={offset} limit={limit}");
            }
        }
    }

    #[test]
    fn test_count_ignores_window() {
        let mut spec = QuerySpec::new("Item");
        spec.predicate = Predicate::gt("score", 1);
        spec.limit = Some(1);
        spec.offset = Some(1);
        assert_eq!(plan(spec).count(&records()), 3);
    }

    #[test]
    fn test_aggregates() {
        let p = plan(QuerySpec::new("Item"));
        let rows = records();
        assert_eq!(p.aggregate(&rows, Aggregate::Max, "score").unwrap(), Value::Integer(3));
        assert_eq!(p.aggregate(&rows, Aggregate::Min, "score").unwrap(), Value::Integer(1));
        assert_eq!(p.aggregate(&rows, Aggregate::Sum, "score").unwrap(), Value::Integer(9));
        assert_eq!(p.aggregate(&rows, Aggregate::Min, "name").unwrap(), Value::from("A"));
        assert_eq!(p.aggregate(&[], Aggregate::Max, "score").unwrap(), Value::Null);
        assert_eq!(p.aggregate(&[], Aggregate::Sum, "weight").unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_aggregate_type_checks() {
        let p = plan(QuerySpec::new("Item"));
        assert_eq!(p.check_aggregate(Aggregate::Sum, "name").unwrap_err().code(), 200);
        assert_eq!(p.check_aggregate(Aggregate::Max, "active").unwrap_err().code(), 200);
        assert_eq!(p.check_aggregate(Aggregate::Sum, "nope").unwrap_err().code(), 200);
    }

    #[test]
    fn test_unknown_sort_key_rejected() {
        let mut spec = QuerySpec::new("Item");
        spec.sort = vec![SortKey::asc("rank")];
        assert!(FetchPlan::compile(item(), spec).is_err());
    }

    #[test]
    fn test_section_key_sorts_first() {
        let mut spec = QuerySpec::new("Item");
        spec.section_by = Some("score".into());
        spec.sort = vec![SortKey::desc("name")];
        assert_eq!(names(&plan(spec).execute(records())), vec!["A", "C", "D", "B"]);
    }

    #[test]
    fn test_plan_cache_reuse_and_invalidation() {
        let cache = PlanCache::new(4);
        let spec = QuerySpec::new("Item");
        let a = cache.get_or_compile("t", item(), spec.clone()).unwrap();
        let b = cache.get_or_compile("t", item(), spec.clone()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let mut other = spec;
        other.limit = Some(2);
        let c = cache.get_or_compile("t", item(), other).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(cache.len(), 1);
    }
}
