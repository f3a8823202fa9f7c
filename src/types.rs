//! # Domain Types for LayerDB
//!
//! This module defines the core vocabulary of LayerDB: identity tokens,
//! context and generation counters, attribute values, and the record shape
//! that flows between contexts and the store.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Identity tokens, context ids and save generations are all integers under
//! the hood. Wrapping each one in its own single-field struct means a
//! `ContextId` can never be passed where an `ObjectId` is expected, and the
//! function signatures document themselves.
//!
//! ```rust
//! use layerdb::types::{ContextId, ObjectId};
//!
//! fn example(id: ObjectId, ctx: ContextId) {
//!     // id == ctx  // Won't compile
//! }
//! ```
//!
//! ## Invariants
//!
//! - [`ObjectId`]: allocated once, never reused, stable across saves and restarts
//! - [`ContextId`]: `0` is always the primary context, children count up from `1`
//! - [`Generation`]: strictly increasing per context, bumped by every save

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::thread::{Thread, ThreadId};

use serde::{Deserialize, Serialize};

// =============================================================================
// Identity
// =============================================================================

/// Stable identity token of a managed entity.
///
/// Allocated by the store when an entity is created in any context, so it is
/// valid before the first save and never changes afterwards. Ordering by
/// `ObjectId` is the deterministic tiebreak for every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Creates an identity token from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a context inside one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// The primary context, bound to the registry's worker thread.
    pub const PRIMARY: ContextId = ContextId(0);

    /// Creates a context id from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns true for [`ContextId::PRIMARY`].
    pub fn is_primary(&self) -> bool {
        *self == Self::PRIMARY
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_primary() {
            write!(f, "primary")
        } else {
            write!(f, "ctx-{}", self.0)
        }
    }
}

/// Save generation of a context.
///
/// Every call to `save()` bumps the generation, including saves with nothing
/// pending, so each save produces exactly one event with a unique
/// `(context, generation)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    /// No save has happened yet.
    pub const ZERO: Generation = Generation(0);

    /// Creates a generation from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the following generation.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Explicit handle for the thread a context is bound to.
///
/// The registry is keyed by this handle rather than by ambient thread-local
/// state. [`ThreadKey::current`] is the usual way to obtain one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey(ThreadId);

impl ThreadKey {
    /// The calling thread's key.
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }

    /// The key of a specific thread (e.g. from a `JoinHandle`).
    pub fn of(thread: &Thread) -> Self {
        Self(thread.id())
    }

    /// Returns the underlying std thread id.
    pub fn thread_id(&self) -> ThreadId {
        self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

// =============================================================================
// Attribute Types and Values
// =============================================================================

/// Semantic type of an entity attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    Boolean,
    Integer,
    Float,
    Text,
    /// Milliseconds since the Unix epoch.
    Timestamp,
    Binary,
}

impl AttributeType {
    /// Types that `sum` is defined for.
    pub fn is_numeric(&self) -> bool {
        matches!(self, AttributeType::Integer | AttributeType::Float)
    }

    /// Types with a natural ordering, i.e. the ones `min`/`max` accept.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            AttributeType::Integer
                | AttributeType::Float
                | AttributeType::Text
                | AttributeType::Timestamp
        )
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeType::Boolean => "boolean",
            AttributeType::Integer => "integer",
            AttributeType::Float => "float",
            AttributeType::Text => "text",
            AttributeType::Timestamp => "timestamp",
            AttributeType::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// A dynamically typed attribute value.
///
/// # Comparison
///
/// `Value` deliberately does not implement `Ord`. Predicates use
/// [`Value::compare`], which is partial: comparing text with a number has no
/// answer and the predicate simply does not match. Sorting uses
/// [`Value::sort_cmp`], which is total (nulls first, then by type rank).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(i64),
    Binary(Vec<u8>),
}

pub(crate) static NULL_VALUE: Value = Value::Null;

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(f) if !f.is_finite() => "non-finite float",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Binary(_) => "binary",
        }
    }

    /// Returns the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns a float view of any numeric value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Coerces the value into the given attribute type.
    ///
    /// Null conforms to every type. Integers widen into floats and
    /// timestamps. Everything else must already have the exact type. NaN and
    /// infinities never conform: the payload codec cannot carry them.
    pub fn conform(&self, ty: AttributeType) -> Option<Value> {
        match (self, ty) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Float(f), _) if !f.is_finite() => None,
            (Value::Boolean(_), AttributeType::Boolean)
            | (Value::Integer(_), AttributeType::Integer)
            | (Value::Float(_), AttributeType::Float)
            | (Value::Text(_), AttributeType::Text)
            | (Value::Timestamp(_), AttributeType::Timestamp)
            | (Value::Binary(_), AttributeType::Binary) => Some(self.clone()),
            (Value::Integer(i), AttributeType::Float) => Some(Value::Float(*i as f64)),
            (Value::Integer(i), AttributeType::Timestamp) => Some(Value::Timestamp(*i)),
            _ => None,
        }
    }

    /// Partial comparison used by predicates.
    ///
    /// Numbers compare across integer and float; timestamps compare with
    /// timestamps and integers. Null only compares equal to null.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b))
            | (Value::Timestamp(a), Value::Integer(b))
            | (Value::Integer(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Float(_), Value::Integer(_) | Value::Float(_))
            | (Value::Integer(_), Value::Float(_)) => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
            _ => None,
        }
    }

    /// Equality under [`Value::compare`] semantics (so `1 == 1.0`).
    pub fn equals(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Total ordering used by sorts. Nulls sort first; incomparable values
    /// fall back to a fixed type rank.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Float(_), Value::Integer(_) | Value::Float(_))
            | (Value::Integer(_), Value::Float(_)) => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => Ordering::Equal,
            },
            _ => self
                .compare(other)
                .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank())),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
            Value::Binary(_) => 5,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(ms) => write!(f, "@{ms}"),
            Value::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Records
// =============================================================================

/// Materialized state of one entity: what contexts stage and the store persists.
///
/// Records are plain values. A context hands out clones, so a record obtained
/// from a query is unaffected by later deletes or edits (it is a materialized
/// handle, not a live one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub entity: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<ObjectId>>,
}

impl ObjectRecord {
    /// Creates an empty record for the given entity.
    pub fn new(id: ObjectId, entity: impl Into<String>) -> Self {
        Self {
            id,
            entity: entity.into(),
            attributes: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Returns an attribute value, or `Null` if unset.
    pub fn value(&self, attribute: &str) -> &Value {
        self.attributes.get(attribute).unwrap_or(&NULL_VALUE)
    }

    /// Returns the related ids for a relationship (empty if unset).
    pub fn related(&self, relationship: &str) -> &[ObjectId] {
        self.relations
            .get(relationship)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// =============================================================================
// Tests
// =============================================================================
