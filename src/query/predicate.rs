//! Predicate expression trees.
//!
//! A [`Predicate`] is plain data: it can be built from combinators, compared,
//! serialized for plan fingerprints, and only becomes executable once it is
//! checked against an [`EntityDescriptor`] and compiled into a [`Matcher`].
//!
//! ```rust
//! use layerdb::query::Predicate;
//!
//! // score > 1 AND (name LIKE "A*" OR NOT genre = "jazz")
//! let p = Predicate::gt("score", 1)
//!     .and(Predicate::like("name", "A*").or(!Predicate::eq("genre", "jazz")));
//! ```
//!
//! ## LIKE Patterns
//!
//! `*` matches any run of characters and `?` matches exactly one. Everything
//! else is literal and the whole value must match. [`Predicate::ilike`] folds
//! case.

use std::collections::{BTreeMap, HashMap};
use std::ops::Not;

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::EntityDescriptor;
use crate::types::{AttributeType, ObjectId, ObjectRecord, Value};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A boolean expression over one entity's attributes and relationships.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    /// Matches everything.
    True,
    Compare {
        attribute: String,
        op: CompareOp,
        value: Value,
    },
    Like {
        attribute: String,
        pattern: String,
        case_insensitive: bool,
    },
    In {
        attribute: String,
        values: Vec<Value>,
    },
    IsNull(String),
    /// The relationship holds `target`.
    Related {
        relationship: String,
        target: ObjectId,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::True
    }
}

impl Predicate {
    fn compare(attribute: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Eq, value)
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ne, value)
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Lt, value)
    }

    pub fn le(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Le, value)
    }

    pub fn gt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Gt, value)
    }

    pub fn ge(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ge, value)
    }

    /// Wildcard match on a text attribute.
    pub fn like(attribute: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Like {
            attribute: attribute.into(),
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    /// Case-insensitive [`Predicate::like`].
    pub fn ilike(attribute: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Like {
            attribute: attribute.into(),
            pattern: pattern.into(),
            case_insensitive: true,
        }
    }

    pub fn is_in<V: Into<Value>>(
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Predicate::In {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Predicate::IsNull(attribute.into())
    }

    pub fn related(relationship: impl Into<String>, target: ObjectId) -> Self {
        Predicate::Related {
            relationship: relationship.into(),
            target,
        }
    }

    /// Conjunction. `True` terms are dropped and nested `And`s are flattened.
    pub fn and(self, other: impl Into<Predicate>) -> Self {
        let mut terms = Vec::new();
        for p in [self, other.into()] {
            match p {
                Predicate::True => {}
                Predicate::And(inner) => terms.extend(inner),
                p => terms.push(p),
            }
        }
        match terms.len() {
            0 => Predicate::True,
            1 => terms.remove(0),
            _ => Predicate::And(terms),
        }
    }

    /// Disjunction. Nested `Or`s are flattened.
    pub fn or(self, other: impl Into<Predicate>) -> Self {
        let mut terms = Vec::new();
        for p in [self, other.into()] {
            match p {
                Predicate::Or(inner) => terms.extend(inner),
                p => terms.push(p),
            }
        }
        Predicate::Or(terms)
    }

    /// Compiles against an entity, rejecting unknown names and ill-typed values.
    pub(crate) fn compile(&self, entity: &EntityDescriptor) -> Result<Matcher> {
        Ok(match self {
            Predicate::True => Matcher::True,
            Predicate::Compare {
                attribute,
                op,
                value,
            } => Matcher::Compare {
                attribute: attribute.clone(),
                op: *op,
                value: conform(entity, attribute, value)?,
            },
            Predicate::Like {
                attribute,
                pattern,
                case_insensitive,
            } => {
                let attr = entity.attribute_named(attribute)?;
                if attr.ty != AttributeType::Text {
                    return Err(Error::invalid_attribute(
                        entity.name(),
                        attribute,
                        format!("LIKE needs a text attribute, not {}", attr.ty),
                    ));
                }
                Matcher::Like {
                    attribute: attribute.clone(),
                    regex: like_regex(pattern, *case_insensitive)
                        .map_err(|e| Error::invalid_attribute(entity.name(), attribute, e.to_string()))?,
                }
            }
            Predicate::In { attribute, values } => Matcher::In {
                attribute: attribute.clone(),
                values: values
                    .iter()
                    .map(|v| conform(entity, attribute, v))
                    .collect::<Result<_>>()?,
            },
            Predicate::IsNull(attribute) => {
                entity.attribute_named(attribute)?;
                Matcher::IsNull(attribute.clone())
            }
            Predicate::Related {
                relationship,
                target,
            } => {
                entity.relationship_named(relationship)?;
                Matcher::Related {
                    relationship: relationship.clone(),
                    target: *target,
                }
            }
            Predicate::And(terms) => Matcher::And(
                terms
                    .iter()
                    .map(|t| t.compile(entity))
                    .collect::<Result<_>>()?,
            ),
            Predicate::Or(terms) => Matcher::Or(
                terms
                    .iter()
                    .map(|t| t.compile(entity))
                    .collect::<Result<_>>()?,
            ),
            Predicate::Not(inner) => Matcher::Not(Box::new(inner.compile(entity)?)),
        })
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Self::Output {
        match self {
            Predicate::Not(inner) => *inner,
            p => Predicate::Not(Box::new(p)),
        }
    }
}

/// `("name", "A")` is `name = "A"`.
impl<K: Into<String>, V: Into<Value>> From<(K, V)> for Predicate {
    fn from((attribute, value): (K, V)) -> Self {
        Predicate::eq(attribute, value)
    }
}

/// An equality map is the conjunction of its entries.
impl<K: Into<String>, V: Into<Value>> From<BTreeMap<K, V>> for Predicate {
    fn from(map: BTreeMap<K, V>) -> Self {
        map.into_iter()
            .fold(Predicate::True, |acc, (k, v)| acc.and(Predicate::eq(k, v)))
    }
}

/// Entries are sorted by attribute name so equal maps build equal predicates.
impl<K: Into<String>, V: Into<Value>> From<HashMap<K, V>> for Predicate {
    fn from(map: HashMap<K, V>) -> Self {
        let sorted: BTreeMap<String, Value> = map
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        sorted.into()
    }
}

fn conform(entity: &EntityDescriptor, attribute: &str, value: &Value) -> Result<Value> {
    let attr = entity.attribute_named(attribute)?;
    value.conform(attr.ty).ok_or_else(|| Error::TypeMismatch {
        attribute: attribute.to_string(),
        expected: attr.ty,
        found: value.type_name(),
    })
}

fn like_regex(pattern: &str, case_insensitive: bool) -> std::result::Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 12);
    source.push_str("(?s)");
    if case_insensitive {
        source.push_str("(?i)");
    }
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source)
}

// =============================================================================
// Compiled Form
// =============================================================================

/// A predicate checked against its entity, with values conformed and LIKE
/// patterns compiled.
#[derive(Debug, Clone)]
pub(crate) enum Matcher {
    True,
    Compare {
        attribute: String,
        op: CompareOp,
        value: Value,
    },
    Like {
        attribute: String,
        regex: Regex,
    },
    In {
        attribute: String,
        values: Vec<Value>,
    },
    IsNull(String),
    Related {
        relationship: String,
        target: ObjectId,
    },
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
    Not(Box<Matcher>),
}

impl Matcher {
    pub(crate) fn matches(&self, record: &ObjectRecord) -> bool {
        use std::cmp::Ordering::*;

        match self {
            Matcher::True => true,
            Matcher::Compare {
                attribute,
                op,
                value,
            } => {
                let actual = record.value(attribute);
                match op {
                    CompareOp::Eq => actual.equals(value),
                    CompareOp::Ne => !actual.equals(value),
                    CompareOp::Lt => actual.compare(value) == Some(Less),
                    CompareOp::Le => matches!(actual.compare(value), Some(Less | Equal)),
                    CompareOp::Gt => actual.compare(value) == Some(Greater),
                    CompareOp::Ge => matches!(actual.compare(value), Some(Greater | Equal)),
                }
            }
            Matcher::Like { attribute, regex } => record
                .value(attribute)
                .as_text()
                .is_some_and(|s| regex.is_match(s)),
            Matcher::In { attribute, values } => {
                let actual = record.value(attribute);
                values.iter().any(|v| actual.equals(v))
            }
            Matcher::IsNull(attribute) => record.value(attribute).is_null(),
            Matcher::Related {
                relationship,
                target,
            } => record.related(relationship).contains(target),
            Matcher::And(terms) => terms.iter().all(|t| t.matches(record)),
            Matcher::Or(terms) => terms.iter().any(|t| t.matches(record)),
            Matcher::Not(inner) => !inner.matches(record),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn artist() -> EntityDescriptor {
        EntityDescriptor::new("Artist")
            .required("name", AttributeType::Text)
            .attribute("score", AttributeType::Integer)
            .attribute("rating", AttributeType::Float)
            .to_many("albums", "Album")
    }

    fn rec(name: &str, score: i64) -> ObjectRecord {
        let mut r = ObjectRecord::new(ObjectId::from_raw(1), "Artist");
        r.attributes.insert("name".into(), name.into());
        r.attributes.insert("score".into(), score.into());
        r
    }

    #[test]
    fn test_and_flattens_and_drops_true() {
        let p = Predicate::True
            .and(Predicate::eq("a", 1))
            .and(Predicate::eq("b", 2).and(Predicate::eq("c", 3)));
        match p {
            Predicate::And(terms) => assert_eq!(terms.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
        assert_eq!(Predicate::True.and(Predicate::True), Predicate::True);
    }

    #[test]
    fn test_double_negation() {
        let p = Predicate::eq("a", 1);
        assert_eq!(!!p.clone(), p);
    }

    #[test]
    fn test_map_conversion_is_conjunction() {
        let mut map = HashMap::new();
        map.insert("score", Value::Integer(3));
        map.insert("name", Value::from("B"));
        let p: Predicate = map.into();

        let m = p.compile(&artist()).unwrap();
        assert!(m.matches(&rec("B", 3)));
        assert!(!m.matches(&rec("B", 2)));
    }

    #[test]
    fn test_comparisons() {
        let e = artist();
        let gt = Predicate::gt("score", 1).compile(&e).unwrap();
        assert!(gt.matches(&rec("x", 2)));
        assert!(!gt.matches(&rec("x", 1)));

        // Integer literal against a float attribute is widened.
        let mut r = rec("x", 0);
        r.attributes.insert("rating".into(), Value::Float(4.5));
        let ge = Predicate::ge("rating", 4).compile(&e).unwrap();
        assert!(ge.matches(&r));

        // Null never satisfies an ordering comparison.
        let lt = Predicate::lt("rating", 10).compile(&e).unwrap();
        assert!(!lt.matches(&rec("x", 0)));
    }

    #[test]
    fn test_like_patterns() {
        let e = artist();
        let like = Predicate::like("name", "B*e?").compile(&e).unwrap();
        assert!(like.matches(&rec("Blues", 0)));
        assert!(!like.matches(&rec("blues", 0)));
        assert!(!like.matches(&rec("Blue", 0)));

        let ilike = Predicate::ilike("name", "b*").compile(&e).unwrap();
        assert!(ilike.matches(&rec("Bach", 0)));

        // Wildcards span line breaks.
        let multiline = Predicate::like("name", "a*b?").compile(&e).unwrap();
        assert!(multiline.matches(&rec("a\nline\nb\n", 0)));

        // Regex metacharacters are literal.
        let literal = Predicate::like("name", "a.c").compile(&e).unwrap();
        assert!(!literal.matches(&rec("abc", 0)));
        assert!(literal.matches(&rec("a.c", 0)));
    }

    #[test]
    fn test_unknown_attribute_fails_compile() {
        let err = Predicate::eq("nmae", "x").compile(&artist()).unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute { ref attribute, .. } if attribute == "nmae"));

        let nested = Predicate::eq("name", "x").or(!Predicate::is_null("genre"));
        assert_eq!(nested.compile(&artist()).unwrap_err().code(), 200);
    }

    #[test]
    fn test_like_on_number_rejected() {
        let err = Predicate::like("score", "1*").compile(&artist()).unwrap_err();
        assert_eq!(err.code(), 200);
    }

    #[test]
    fn test_ill_typed_value_rejected() {
        let err = Predicate::eq("score", "high").compile(&artist()).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_in_and_related() {
        let e = artist();
        let m = Predicate::is_in("score", [1, 3]).compile(&e).unwrap();
        assert!(m.matches(&rec("x", 3)));
        assert!(!m.matches(&rec("x", 2)));

        let mut r = rec("x", 0);
        r.relations
            .insert("albums".into(), vec![ObjectId::from_raw(7)]);
        let rel = Predicate::related("albums", ObjectId::from_raw(7))
            .compile(&e)
            .unwrap();
        assert!(rel.matches(&r));
    }
}
