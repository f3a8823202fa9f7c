//! # Entity Model
//!
//! The model is the schema every context and query is checked against: a named
//! set of [`EntityDescriptor`]s, each an ordered attribute list plus a list of
//! relationships. Descriptors are immutable once the model is built and are
//! shared as `Arc<EntityDescriptor>`.
//!
//! ```text
//!   Model "music"
//!   ├── Artist
//!   │   ├── name: text (required)
//!   │   ├── formed: timestamp
//!   │   └── albums ──owns──► Album (to-many)
//!   └── Album
//!       ├── title: text (required)
//!       ├── score: integer
//!       └── artist ────────► Artist (to-one)
//! ```
//!
//! ## Ownership Direction
//!
//! A relationship flagged as owning cascades deletes: deleting an `Artist`
//! deletes every `Album` it owns in the same context, inside the same save.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::AttributeType;

// =============================================================================
// Descriptors
// =============================================================================

/// A named, typed attribute of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub ty: AttributeType,
    /// Saves fail with `Error::Validation` when a required attribute is null.
    pub required: bool,
}

/// How many targets a relationship holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// A relationship from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    /// True when the source owns its targets (delete cascades).
    pub owns: bool,
}

/// Schema of one entity type.
///
/// Built fluently and then frozen inside a [`Model`]:
///
/// ```rust
/// use layerdb::model::EntityDescriptor;
/// use layerdb::types::AttributeType;
///
/// let album = EntityDescriptor::new("Album")
///     .required("title", AttributeType::Text)
///     .attribute("score", AttributeType::Integer)
///     .to_one("artist", "Artist");
/// assert_eq!(album.attributes().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    name: String,
    attributes: Vec<AttributeDescriptor>,
    relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    /// Starts a descriptor with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Adds an optional attribute.
    pub fn attribute(self, name: impl Into<String>, ty: AttributeType) -> Self {
        self.push_attribute(name.into(), ty, false)
    }

    /// Adds a required attribute.
    pub fn required(self, name: impl Into<String>, ty: AttributeType) -> Self {
        self.push_attribute(name.into(), ty, true)
    }

    /// Adds a non-owning to-one relationship.
    pub fn to_one(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_relationship(name.into(), target.into(), Cardinality::ToOne, false)
    }

    /// Adds a non-owning to-many relationship.
    pub fn to_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_relationship(name.into(), target.into(), Cardinality::ToMany, false)
    }

    /// Adds a to-many relationship whose targets are deleted with the source.
    pub fn owning_to_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_relationship(name.into(), target.into(), Cardinality::ToMany, true)
    }

    /// Adds a to-one relationship whose target is deleted with the source.
    pub fn owning_to_one(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_relationship(name.into(), target.into(), Cardinality::ToOne, true)
    }

    fn push_attribute(mut self, name: String, ty: AttributeType, required: bool) -> Self {
        // Redeclaring an attribute replaces it in place so order is stable.
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => {
                existing.ty = ty;
                existing.required = required;
            }
            None => self.attributes.push(AttributeDescriptor { name, ty, required }),
        }
        self
    }

    fn push_relationship(
        mut self,
        name: String,
        target: String,
        cardinality: Cardinality,
        owns: bool,
    ) -> Self {
        self.relationships.retain(|r| r.name != name);
        self.relationships.push(RelationshipDescriptor {
            name,
            target,
            cardinality,
            owns,
        });
        self
    }

    /// Entity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    /// Relationships in declaration order.
    pub fn relationships(&self) -> &[RelationshipDescriptor] {
        &self.relationships
    }

    /// Looks up an attribute, failing with `Error::InvalidAttribute` when unknown.
    pub fn attribute_named(&self, name: &str) -> Result<&AttributeDescriptor> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::invalid_attribute(&self.name, name, "no such attribute"))
    }

    /// Looks up a relationship, failing with `Error::InvalidAttribute` when unknown.
    pub fn relationship_named(&self, name: &str) -> Result<&RelationshipDescriptor> {
        self.relationships
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::invalid_attribute(&self.name, name, "no such relationship"))
    }

    /// True if `name` is an attribute of this entity.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }
}

// =============================================================================
// Model
// =============================================================================

/// A named collection of entity descriptors.
#[derive(Debug, Clone, Default)]
pub struct Model {
    name: String,
    entities: BTreeMap<String, Arc<EntityDescriptor>>,
}

impl Model {
    /// Creates an empty model.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) an entity.
    pub fn with_entity(mut self, entity: EntityDescriptor) -> Self {
        self.entities
            .insert(entity.name().to_string(), Arc::new(entity));
        self
    }

    /// Model name, recorded in the store's metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up an entity descriptor by name.
    pub fn entity(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Iterates all entities in name order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }

    /// Checks that every relationship points at an entity in this model.
    pub fn validate(&self) -> Result<()> {
        for entity in self.entities.values() {
            for rel in entity.relationships() {
                if !self.entities.contains_key(&rel.target) {
                    return Err(Error::invalid_attribute(
                        entity.name(),
                        &rel.name,
                        format!("target entity '{}' is not in model '{}'", rel.target, self.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
