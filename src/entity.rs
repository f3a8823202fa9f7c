//! Managed entity handles.
//!
//! A [`ManagedEntity`] is a handle on one object as seen through one context.
//! Reading goes through the context, so it reflects that context's pending
//! edits. Writing stages an update in the context. Handles obtained for the
//! same id from different contexts are independent until a save merges them.
//!
//! Each handle also keeps the record it was materialized with. Once the object
//! is deleted from its context, reads fall back to that snapshot, so result
//! sets fetched before a delete keep their values.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::model::{Cardinality, EntityDescriptor, RelationshipDescriptor};
use crate::types::{ObjectId, ObjectRecord, Value};

/// One entity instance tracked by a [`Context`].
#[derive(Debug, Clone)]
pub struct ManagedEntity {
    id: ObjectId,
    descriptor: Arc<EntityDescriptor>,
    context: Context,
    snapshot: ObjectRecord,
}

impl ManagedEntity {
    pub(crate) fn new(
        id: ObjectId,
        descriptor: Arc<EntityDescriptor>,
        context: Context,
        snapshot: ObjectRecord,
    ) -> Self {
        Self {
            id,
            descriptor,
            context,
            snapshot,
        }
    }

    /// Stable identity token.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn entity_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    /// The context this handle belongs to.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The record as it was when this handle was materialized or last written.
    pub fn snapshot(&self) -> &ObjectRecord {
        &self.snapshot
    }

    /// Current values, or the snapshot if the object is gone from the context.
    pub fn values(&self) -> Result<ObjectRecord> {
        self.context.confine();
        Ok(self
            .context
            .lookup(self.id)?
            .unwrap_or_else(|| self.snapshot.clone()))
    }

    /// Reads one attribute.
    pub fn get(&self, attribute: &str) -> Result<Value> {
        self.descriptor.attribute_named(attribute)?;
        Ok(self.values()?.value(attribute).clone())
    }

    /// Reads a text attribute, `None` if null or not text.
    pub fn get_text(&self, attribute: &str) -> Result<Option<String>> {
        Ok(self.get(attribute)?.as_text().map(str::to_string))
    }

    /// Writes one attribute, staging an update in the context.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidAttribute` if the entity has no such attribute
    /// - `Error::TypeMismatch` if the value does not conform to its type
    /// - `Error::NotFound` if the object was deleted in this context
    pub fn set(&mut self, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let attr = self.descriptor.attribute_named(attribute)?;
        let conformed = value.conform(attr.ty).ok_or_else(|| Error::TypeMismatch {
            attribute: attribute.to_string(),
            expected: attr.ty,
            found: value.type_name(),
        })?;

        let name = attr.name.clone();
        self.snapshot = self.context.update_record(self.id, move |record| {
            record.attributes.insert(name, conformed);
            Ok(())
        })?;
        Ok(())
    }

    /// True while the object has pending changes in its context.
    pub fn is_dirty(&self) -> bool {
        let (inserted, updated, deleted) = self.context.pending_status(self.id);
        inserted || updated || deleted
    }

    /// True while the object is a pending insert that has not been saved.
    pub fn is_inserted(&self) -> bool {
        self.context.pending_status(self.id).0
    }

    /// True if the object is no longer visible in its context.
    pub fn is_deleted(&self) -> Result<bool> {
        self.context.confine();
        Ok(self.context.lookup(self.id)?.is_none())
    }

    /// Marks this object for deletion in its context.
    pub fn delete(&self) -> Result<()> {
        self.context.delete(self)
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Identity tokens held by a relationship.
    pub fn related(&self, relationship: &str) -> Result<Vec<ObjectId>> {
        self.descriptor.relationship_named(relationship)?;
        Ok(self.values()?.related(relationship).to_vec())
    }

    /// Handles for every related object still visible in the context.
    pub fn related_entities(&self, relationship: &str) -> Result<Vec<ManagedEntity>> {
        let mut out = Vec::new();
        for id in self.related(relationship)? {
            match self.context.object_with_id(id) {
                Ok(entity) => out.push(entity),
                Err(Error::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Replaces a relationship's targets.
    pub fn set_related(&mut self, relationship: &str, targets: &[&ManagedEntity]) -> Result<()> {
        let rel = self.descriptor.relationship_named(relationship)?.clone();
        if rel.cardinality == Cardinality::ToOne && targets.len() > 1 {
            return Err(Error::invalid_attribute(
                self.descriptor.name(),
                relationship,
                "to-one relationship accepts at most one target",
            ));
        }
        let mut ids = Vec::with_capacity(targets.len());
        for target in targets {
            self.check_target(&rel, target)?;
            if !ids.contains(&target.id) {
                ids.push(target.id);
            }
        }
        self.write_relation(rel.name, ids)
    }

    /// Adds one target. On a to-one relationship this replaces the target.
    pub fn add_related(&mut self, relationship: &str, target: &ManagedEntity) -> Result<()> {
        let rel = self.descriptor.relationship_named(relationship)?.clone();
        self.check_target(&rel, target)?;
        let mut ids = match rel.cardinality {
            Cardinality::ToOne => Vec::new(),
            Cardinality::ToMany => self.related(relationship)?,
        };
        if !ids.contains(&target.id) {
            ids.push(target.id);
        }
        self.write_relation(rel.name, ids)
    }

    /// Removes one target if present.
    pub fn remove_related(&mut self, relationship: &str, target: &ManagedEntity) -> Result<()> {
        let rel = self.descriptor.relationship_named(relationship)?.clone();
        let mut ids = self.related(relationship)?;
        ids.retain(|id| *id != target.id);
        self.write_relation(rel.name, ids)
    }

    fn check_target(&self, rel: &RelationshipDescriptor, target: &ManagedEntity) -> Result<()> {
        if target.entity_name() != rel.target {
            return Err(Error::invalid_attribute(
                self.descriptor.name(),
                &rel.name,
                format!("expects '{}' targets, got '{}'", rel.target, target.entity_name()),
            ));
        }
        if target.context.id() != self.context.id() {
            return Err(Error::NotFound {
                id: target.id,
                context: self.context.id(),
            });
        }
        Ok(())
    }

    fn write_relation(&mut self, name: String, ids: Vec<ObjectId>) -> Result<()> {
        self.snapshot = self.context.update_record(self.id, move |record| {
            if ids.is_empty() {
                record.relations.remove(&name);
            } else {
                record.relations.insert(name, ids);
            }
            Ok(())
        })?;
        Ok(())
    }
}
