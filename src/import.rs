//! # Bulk Import
//!
//! [`ImportBuilder`] is a client of the context layer: it reads source records,
//! runs per-field hooks, and creates (or upserts) entities through an ordinary
//! [`Context`], then saves once. The whole import lands in one save.
//!
//! ```text
//!  ImportSource ──► record ──► filter? ──► map ──► conform ──► validate
//!                                │ no                 │ bad       │ bad
//!                                ▼                    ▼           ▼
//!                             skipped              failed      failed
//!                                                                 │ ok
//!                                              unique_by match? ──┴─► update / create
//! ```
//!
//! ## Configuration Errors Come First
//!
//! Everything that can be checked without reading records is checked while
//! building: the source's type and location, field names, and whether a
//! timestamp fed from text has a `map` hook to parse it.
//!
//! ## Bad Records
//!
//! A record that a filter rejects is skipped. A record whose values do not fit
//! the model is counted as failed. Neither stops the import, and nothing
//! already staged is rolled back. [`ImportReport`] has the counts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::entity::ManagedEntity;
use crate::error::{Error, Result};
use crate::model::EntityDescriptor;
use crate::notify::SaveTicket;
use crate::query::QueryBuilder;
use crate::types::{AttributeType, ObjectId, ObjectRecord, Value};

/// One source record: field name to value.
pub type Record = BTreeMap<String, Value>;

/// Decides whether a record is imported, given one field's raw value.
pub type FilterHook = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Converts one field's raw value. Receives the record's position in the source.
pub type MapHook = Arc<dyn Fn(Value, usize) -> Value + Send + Sync>;

// =============================================================================
// Sources
// =============================================================================

/// Where records come from.
#[derive(Debug, Clone)]
pub enum ImportSource {
    /// Records already in memory.
    Records(Vec<Record>),
    /// A `.json` file holding an array of objects.
    JsonFile(PathBuf),
}

impl ImportSource {
    fn check(&self) -> Result<()> {
        let ImportSource::JsonFile(path) = self else {
            return Ok(());
        };
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if extension != "json" {
            return Err(Error::InvalidSourceType(extension));
        }
        if !path.is_file() {
            return Err(Error::InvalidSourceLocation(path.clone()));
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<Record>> {
        match self {
            ImportSource::Records(records) => Ok(records.clone()),
            ImportSource::JsonFile(path) => read_json_records(path),
        }
    }
}

fn read_json_records(path: &Path) -> Result<Vec<Record>> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| Error::InvalidSourceLocation(path.to_path_buf()))?;
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(&text)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(key, value)| (key, json_to_value(value)))
                .collect()
        })
        .collect())
}

fn json_to_value(value: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        Json::String(s) => Value::Text(s),
        nested @ (Json::Array(_) | Json::Object(_)) => Value::Text(nested.to_string()),
    }
}

// =============================================================================
// Field Hooks
// =============================================================================

/// Per-field import behavior.
#[derive(Clone, Default)]
pub struct FieldHooks {
    filter: Option<FilterHook>,
    map: Option<MapHook>,
    source_key: Option<String>,
    text_source: bool,
}

impl fmt::Debug for FieldHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldHooks")
            .field("filter", &self.filter.is_some())
            .field("map", &self.map.is_some())
            .field("source_key", &self.source_key)
            .field("text_source", &self.text_source)
            .finish()
    }
}

impl FieldHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Imports a record only if `f` accepts this field's raw value.
    pub fn filter(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Converts the raw value before it is assigned.
    pub fn map(mut self, f: impl Fn(Value, usize) -> Value + Send + Sync + 'static) -> Self {
        self.map = Some(Arc::new(f));
        self
    }

    /// Reads the value from a differently named source field.
    pub fn from_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    /// Declares that the source supplies this field as text.
    pub fn text_source(mut self) -> Self {
        self.text_source = true;
        self
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Outcome of [`ImportBuilder::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// The save that carried the import.
    pub ticket: SaveTicket,
}

/// Configures and runs an import into one entity.
#[derive(Debug, Clone)]
pub struct ImportBuilder {
    entity: Arc<EntityDescriptor>,
    source: ImportSource,
    fields: Vec<(String, FieldHooks)>,
    unique_by: Option<String>,
}

impl ImportBuilder {
    pub fn new(entity: Arc<EntityDescriptor>) -> Self {
        Self {
            entity,
            source: ImportSource::Records(Vec::new()),
            fields: Vec::new(),
            unique_by: None,
        }
    }

    /// Sets the source.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidSourceType` for a file that is not `.json`
    /// - `Error::InvalidSourceLocation` for a file that does not exist
    pub fn source(mut self, source: ImportSource) -> Result<Self> {
        source.check()?;
        self.source = source;
        Ok(self)
    }

    /// Declares an imported field. Without any declared fields, every source
    /// field that names an attribute is imported as is.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidAttribute` if the entity has no such attribute
    /// - `Error::MissingFormatter` for a timestamp read from text without `map`
    pub fn field(mut self, name: &str, hooks: FieldHooks) -> Result<Self> {
        let attribute = self.entity.attribute_named(name)?;
        if attribute.ty == AttributeType::Timestamp && hooks.text_source && hooks.map.is_none() {
            return Err(Error::MissingFormatter {
                field: name.to_string(),
                ty: attribute.ty,
            });
        }
        self.fields.push((name.to_string(), hooks));
        Ok(self)
    }

    /// Updates the entity whose `attribute` equals the record's instead of
    /// creating a duplicate.
    pub fn unique_by(mut self, attribute: &str) -> Result<Self> {
        self.entity.attribute_named(attribute)?;
        self.unique_by = Some(attribute.to_string());
        Ok(self)
    }

    /// Imports every record into `ctx` and saves it.
    pub fn run(&self, ctx: &Context) -> Result<ImportReport> {
        let records = self.source.load()?;
        let mut imported = 0;
        let mut updated = 0;
        let mut skipped = 0;
        let mut failed = 0;

        for (index, record) in records.into_iter().enumerate() {
            let Some(values) = self.extract(&record, index) else {
                skipped += 1;
                continue;
            };
            let values = match self.conform(values) {
                Ok(values) => values,
                Err(err) => {
                    warn!(entity = self.entity.name(), index, error = %err, "import record rejected");
                    failed += 1;
                    continue;
                }
            };

            let existing = self.find_existing(ctx, &values)?;
            let mut candidate = match &existing {
                Some(entity) => entity.values()?,
                None => ObjectRecord::new(ObjectId::from_raw(0), self.entity.name()),
            };
            candidate.attributes.extend(values.clone());
            if let Err(err) = ctx.store().validate(&candidate) {
                warn!(entity = self.entity.name(), index, error = %err, "import record rejected");
                failed += 1;
                continue;
            }

            let mut target = match existing {
                Some(entity) => {
                    updated += 1;
                    entity
                }
                None => {
                    imported += 1;
                    ctx.create(&self.entity)?
                }
            };
            for (attribute, value) in values {
                target.set(&attribute, value)?;
            }
        }

        debug!(entity = self.entity.name(), imported, updated, skipped, failed, "import staged");
        let ticket = ctx.save()?;
        info!(
            entity = self.entity.name(),
            imported, updated, skipped, failed, "import saved"
        );
        Ok(ImportReport {
            imported,
            updated,
            skipped,
            failed,
            ticket,
        })
    }

    /// Runs hooks over one record. `None` if a filter rejected it.
    fn extract(&self, record: &Record, index: usize) -> Option<Record> {
        if self.fields.is_empty() {
            return Some(
                record
                    .iter()
                    .filter(|(key, _)| self.entity.has_attribute(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            );
        }

        let mut values = Record::new();
        for (name, hooks) in &self.fields {
            let key = hooks.source_key.as_deref().unwrap_or(name);
            let raw = record.get(key).cloned().unwrap_or(Value::Null);
            if let Some(filter) = &hooks.filter {
                if !filter(&raw) {
                    return None;
                }
            }
            let value = match &hooks.map {
                Some(map) => map(raw, index),
                None => raw,
            };
            values.insert(name.clone(), value);
        }
        Some(values)
    }

    fn conform(&self, values: Record) -> Result<Record> {
        values
            .into_iter()
            .map(|(name, value)| {
                let attribute = self.entity.attribute_named(&name)?;
                if value.is_null() {
                    return Ok((name, value));
                }
                let conformed = value.conform(attribute.ty).ok_or(Error::TypeMismatch {
                    attribute: name.clone(),
                    expected: attribute.ty,
                    found: value.type_name(),
                })?;
                Ok((name, conformed))
            })
            .collect()
    }

    fn find_existing(&self, ctx: &Context, values: &Record) -> Result<Option<ManagedEntity>> {
        let Some(key) = &self.unique_by else {
            return Ok(None);
        };
        match values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => QueryBuilder::new(Arc::clone(&self.entity))
                .where_eq(key, value.clone())
                .first(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn track() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::new("Track")
                .required("title", AttributeType::Text)
                .attribute("plays", AttributeType::Integer)
                .attribute("released", AttributeType::Timestamp),
        )
    }

    #[test]
    fn test_source_type_checked_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracks.csv");
        std::fs::write(&path, "title\n").unwrap();

        let err = ImportBuilder::new(track())
            .source(ImportSource::JsonFile(path))
            .unwrap_err();
        assert_eq!(err.code(), 100);
    }

    #[test]
    fn test_missing_source_file() {
        let err = ImportBuilder::new(track())
            .source(ImportSource::JsonFile(PathBuf::from("/nonexistent/tracks.json")))
            .unwrap_err();
        assert_eq!(err.code(), 101);
    }

    #[test]
    fn test_unknown_field() {
        let err = ImportBuilder::new(track())
            .field("genre", FieldHooks::new())
            .unwrap_err();
        assert_eq!(err.code(), 200);
    }

    #[test]
    fn test_text_timestamp_needs_formatter() {
        let err = ImportBuilder::new(track())
            .field("released", FieldHooks::new().text_source())
            .unwrap_err();
        assert!(matches!(err, Error::MissingFormatter { .. }));
        assert_eq!(err.code(), 201);

        assert!(ImportBuilder::new(track())
            .field(
                "released",
                FieldHooks::new().text_source().map(|_, _| Value::Timestamp(0))
            )
            .is_ok());
    }

    #[test]
    fn test_json_records_load() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"[{{"title": "A", "plays": 3}}, {{"title": "B", "extra": [1]}}]"#).unwrap();

        let records = ImportSource::JsonFile(file.path().to_path_buf())
            .load()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["plays"], Value::Integer(3));
        assert_eq!(records[1]["extra"], Value::Text("[1]".into()));
    }

    #[test]
    fn test_hooks_filter_and_map() {
        let builder = ImportBuilder::new(track())
            .field(
                "title",
                FieldHooks::new()
                    .from_key("name")
                    .filter(|v| !v.is_null())
                    .map(|v, i| Value::Text(format!("{i}:{v}"))),
            )
            .unwrap();

        let mut record = Record::new();
        record.insert("name".into(), Value::from("Song"));
        let values = builder.extract(&record, 4).unwrap();
        assert_eq!(values["title"], Value::from("4:Song"));

        assert!(builder.extract(&Record::new(), 0).is_none());
    }
}
