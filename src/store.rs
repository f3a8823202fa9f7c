//! # Store Handle
//!
//! The store handle owns the single persistent SQLite store and the model it
//! was opened with. It is the only type that touches SQL; contexts above it
//! deal in [`ObjectRecord`]s and [`Changeset`]s.
//!
//! ## Design: Commit Is the Only Write
//!
//! Contexts never write rows directly. The primary context collects every
//! pending insert, update and delete that reached it and hands them to
//! [`StoreHandle::commit`] as one changeset, which runs inside a single SQLite
//! transaction:
//!
//! ```text
//! Changeset { inserted, updated, deleted }
//!         │
//!         ▼  validate every record against the model (no SQL yet)
//!         │
//!         ▼  BEGIN
//!         │    INSERT INTO objects ..                 (inserted)
//!         │    UPDATE objects .. WHERE id = ?         (updated, 0 rows = Conflict)
//!         │    DELETE FROM objects WHERE id = ?       (deleted)
//!         ▼  COMMIT ──► CommitReceipt { generation, entities, ids }
//! ```
//!
//! Either the whole changeset lands or none of it does, so a save is one atomic
//! unit per context generation.
//!
//! ## Identity Tokens
//!
//! [`StoreHandle::allocate_id`] hands out identity tokens from an atomic counter
//! seeded with `MAX(id) + 1` at open time. Tokens are allocated when an entity
//! is created in any context, so they are stable before, during and after the
//! save that persists them, and across restarts.
//!
//! ## Thread Safety
//!
//! The connection sits behind a `Mutex`. Reads come from any context's thread;
//! the only writer is the primary context's worker.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::codec::{decode_record, encode_record};
use crate::error::{Error, Result};
use crate::model::{Cardinality, Model};
use crate::schema::Database;
use crate::types::{Generation, ObjectId, ObjectRecord};

// =============================================================================
// Changesets
// =============================================================================

/// Everything one save wants to make durable.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub inserted: Vec<ObjectRecord>,
    pub updated: Vec<ObjectRecord>,
    /// `(id, entity)` pairs, so observers know which entities were touched
    /// without a lookup.
    pub deleted: Vec<(ObjectId, String)>,
}

impl Changeset {
    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Entity names touched by this changeset.
    pub fn entities(&self) -> BTreeSet<String> {
        self.inserted
            .iter()
            .chain(&self.updated)
            .map(|r| r.entity.clone())
            .chain(self.deleted.iter().map(|(_, e)| e.clone()))
            .collect()
    }
}

/// What a successful commit reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Store-wide commit counter after this commit.
    pub generation: Generation,
    pub entities: BTreeSet<String>,
    pub ids: Vec<ObjectId>,
}

// =============================================================================
// StoreHandle
// =============================================================================

/// The single persistent store shared by every context in a registry.
#[derive(Debug)]
pub struct StoreHandle {
    model: Arc<Model>,
    conn: Mutex<Connection>,
    next_id: AtomicU64,
    generation: AtomicU64,
    path: Option<PathBuf>,
}

impl StoreHandle {
    /// Opens (or creates) the store file at `path` for `model`.
    ///
    /// The parent directory is created if missing. The store remembers the
    /// model name it was created with and refuses to open under another one.
    pub fn open(path: impl AsRef<Path>, model: Model) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let db = Database::open(path)?;
        let store = Self::from_database(db, model, Some(path.to_path_buf()))?;
        info!(path = %path.display(), next_id = store.next_id.load(Ordering::Relaxed), "store opened");
        Ok(store)
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory(model: Model) -> Result<Self> {
        Self::from_database(Database::open_in_memory()?, model, None)
    }

    fn from_database(db: Database, model: Model, path: Option<PathBuf>) -> Result<Self> {
        model.validate()?;
        db.verify_model_name(model.name())?;
        let next_id = db.max_object_id()? + 1;
        Ok(Self {
            model: Arc::new(model),
            conn: Mutex::new(db.into_connection()),
            next_id: AtomicU64::new(next_id),
            generation: AtomicU64::new(0),
            path,
        })
    }

    /// The model this store was opened with.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// On-disk location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of commits made through this handle.
    pub fn generation(&self) -> Generation {
        Generation::from_raw(self.generation.load(Ordering::Acquire))
    }

    /// Allocates a fresh identity token.
    pub fn allocate_id(&self) -> ObjectId {
        ObjectId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave the connection
        // mid-transaction: rusqlite rolls back on drop.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All committed records of one entity, in identity order.
    pub fn fetch_entity(&self, entity: &str) -> Result<Vec<ObjectRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, payload, checksum FROM objects WHERE entity = ? ORDER BY id",
        )?;
        let rows = stmt.query_map([entity], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, payload, checksum) = row?;
            records.push(decode_record(
                ObjectId::from_raw(id as u64),
                entity.to_string(),
                &payload,
                checksum,
            )?);
        }
        Ok(records)
    }

    /// One committed record by identity.
    pub fn fetch_object(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT entity, payload, checksum FROM objects WHERE id = ?",
                [id.as_raw() as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(entity, payload, checksum)| decode_record(id, entity, &payload, checksum))
            .transpose()
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Checks a record against its entity descriptor.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownEntity` if the entity is not in the model
    /// - `Error::InvalidAttribute` for undeclared attributes or relationships
    /// - `Error::TypeMismatch` if a value does not conform to its attribute type
    /// - `Error::Validation` if a required attribute is null
    pub fn validate(&self, record: &ObjectRecord) -> Result<()> {
        let descriptor = self.model.entity(&record.entity)?;

        for (name, value) in &record.attributes {
            let attr = descriptor.attribute_named(name)?;
            if value.conform(attr.ty).is_none() {
                return Err(Error::TypeMismatch {
                    attribute: name.clone(),
                    expected: attr.ty,
                    found: value.type_name(),
                });
            }
        }

        for attr in descriptor.attributes().iter().filter(|a| a.required) {
            if record.value(&attr.name).is_null() {
                return Err(Error::Validation {
                    entity: record.entity.clone(),
                    id: record.id,
                    attribute: attr.name.clone(),
                });
            }
        }

        for (name, targets) in &record.relations {
            let rel = descriptor.relationship_named(name)?;
            if rel.cardinality == Cardinality::ToOne && targets.len() > 1 {
                return Err(Error::invalid_attribute(
                    &record.entity,
                    name,
                    "to-one relationship holds more than one target",
                ));
            }
        }

        Ok(())
    }

    /// Validates every record a changeset would write.
    pub fn validate_changes(&self, changes: &Changeset) -> Result<()> {
        changes
            .inserted
            .iter()
            .chain(&changes.updated)
            .try_for_each(|record| self.validate(record))
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Durably applies a changeset in one transaction.
    ///
    /// Validation runs before the transaction opens; a failure leaves the store
    /// untouched.
    pub fn commit(&self, changes: &Changeset) -> Result<CommitReceipt> {
        self.validate_changes(changes)?;

        let now = current_time_ms();
        let mut ids = Vec::with_capacity(
            changes.inserted.len() + changes.updated.len() + changes.deleted.len(),
        );

        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO objects (id, entity, payload, checksum, updated_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for record in &changes.inserted {
                    let (payload, checksum) = encode_record(record)?;
                    insert.execute(params![
                        record.id.as_raw() as i64,
                        record.entity,
                        payload,
                        checksum,
                        now
                    ])?;
                    ids.push(record.id);
                }

                // An update never resurrects a deleted row.
                let mut update = tx.prepare_cached(
                    "UPDATE objects SET payload = ?2, checksum = ?3, updated_ms = ?4
                     WHERE id = ?1",
                )?;
                for record in &changes.updated {
                    let (payload, checksum) = encode_record(record)?;
                    let touched = update.execute(params![
                        record.id.as_raw() as i64,
                        payload,
                        checksum,
                        now
                    ])?;
                    if touched == 0 {
                        return Err(Error::Conflict { id: record.id });
                    }
                    ids.push(record.id);
                }

                let mut delete = tx.prepare_cached("DELETE FROM objects WHERE id = ?")?;
                for (id, _) in &changes.deleted {
                    delete.execute([id.as_raw() as i64])?;
                    ids.push(*id);
                }
            }
            tx.commit()?;
        }

        let generation = Generation::from_raw(self.generation.fetch_add(1, Ordering::AcqRel) + 1);
        debug!(
            %generation,
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "store commit"
        );

        Ok(CommitReceipt {
            generation,
            entities: changes.entities(),
            ids,
        })
    }
}

fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
