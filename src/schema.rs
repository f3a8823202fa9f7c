//! # SQLite Schema for LayerDB
//!
//! This module defines the on-disk layout of the store and handles
//! initialization. The layout is deliberately small: every entity of every type
//! lives in one `objects` table, keyed by its identity token.
//!
//! ## Table Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Schema Overview                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  objects                         layerdb_metadata             │
//! │  ┌───────────────────┐           ┌──────────────────┐         │
//! │  │ id (PK)           │           │ key (PK)         │         │
//! │  │ entity ───── idx  │           │ value            │         │
//! │  │ payload BLOB      │           └──────────────────┘         │
//! │  │ checksum          │             schema_version             │
//! │  │ updated_ms        │             model_name                 │
//! │  └───────────────────┘                                        │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why one table instead of one table per entity?
//!
//! The model is supplied at runtime. A single table means opening a store never
//! runs DDL that depends on the model, and predicates are evaluated in process
//! against decoded records anyway. The `entity` index keeps per-type scans cheap.
//!
//! ### Why record the model name?
//!
//! Opening a store written by a different model would silently reinterpret its
//! payloads. The first open records the model name; later opens must match.

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a mismatched version is an error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Every managed object, one row each.
///
/// - `id`: identity token, allocated by the store handle, never reused
/// - `entity`: entity name from the model
/// - `payload`: JSON body (see `codec`)
/// - `checksum`: XXH3-64 of `payload`
/// - `updated_ms`: wall-clock time of the last commit touching the row
const CREATE_OBJECTS: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    id         INTEGER PRIMARY KEY,
    entity     TEXT NOT NULL,
    payload    BLOB NOT NULL,
    checksum   INTEGER NOT NULL,
    updated_ms INTEGER NOT NULL
)
"#;

/// Per-entity scans: `WHERE entity = ? ORDER BY id`.
const CREATE_OBJECTS_ENTITY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS objects_entity
ON objects(entity, id)
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS layerdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the LayerDB schema applied.
///
/// `Database` only owns initialization. Once the schema is verified, the
/// connection is handed to the [`StoreHandle`](crate::store::StoreHandle) with
/// [`Database::into_connection`].
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(true)?;
        Ok(db)
    }

    /// Creates an in-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(false)?;
        Ok(db)
    }

    fn initialize(&mut self, on_disk: bool) -> Result<()> {
        // WAL lets readers keep a consistent snapshot while a commit is in
        // flight. In-memory databases do not support it.
        if on_disk {
            self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        }
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_OBJECTS)?;
        self.conn.execute_batch(CREATE_OBJECTS_ENTITY_INDEX)?;

        self.verify_or_set_version()
    }

    fn read_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM layerdb_metadata WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO layerdb_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        match self.read_metadata("schema_version")? {
            None => self.write_metadata("schema_version", &SCHEMA_VERSION.to_string()),
            Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => Ok(()),
            Some(v) => Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this LayerDB version requires {SCHEMA_VERSION}"
            ))),
        }
    }

    /// Records the model name on first open, and rejects a different one later.
    pub fn verify_model_name(&self, model_name: &str) -> Result<()> {
        match self.read_metadata("model_name")? {
            None => self.write_metadata("model_name", model_name),
            Some(existing) if existing == model_name => Ok(()),
            Some(existing) => Err(Error::Schema(format!(
                "store was created for model '{existing}', cannot open it with model '{model_name}'"
            ))),
        }
    }

    /// Largest identity token in use, or 0 for an empty store.
    pub fn max_object_id(&self) -> Result<u64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM objects", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    /// Releases the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
