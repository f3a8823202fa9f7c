//! # Error Handling for LayerDB
//!
//! This module defines the error types used throughout LayerDB. A single
//! error enum ([`Error`]) represents every failure mode, and every variant maps
//! to a numeric code inside one namespaced error domain ([`ERROR_DOMAIN`]).
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from the `#[from]` attributes, so `?` works on
//!   `rusqlite`, `serde_json` and `std::io` errors
//!
//! ## Error Categories
//!
//! | Codes | Category | Detected | Typical Response |
//! |-------|----------|----------|------------------|
//! | 1xx | Import configuration | Builder construction | Fix the source |
//! | 2xx | Field / schema | Query or update build, before store access | Fix the call site |
//! | 3xx | Store | Fetch or commit | Log, retry, or surface to the user |
//! | 4xx | Context | Runtime | Programming error or shutdown |
//!
//! ## Synchronous vs Asynchronous Failures
//!
//! Foreground calls return `Result<T>`. Background save propagation cannot
//! return into the caller's stack, so those failures are converted into an
//! [`ErrorInfo`] (which is `Clone`, unlike `rusqlite::Error`) and broadcast by
//! the [`Notifier`](crate::notify::Notifier).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttributeType, ContextId, ObjectId};

/// The namespaced error domain shared by every LayerDB error code.
pub const ERROR_DOMAIN: &str = "layerdb";

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in LayerDB operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // 1xx: Import configuration
    // =========================================================================

    /// The import source kind is not one we can read (for example a file
    /// extension other than `.json`).
    #[error("invalid import source type '{0}'")]
    InvalidSourceType(String),

    /// The import source does not exist or cannot be opened.
    #[error("invalid import source location '{}'", .0.display())]
    InvalidSourceLocation(PathBuf),

    // =========================================================================
    // 2xx: Field / schema
    // =========================================================================

    /// An attribute or relationship name is unknown for the entity, or the
    /// attribute cannot be used the way the caller asked (LIKE on a number,
    /// `sum` on text, ...).
    ///
    /// Always raised while a query, update or import is being built, before
    /// any store access happens.
    #[error("invalid attribute '{attribute}' on entity '{entity}': {reason}")]
    InvalidAttribute {
        /// Entity the attribute was looked up on.
        entity: String,
        /// The offending attribute or relationship name.
        attribute: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An imported field needs a `map` hook to convert source values into the
    /// attribute's semantic type.
    #[error("field '{field}' requires a formatter to be imported into a {ty} attribute")]
    MissingFormatter {
        /// The attribute being imported.
        field: String,
        /// Semantic type that needs the conversion.
        ty: AttributeType,
    },

    /// A value does not conform to the attribute's semantic type.
    #[error("type mismatch for '{attribute}': expected {expected}, found {found}")]
    TypeMismatch {
        /// The attribute being assigned or compared.
        attribute: String,
        /// The attribute's declared type.
        expected: AttributeType,
        /// The type name of the supplied value.
        found: &'static str,
    },

    /// The entity is not part of the store's model.
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    // =========================================================================
    // 3xx: Store
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A stored payload no longer matches its checksum.
    #[error("corrupted payload for object {id}: checksum mismatch")]
    Corruption {
        /// The object whose row is damaged.
        id: ObjectId,
    },

    /// Schema version or model name mismatch.
    #[error("schema error: {0}")]
    Schema(String),

    /// A required attribute is missing on save.
    #[error("validation failed for {entity} {id}: required attribute '{attribute}' is missing")]
    Validation {
        /// Entity of the invalid object.
        entity: String,
        /// The invalid object.
        id: ObjectId,
        /// The required attribute that is null.
        attribute: String,
    },

    /// Filesystem failure (store directory, import source, thread spawn).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed, or was changed after first access.
    #[error("configuration error: {0}")]
    Config(String),

    /// An update reached the store after its row was deleted.
    #[error("object {id} was deleted before its update was committed")]
    Conflict {
        /// The object whose row is gone.
        id: ObjectId,
    },

    // =========================================================================
    // 4xx: Context
    // =========================================================================

    /// The object does not belong to (or is no longer visible in) the context.
    #[error("object {id} not found in context {context}")]
    NotFound {
        /// The object that was looked up.
        id: ObjectId,
        /// The context it was looked up in.
        context: ContextId,
    },

    /// A context was used from a thread other than the one it is bound to.
    ///
    /// This is a programming error. Context operations panic with this
    /// message instead of returning it.
    #[error("context {context} is bound to thread {owner} but was used from thread {caller}")]
    ThreadAffinityViolation {
        /// The misused context.
        context: ContextId,
        /// The thread the context is bound to.
        owner: String,
        /// The calling thread.
        caller: String,
    },

    /// The primary context's worker has shut down.
    #[error("{0}")]
    Closed(String),

    /// A subscriber fell behind the broadcast buffer and missed events.
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),

    /// A wait for a save event did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns the numeric code of this error inside [`ERROR_DOMAIN`].
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidSourceType(_) => 100,
            Error::InvalidSourceLocation(_) => 101,
            Error::InvalidAttribute { .. } => 200,
            Error::MissingFormatter { .. } => 201,
            Error::TypeMismatch { .. } => 202,
            Error::UnknownEntity(_) => 203,
            Error::Sqlite(_) => 300,
            Error::Codec(_) => 301,
            Error::Corruption { .. } => 302,
            Error::Schema(_) => 303,
            Error::Validation { .. } => 304,
            Error::Io(_) => 305,
            Error::Config(_) => 306,
            Error::Conflict { .. } => 307,
            Error::NotFound { .. } => 400,
            Error::ThreadAffinityViolation { .. } => 401,
            Error::Closed(_) => 402,
            Error::Lagged(_) => 403,
            Error::Timeout(_) => 404,
        }
    }

    /// Shorthand used by every descriptor lookup.
    pub(crate) fn invalid_attribute(
        entity: &str,
        attribute: &str,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidAttribute {
            entity: entity.to_string(),
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Structured Error Payload
// =============================================================================

/// A cloneable snapshot of an [`Error`], carried by save-failed events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Always [`ERROR_DOMAIN`].
    pub domain: String,
    /// Numeric code, see [`Error::code`].
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> Self {
        Self {
            domain: ERROR_DOMAIN.to_string(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", self.domain, self.code, self.message)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
