//! # Record Payload Encoding and Decoding
//!
//! Each stored object is one row whose `payload` column holds the record's
//! attributes and relationships as JSON. A 64-bit XXH3 checksum of the payload
//! bytes is stored beside it and verified on every load.
//!
//! ## Stored Format
//!
//! ```text
//! objects row:
//!   id        INTEGER   identity token (ObjectId)
//!   entity    TEXT      entity name
//!   payload   BLOB      {"attributes":{...},"relations":{...}}
//!   checksum  INTEGER   xxh3_64(payload) as i64
//! ```
//!
//! `id` and `entity` live in their own columns so the store can filter by
//! entity without decoding, and are not duplicated in the blob.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::types::{ObjectId, ObjectRecord, Value};

/// Serialized body of a record. Borrowed on encode, owned on decode.
#[derive(Serialize)]
struct PayloadRef<'a> {
    attributes: &'a BTreeMap<String, Value>,
    relations: &'a BTreeMap<String, Vec<ObjectId>>,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    relations: BTreeMap<String, Vec<ObjectId>>,
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a record into its payload bytes and checksum.
pub fn encode_record(record: &ObjectRecord) -> Result<(Vec<u8>, i64)> {
    let bytes = serde_json::to_vec(&PayloadRef {
        attributes: &record.attributes,
        relations: &record.relations,
    })?;
    let checksum = checksum(&bytes);
    Ok((bytes, checksum))
}

/// XXH3-64 of the payload, reinterpreted as `i64` for SQLite's INTEGER column.
pub fn checksum(bytes: &[u8]) -> i64 {
    xxh3_64(bytes) as i64
}

// =============================================================================
// Decoding
// =============================================================================

/// Verifies the checksum and rebuilds the record.
///
/// # Errors
///
/// - `Error::Corruption` if the checksum does not match
/// - `Error::Codec` if the payload is not valid JSON for a record
pub fn decode_record(
    id: ObjectId,
    entity: String,
    payload: &[u8],
    stored_checksum: i64,
) -> Result<ObjectRecord> {
    if checksum(payload) != stored_checksum {
        return Err(Error::Corruption { id });
    }
    let body: Payload = serde_json::from_slice(payload)?;
    Ok(ObjectRecord {
        id,
        entity,
        attributes: body.attributes,
        relations: body.relations,
    })
}

// =============================================================================
// Tests
// =============================================================================
