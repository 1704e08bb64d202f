//! # Payload Serialization
//!
//! The storage engines never interpret event bodies, but they do have to turn
//! a commit's event list and header map into bytes for a row, and back. That
//! conversion is the [`Serializer`] capability, supplied by the host.
//!
//! ## Stored Payload Format
//!
//! ```text
//! commits.headers = Serializer(Headers)
//! commits.payload = Serializer(Vec<EventMessage>)
//! commits.checksum = XXH3-64(headers || payload)
//! ```
//!
//! The checksum is verified on every read, so a damaged row surfaces as
//! [`Error::Corrupted`](crate::Error::Corrupted) instead of garbage events.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

// =============================================================================
// Serializer Capability
// =============================================================================

/// Converts values to bytes and back.
///
/// # Rust Pattern: Generic Methods, Static Dispatch
///
/// The methods are generic over the value type, so the trait is used as a
/// type parameter (`SqliteCommitStore<S: Serializer>`) rather than as a
/// trait object. Each engine is monomorphized for its serializer.
pub trait Serializer: Send + Sync + 'static {
    /// Serializes a value into bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserializes bytes produced by [`Serializer::serialize`].
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// The default serializer: compact JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes the integrity checksum of a stored row.
///
/// XXH3-64 over the concatenation of all parts, little-endian.
pub fn compute_checksum(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = xxhash_rust::xxh3::Xxh3::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.digest().to_le_bytes().to_vec()
}

/// Returns the current time in milliseconds since Unix epoch.
///
/// A clock set before 1970 reads as 0.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
