use serde::Serialize;
use sha2::{Digest, Sha256};
use trove_core::errors::TroveError;

use crate::serde::to_canonical_json_bytes;

/// Digests an already canonical encoding into a lowercase hex string.
pub fn content_hash(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Computes a stable SHA256 hash for the provided serializable value.
pub fn stable_hash_string<T: Serialize>(value: &T) -> Result<String, TroveError> {
    let bytes = to_canonical_json_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
