#![deny(missing_docs)]
#![doc = "Canonical encoding, blob addressing, record storage and the `Storable` capability set."]

/// Blob address derivation and enumeration.
pub mod address;
/// Canonical encoder and cosmetic normalisation.
pub mod canonical;
/// Content digests.
pub mod hash;
/// Per-entity record documents and merge policies.
pub mod record;
/// Canonical JSON and YAML serde helpers.
pub mod serde;
/// Shared identity and persistence capabilities.
pub mod storable;

pub use address::{
    blob_path, expand_root, fan_out_dir, hash_from_blob_path, list_blob_paths, normalize_path, split_hash, BLOB_DIR,
    HASH_SPLIT_POINT,
};
pub use canonical::{
    encode, mask_generated_names, normalize_model, strip_defaults, strip_version_tags,
    CanonicalRules, PLACEHOLDER,
};
pub use hash::{content_hash, stable_hash_string};
pub use record::{merge, MergePolicy, Record, RECORD_FILE};
pub use serde::{
    from_json_slice, from_yaml_slice, read_json_or_empty, to_canonical_json_bytes,
    to_pretty_json_bytes, to_yaml_string, write_atomic, write_json,
};
pub use storable::{EntityKind, Identity, Storable};
