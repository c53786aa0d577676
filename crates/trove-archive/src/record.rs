//! Record store: a flat key/value document kept beside each entity.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use trove_core::errors::TroveError;

use crate::serde::{read_json_or_empty, write_json};

/// File name of the record document inside an address directory.
pub const RECORD_FILE: &str = "record.json";

/// Flat record document. Keys iterate in sorted order.
pub type Record = Map<String, Value>;

/// How a partial record is merged into the stored one, key by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// The incoming value overwrites whatever was stored.
    #[default]
    Replace,
    /// The stored value becomes a list and gains the incoming value once.
    AppendUnique,
    /// The stored value becomes a list and always gains the incoming value.
    AppendAll,
}

/// Applies `partial` to `existing` in place under `policy`.
///
/// For the append policies an absent key starts from the empty list and a
/// stored scalar is first coerced into a one element list.
pub fn merge(existing: &mut Record, partial: &Record, policy: MergePolicy) {
    for (key, value) in partial {
        match policy {
            MergePolicy::Replace => {
                existing.insert(key.clone(), value.clone());
            }
            MergePolicy::AppendUnique | MergePolicy::AppendAll => {
                let mut items = match existing.remove(key) {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(scalar) => vec![scalar],
                };
                if policy == MergePolicy::AppendAll || !items.contains(value) {
                    items.push(value.clone());
                }
                existing.insert(key.clone(), Value::Array(items));
            }
        }
    }
}

/// Reads the record stored in `dir`; absent or unreadable records are empty.
pub fn read_record(dir: &Path) -> Record {
    read_json_or_empty(&dir.join(RECORD_FILE))
}

/// Overwrites the record stored in `dir`.
pub fn write_record(dir: &Path, record: &Record) -> Result<(), TroveError> {
    write_json(&dir.join(RECORD_FILE), record)
}

/// Merges `partial` into the stored record and writes the result back.
pub fn update_record(
    dir: &Path,
    partial: &Record,
    policy: MergePolicy,
) -> Result<Record, TroveError> {
    let mut record = read_record(dir);
    merge(&mut record, partial, policy);
    write_record(dir, &record)?;
    debug!(dir = %dir.display(), keys = partial.len(), ?policy, "record updated");
    Ok(record)
}

/// Removes `key` from the stored record, reporting whether it existed.
pub fn remove_key(dir: &Path, key: &str) -> Result<bool, TroveError> {
    let mut record = read_record(dir);
    if record.remove(key).is_none() {
        return Ok(false);
    }
    write_record(dir, &record)?;
    Ok(true)
}

/// Looks up several keys at once, `None` for each key not recorded.
pub fn get_values(dir: &Path, keys: &[&str]) -> Vec<Option<Value>> {
    let record = read_record(dir);
    keys.iter().map(|key| record.get(*key).cloned()).collect()
}
