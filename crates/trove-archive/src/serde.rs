use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::iter::FromIterator;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::warn;
use trove_core::errors::{ErrorInfo, TroveError};

fn serde_error(code: &str, err: impl ToString) -> TroveError {
    TroveError::Serde(ErrorInfo::new(code, err.to_string()))
}

pub(crate) fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered = map
                .into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect::<BTreeMap<_, _>>();
            Value::Object(Map::from_iter(ordered))
        }
        Value::Array(values) => {
            let canonical_values = values.into_iter().map(canonicalize).collect();
            Value::Array(canonical_values)
        }
        other => other,
    }
}

/// Serializes a value into canonical JSON bytes with deterministic ordering.
pub fn to_canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, TroveError> {
    let value = serde_json::to_value(value).map_err(|err| serde_error("trove.json_serialize", err))?;
    let canonical = canonicalize(value);
    let mut bytes = Vec::new();
    serde_json::to_writer(&mut bytes, &canonical)
        .map_err(|err| serde_error("trove.json_write", err))?;
    Ok(bytes)
}

/// Serializes a value into indented JSON with sorted keys, for files humans read.
pub fn to_pretty_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, TroveError> {
    let value = serde_json::to_value(value).map_err(|err| serde_error("trove.json_serialize", err))?;
    let canonical = canonicalize(value);
    serde_json::to_vec_pretty(&canonical).map_err(|err| serde_error("trove.json_write", err))
}

/// Deserializes a value from JSON bytes.
pub fn from_json_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TroveError> {
    serde_json::from_slice(data).map_err(|err| serde_error("trove.json_deserialize", err))
}

/// Serializes a value into deterministic YAML.
pub fn to_yaml_string<T: Serialize>(value: &T) -> Result<String, TroveError> {
    serde_yaml::to_string(value).map_err(|err| serde_error("trove.yaml_serialize", err))
}

/// Deserializes a YAML payload into the requested type.
pub fn from_yaml_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TroveError> {
    serde_yaml::from_slice(data).map_err(|err| serde_error("trove.yaml_deserialize", err))
}

/// Reads a JSON object from disk, degrading to an empty object.
///
/// A missing file is the normal "nothing recorded yet" case. Unreadable or
/// malformed files are logged and also treated as absent.
pub fn read_json_or_empty(path: &Path) -> Map<String, Value> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Map::new(),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read json document");
            return Map::new();
        }
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = %path.display(), "json document is not an object");
            Map::new()
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to parse json document");
            Map::new()
        }
    }
}

/// Writes `value` as pretty canonical JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TroveError> {
    let bytes = to_pretty_json_bytes(value)?;
    write_atomic(path, &bytes, "trove.json_file_write")
}

/// Replaces `path` with `bytes` through a uniquely named sibling staging
/// file, so readers never observe a partial file and concurrent writers to
/// one path resolve as last-writer-wins.
pub fn write_atomic(path: &Path, bytes: &[u8], code: &str) -> Result<(), TroveError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|err| {
        TroveError::ArchiveIo(
            ErrorInfo::new("trove.mkdir", err.to_string())
                .with_context("path", parent.display().to_string()),
        )
    })?;
    let io_error = |err: std::io::Error| {
        TroveError::ArchiveIo(
            ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
        )
    };
    let mut staging = NamedTempFile::new_in(parent).map_err(io_error)?;
    staging.write_all(bytes).map_err(io_error)?;
    staging.persist(path).map_err(|err| io_error(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_bytes_sort_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": null});
        let bytes = to_canonical_json_bytes(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn missing_document_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_json_or_empty(&dir.path().join("absent.json")).is_empty());
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        assert!(read_json_or_empty(&dir.path().join("broken.json")).is_empty());
    }

    #[test]
    fn concurrent_writers_never_expose_partial_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        let payload = |i: usize| json!({"writer": i, "padding": "x".repeat(4096)});
        write_json(&path, &payload(0)).unwrap();

        std::thread::scope(|scope| {
            for i in 1..=4 {
                let path = &path;
                scope.spawn(move || {
                    for _ in 0..25 {
                        write_json(path, &payload(i)).unwrap();
                    }
                });
            }
            for _ in 0..100 {
                let doc = read_json_or_empty(&path);
                assert!(doc.contains_key("writer"), "reader saw a partial document");
            }
        });

        let last = read_json_or_empty(&path);
        assert_eq!(last["padding"].as_str().map(str::len), Some(4096));
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
