//! Blob addressing: `root/blob/<hash[..2]>/<hash[2..]>`.

use std::path::{Component, Path, PathBuf};

use trove_core::errors::{ErrorInfo, TroveError};
use walkdir::WalkDir;

/// Directory under the archive root that holds every entity address.
pub const BLOB_DIR: &str = "blob";
/// Number of leading hash characters used for the fan-out directory.
pub const HASH_SPLIT_POINT: usize = 2;

/// Splits a hash into its fan-out prefix and remainder.
pub fn split_hash(hash: &str) -> (&str, &str) {
    let split = hash
        .char_indices()
        .nth(HASH_SPLIT_POINT)
        .map(|(idx, _)| idx)
        .unwrap_or(hash.len());
    hash.split_at(split)
}

/// Expands `$VAR` and `${VAR}` references and normalises the path lexically.
///
/// Unknown variables expand to the empty string.
pub fn expand_root(raw: &Path) -> PathBuf {
    let text = raw.to_string_lossy();
    let mut expanded = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            expanded.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if braced && next == '}' {
                chars.next();
                break;
            }
            if !braced && !(next.is_ascii_alphanumeric() || next == '_') {
                break;
            }
            name.push(next);
            chars.next();
        }
        if name.is_empty() && !braced {
            expanded.push('$');
        } else {
            expanded.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    normalize_path(Path::new(&expanded))
}

/// Normalises a path lexically: `.` components are dropped and `..` pops a
/// preceding named component. The filesystem is not consulted.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// Returns the address directory for `hash` beneath `root`.
pub fn blob_path(root: &Path, hash: &str) -> PathBuf {
    let (prefix, rest) = split_hash(hash);
    root.join(BLOB_DIR).join(prefix).join(rest)
}

/// Returns the fan-out directory that contains the address of `hash`.
pub fn fan_out_dir(root: &Path, hash: &str) -> PathBuf {
    let (prefix, _) = split_hash(hash);
    root.join(BLOB_DIR).join(prefix)
}

/// Reassembles the hash from an address directory path.
pub fn hash_from_blob_path(path: &Path) -> Option<String> {
    let rest = path.file_name()?.to_str()?;
    let prefix = path.parent()?.file_name()?.to_str()?;
    if prefix.chars().count() != HASH_SPLIT_POINT || rest.is_empty() {
        return None;
    }
    Some(format!("{prefix}{rest}"))
}

/// Lists every address directory in the archive, sorted by path.
pub fn list_blob_paths(root: &Path) -> Result<Vec<PathBuf>, TroveError> {
    let blob_root = root.join(BLOB_DIR);
    if !blob_root.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(&blob_root).min_depth(2).max_depth(2).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            TroveError::ArchiveIo(
                ErrorInfo::new("trove.blob_walk", err.to_string())
                    .with_context("path", blob_root.display().to_string()),
            )
        })?;
        if entry.file_type().is_dir() {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}
