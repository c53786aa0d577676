//! Canonical encoder: the stable textual form every identity is digested from.
//!
//! Encoding sorts mapping keys at every depth and writes compact JSON. Before
//! encoding, entity kinds apply their own normalisation through the helpers
//! here: fields equal to their declared default are dropped so that schemas
//! may grow defaulted fields without moving old hashes, and model blobs have
//! auto-generated names masked and version tags removed.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use trove_core::errors::{ErrorInfo, TroveError};

use crate::serde::{canonicalize, to_canonical_json_bytes};

/// Token substituted for auto-generated names in model definitions.
pub const PLACEHOLDER: &str = "@";

/// Cosmetic normalisation applied to opaque model definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRules {
    /// Keys whose string values are auto-generated (layer names and the like).
    pub generated_name_keys: Vec<String>,
    /// Keys carrying framework version strings, removed entirely.
    pub version_tag_keys: Vec<String>,
    /// Replacement written in place of generated names.
    pub placeholder: String,
}

impl Default for CanonicalRules {
    fn default() -> Self {
        Self {
            generated_name_keys: vec!["name".to_string()],
            version_tag_keys: vec!["keras_version".to_string(), "framework_version".to_string()],
            placeholder: PLACEHOLDER.to_string(),
        }
    }
}

/// Removes every entry of `map` whose value equals its declared default.
pub fn strip_defaults(map: &mut Map<String, Value>, defaults: &Map<String, Value>) {
    map.retain(|key, value| defaults.get(key) != Some(value));
}

/// Replaces auto-generated names with the placeholder.
///
/// Every string stored under a generated-name key is collected first, then
/// every string value anywhere in `value` equal to a collected name is
/// replaced, so references between layers are masked along with the names.
pub fn mask_generated_names(value: &mut Value, rules: &CanonicalRules) {
    let mut names = BTreeSet::new();
    collect_generated_names(value, rules, &mut names);
    if !names.is_empty() {
        replace_names(value, &names, &rules.placeholder);
    }
}

fn collect_generated_names(value: &Value, rules: &CanonicalRules, names: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map {
                match entry {
                    Value::String(name) if rules.generated_name_keys.iter().any(|k| k == key) => {
                        names.insert(name.clone());
                    }
                    _ => collect_generated_names(entry, rules, names),
                }
            }
        }
        Value::Array(values) => {
            for entry in values {
                collect_generated_names(entry, rules, names);
            }
        }
        _ => {}
    }
}

fn replace_names(value: &mut Value, names: &BTreeSet<String>, placeholder: &str) {
    match value {
        Value::String(text) if names.contains(text.as_str()) => {
            *value = Value::String(placeholder.to_string());
        }
        Value::Object(map) => {
            for entry in map.values_mut() {
                replace_names(entry, names, placeholder);
            }
        }
        Value::Array(values) => {
            for entry in values {
                replace_names(entry, names, placeholder);
            }
        }
        _ => {}
    }
}

/// Drops version-tag keys at every depth.
pub fn strip_version_tags(value: &mut Value, rules: &CanonicalRules) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !rules.version_tag_keys.iter().any(|tag| tag == key));
            for entry in map.values_mut() {
                strip_version_tags(entry, rules);
            }
        }
        Value::Array(values) => {
            for entry in values {
                strip_version_tags(entry, rules);
            }
        }
        _ => {}
    }
}

/// Returns the cosmetic-normalised copy of a model definition.
///
/// Definitions supplied as JSON text are parsed first so that the string and
/// structured forms of one model share an identity. The input is untouched.
pub fn normalize_model(model: &Value, rules: &CanonicalRules) -> Value {
    let mut copy = match model {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => model.clone(),
        },
        other => other.clone(),
    };
    mask_generated_names(&mut copy, rules);
    strip_version_tags(&mut copy, rules);
    copy
}

/// Encodes a value into its canonical string form.
pub fn encode(value: &Value) -> Result<String, TroveError> {
    let bytes = to_canonical_json_bytes(&canonicalize(value.clone()))?;
    String::from_utf8(bytes).map_err(|err| {
        TroveError::Serde(
            ErrorInfo::new("trove.canonical_utf8", "canonical encoding is not utf-8")
                .with_hint(err.to_string()),
        )
    })
}
