//! Structured error types shared across trove crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`TroveError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (hashes, paths, counts, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the trove archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum TroveError {
    /// Argument, output-slot or container slot counts disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(ErrorInfo),
    /// A procedure produced an output element that cannot be archived.
    #[error("invalid output: {0}")]
    InvalidOutput(ErrorInfo),
    /// A function reference could not be resolved in the current registry.
    #[error("unresolvable function: {0}")]
    UnresolvableFunction(ErrorInfo),
    /// A trial data reference is neither a procedure nor a materialised path.
    #[error("invalid data source: {0}")]
    InvalidDataSource(ErrorInfo),
    /// A configuration combination that the archive refuses to run.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(ErrorInfo),
    /// The executor adapter failed while compiling, fitting or evaluating.
    #[error("delegate failure: {0}")]
    DelegateFailure(ErrorInfo),
    /// Reading or writing a description, record, history or container failed.
    #[error("archive io failure: {0}")]
    ArchiveIo(ErrorInfo),
    /// Encoding or decoding of a structured payload failed.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl TroveError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            TroveError::ShapeMismatch(info)
            | TroveError::InvalidOutput(info)
            | TroveError::UnresolvableFunction(info)
            | TroveError::InvalidDataSource(info)
            | TroveError::UnsupportedConfiguration(info)
            | TroveError::DelegateFailure(info)
            | TroveError::ArchiveIo(info)
            | TroveError::Serde(info) => info,
        }
    }

    fn info_mut(&mut self) -> &mut ErrorInfo {
        match self {
            TroveError::ShapeMismatch(info)
            | TroveError::InvalidOutput(info)
            | TroveError::UnresolvableFunction(info)
            | TroveError::InvalidDataSource(info)
            | TroveError::UnsupportedConfiguration(info)
            | TroveError::DelegateFailure(info)
            | TroveError::ArchiveIo(info)
            | TroveError::Serde(info) => info,
        }
    }

    /// Attaches the hash of the offending entity unless one is already present.
    ///
    /// Nested failures keep the innermost hash so the exact archive address
    /// that broke stays inspectable.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.info_mut()
            .context
            .entry("hash".to_string())
            .or_insert_with(|| hash.into());
        self
    }

    /// Returns the entity hash recorded in the context, if any.
    pub fn hash(&self) -> Option<&str> {
        self.info().context.get("hash").map(String::as_str)
    }

    /// True for read/write failures against the archive.
    pub fn is_archive_io(&self) -> bool {
        matches!(self, TroveError::ArchiveIo(_))
    }

    /// Shorthand for an [`TroveError::ArchiveIo`] built from an underlying error.
    pub fn archive_io(code: &str, err: impl ToString) -> Self {
        TroveError::ArchiveIo(ErrorInfo::new(code, err.to_string()))
    }

    /// Shorthand for a [`TroveError::Serde`] built from an underlying error.
    pub fn serde(code: &str, err: impl ToString) -> Self {
        TroveError::Serde(ErrorInfo::new(code, err.to_string()))
    }
}
