use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trove_archive::{expand_root, from_yaml_slice};
use trove_core::errors::{ErrorInfo, TroveError};

use crate::trial::ExecOptions;

/// Environment variable naming the default archive root.
pub const ARCHIVE_ENV: &str = "TROVE_ARCHIVE";

/// YAML-configurable settings for working against an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroveConfig {
    /// Archive root; `$VAR` references are expanded on use.
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,
    /// Persist training procedure outputs when a trial evaluates them.
    #[serde(default = "default_true")]
    pub archive_training: bool,
    /// Persist validation procedure outputs when a trial evaluates them.
    #[serde(default = "default_true")]
    pub archive_validation: bool,
    /// Worker threads used to materialise procedures in bulk.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// History metrics whose best value is copied into trial records.
    #[serde(default = "default_record_metrics")]
    pub record_metrics: Vec<String>,
    /// Default log filter directive.
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("archive")
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

fn default_record_metrics() -> Vec<String> {
    vec!["val_acc".to_string()]
}

fn default_log() -> String {
    "info".to_string()
}

impl Default for TroveConfig {
    fn default() -> Self {
        Self {
            archive_root: default_archive_root(),
            archive_training: true,
            archive_validation: true,
            concurrency: default_concurrency(),
            record_metrics: default_record_metrics(),
            log: default_log(),
        }
    }
}

impl TroveConfig {
    /// Loads a YAML config file.
    pub fn load(path: &Path) -> Result<Self, TroveError> {
        let bytes = fs::read(path).map_err(|err| {
            TroveError::ArchiveIo(
                ErrorInfo::new("trove.config_read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        from_yaml_slice(&bytes)
    }

    /// Defaults, with the archive root taken from `TROVE_ARCHIVE` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = std::env::var_os(ARCHIVE_ENV) {
            config.archive_root = PathBuf::from(root);
        }
        config
    }

    /// The archive root with variables expanded.
    pub fn archive_root(&self) -> PathBuf {
        expand_root(&self.archive_root)
    }

    /// Execution options derived from this config.
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            archive_training: self.archive_training,
            archive_validation: self.archive_validation,
            record_metrics: self.record_metrics.clone(),
            concurrency: self.concurrency.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: TroveConfig =
            from_yaml_slice(b"archive_root: /srv/trove\nconcurrency: 4\n").unwrap();
        assert_eq!(config.archive_root, PathBuf::from("/srv/trove"));
        assert_eq!(config.concurrency, 4);
        assert!(config.archive_training);
        assert_eq!(config.record_metrics, vec!["val_acc".to_string()]);
        assert_eq!(config.exec_options().concurrency, 4);
    }
}
