//! Training progress document kept at a trial's address.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use trove_archive::{read_json_or_empty, write_json};
use trove_core::errors::TroveError;

/// File name of the history document.
pub const HISTORY_FILE: &str = "history.json";

/// Progress of one consumed training source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProgress {
    /// Position of the source in the trial's training list.
    pub index: usize,
    /// Procedure hash or container path of the source.
    pub id: String,
    /// Samples fed to the executor.
    pub samples: u64,
    /// Epochs run on this source.
    pub epochs: u32,
}

/// What one fit call reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryDelta {
    /// Epochs actually run.
    pub epochs: u32,
    /// Per-epoch metric series, keyed by metric name.
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<f64>>,
}

/// Accumulated training history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// RFC 3339 time the first fit started.
    #[serde(default)]
    pub start_time: Option<String>,
    /// Wall time spent fitting, in seconds.
    #[serde(default)]
    pub elapse_time: f64,
    /// Cumulative epoch count across all sources.
    #[serde(default)]
    pub last_epoch: u32,
    /// Per-epoch metric series.
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<f64>>,
    /// Terminal events; non-empty marks the trial complete.
    #[serde(default)]
    pub stops: Vec<u32>,
    /// Progress of each training source, in order.
    #[serde(default)]
    pub sources: Vec<SourceProgress>,
    /// Samples in the validation source.
    #[serde(default)]
    pub validation_samples: Option<u64>,
}

impl History {
    /// Loads the history in `dir`; absent or malformed documents are empty.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(HISTORY_FILE);
        let document = read_json_or_empty(&path);
        match serde_json::from_value(Value::Object(document)) {
            Ok(history) => history,
            Err(err) => {
                warn!(path = %path.display(), %err, "history document has unexpected shape");
                Self::default()
            }
        }
    }

    /// Writes the history into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), TroveError> {
        write_json(&dir.join(HISTORY_FILE), self)
    }

    /// Whether a stop event has been recorded.
    pub fn is_complete(&self) -> bool {
        !self.stops.is_empty()
    }

    /// True when source `index` with identity `id` was already consumed.
    pub fn source_done(&self, index: usize, id: &str) -> bool {
        self.sources
            .iter()
            .any(|source| source.index == index && source.id == id)
    }

    /// Folds one fit call into the history.
    pub fn absorb(&mut self, delta: HistoryDelta, index: usize, id: String, samples: u64) {
        self.last_epoch += delta.epochs;
        for (name, values) in delta.metrics {
            self.metrics.entry(name).or_default().extend(values);
        }
        self.sources.push(SourceProgress {
            index,
            id,
            samples,
            epochs: delta.epochs,
        });
    }

    /// Appends the terminal event.
    pub fn finish(&mut self) {
        self.stops.push(self.last_epoch);
    }

    /// Samples consumed across every recorded source.
    pub fn total_samples(&self) -> u64 {
        self.sources.iter().map(|source| source.samples).sum()
    }

    /// Maximum of a metric series.
    pub fn best(&self, metric: &str) -> Option<f64> {
        self.metrics
            .get(metric)?
            .iter()
            .copied()
            .filter(|value| value.is_finite())
            .reduce(f64::max)
    }
}
