//! Boundary to the model framework that compiles, fits and evaluates models.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trove_core::errors::{ErrorInfo, TroveError};
use trove_core::DataSet;

use crate::history::HistoryDelta;
use crate::procedure::BatchStream;
use crate::trial::DistributedParams;

/// File the executor writes best-checkpoint weights to.
pub const WEIGHTS_FILE: &str = "weights.bin";

/// Everything needed to build a compiled model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileRequest {
    /// Opaque model definition.
    pub model: Value,
    /// Optimizer id.
    pub optimizer: String,
    /// Loss id.
    pub loss: String,
    /// Metric ids, sorted.
    pub metrics: Vec<String>,
    /// Sample weighting mode, if any.
    pub sample_weight_mode: Option<String>,
    /// Custom layer or object names mapped to their defining module.
    pub custom_objects: BTreeMap<String, String>,
    /// Weights to restore after compiling, if any.
    pub load_weights: Option<PathBuf>,
    /// Master seed of the run.
    pub seed: u64,
}

/// Training data handed to a fit or evaluate call.
#[derive(Debug)]
pub enum FitData {
    /// Fully materialised arrays.
    InMemory(DataSet),
    /// Lazy batches with a declared epoch length.
    Stream {
        /// Batch producer.
        stream: BatchStream,
        /// Samples that make up one epoch.
        samples_per_epoch: u64,
    },
    /// Output container on disk.
    Container(PathBuf),
}

impl FitData {
    /// Samples per epoch, when known without reading from disk.
    pub fn sample_count(&self) -> Option<u64> {
        match self {
            FitData::InMemory(data) => Some(data.sample_count()),
            FitData::Stream {
                samples_per_epoch, ..
            } => Some(*samples_per_epoch),
            FitData::Container(_) => None,
        }
    }
}

/// Per-fit run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Samples per gradient update.
    pub batch_size: u32,
    /// Epochs to train in this fit.
    pub epochs: u32,
    /// Callback descriptions, passed through untouched.
    pub callbacks: Vec<Value>,
    /// Fraction of the training data held out for validation.
    pub validation_split: f64,
    /// Shuffle training data between epochs.
    pub shuffle: bool,
    /// Per-class loss weights.
    pub class_weight: Option<Value>,
    /// Per-sample loss weights.
    pub sample_weight: Option<Value>,
    /// Epoch length for streamed sources.
    pub samples_per_epoch: Option<u64>,
    /// Validation samples drawn from streamed sources.
    pub nb_val_samples: Option<u64>,
    /// Prefetch queue length for streamed sources.
    pub max_queue_size: u32,
    /// Producer workers for streamed sources.
    pub workers: u32,
    /// Run producers in processes instead of threads.
    pub use_multiprocessing: bool,
    /// Metric the checkpoint monitors (`val_acc`, or `acc` without validation).
    pub monitor: String,
    /// Where best-checkpoint weights go.
    pub weights_path: PathBuf,
    /// Seed of this fit's substream.
    pub seed: u64,
}

/// The model framework, seen from the archive.
///
/// Handles are owned by a [`ModelCache`] keyed by trial hash, never by the
/// trial itself.
pub trait ExecutorAdapter {
    /// Compiled model handle.
    type Handle;

    /// Builds a compiled model, restoring `request.load_weights` when set.
    fn compile(&mut self, request: &CompileRequest) -> Result<Self::Handle, TroveError>;

    /// Fits one training source, continuing the epoch count at
    /// `resume_from_epoch`.
    fn fit(
        &mut self,
        handle: &mut Self::Handle,
        data: FitData,
        validation: Option<&DataSet>,
        run: &RunParams,
        resume_from_epoch: u32,
    ) -> Result<HistoryDelta, TroveError>;

    /// Fits every materialised source in one coordinated group run.
    fn fit_distributed(
        &mut self,
        handle: &mut Self::Handle,
        sources: &[PathBuf],
        validation: Option<&Path>,
        coordination: &DistributedParams,
        run: &RunParams,
    ) -> Result<HistoryDelta, TroveError>;

    /// Returns `[loss, metrics...]` on held-out data.
    fn evaluate(&mut self, handle: &mut Self::Handle, data: FitData) -> Result<Vec<f64>, TroveError>;
}

/// Externally owned cache of compiled models keyed by trial hash.
#[derive(Debug)]
pub struct ModelCache<H> {
    handles: HashMap<String, H>,
}

impl<H> Default for ModelCache<H> {
    fn default() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }
}

impl<H> ModelCache<H> {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a handle is cached for `hash`.
    pub fn contains(&self, hash: &str) -> bool {
        self.handles.contains_key(hash)
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handle is cached.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns the cached handle, compiling it first when absent.
    pub fn get_or_compile(
        &mut self,
        hash: &str,
        compile: impl FnOnce() -> Result<H, TroveError>,
    ) -> Result<&mut H, TroveError> {
        if !self.handles.contains_key(hash) {
            let handle = compile()?;
            self.handles.insert(hash.to_string(), handle);
        }
        self.handles.get_mut(hash).ok_or_else(|| {
            TroveError::DelegateFailure(
                ErrorInfo::new("trove.model_cache", "compiled model vanished from cache")
                    .with_context("hash", hash),
            )
        })
    }

    /// Drops the handle for `hash`, returning it.
    pub fn invalidate(&mut self, hash: &str) -> Option<H> {
        self.handles.remove(hash)
    }
}

/// Wraps an adapter error as a delegate failure carrying the trial hash.
pub(crate) fn delegate_failure(stage: &str, hash: &str, err: TroveError) -> TroveError {
    match err {
        TroveError::DelegateFailure(info) => TroveError::DelegateFailure(info).with_hash(hash),
        other => TroveError::DelegateFailure(
            ErrorInfo::new(format!("trove.{stage}"), other.info().message.clone())
                .with_context("hash", hash)
                .with_context("cause_code", other.info().code.clone())
                .with_hint(other.to_string()),
        ),
    }
}
