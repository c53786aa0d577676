//! Cacheable, resumable experiments.
//!
//! A trial pairs an opaque model definition with its data sources and
//! compile/fit parameters. Its identity is the canonical encoding of those
//! fields with defaults stripped and the model's generated names and version
//! tags normalised away. Completion is read from the `stops` list of the
//! history document at the trial's address.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use trove_archive::{
    normalize_model, normalize_path, strip_defaults, write_json, CanonicalRules, EntityKind, Identity,
    MergePolicy, Record, Storable,
};
use trove_core::errors::{ErrorInfo, TroveError};
use trove_core::{derive_substream_seed, seed_from_hash, DataSet};

use crate::batch::assert_archived;
use crate::container::ArchiveContainer;
use crate::executor::{
    delegate_failure, CompileRequest, ExecutorAdapter, FitData, ModelCache, RunParams,
    WEIGHTS_FILE,
};
use crate::function::FunctionRegistry;
use crate::history::History;
use crate::procedure::{EvalOptions, Outputs, Procedure, ProcedureSpec, Resolver};

const RULE_WIDTH: usize = 50;
const INDENT: &str = "    ";

/// Where a trial reads training, validation or test data from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Outputs of a procedure, evaluated (and cached) on demand.
    Procedure(ProcedureSpec),
    /// An already materialised output container.
    Path(PathBuf),
}

impl DataSource {
    /// Source backed by `procedure`.
    pub fn procedure(procedure: &Procedure) -> Self {
        DataSource::Procedure(procedure.spec().clone())
    }

    /// Source backed by a container file.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        DataSource::Path(path.into())
    }

    /// Interprets a loosely typed reference.
    ///
    /// Accepts the tagged form, a bare procedure description or a string
    /// path. Anything else is rejected with `InvalidDataSource`.
    pub fn from_value(value: &Value) -> Result<Self, TroveError> {
        let invalid = |kind: &str, detail: Option<String>| {
            let mut info = ErrorInfo::new(
                "trove.data_source",
                "data source must be a procedure or a materialised path",
            )
            .with_context("kind", kind);
            if let Some(detail) = detail {
                info = info.with_hint(detail);
            }
            TroveError::InvalidDataSource(info)
        };
        match value {
            Value::String(path) => Ok(DataSource::Path(PathBuf::from(path))),
            Value::Object(map)
                if map.len() == 1 && (map.contains_key("procedure") || map.contains_key("path")) =>
            {
                serde_json::from_value(value.clone())
                    .map_err(|err| invalid("object", Some(err.to_string())))
            }
            Value::Object(map) if map.contains_key("func") => {
                let spec: ProcedureSpec = serde_json::from_value(value.clone())
                    .map_err(|err| invalid("object", Some(err.to_string())))?;
                Ok(DataSource::Procedure(spec))
            }
            Value::Null => Err(invalid("null", None)),
            Value::Bool(_) => Err(invalid("bool", None)),
            Value::Number(_) => Err(invalid("number", None)),
            Value::Array(_) => Err(invalid("array", None)),
            Value::Object(_) => Err(invalid("object", None)),
        }
    }

    fn document(&self, for_identity: bool) -> Result<Value, TroveError> {
        Ok(match self {
            DataSource::Procedure(spec) if for_identity => json!({ "procedure": spec.hashable() }),
            DataSource::Procedure(spec) => json!({
                "procedure": serde_json::to_value(spec)
                    .map_err(|err| TroveError::serde("trove.json_serialize", err))?
            }),
            DataSource::Path(path) => json!({ "path": path_key(path) }),
        })
    }

    /// Procedure hash or normalised path string.
    fn id(&self, root: &Path) -> Result<String, TroveError> {
        match self {
            DataSource::Procedure(spec) => Procedure::from_spec(root, spec.clone()).hash(),
            DataSource::Path(path) => Ok(path_key(path)),
        }
    }

    fn render(&self) -> String {
        match self {
            DataSource::Procedure(spec) => spec.signature(),
            DataSource::Path(path) => path.display().to_string(),
        }
    }

    fn invalid_path(path: &Path) -> TroveError {
        TroveError::InvalidDataSource(
            ErrorInfo::new("trove.data_path_missing", "materialised data path does not exist")
                .with_context("path", path.display().to_string()),
        )
    }
}

fn path_key(path: &Path) -> String {
    normalize_path(path).display().to_string()
}

/// Validation configuration. Exactly one variant is active.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Validation {
    /// No validation.
    #[default]
    None,
    /// Fraction of each training source held out, in `[0, 1)`.
    Split(f64),
    /// A dedicated validation source.
    Procedure(DataSource),
}

fn check_split(split: f64) -> Result<Validation, TroveError> {
    if !(0.0..1.0).contains(&split) {
        return Err(TroveError::UnsupportedConfiguration(
            ErrorInfo::new("trove.val_split_range", "validation split must lie in [0, 1)")
                .with_context("validation_split", split.to_string()),
        ));
    }
    Ok(if split == 0.0 {
        Validation::None
    } else {
        Validation::Split(split)
    })
}

fn parse_validation(split: f64, procedure: Option<&Value>) -> Result<Validation, TroveError> {
    let source = match procedure {
        None | Some(Value::Null) => return check_split(split),
        Some(Value::Number(number)) => {
            return Err(TroveError::InvalidDataSource(
                ErrorInfo::new(
                    "trove.val_numeric",
                    "val_procedure holds a number instead of a data source",
                )
                .with_context("val_procedure", number.to_string())
                .with_hint("set validation_split to hold out a fraction"),
            ))
        }
        Some(Value::Array(items)) => match items.as_slice() {
            [] => return check_split(split),
            [single] => DataSource::from_value(single)?,
            _ => return Err(validation_list_error(items.len())),
        },
        Some(other) => DataSource::from_value(other)?,
    };
    if split != 0.0 {
        return Err(TroveError::UnsupportedConfiguration(
            ErrorInfo::new(
                "trove.val_conflict",
                "validation split and validation procedure are both set",
            )
            .with_context("validation_split", split.to_string()),
        ));
    }
    Ok(Validation::Procedure(source))
}

fn validation_list_error(len: usize) -> TroveError {
    TroveError::UnsupportedConfiguration(
        ErrorInfo::new("trove.val_list", "validation accepts a single procedure")
            .with_context("count", len.to_string()),
    )
}

/// Compilation parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompileParams {
    /// Optimizer id.
    pub optimizer: String,
    /// Loss id.
    pub loss: String,
    /// Metric ids, kept sorted.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Sample weighting mode, if any.
    #[serde(default)]
    pub sample_weight_mode: Option<String>,
}

fn default_batch_size() -> u32 {
    32
}

fn default_epochs() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_queue_size() -> u32 {
    10
}

fn default_fit_workers() -> u32 {
    1
}

/// Fit and generator-fit parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    /// Samples per gradient update.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Epochs per training source.
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    /// Callback descriptions.
    #[serde(default)]
    pub callbacks: Vec<Value>,
    /// Shuffle training data between epochs.
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Per-class loss weights.
    #[serde(default)]
    pub class_weight: Option<Value>,
    /// Per-sample loss weights.
    #[serde(default)]
    pub sample_weight: Option<Value>,
    /// Required when a training source streams.
    #[serde(default)]
    pub samples_per_epoch: Option<u64>,
    /// Validation samples drawn from streamed sources.
    #[serde(default)]
    pub nb_val_samples: Option<u64>,
    /// Prefetch queue length for streamed sources.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u32,
    /// Producer workers for streamed sources.
    #[serde(default = "default_fit_workers")]
    pub workers: u32,
    /// Run producers in processes instead of threads.
    #[serde(default)]
    pub use_multiprocessing: bool,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            callbacks: Vec::new(),
            shuffle: true,
            class_weight: None,
            sample_weight: None,
            samples_per_epoch: None,
            nb_val_samples: None,
            max_queue_size: default_max_queue_size(),
            workers: default_fit_workers(),
            use_multiprocessing: false,
        }
    }
}

fn default_masters() -> u32 {
    1
}

fn default_dist_workers() -> u32 {
    2
}

fn default_master_optimizer() -> String {
    "rmsprop".to_string()
}

fn default_sync_every() -> u32 {
    1
}

fn default_elastic_force() -> f64 {
    0.9
}

fn default_elastic_lr() -> f64 {
    1.0
}

fn default_features_name() -> String {
    "X".to_string()
}

fn default_labels_name() -> String {
    "Y".to_string()
}

/// Coordination settings for a distributed fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedParams {
    /// Master processes.
    #[serde(default = "default_masters")]
    pub masters: u32,
    /// Worker processes.
    #[serde(default = "default_dist_workers")]
    pub workers: u32,
    /// Defaults to `masters + workers`.
    #[serde(default)]
    pub max_gpus: Option<u32>,
    /// Give the master a GPU of its own.
    #[serde(default)]
    pub master_gpu: bool,
    /// Synchronous parameter updates.
    #[serde(default)]
    pub synchronous: bool,
    /// Optimizer run by the master.
    #[serde(default = "default_master_optimizer")]
    pub master_optimizer: String,
    /// Batches between synchronisations.
    #[serde(default = "default_sync_every")]
    pub sync_every: u32,
    /// Elastic averaging SGD.
    #[serde(default)]
    pub easgd: bool,
    /// Elastic averaging force.
    #[serde(default = "default_elastic_force")]
    pub elastic_force: f64,
    /// Elastic averaging learning rate.
    #[serde(default = "default_elastic_lr")]
    pub elastic_lr: f64,
    /// Elastic averaging momentum.
    #[serde(default)]
    pub elastic_momentum: f64,
    /// Slot holding the features.
    #[serde(default = "default_features_name")]
    pub features_name: String,
    /// Slot holding the labels.
    #[serde(default = "default_labels_name")]
    pub labels_name: String,
}

impl Default for DistributedParams {
    fn default() -> Self {
        Self {
            masters: default_masters(),
            workers: default_dist_workers(),
            max_gpus: None,
            master_gpu: false,
            synchronous: false,
            master_optimizer: default_master_optimizer(),
            sync_every: default_sync_every(),
            easgd: false,
            elastic_force: default_elastic_force(),
            elastic_lr: default_elastic_lr(),
            elastic_momentum: 0.0,
            features_name: default_features_name(),
            labels_name: default_labels_name(),
        }
    }
}

impl DistributedParams {
    /// GPU budget, falling back to one per process.
    pub fn effective_max_gpus(&self) -> u32 {
        self.max_gpus.unwrap_or(self.masters + self.workers)
    }

    /// Processes in the coordination group.
    pub fn process_count(&self) -> u32 {
        self.masters + self.workers
    }

    fn document(&self, for_identity: bool) -> Result<Value, TroveError> {
        let mut map = match serde_json::to_value(self)
            .map_err(|err| TroveError::serde("trove.json_serialize", err))?
        {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if for_identity {
            map.insert("max_gpus".into(), json!(self.effective_max_gpus()));
            let mut defaults = match serde_json::to_value(DistributedParams::default())
                .map_err(|err| TroveError::serde("trove.json_serialize", err))?
            {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            defaults.insert("max_gpus".into(), json!(self.masters + self.workers));
            strip_defaults(&mut map, &defaults);
        }
        Ok(Value::Object(map))
    }
}

/// Persisted form of a trial.
#[derive(Debug, Clone, Deserialize)]
struct TrialDescription {
    model: Value,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    train_procedure: Vec<Value>,
    #[serde(default)]
    validation_split: f64,
    #[serde(default)]
    val_procedure: Option<Value>,
    #[serde(flatten)]
    compile: CompileParams,
    #[serde(flatten)]
    fit: FitParams,
    #[serde(default)]
    custom_objects: BTreeMap<String, String>,
    #[serde(default)]
    distributed: Option<DistributedParams>,
}

fn trial_defaults() -> Map<String, Value> {
    let mut defaults = Map::new();
    defaults.insert("seed".into(), Value::Null);
    defaults.insert("train_procedure".into(), json!([]));
    defaults.insert("validation_split".into(), json!(0.0));
    defaults.insert("val_procedure".into(), Value::Null);
    defaults.insert("metrics".into(), json!([]));
    defaults.insert("sample_weight_mode".into(), Value::Null);
    defaults.insert("batch_size".into(), json!(default_batch_size()));
    defaults.insert("epochs".into(), json!(default_epochs()));
    defaults.insert("callbacks".into(), json!([]));
    defaults.insert("shuffle".into(), json!(true));
    defaults.insert("class_weight".into(), Value::Null);
    defaults.insert("sample_weight".into(), Value::Null);
    defaults.insert("samples_per_epoch".into(), Value::Null);
    defaults.insert("nb_val_samples".into(), Value::Null);
    defaults.insert("max_queue_size".into(), json!(default_max_queue_size()));
    defaults.insert("workers".into(), json!(default_fit_workers()));
    defaults.insert("use_multiprocessing".into(), json!(false));
    defaults.insert("custom_objects".into(), json!({}));
    defaults.insert("distributed".into(), Value::Null);
    defaults
}

/// Lifecycle stage of a trial within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    /// Built but not yet run.
    Defined,
    /// Data procedures are being evaluated.
    Resolving,
    /// The executor adapter is running.
    Delegating,
    /// History and record are being persisted.
    Recording,
    /// Training finished.
    Complete,
}

/// Options steering `execute`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOptions {
    /// Persist training procedure outputs on evaluation.
    pub archive_training: bool,
    /// Persist the validation procedure outputs on evaluation.
    pub archive_validation: bool,
    /// History series whose maxima are copied into the record.
    pub record_metrics: Vec<String>,
    /// Worker threads for batch materialisation.
    pub concurrency: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            archive_training: true,
            archive_validation: true,
            record_metrics: vec!["val_acc".to_string()],
            concurrency: 1,
        }
    }
}

/// Collaborators a trial needs to run.
pub struct ExecContext<'a, A: ExecutorAdapter> {
    /// Functions backing the trial's procedures.
    pub registry: &'a FunctionRegistry,
    /// Model framework.
    pub adapter: &'a mut A,
    /// Compiled models keyed by trial hash.
    pub models: &'a mut ModelCache<A::Handle>,
    /// Archiving and recording behaviour.
    pub options: ExecOptions,
}

impl<'a, A: ExecutorAdapter> ExecContext<'a, A> {
    /// Context with default options.
    pub fn new(
        registry: &'a FunctionRegistry,
        adapter: &'a mut A,
        models: &'a mut ModelCache<A::Handle>,
    ) -> Self {
        Self {
            registry,
            adapter,
            models,
            options: ExecOptions::default(),
        }
    }

    /// Replaces the options.
    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }
}

/// What `execute` did.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    /// A prior run already completed; nothing was done.
    AlreadyComplete {
        /// Hash of the trial.
        hash: String,
    },
    /// The trial ran to completion in this call.
    Completed {
        /// Hash of the trial.
        hash: String,
        /// Training sources fitted in this call.
        sources_run: usize,
        /// Training sources already finished by an earlier run.
        sources_skipped: usize,
        /// Epoch count after the last fit.
        last_epoch: u32,
    },
}

/// Options for `test`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestOptions {
    /// Ignore cached test metrics.
    pub redo: bool,
    /// Samples per streamed test source.
    pub test_samples: Option<u64>,
    /// Persist test procedure outputs on evaluation.
    pub archive: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            redo: false,
            test_samples: None,
            archive: true,
        }
    }
}

/// Averaged held-out metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestMetrics {
    /// Loss on the test data.
    pub test_loss: f64,
    /// Accuracy on the test data.
    pub test_acc: f64,
    /// Samples in the test data, when known.
    pub num_test: Option<u64>,
    /// True when served from the record without evaluating.
    pub from_record: bool,
}

/// Sections shown by [`Trial::summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryOptions {
    /// Show the trial name.
    pub show_name: bool,
    /// Show the address directory.
    pub show_directory: bool,
    /// Show the record.
    pub show_record: bool,
    /// Show the training sources.
    pub show_training: bool,
    /// Show the validation setup.
    pub show_validation: bool,
    /// Show the compile parameters.
    pub show_compilation: bool,
    /// Show the fit parameters.
    pub show_fit: bool,
    /// Join entries on one line instead of one per line.
    pub squat: bool,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            show_name: false,
            show_directory: false,
            show_record: true,
            show_training: false,
            show_validation: false,
            show_compilation: false,
            show_fit: false,
            squat: true,
        }
    }
}

/// What [`Trial::export`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    /// Write `model.json`.
    pub model: bool,
    /// Copy or link the best weights.
    pub weights: bool,
    /// Copy the training containers.
    pub train: bool,
    /// Copy the validation containers.
    pub validation: bool,
    /// Symlink instead of copying where the platform allows it.
    pub symlink: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            model: true,
            weights: false,
            train: true,
            validation: true,
            symlink: false,
        }
    }
}

/// A reproducible experiment bound to an archive root.
#[derive(Debug, Clone)]
pub struct Trial {
    root: PathBuf,
    name: String,
    model: Value,
    seed: Option<u64>,
    train: Vec<DataSource>,
    validation: Validation,
    compile: CompileParams,
    fit: FitParams,
    custom_objects: BTreeMap<String, String>,
    distributed: Option<DistributedParams>,
    identity: Identity,
    state: TrialState,
}

impl Trial {
    /// Starts building a trial stored beneath `root`.
    pub fn builder(root: impl Into<PathBuf>) -> TrialBuilder {
        TrialBuilder::new(root.into())
    }

    /// Rebuilds a trial from its persisted description.
    pub fn from_description(
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        description: &Value,
    ) -> Result<Self, TroveError> {
        let parsed: TrialDescription =
            serde_json::from_value(description.clone()).map_err(|err| {
                TroveError::Serde(ErrorInfo::new("trove.trial_description", err.to_string()))
            })?;
        let train = parsed
            .train_procedure
            .iter()
            .map(DataSource::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        let validation = parse_validation(parsed.validation_split, parsed.val_procedure.as_ref())?;
        let mut compile = parsed.compile;
        compile.metrics.sort();
        Ok(Self {
            root: root.into(),
            name: name.into(),
            model: parsed.model,
            seed: parsed.seed,
            train,
            validation,
            compile,
            fit: parsed.fit,
            custom_objects: parsed.custom_objects,
            distributed: parsed.distributed,
            identity: Identity::new(),
            state: TrialState::Defined,
        })
    }

    pub(crate) fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Record label; not part of the identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model definition as given.
    pub fn model(&self) -> &Value {
        &self.model
    }

    /// Explicit seed, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Training sources, in order.
    pub fn train(&self) -> &[DataSource] {
        &self.train
    }

    /// Validation setup.
    pub fn validation(&self) -> &Validation {
        &self.validation
    }

    /// Compile parameters.
    pub fn compile_params(&self) -> &CompileParams {
        &self.compile
    }

    /// Fit parameters.
    pub fn fit_params(&self) -> &FitParams {
        &self.fit
    }

    /// Custom objects forwarded to compilation.
    pub fn custom_objects(&self) -> &BTreeMap<String, String> {
        &self.custom_objects
    }

    /// Distributed training setup, if any.
    pub fn distributed(&self) -> Option<&DistributedParams> {
        self.distributed.as_ref()
    }

    /// Lifecycle stage within this process.
    pub fn state(&self) -> TrialState {
        self.state
    }

    /// Training history persisted at the address.
    pub fn history(&self) -> Result<History, TroveError> {
        Ok(History::load(&self.address()?))
    }

    /// True iff the persisted history holds at least one stop event.
    pub fn is_complete(&self) -> Result<bool, TroveError> {
        Ok(self.history()?.is_complete())
    }

    /// Writes the description and merges the trial name into the record.
    pub fn write(&self) -> Result<PathBuf, TroveError> {
        let path = self.write_description()?;
        let mut record = Record::new();
        record.insert("name".into(), Value::String(self.name.clone()));
        self.update_record(&record, MergePolicy::AppendUnique)?;
        Ok(path)
    }

    /// Seed used for this run: the explicit seed, or one derived from the
    /// generation hash.
    pub fn master_seed(&self) -> Result<u64, TroveError> {
        match self.seed {
            Some(seed) => Ok(seed),
            None => Ok(seed_from_hash(&self.gen_hash()?)),
        }
    }

    /// Runs the trial unless a prior run already completed it.
    pub fn execute<A: ExecutorAdapter>(
        &mut self,
        ctx: &mut ExecContext<'_, A>,
    ) -> Result<ExecuteOutcome, TroveError> {
        let hash = self.hash()?;
        if self.train.is_empty() {
            return Err(TroveError::UnsupportedConfiguration(
                ErrorInfo::new("trove.trial_no_training", "trial has no training data source")
                    .with_context("hash", hash),
            ));
        }
        if self.is_complete()? {
            info!(%hash, "trial already complete");
            self.state = TrialState::Complete;
            return Ok(ExecuteOutcome::AlreadyComplete { hash });
        }
        if let Some(params) = self.distributed.clone() {
            return self.execute_distributed(ctx, &hash, &params);
        }

        let address = self.address()?;
        let mut history = History::load(&address);
        if history.start_time.is_none() {
            history.start_time = Some(chrono::Utc::now().to_rfc3339());
        }
        let master_seed = self.master_seed()?;

        let mut pending = Vec::new();
        for (index, source) in self.train.iter().enumerate() {
            let id = source.id(&self.root)?;
            if !history.source_done(index, &id) {
                pending.push((index, id));
            }
        }
        let skipped = self.train.len() - pending.len();
        let ran = pending.len();
        info!(
            %hash,
            sources = self.train.len(),
            skipped,
            resume_epoch = history.last_epoch,
            "executing trial"
        );

        if !pending.is_empty() {
            self.state = TrialState::Resolving;
            let mut resolver = Resolver::new(ctx.registry);
            let validation =
                self.resolve_validation(&mut resolver, ctx.options.archive_validation, &hash)?;
            if let Some(data) = &validation {
                history.validation_samples = Some(data.sample_count());
            }

            let request = self.compile_request(master_seed, None);
            let adapter = &mut *ctx.adapter;
            let handle = ctx.models.get_or_compile(&hash, || {
                adapter
                    .compile(&request)
                    .map_err(|err| delegate_failure("compile", &hash, err))
            })?;

            for (index, id) in pending {
                self.state = TrialState::Resolving;
                let (data, samples) = self.resolve_data(
                    &self.train[index],
                    &mut resolver,
                    ctx.options.archive_training,
                    self.fit.samples_per_epoch,
                    &hash,
                )?;
                self.state = TrialState::Delegating;
                let run = self.run_params(&address, derive_substream_seed(master_seed, index as u64));
                let started = Instant::now();
                let delta = adapter
                    .fit(handle, data, validation.as_ref(), &run, history.last_epoch)
                    .map_err(|err| delegate_failure("fit", &hash, err))?;
                history.elapse_time += started.elapsed().as_secs_f64();
                debug!(%hash, index, epochs = delta.epochs, samples, "training source consumed");
                history.absorb(delta, index, id, samples);
                history
                    .save(&address)
                    .map_err(|err| err.with_hash(hash.clone()))?;
            }
        }

        self.finish(&mut history, &address, &hash, &ctx.options.record_metrics)?;
        Ok(ExecuteOutcome::Completed {
            hash,
            sources_run: ran,
            sources_skipped: skipped,
            last_epoch: history.last_epoch,
        })
    }

    fn execute_distributed<A: ExecutorAdapter>(
        &mut self,
        ctx: &mut ExecContext<'_, A>,
        hash: &str,
        params: &DistributedParams,
    ) -> Result<ExecuteOutcome, TroveError> {
        let address = self.address()?;
        let mut history = History::load(&address);
        if history.start_time.is_none() {
            history.start_time = Some(chrono::Utc::now().to_rfc3339());
        }
        self.state = TrialState::Resolving;

        let sources = self.materialise(&self.train, ctx.registry, ctx.options.concurrency)?;
        let validation = match &self.validation {
            Validation::Procedure(source) => self
                .materialise(std::slice::from_ref(source), ctx.registry, ctx.options.concurrency)?
                .pop(),
            _ => None,
        };
        let mut samples = 0;
        for path in &sources {
            samples += ArchiveContainer::read(path)
                .map_err(|err| err.with_hash(hash))?
                .sample_count();
        }
        if let Some(path) = &validation {
            history.validation_samples = Some(
                ArchiveContainer::read(path)
                    .map_err(|err| err.with_hash(hash))?
                    .sample_count(),
            );
        }
        self.write()?;

        self.state = TrialState::Delegating;
        let master_seed = self.master_seed()?;
        let request = self.compile_request(master_seed, None);
        let run = self.run_params(&address, master_seed);
        let adapter = &mut *ctx.adapter;
        let handle = ctx.models.get_or_compile(hash, || {
            adapter
                .compile(&request)
                .map_err(|err| delegate_failure("compile", hash, err))
        })?;
        info!(
            %hash,
            processes = params.process_count(),
            max_gpus = params.effective_max_gpus(),
            sources = sources.len(),
            "delegating distributed fit"
        );
        let started = Instant::now();
        let delta = adapter
            .fit_distributed(handle, &sources, validation.as_deref(), params, &run)
            .map_err(|err| delegate_failure("fit_distributed", hash, err))?;
        history.elapse_time += started.elapsed().as_secs_f64();
        history.absorb(delta, 0, format!("group:{}", sources.len()), samples);

        self.finish(&mut history, &address, hash, &ctx.options.record_metrics)?;
        Ok(ExecuteOutcome::Completed {
            hash: hash.to_string(),
            sources_run: self.train.len(),
            sources_skipped: 0,
            last_epoch: history.last_epoch,
        })
    }

    fn finish(
        &mut self,
        history: &mut History,
        address: &Path,
        hash: &str,
        record_metrics: &[String],
    ) -> Result<(), TroveError> {
        self.state = TrialState::Recording;
        history.finish();
        history
            .save(address)
            .map_err(|err| err.with_hash(hash))?;
        self.write()?;

        let total = history.total_samples();
        let (num_train, num_validation) = match &self.validation {
            Validation::Split(split) => {
                let held_out = (total as f64 * split).round() as u64;
                (total.saturating_sub(held_out), Some(held_out))
            }
            Validation::Procedure(_) => (
                total,
                self.fit.nb_val_samples.or(history.validation_samples),
            ),
            Validation::None => (total, None),
        };
        let mut record = Record::new();
        record.insert("num_train".into(), json!(num_train));
        record.insert("num_validation".into(), json!(num_validation));
        record.insert("elapse_time".into(), json!(history.elapse_time));
        record.insert("last_epoch".into(), json!(history.last_epoch));
        record.insert("start_time".into(), json!(history.start_time));
        for metric in record_metrics {
            if let Some(best) = history.best(metric) {
                record.insert(metric.clone(), json!(best));
            }
        }
        self.update_record(&record, MergePolicy::Replace)?;
        self.state = TrialState::Complete;
        info!(%hash, last_epoch = history.last_epoch, num_train, "trial complete");
        Ok(())
    }

    /// Evaluates held-out sources, averaging metrics across them.
    ///
    /// Cached `test_loss`/`test_acc` in the record are returned as-is unless
    /// `redo` is set.
    pub fn test<A: ExecutorAdapter>(
        &mut self,
        sources: &[DataSource],
        ctx: &mut ExecContext<'_, A>,
        opts: TestOptions,
    ) -> Result<TestMetrics, TroveError> {
        let hash = self.hash()?;
        if !opts.redo {
            let cached = self.get_from_record(&["test_loss", "test_acc", "num_test"])?;
            let loss = cached[0].as_ref().and_then(Value::as_f64);
            let acc = cached[1].as_ref().and_then(Value::as_f64);
            if let (Some(test_loss), Some(test_acc)) = (loss, acc) {
                info!(%hash, test_loss, test_acc, "test already complete");
                return Ok(TestMetrics {
                    test_loss,
                    test_acc,
                    num_test: cached[2].as_ref().and_then(Value::as_u64),
                    from_record: true,
                });
            }
        }
        if sources.is_empty() {
            return Err(TroveError::UnsupportedConfiguration(
                ErrorInfo::new("trove.test_sources", "test requires at least one source")
                    .with_context("hash", hash),
            ));
        }

        let weights = self.address()?.join(WEIGHTS_FILE);
        let load_weights = weights.is_file().then_some(weights);
        let request = self.compile_request(self.master_seed()?, load_weights);
        let adapter = &mut *ctx.adapter;
        let handle = ctx.models.get_or_compile(&hash, || {
            adapter
                .compile(&request)
                .map_err(|err| delegate_failure("compile", &hash, err))
        })?;

        let mut resolver = Resolver::new(ctx.registry);
        let mut sums: Vec<f64> = Vec::new();
        let mut num_test = 0;
        for source in sources {
            let (data, samples) =
                self.resolve_data(source, &mut resolver, opts.archive, opts.test_samples, &hash)?;
            num_test += samples;
            let metrics = adapter
                .evaluate(handle, data)
                .map_err(|err| delegate_failure("evaluate", &hash, err))?;
            if sums.is_empty() {
                sums = metrics;
            } else {
                for (sum, value) in sums.iter_mut().zip(metrics) {
                    *sum += value;
                }
            }
        }
        let count = sources.len() as f64;
        let averaged: Vec<f64> = sums.iter().map(|sum| sum / count).collect();
        let (test_loss, test_acc) = match averaged.as_slice() {
            [loss, acc, ..] => (*loss, *acc),
            _ => {
                return Err(TroveError::DelegateFailure(
                    ErrorInfo::new("trove.test_metrics", "evaluate must return loss and accuracy")
                        .with_context("hash", hash)
                        .with_context("returned", averaged.len().to_string()),
                ))
            }
        };

        let mut record = Record::new();
        record.insert("test_loss".into(), json!(test_loss));
        record.insert("test_acc".into(), json!(test_acc));
        record.insert("num_test".into(), json!(num_test));
        self.update_record(&record, MergePolicy::Replace)?;
        info!(%hash, test_loss, test_acc, num_test, "test complete");
        Ok(TestMetrics {
            test_loss,
            test_acc,
            num_test: Some(num_test),
            from_record: false,
        })
    }

    /// Renders a textual summary of the trial.
    pub fn summary(&self, opts: &SummaryOptions) -> Result<String, TroveError> {
        let sep = if opts.squat {
            ", ".to_string()
        } else {
            format!("\n{INDENT}{INDENT}")
        };
        let rule = "-".repeat(RULE_WIDTH);
        let mut out = format!("{rule}\nTRIAL SUMMARY ({})\n", self.hash()?);
        if opts.show_directory {
            out += &format!("{INDENT}Directory: {}\n", self.root.display());
        }
        if opts.show_name {
            out += &format!("{INDENT}Name: {}\n", self.name);
        }
        if opts.show_record {
            out += &format!("{INDENT}Record_Info:\n");
            let mut record = self.read_record()?;
            if record.is_empty() {
                out += &format!("{INDENT}{INDENT}No record. Not stored in archive.\n");
            } else {
                let groups: [&[&str]; 3] = [
                    &["name", "elapse_time", "last_epoch", "start_time"],
                    &["test_acc", "val_acc", "acc", "test_loss", "val_loss", "loss"],
                    &["num_train", "num_validation", "num_test"],
                ];
                for group in groups {
                    let entries: Vec<String> = group
                        .iter()
                        .filter_map(|key| record.remove(*key).map(|value| render_entry(key, &value)))
                        .collect();
                    out += &format!("{INDENT}{INDENT}{}\n", entries.join(&sep));
                }
                let mut rest: Vec<String> = record
                    .iter()
                    .map(|(key, value)| format!("{key} = {value}"))
                    .collect();
                rest.sort();
                out += &format!("{INDENT}{INDENT}{}\n", rest.join(&sep));
            }
        }
        if opts.show_training {
            out += &format!("{INDENT}Training:\n");
            let rendered: Vec<String> = self.train.iter().map(DataSource::render).collect();
            out += &format!("{INDENT}{INDENT}{}\n", rendered.join(&sep));
            if let Some(samples) = self.fit.samples_per_epoch {
                out += &format!("{INDENT}{INDENT}samples_per_epoch = {samples}\n");
            }
        }
        if opts.show_validation {
            out += &format!("{INDENT}Validation:\n");
            match &self.validation {
                Validation::None => out += &format!("{INDENT}{INDENT}validation_split = 0.0\n"),
                Validation::Split(split) => {
                    out += &format!("{INDENT}{INDENT}validation_split = {split}\n")
                }
                Validation::Procedure(source) => {
                    out += &format!("{INDENT}{INDENT}{}\n", source.render());
                    if let Some(samples) = self.fit.nb_val_samples {
                        out += &format!("{INDENT}{INDENT}nb_val_samples = {samples}\n");
                    }
                }
            }
        }
        if opts.show_compilation {
            out += &format!("{INDENT}Compilation:\n");
            let mut entries = vec![
                format!("optimizer={}", self.compile.optimizer),
                format!("loss={}", self.compile.loss),
                format!("metrics={:?}", self.compile.metrics),
            ];
            if let Some(mode) = &self.compile.sample_weight_mode {
                entries.push(format!("sample_weight_mode={mode}"));
            }
            out += &format!("{INDENT}{INDENT}{}\n", entries.join(&sep));
        }
        if opts.show_fit {
            out += &format!("{INDENT}Fit:\n");
            let mut entries = vec![
                format!("batch_size={}", self.fit.batch_size),
                format!("epochs={}", self.fit.epochs),
                format!("callbacks={}", Value::Array(self.fit.callbacks.clone())),
                format!("shuffle={}", self.fit.shuffle),
            ];
            if let Validation::Split(split) = self.validation {
                entries.push(format!("validation_split={split}"));
            }
            if let Some(weights) = &self.fit.class_weight {
                entries.push(format!("class_weight={weights}"));
            }
            if let Some(weights) = &self.fit.sample_weight {
                entries.push(format!("sample_weight={weights}"));
            }
            out += &format!("{INDENT}{INDENT}{}\n", entries.join(&sep));
        }
        out += &rule;
        Ok(out)
    }

    /// Writes the model definition, weights and data containers into `dir`.
    pub fn export(&self, dir: &Path, opts: &ExportOptions) -> Result<PathBuf, TroveError> {
        let hash = self.hash()?;
        fs::create_dir_all(dir)
            .map_err(|err| TroveError::archive_io("trove.mkdir", err).with_hash(hash.clone()))?;
        if opts.model {
            write_json(&dir.join("model.json"), &self.model)
                .map_err(|err| err.with_hash(hash.clone()))?;
        }
        if opts.weights {
            let weights = self.address()?.join(WEIGHTS_FILE);
            if !weights.is_file() {
                return Err(TroveError::ArchiveIo(
                    ErrorInfo::new("trove.export_weights", "trial has no stored weights")
                        .with_context("hash", hash)
                        .with_hint("execute the trial before exporting weights"),
                ));
            }
            link_or_copy(&weights, &dir.join(WEIGHTS_FILE), opts.symlink, &hash)?;
        }
        if opts.train {
            for (index, source) in self.train.iter().enumerate() {
                let container = self.stored_container(source, &hash)?;
                let target = dir.join("train").join(format!("{index:04}.bin"));
                link_or_copy(&container, &target, opts.symlink, &hash)?;
            }
        }
        if opts.validation {
            if let Validation::Procedure(source) = &self.validation {
                let container = self.stored_container(source, &hash)?;
                link_or_copy(&container, &dir.join("val").join("0000.bin"), opts.symlink, &hash)?;
            }
        }
        info!(%hash, dir = %dir.display(), "trial exported");
        Ok(dir.to_path_buf())
    }

    fn stored_container(&self, source: &DataSource, hash: &str) -> Result<PathBuf, TroveError> {
        match source {
            DataSource::Procedure(spec) => {
                let procedure = Procedure::from_spec(self.root.clone(), spec.clone());
                if !procedure.is_cached()? {
                    return Err(TroveError::ArchiveIo(
                        ErrorInfo::new("trove.export_uncached", "data procedure is not archived")
                            .with_context("hash", hash)
                            .with_context("procedure", procedure.hash()?)
                            .with_hint("execute the trial before exporting data"),
                    ));
                }
                procedure.container_path()
            }
            DataSource::Path(path) if path.is_file() => Ok(path.clone()),
            DataSource::Path(path) => Err(DataSource::invalid_path(path).with_hash(hash)),
        }
    }

    fn materialise(
        &self,
        sources: &[DataSource],
        registry: &FunctionRegistry,
        concurrency: usize,
    ) -> Result<Vec<PathBuf>, TroveError> {
        let procedures: Vec<Procedure> = sources
            .iter()
            .filter_map(|source| match source {
                DataSource::Procedure(spec) => {
                    Some(Procedure::from_spec(self.root.clone(), spec.clone()))
                }
                DataSource::Path(_) => None,
            })
            .collect();
        let mut archived = assert_archived(&procedures, registry, concurrency)?.into_iter();
        let mut paths = Vec::with_capacity(sources.len());
        for source in sources {
            match source {
                DataSource::Procedure(_) => {
                    if let Some(path) = archived.next() {
                        paths.push(path);
                    }
                }
                DataSource::Path(path) if path.is_file() => paths.push(path.clone()),
                DataSource::Path(path) => return Err(DataSource::invalid_path(path)),
            }
        }
        Ok(paths)
    }

    fn resolve_validation(
        &self,
        resolver: &mut Resolver<'_>,
        archive: bool,
        hash: &str,
    ) -> Result<Option<DataSet>, TroveError> {
        let source = match &self.validation {
            Validation::Procedure(source) => source,
            _ => return Ok(None),
        };
        match source {
            DataSource::Procedure(spec) => {
                let mut procedure = Procedure::from_spec(self.root.clone(), spec.clone());
                let outputs = resolver.evaluate(
                    &mut procedure,
                    EvalOptions {
                        force_recompute: false,
                        archive,
                    },
                )?;
                match outputs {
                    Outputs::Data(data) => Ok(Some(data)),
                    Outputs::Stream(_) => Err(TroveError::UnsupportedConfiguration(
                        ErrorInfo::new(
                            "trove.stream_validation",
                            "validation procedure must produce materialised outputs",
                        )
                        .with_context("hash", hash),
                    )),
                }
            }
            DataSource::Path(path) => {
                if !path.is_file() {
                    return Err(DataSource::invalid_path(path).with_hash(hash));
                }
                let data = ArchiveContainer::read(path)
                    .and_then(ArchiveContainer::into_data_set)
                    .map_err(|err| err.with_hash(hash))?;
                Ok(Some(data))
            }
        }
    }

    fn resolve_data(
        &self,
        source: &DataSource,
        resolver: &mut Resolver<'_>,
        archive: bool,
        stream_samples: Option<u64>,
        hash: &str,
    ) -> Result<(FitData, u64), TroveError> {
        match source {
            DataSource::Procedure(spec) => {
                let mut procedure = Procedure::from_spec(self.root.clone(), spec.clone());
                let outputs = resolver.evaluate(
                    &mut procedure,
                    EvalOptions {
                        force_recompute: false,
                        archive,
                    },
                )?;
                match outputs {
                    Outputs::Data(data) => {
                        let samples = data.sample_count();
                        Ok((FitData::InMemory(data), samples))
                    }
                    Outputs::Stream(stream) => {
                        let samples_per_epoch = stream_samples.ok_or_else(|| {
                            TroveError::UnsupportedConfiguration(
                                ErrorInfo::new(
                                    "trove.stream_samples",
                                    "streamed data needs a declared sample count",
                                )
                                .with_context("hash", hash)
                                .with_hint("set samples_per_epoch (or test_samples)"),
                            )
                        })?;
                        Ok((
                            FitData::Stream {
                                stream,
                                samples_per_epoch,
                            },
                            samples_per_epoch,
                        ))
                    }
                }
            }
            DataSource::Path(path) => {
                if !path.is_file() {
                    return Err(DataSource::invalid_path(path).with_hash(hash));
                }
                let samples = ArchiveContainer::read(path)
                    .map_err(|err| err.with_hash(hash))?
                    .sample_count();
                Ok((FitData::Container(path.clone()), samples))
            }
        }
    }

    fn compile_request(&self, seed: u64, load_weights: Option<PathBuf>) -> CompileRequest {
        CompileRequest {
            model: self.model.clone(),
            optimizer: self.compile.optimizer.clone(),
            loss: self.compile.loss.clone(),
            metrics: self.compile.metrics.clone(),
            sample_weight_mode: self.compile.sample_weight_mode.clone(),
            custom_objects: self.custom_objects.clone(),
            load_weights,
            seed,
        }
    }

    fn run_params(&self, address: &Path, seed: u64) -> RunParams {
        let (validation_split, monitor) = match self.validation {
            Validation::None => (0.0, "acc"),
            Validation::Split(split) => (split, "val_acc"),
            Validation::Procedure(_) => (0.0, "val_acc"),
        };
        RunParams {
            batch_size: self.fit.batch_size,
            epochs: self.fit.epochs,
            callbacks: self.fit.callbacks.clone(),
            validation_split,
            shuffle: self.fit.shuffle,
            class_weight: self.fit.class_weight.clone(),
            sample_weight: self.fit.sample_weight.clone(),
            samples_per_epoch: self.fit.samples_per_epoch,
            nb_val_samples: self.fit.nb_val_samples,
            max_queue_size: self.fit.max_queue_size,
            workers: self.fit.workers,
            use_multiprocessing: self.fit.use_multiprocessing,
            monitor: monitor.to_string(),
            weights_path: address.join(WEIGHTS_FILE),
            seed,
        }
    }

    fn document(&self, for_identity: bool) -> Result<Map<String, Value>, TroveError> {
        let mut map = Map::new();
        let model = if for_identity {
            normalize_model(&self.model, &CanonicalRules::default())
        } else {
            self.model.clone()
        };
        map.insert("model".into(), model);
        if let Some(seed) = self.seed {
            map.insert("seed".into(), json!(seed));
        }
        let train = self
            .train
            .iter()
            .map(|source| source.document(for_identity))
            .collect::<Result<Vec<_>, _>>()?;
        map.insert("train_procedure".into(), Value::Array(train));
        match &self.validation {
            Validation::None => {
                map.insert("validation_split".into(), json!(0.0));
            }
            Validation::Split(split) => {
                map.insert("validation_split".into(), json!(split));
            }
            Validation::Procedure(source) => {
                map.insert("validation_split".into(), json!(0.0));
                map.insert(
                    "val_procedure".into(),
                    Value::Array(vec![source.document(for_identity)?]),
                );
            }
        }
        for section in [
            serde_json::to_value(&self.compile),
            serde_json::to_value(&self.fit),
        ] {
            if let Value::Object(fields) =
                section.map_err(|err| TroveError::serde("trove.json_serialize", err))?
            {
                map.extend(fields);
            }
        }
        map.insert("custom_objects".into(), json!(self.custom_objects));
        if let Some(distributed) = &self.distributed {
            map.insert("distributed".into(), distributed.document(for_identity)?);
        }
        if for_identity {
            strip_defaults(&mut map, &trial_defaults());
        }
        Ok(map)
    }
}

fn render_entry(key: &str, value: &Value) -> String {
    if key == "elapse_time" {
        if let Some(seconds) = value.as_f64() {
            return format!("{key} = {}", format_elapsed(seconds));
        }
    }
    if key.ends_with("_acc") || key.ends_with("_loss") {
        if let Some(metric) = value.as_f64() {
            return format!("{key} = {metric:.4}");
        }
    }
    format!("{key} = {value}")
}

/// Formats seconds as `h:mm:ss`.
pub fn format_elapsed(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

fn link_or_copy(source: &Path, target: &Path, symlink: bool, hash: &str) -> Result<(), TroveError> {
    let io_error = |err: std::io::Error| {
        TroveError::ArchiveIo(
            ErrorInfo::new("trove.export_write", err.to_string())
                .with_context("path", target.display().to_string())
                .with_context("hash", hash),
        )
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    if target.exists() || target.is_symlink() {
        fs::remove_file(target).map_err(io_error)?;
    }
    if symlink {
        symlink_file(source, target).map_err(io_error)
    } else {
        fs::copy(source, target).map(|_| ()).map_err(io_error)
    }
}

#[cfg(unix)]
fn symlink_file(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn symlink_file(source: &Path, target: &Path) -> std::io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

impl Storable for Trial {
    fn kind(&self) -> EntityKind {
        EntityKind::Trial
    }

    fn archive_root(&self) -> &Path {
        &self.root
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn identity_mut(&mut self) -> &mut Identity {
        &mut self.identity
    }

    fn hashable(&self, with_seed: bool) -> Result<Value, TroveError> {
        let mut map = self.document(true)?;
        if !with_seed {
            map.remove("seed");
        }
        Ok(Value::Object(map))
    }

    fn description(&self) -> Result<Value, TroveError> {
        Ok(Value::Object(self.document(false)?))
    }
}

/// Fluent construction of a [`Trial`] with validation at `build`.
#[derive(Debug, Clone)]
pub struct TrialBuilder {
    root: PathBuf,
    name: String,
    model: Option<Value>,
    seed: Option<u64>,
    train: Vec<DataSource>,
    validation: Validation,
    compile: CompileParams,
    fit: FitParams,
    custom_objects: BTreeMap<String, String>,
    distributed: Option<DistributedParams>,
    error: Option<TroveError>,
}

impl TrialBuilder {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            name: "trial".to_string(),
            model: None,
            seed: None,
            train: Vec::new(),
            validation: Validation::None,
            compile: CompileParams::default(),
            fit: FitParams::default(),
            custom_objects: BTreeMap::new(),
            distributed: None,
            error: None,
        }
    }

    fn fail(mut self, err: TroveError) -> Self {
        self.error.get_or_insert(err);
        self
    }

    /// Record-only label; not part of the identity.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Model definition, structured or as JSON text.
    pub fn model(mut self, model: impl Into<Value>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Fixes the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Appends a training source.
    pub fn train(mut self, source: DataSource) -> Self {
        self.train.push(source);
        self
    }

    /// Appends a training procedure.
    pub fn train_procedure(self, procedure: &Procedure) -> Self {
        self.train(DataSource::procedure(procedure))
    }

    /// Appends a loosely typed training reference.
    pub fn train_value(self, value: &Value) -> Self {
        match DataSource::from_value(value) {
            Ok(source) => self.train(source),
            Err(err) => self.fail(err),
        }
    }

    /// Holds out a fraction of each training source, replacing any
    /// validation procedure.
    pub fn validation_split(mut self, split: f64) -> Self {
        match check_split(split) {
            Ok(validation) => {
                self.validation = validation;
                self
            }
            Err(err) => self.fail(err),
        }
    }

    /// Validates on a dedicated source, replacing any split.
    pub fn validation_source(mut self, source: DataSource) -> Self {
        self.validation = Validation::Procedure(source);
        self
    }

    /// Validates on `procedure`'s outputs.
    pub fn validation_procedure(self, procedure: &Procedure) -> Self {
        self.validation_source(DataSource::procedure(procedure))
    }

    /// Validates on a list of sources; only a single source is supported.
    pub fn validation_sources(self, mut sources: Vec<DataSource>) -> Self {
        match sources.len() {
            0 => self,
            1 => match sources.pop() {
                Some(source) => self.validation_source(source),
                None => self,
            },
            len => self.fail(validation_list_error(len)),
        }
    }

    /// Sets the optimizer.
    pub fn optimizer(mut self, optimizer: impl Into<String>) -> Self {
        self.compile.optimizer = optimizer.into();
        self
    }

    /// Sets the loss.
    pub fn loss(mut self, loss: impl Into<String>) -> Self {
        self.compile.loss = loss.into();
        self
    }

    /// Sets the metrics.
    pub fn metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compile.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the sample weighting mode.
    pub fn sample_weight_mode(mut self, mode: impl Into<String>) -> Self {
        self.compile.sample_weight_mode = Some(mode.into());
        self
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.fit.batch_size = batch_size;
        self
    }

    /// Sets the epoch count.
    pub fn epochs(mut self, epochs: u32) -> Self {
        self.fit.epochs = epochs;
        self
    }

    /// Sets the epoch length for streamed sources.
    pub fn samples_per_epoch(mut self, samples: u64) -> Self {
        self.fit.samples_per_epoch = Some(samples);
        self
    }

    /// Replaces every fit parameter at once.
    pub fn fit(mut self, fit: FitParams) -> Self {
        self.fit = fit;
        self
    }

    /// Registers a custom object defined in `module`.
    pub fn custom_object(mut self, name: impl Into<String>, module: impl Into<String>) -> Self {
        self.custom_objects.insert(name.into(), module.into());
        self
    }

    /// Trains distributed with `params`.
    pub fn distributed(mut self, params: DistributedParams) -> Self {
        self.distributed = Some(params);
        self
    }

    /// Validates and builds the trial.
    pub fn build(self) -> Result<Trial, TroveError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let model = self.model.ok_or_else(|| {
            TroveError::UnsupportedConfiguration(ErrorInfo::new(
                "trove.trial_model",
                "trial requires a model definition",
            ))
        })?;
        if self.compile.optimizer.is_empty() || self.compile.loss.is_empty() {
            return Err(TroveError::UnsupportedConfiguration(
                ErrorInfo::new("trove.trial_required", "trial requires optimizer and loss")
                    .with_context("optimizer", self.compile.optimizer.clone())
                    .with_context("loss", self.compile.loss.clone()),
            ));
        }
        let sources = self.train.iter().chain(match &self.validation {
            Validation::Procedure(source) => Some(source),
            _ => None,
        });
        for source in sources {
            if let DataSource::Path(path) = source {
                if !path.is_file() {
                    return Err(DataSource::invalid_path(path));
                }
            }
        }
        let mut compile = self.compile;
        compile.metrics.sort();
        Ok(Trial {
            root: self.root,
            name: self.name,
            model,
            seed: self.seed,
            train: self.train,
            validation: self.validation,
            compile,
            fit: self.fit,
            custom_objects: self.custom_objects,
            distributed: self.distributed,
            identity: Identity::new(),
            state: TrialState::Defined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_paths_share_an_identity() {
        let root = Path::new("/archive");
        let plain = DataSource::path("data/d.bin");
        for spelling in ["./data/d.bin", "data/./d.bin", "data/tmp/../d.bin"] {
            let source = DataSource::path(spelling);
            assert_eq!(source.document(true).unwrap(), plain.document(true).unwrap());
            assert_eq!(source.id(root).unwrap(), plain.id(root).unwrap());
        }
        assert_ne!(
            DataSource::path("../d.bin").id(root).unwrap(),
            plain.id(root).unwrap()
        );
    }

    #[test]
    fn numeric_validation_slot_is_rejected() {
        let err = parse_validation(0.0, Some(&json!(0.2))).unwrap_err();
        assert!(matches!(err, TroveError::InvalidDataSource(_)));
    }

    #[test]
    fn split_and_procedure_conflict() {
        let err = parse_validation(0.1, Some(&json!([{"path": "/data/val.bin"}]))).unwrap_err();
        assert_eq!(err.info().code, "trove.val_conflict");
    }

    #[test]
    fn validation_lists_hold_one_source() {
        let err = parse_validation(
            0.0,
            Some(&json!([{"path": "/a.bin"}, {"path": "/b.bin"}])),
        )
        .unwrap_err();
        assert!(matches!(err, TroveError::UnsupportedConfiguration(_)));
        assert_eq!(
            parse_validation(0.0, Some(&json!(["/a.bin"]))).unwrap(),
            Validation::Procedure(DataSource::Path(PathBuf::from("/a.bin")))
        );
        assert_eq!(parse_validation(0.25, None).unwrap(), Validation::Split(0.25));
        assert!(parse_validation(1.0, None).is_err());
    }

    #[test]
    fn data_sources_reject_scalars() {
        for value in [json!(3), json!(true), json!(null), json!([1])] {
            let err = DataSource::from_value(&value).unwrap_err();
            assert!(matches!(err, TroveError::InvalidDataSource(_)), "{value}");
        }
        let bare = json!({"func": "range_data", "func_module": "prep"});
        assert!(matches!(
            DataSource::from_value(&bare).unwrap(),
            DataSource::Procedure(_)
        ));
    }

    #[test]
    fn distributed_defaults_are_stripped() {
        let implicit = DistributedParams::default();
        let explicit = DistributedParams {
            max_gpus: Some(3),
            ..DistributedParams::default()
        };
        assert_eq!(implicit.document(true).unwrap(), json!({}));
        assert_eq!(explicit.document(true).unwrap(), json!({}));
        let tuned = DistributedParams {
            workers: 4,
            ..DistributedParams::default()
        };
        assert_eq!(tuned.document(true).unwrap(), json!({"workers": 4}));
    }

    #[test]
    fn elapsed_time_formats_as_clock() {
        assert_eq!(format_elapsed(3725.9), "1:02:05");
        assert_eq!(format_elapsed(59.0), "0:00:59");
    }
}
