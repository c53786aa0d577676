//! Cacheable deferred computations: `outputs = function(args, kwargs)`.
//!
//! A procedure's identity covers the function reference, the ordered
//! positional arguments, the keyword arguments (sorted, minus logging noise)
//! and the output slot names. Nested procedures are hashed through their own
//! identity so two trials sharing an upstream step address the same cached
//! outputs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use trove_archive::{strip_defaults, EntityKind, Identity, MergePolicy, Record, Storable};
use trove_core::errors::{ErrorInfo, TroveError};
use trove_core::DataSet;

use crate::container::{ArchiveContainer, CONTAINER_FILE};
use crate::function::{CallArgs, FunctionRef, FunctionRegistry, ProcOutput, Resolved};

/// Keyword arguments that only steer logging and never enter the identity.
pub const NOISE_KWARGS: [&str; 2] = ["verbose", "verbosity"];

/// Output slot names used when none are declared.
pub fn default_data_keys() -> Vec<String> {
    vec!["X".to_string(), "Y".to_string()]
}

/// Lazy producer of data batches.
pub struct BatchStream {
    inner: Box<dyn Iterator<Item = Result<DataSet, TroveError>> + Send>,
}

impl BatchStream {
    /// Wraps an iterator of batches.
    pub fn new<I>(batches: I) -> Self
    where
        I: Iterator<Item = Result<DataSet, TroveError>> + Send + 'static,
    {
        Self {
            inner: Box::new(batches),
        }
    }

    /// Stream over an already built list of batches.
    pub fn from_batches(batches: Vec<DataSet>) -> Self {
        Self::new(batches.into_iter().map(Ok))
    }
}

impl Iterator for BatchStream {
    type Item = Result<DataSet, TroveError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl fmt::Debug for BatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BatchStream")
    }
}

/// A procedure argument: a plain value or a nested procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    /// JSON-representable configuration value.
    Value(Value),
    /// Procedure whose outputs are passed in its place.
    Procedure(Box<ProcedureSpec>),
}

impl Arg {
    fn hashable(&self) -> Value {
        match self {
            Arg::Value(value) => json!({ "value": value }),
            Arg::Procedure(spec) => json!({ "procedure": spec.hashable() }),
        }
    }

    fn render(&self) -> String {
        match self {
            Arg::Value(value) => value.to_string(),
            Arg::Procedure(spec) => spec.signature(),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

/// Persisted description of a procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSpec {
    /// Function producing the outputs.
    #[serde(flatten)]
    pub func: FunctionRef,
    /// Positional arguments, order significant.
    #[serde(default)]
    pub args: Vec<Arg>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: BTreeMap<String, Arg>,
    /// Declared output slot names.
    #[serde(default = "default_data_keys")]
    pub data_keys: Vec<String>,
    /// Persist outputs on first computation. Not part of the identity.
    #[serde(default)]
    pub cache_result: bool,
}

impl ProcedureSpec {
    /// Identity-relevant view with defaults and noise keywords removed.
    pub fn hashable(&self) -> Value {
        let kwargs: Map<String, Value> = self
            .kwargs
            .iter()
            .filter(|(name, _)| !NOISE_KWARGS.contains(&name.as_str()))
            .map(|(name, arg)| (name.clone(), arg.hashable()))
            .collect();
        let mut map = Map::new();
        map.insert("func".into(), Value::String(self.func.name.clone()));
        map.insert("func_module".into(), Value::String(self.func.module.clone()));
        map.insert(
            "args".into(),
            Value::Array(self.args.iter().map(Arg::hashable).collect()),
        );
        map.insert("kwargs".into(), Value::Object(kwargs));
        map.insert("data_keys".into(), json!(self.data_keys));
        strip_defaults(&mut map, &procedure_defaults());
        Value::Object(map)
    }

    /// `module.name(args,kwargs)` rendering.
    pub fn signature(&self) -> String {
        let mut parts: Vec<String> = self.args.iter().map(Arg::render).collect();
        parts.extend(
            self.kwargs
                .iter()
                .map(|(name, arg)| format!("{name}={}", arg.render())),
        );
        format!("{}({})", self.func, parts.join(","))
    }
}

fn procedure_defaults() -> Map<String, Value> {
    let mut defaults = Map::new();
    defaults.insert("args".into(), json!([]));
    defaults.insert("kwargs".into(), json!({}));
    defaults.insert("data_keys".into(), json!(default_data_keys()));
    defaults
}

/// Outputs of an evaluation.
#[derive(Debug)]
pub enum Outputs {
    /// Materialised slots, in declared order.
    Data(DataSet),
    /// Streaming producer; never cached.
    Stream(BatchStream),
}

impl Outputs {
    /// Returns the materialised data, if any.
    pub fn into_data(self) -> Option<DataSet> {
        match self {
            Outputs::Data(data) => Some(data),
            Outputs::Stream(_) => None,
        }
    }

    /// True for streaming outputs.
    pub fn is_stream(&self) -> bool {
        matches!(self, Outputs::Stream(_))
    }
}

/// Options for a single evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalOptions {
    /// Ignore any cached container and run the function.
    pub force_recompute: bool,
    /// Persist tuple outputs even when the procedure does not cache itself.
    pub archive: bool,
}

/// A cacheable deferred computation bound to an archive root.
#[derive(Debug, Clone)]
pub struct Procedure {
    root: PathBuf,
    spec: ProcedureSpec,
    identity: Identity,
}

impl Procedure {
    /// Starts building a procedure for `func`.
    pub fn builder(root: impl Into<PathBuf>, func: FunctionRef) -> ProcedureBuilder {
        ProcedureBuilder {
            root: root.into(),
            spec: ProcedureSpec {
                func,
                args: Vec::new(),
                kwargs: BTreeMap::new(),
                data_keys: default_data_keys(),
                cache_result: true,
            },
        }
    }

    /// Binds a description to an archive root.
    pub fn from_spec(root: impl Into<PathBuf>, spec: ProcedureSpec) -> Self {
        Self {
            root: root.into(),
            spec,
            identity: Identity::new(),
        }
    }

    /// Rebuilds a procedure from its persisted description.
    ///
    /// The function does not need to be registered; the rebuilt procedure
    /// keeps its identity but can only run once the function is available.
    pub fn from_description(root: impl Into<PathBuf>, description: &Value) -> Result<Self, TroveError> {
        let spec: ProcedureSpec = serde_json::from_value(description.clone()).map_err(|err| {
            TroveError::Serde(
                ErrorInfo::new("trove.procedure_description", err.to_string())
                    .with_hint("procedure descriptions need func, func_module and tagged args"),
            )
        })?;
        Ok(Self::from_spec(root, spec))
    }

    pub(crate) fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Persisted description.
    pub fn spec(&self) -> &ProcedureSpec {
        &self.spec
    }

    /// Function reference.
    pub fn func(&self) -> &FunctionRef {
        &self.spec.func
    }

    /// Declared output slot names.
    pub fn data_keys(&self) -> &[String] {
        &self.spec.data_keys
    }

    /// Whether outputs are persisted on first computation.
    pub fn cache_result(&self) -> bool {
        self.spec.cache_result
    }

    /// Path of the output container.
    pub fn container_path(&self) -> Result<PathBuf, TroveError> {
        Ok(self.address()?.join(CONTAINER_FILE))
    }

    /// True iff the address holds a materialised output container.
    pub fn is_cached(&self) -> Result<bool, TroveError> {
        Ok(self.container_path()?.is_file())
    }

    /// Evaluates with a fresh resolver.
    pub fn evaluate(
        &mut self,
        registry: &FunctionRegistry,
        opts: EvalOptions,
    ) -> Result<Outputs, TroveError> {
        Resolver::new(registry).evaluate(self, opts)
    }

    /// Persists description (if absent), output container and a summary
    /// record. Returns the container path.
    pub fn archive(&self, data: &DataSet) -> Result<PathBuf, TroveError> {
        let hash = self.hash()?;
        if !self.description_path()?.is_file() {
            self.write_description()?;
        }
        let path = self.container_path()?;
        ArchiveContainer::from_data(data)
            .write(&path)
            .map_err(|err| err.with_hash(hash.clone()))?;

        let mut record = Record::new();
        record.insert("func".into(), Value::String(self.spec.func.name.clone()));
        record.insert("module".into(), Value::String(self.spec.func.module.clone()));
        record.insert("args".into(), to_json_value(&self.spec.args, &hash)?);
        record.insert("kwargs".into(), to_json_value(&self.spec.kwargs, &hash)?);
        self.update_record(&record, MergePolicy::Replace)?;
        debug!(%hash, path = %path.display(), "procedure archived");
        Ok(path)
    }

    /// Human readable one-call summary.
    pub fn summary(&self) -> Result<String, TroveError> {
        let rule = "-".repeat(50);
        Ok(format!(
            "{rule}\nProcedure ({})\n    {}\n{rule}\n",
            self.hash()?,
            self.spec.signature()
        ))
    }

    /// Removes the procedure's whole address subtree.
    pub fn delete(&self) -> Result<bool, TroveError> {
        self.remove_from_archive()
    }

    fn nested(&self, spec: &ProcedureSpec) -> Procedure {
        Procedure::from_spec(self.root.clone(), spec.clone())
    }
}

fn to_json_value<T: Serialize>(value: &T, hash: &str) -> Result<Value, TroveError> {
    serde_json::to_value(value)
        .map_err(|err| TroveError::serde("trove.json_serialize", err).with_hash(hash))
}

impl Storable for Procedure {
    fn kind(&self) -> EntityKind {
        EntityKind::Procedure
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

    fn hashable(&self, _with_seed: bool) -> Result<Value, TroveError> {
        Ok(self.spec.hashable())
    }

    fn description(&self) -> Result<Value, TroveError> {
        serde_json::to_value(&self.spec).map_err(|err| TroveError::serde("trove.json_serialize", err))
    }
}

/// Fluent construction of a [`Procedure`].
#[derive(Debug, Clone)]
pub struct ProcedureBuilder {
    root: PathBuf,
    spec: ProcedureSpec,
}

impl ProcedureBuilder {
    /// Appends a positional value.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.spec.args.push(Arg::Value(value.into()));
        self
    }

    /// Appends a nested procedure as positional argument.
    pub fn arg_procedure(mut self, procedure: &Procedure) -> Self {
        self.spec
            .args
            .push(Arg::Procedure(Box::new(procedure.spec.clone())));
        self
    }

    /// Sets a keyword value.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.kwargs.insert(name.into(), Arg::Value(value.into()));
        self
    }

    /// Sets a nested procedure as keyword argument.
    pub fn kwarg_procedure(mut self, name: impl Into<String>, procedure: &Procedure) -> Self {
        self.spec
            .kwargs
            .insert(name.into(), Arg::Procedure(Box::new(procedure.spec.clone())));
        self
    }

    /// Declares the output slot names.
    pub fn data_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.data_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Whether to persist outputs on first computation (default true).
    pub fn cache_result(mut self, cache: bool) -> Self {
        self.spec.cache_result = cache;
        self
    }

    /// Builds from explicit metadata without checking the function exists.
    pub fn build(self) -> Procedure {
        Procedure::from_spec(self.root, self.spec)
    }

    /// Builds after checking that the function resolves in `registry`.
    pub fn build_resolved(self, registry: &FunctionRegistry) -> Result<Procedure, TroveError> {
        registry.resolve(&self.spec.func)?;
        Ok(self.build())
    }
}

/// Depth-first evaluator for procedure graphs.
///
/// Results are memoised by hash for the lifetime of the resolver, and a stack
/// of in-flight hashes rejects graphs that reference themselves.
#[derive(Debug)]
pub struct Resolver<'r> {
    registry: &'r FunctionRegistry,
    memo: HashMap<String, DataSet>,
    in_flight: Vec<String>,
    invocations: usize,
}

impl<'r> Resolver<'r> {
    /// Creates a resolver over `registry`.
    pub fn new(registry: &'r FunctionRegistry) -> Self {
        Self {
            registry,
            memo: HashMap::new(),
            in_flight: Vec::new(),
            invocations: 0,
        }
    }

    /// Number of function invocations performed so far.
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    /// Evaluates `procedure`, serving from memo or cache where possible.
    pub fn evaluate(
        &mut self,
        procedure: &mut Procedure,
        opts: EvalOptions,
    ) -> Result<Outputs, TroveError> {
        let hash = procedure.hash()?;
        if self.in_flight.contains(&hash) {
            return Err(TroveError::UnsupportedConfiguration(
                ErrorInfo::new(
                    "trove.procedure_cycle",
                    "procedure argument graph contains its own hash",
                )
                .with_context("hash", hash)
                .with_context("depth", self.in_flight.len().to_string()),
            ));
        }
        if !opts.force_recompute {
            if let Some(data) = self.memo.get(&hash) {
                return Ok(Outputs::Data(data.clone()));
            }
            if procedure.is_cached()? {
                let path = procedure.container_path()?;
                match ArchiveContainer::load(&path, procedure.data_keys()) {
                    Ok(data) => {
                        info!(%hash, "procedure outputs read from archive");
                        self.memo.insert(hash, data.clone());
                        return Ok(Outputs::Data(data));
                    }
                    Err(err) if err.is_archive_io() => {
                        warn!(%hash, error = %err, "cached container unreadable, recomputing");
                        return self.compute(procedure, opts, &hash).map_err(|cause| {
                            TroveError::ArchiveIo(
                                ErrorInfo::new(
                                    "trove.container_recompute",
                                    "cached container unreadable and recompute failed",
                                )
                                .with_context("read_error", err.info().message.clone())
                                .with_context("hash", hash.clone())
                                .with_hint(cause.to_string()),
                            )
                        });
                    }
                    Err(err) => return Err(err.with_hash(hash)),
                }
            }
        }
        self.compute(procedure, opts, &hash)
    }

    fn compute(
        &mut self,
        procedure: &mut Procedure,
        opts: EvalOptions,
        hash: &str,
    ) -> Result<Outputs, TroveError> {
        self.in_flight.push(hash.to_string());
        let result = self.compute_inner(procedure, opts, hash);
        self.in_flight.pop();
        result
    }

    fn compute_inner(
        &mut self,
        procedure: &mut Procedure,
        opts: EvalOptions,
        hash: &str,
    ) -> Result<Outputs, TroveError> {
        let func = self
            .registry
            .resolve(procedure.func())
            .map_err(|err| err.with_hash(hash))?;
        let nested_opts = EvalOptions {
            force_recompute: false,
            archive: opts.archive,
        };

        let mut call = CallArgs::default();
        for arg in &procedure.spec.args {
            call.args.push(self.resolve_arg(procedure, arg, nested_opts)?);
        }
        for (name, arg) in &procedure.spec.kwargs {
            let resolved = self.resolve_arg(procedure, arg, nested_opts)?;
            call.kwargs.insert(name.clone(), resolved);
        }

        self.invocations += 1;
        debug!(%hash, func = %procedure.func(), "invoking procedure function");
        let output = func(call).map_err(|err| err.with_hash(hash))?;
        match output {
            ProcOutput::Stream(stream) => {
                if procedure.spec.cache_result {
                    debug!(%hash, "streaming output, caching disabled");
                }
                procedure.spec.cache_result = false;
                Ok(Outputs::Stream(stream))
            }
            ProcOutput::Tuple(elements) => {
                let data = collect_outputs(procedure.data_keys(), elements, hash)?;
                if procedure.spec.cache_result || opts.archive {
                    procedure.archive(&data)?;
                    info!(%hash, "procedure outputs archived");
                }
                self.memo.insert(hash.to_string(), data.clone());
                Ok(Outputs::Data(data))
            }
        }
    }

    fn resolve_arg(
        &mut self,
        parent: &Procedure,
        arg: &Arg,
        opts: EvalOptions,
    ) -> Result<Resolved, TroveError> {
        match arg {
            Arg::Value(value) => Ok(Resolved::Value(value.clone())),
            Arg::Procedure(spec) => {
                let mut nested = parent.nested(spec);
                Ok(match self.evaluate(&mut nested, opts)? {
                    Outputs::Data(data) => Resolved::Data(data),
                    Outputs::Stream(stream) => Resolved::Stream(stream),
                })
            }
        }
    }
}

fn collect_outputs(
    data_keys: &[String],
    elements: Vec<Option<trove_core::SlotData>>,
    hash: &str,
) -> Result<DataSet, TroveError> {
    if elements.len() != data_keys.len() {
        return Err(TroveError::ShapeMismatch(
            ErrorInfo::new(
                "trove.slot_count",
                "output count does not match declared output slots",
            )
            .with_context("expected", data_keys.len().to_string())
            .with_context("actual", elements.len().to_string())
            .with_context("hash", hash),
        ));
    }
    let mut slots = Vec::with_capacity(elements.len());
    for (name, element) in data_keys.iter().zip(elements) {
        let blocks = element.ok_or_else(|| {
            TroveError::InvalidOutput(
                ErrorInfo::new("trove.output_undefined", "output element has no value")
                    .with_context("slot", name.clone())
                    .with_context("hash", hash),
            )
        })?;
        for block in &blocks {
            block.validate().map_err(|err| err.with_hash(hash))?;
        }
        slots.push(blocks);
    }
    DataSet::new(data_keys, slots).map_err(|err| err.with_hash(hash))
}
