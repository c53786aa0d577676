#![deny(missing_docs)]
#![doc = "Procedures, trials and the executor boundary of the trove experiment archive."]

/// Enumeration and lookup over stored entities.
pub mod archive;
/// Bulk materialisation of procedure outputs.
pub mod batch;
/// YAML configuration.
pub mod config;
/// Binary output containers.
pub mod container;
/// Executor adapter boundary and compiled-model cache.
pub mod executor;
/// Function registry and call plumbing.
pub mod function;
/// Trial training history.
pub mod history;
/// Cacheable deferred computations.
pub mod procedure;
/// Cacheable, resumable experiments.
pub mod trial;

pub use archive::{Archive, Entity};
pub use batch::assert_archived;
pub use config::{TroveConfig, ARCHIVE_ENV};
pub use container::{ArchiveContainer, CONTAINER_FILE};
pub use executor::{
    CompileRequest, ExecutorAdapter, FitData, ModelCache, RunParams, WEIGHTS_FILE,
};
pub use function::{
    CallArgs, FunctionRef, FunctionRegistry, ProcOutput, ProcedureFn, Resolved,
};
pub use history::{History, HistoryDelta, SourceProgress, HISTORY_FILE};
pub use procedure::{
    default_data_keys, Arg, BatchStream, EvalOptions, Outputs, Procedure, ProcedureBuilder,
    ProcedureSpec, Resolver, NOISE_KWARGS,
};
pub use trial::{
    format_elapsed, CompileParams, DataSource, DistributedParams, ExecContext, ExecOptions,
    ExecuteOutcome, ExportOptions, FitParams, SummaryOptions, TestMetrics, TestOptions, Trial,
    TrialBuilder, TrialState, Validation,
};
