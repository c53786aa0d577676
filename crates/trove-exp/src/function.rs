use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trove_core::errors::{ErrorInfo, TroveError};
use trove_core::{DataSet, SlotData};

use crate::procedure::BatchStream;

/// Name plus defining module of a procedure function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionRef {
    /// Module path the function is registered under.
    #[serde(rename = "func_module")]
    pub module: String,
    /// Function name inside the module.
    #[serde(rename = "func")]
    pub name: String,
}

impl FunctionRef {
    /// Creates a reference from module path and name.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// `module.name` form used in summaries and registry keys.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// An argument after nested procedures have been evaluated.
#[derive(Debug)]
pub enum Resolved {
    /// Plain configuration value.
    Value(Value),
    /// Materialised outputs of a nested procedure.
    Data(DataSet),
    /// Streaming outputs of a nested procedure.
    Stream(BatchStream),
}

impl Resolved {
    /// Returns the plain value, if this argument is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Resolved::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the materialised data, if this argument is a nested procedure.
    pub fn as_data(&self) -> Option<&DataSet> {
        match self {
            Resolved::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// Fully resolved call arguments handed to a procedure function.
#[derive(Debug, Default)]
pub struct CallArgs {
    /// Positional arguments in declared order.
    pub args: Vec<Resolved>,
    /// Keyword arguments sorted by name.
    pub kwargs: BTreeMap<String, Resolved>,
}

impl CallArgs {
    /// Positional argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&Resolved> {
        self.args.get(index)
    }

    /// Keyword argument `name`.
    pub fn kwarg(&self, name: &str) -> Option<&Resolved> {
        self.kwargs.get(name)
    }

    /// Keyword argument `name` read as an unsigned integer.
    pub fn kwarg_u64(&self, name: &str) -> Option<u64> {
        self.kwarg(name)
            .and_then(Resolved::as_value)
            .and_then(Value::as_u64)
    }

    /// Keyword argument `name` read as a float.
    pub fn kwarg_f64(&self, name: &str) -> Option<f64> {
        self.kwarg(name)
            .and_then(Resolved::as_value)
            .and_then(Value::as_f64)
    }

    /// Removes and returns a streaming positional argument.
    pub fn take_stream(&mut self, index: usize) -> Option<BatchStream> {
        let slot = self.args.get_mut(index)?;
        if !matches!(slot, Resolved::Stream(_)) {
            return None;
        }
        match std::mem::replace(slot, Resolved::Value(Value::Null)) {
            Resolved::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

/// What a procedure function returns.
pub enum ProcOutput {
    /// One entry per declared output slot. `None` marks an element that has no
    /// archivable representation.
    Tuple(Vec<Option<SlotData>>),
    /// A lazy producer that cannot be snapshotted.
    Stream(BatchStream),
}

impl fmt::Debug for ProcOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcOutput::Tuple(items) => f.debug_tuple("Tuple").field(&items.len()).finish(),
            ProcOutput::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Callable body of a procedure.
pub type ProcedureFn = Arc<dyn Fn(CallArgs) -> Result<ProcOutput, TroveError> + Send + Sync>;

/// In-process table mapping function references to callables.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<FunctionRef, ProcedureFn>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func` under `module.name`, replacing any earlier entry.
    pub fn register<F>(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        func: F,
    ) -> FunctionRef
    where
        F: Fn(CallArgs) -> Result<ProcOutput, TroveError> + Send + Sync + 'static,
    {
        let reference = FunctionRef::new(module, name);
        self.functions.insert(reference.clone(), Arc::new(func));
        reference
    }

    /// True when `reference` can be resolved.
    pub fn contains(&self, reference: &FunctionRef) -> bool {
        self.functions.contains_key(reference)
    }

    /// Looks up the callable for `reference`.
    pub fn resolve(&self, reference: &FunctionRef) -> Result<ProcedureFn, TroveError> {
        self.functions.get(reference).cloned().ok_or_else(|| {
            TroveError::UnresolvableFunction(
                ErrorInfo::new(
                    "trove.function_unresolved",
                    format!("function {reference} is not registered"),
                )
                .with_context("module", reference.module.clone())
                .with_context("name", reference.name.clone())
                .with_hint("register the function before evaluating procedures that use it"),
            )
        })
    }

    /// Registered references in sorted order.
    pub fn references(&self) -> impl Iterator<Item = &FunctionRef> {
        self.functions.keys()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.functions.keys().map(FunctionRef::qualified))
            .finish()
    }
}
