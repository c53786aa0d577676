#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use trove_core::{ArrayBlock, DataSet, ErrorInfo, TroveError};
use trove_exp::{
    ArchiveContainer, BatchStream, CallArgs, CompileRequest, DistributedParams, ExecutorAdapter,
    FitData, FunctionRegistry, HistoryDelta, ProcOutput, Resolved, RunParams,
};

pub const MODULE: &str = "fixtures.prep";

/// Compiled model handle of the simulated executor.
#[derive(Debug, Clone, PartialEq)]
pub struct SimModel {
    pub seed: u64,
    pub restored: bool,
    pub epochs_trained: u32,
}

/// Deterministic stand-in for a model framework.
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    pub compiles: usize,
    pub fits: usize,
    pub distributed_fits: usize,
    pub evaluations: usize,
    /// One-based fit call that fails.
    pub fail_on_fit: Option<usize>,
    pub fit_seeds: Vec<u64>,
    pub resumed_from: Vec<u32>,
    pub distributed_sources: Vec<PathBuf>,
    pub last_compile: Option<CompileRequest>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(fit: usize) -> Self {
        Self {
            fail_on_fit: Some(fit),
            ..Self::default()
        }
    }

    fn delta(&self, run: &RunParams, with_validation: bool) -> HistoryDelta {
        let mut rng = StdRng::seed_from_u64(run.seed);
        let series = |rng: &mut StdRng| -> Vec<f64> {
            (0..run.epochs)
                .map(|_| f64::from(rng.next_u32()) / (f64::from(u32::MAX) + 1.0))
                .collect()
        };
        let mut metrics = BTreeMap::new();
        metrics.insert("acc".to_string(), series(&mut rng));
        metrics.insert("loss".to_string(), series(&mut rng));
        if with_validation {
            metrics.insert("val_acc".to_string(), series(&mut rng));
            metrics.insert("val_loss".to_string(), series(&mut rng));
        }
        HistoryDelta {
            epochs: run.epochs,
            metrics,
        }
    }

    fn write_weights(run: &RunParams, epochs: u32) -> Result<(), TroveError> {
        if let Some(parent) = run.weights_path.parent() {
            fs::create_dir_all(parent).map_err(|err| TroveError::archive_io("sim.weights", err))?;
        }
        fs::write(&run.weights_path, epochs.to_string())
            .map_err(|err| TroveError::archive_io("sim.weights", err))
    }
}

fn consume(data: FitData) -> Result<DataSet, TroveError> {
    match data {
        FitData::InMemory(data) => Ok(data),
        FitData::Container(path) => ArchiveContainer::read(&path)?.into_data_set(),
        FitData::Stream {
            stream,
            samples_per_epoch,
        } => {
            let mut seen = 0;
            let mut last = DataSet::default();
            for batch in stream {
                let batch = batch?;
                seen += batch.sample_count();
                last = batch;
                if seen >= samples_per_epoch {
                    break;
                }
            }
            Ok(last)
        }
    }
}

impl ExecutorAdapter for SimulatedExecutor {
    type Handle = SimModel;

    fn compile(&mut self, request: &CompileRequest) -> Result<SimModel, TroveError> {
        self.compiles += 1;
        self.last_compile = Some(request.clone());
        Ok(SimModel {
            seed: request.seed,
            restored: request.load_weights.is_some(),
            epochs_trained: 0,
        })
    }

    fn fit(
        &mut self,
        handle: &mut SimModel,
        data: FitData,
        validation: Option<&DataSet>,
        run: &RunParams,
        resume_from_epoch: u32,
    ) -> Result<HistoryDelta, TroveError> {
        self.fits += 1;
        if self.fail_on_fit == Some(self.fits) {
            return Err(TroveError::DelegateFailure(ErrorInfo::new(
                "sim.fit",
                "simulated executor crashed",
            )));
        }
        consume(data)?;
        self.fit_seeds.push(run.seed);
        self.resumed_from.push(resume_from_epoch);
        handle.epochs_trained += run.epochs;
        Self::write_weights(run, resume_from_epoch + run.epochs)?;
        Ok(self.delta(run, validation.is_some() || run.validation_split > 0.0))
    }

    fn fit_distributed(
        &mut self,
        handle: &mut SimModel,
        sources: &[PathBuf],
        validation: Option<&Path>,
        _coordination: &DistributedParams,
        run: &RunParams,
    ) -> Result<HistoryDelta, TroveError> {
        self.distributed_fits += 1;
        self.distributed_sources = sources.to_vec();
        handle.epochs_trained += run.epochs;
        Self::write_weights(run, run.epochs)?;
        Ok(self.delta(run, validation.is_some()))
    }

    fn evaluate(&mut self, _handle: &mut SimModel, data: FitData) -> Result<Vec<f64>, TroveError> {
        self.evaluations += 1;
        let data = consume(data)?;
        let values: Vec<f64> = data
            .slot("X")
            .into_iter()
            .flatten()
            .flat_map(|block| block.values.iter().copied())
            .collect();
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        Ok(vec![mean, 0.5])
    }
}

/// Invocation counters of the fixture functions.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub range_data: Arc<AtomicUsize>,
    pub scaled: Arc<AtomicUsize>,
    pub stream_data: Arc<AtomicUsize>,
}

impl Calls {
    pub fn range_data(&self) -> usize {
        self.range_data.load(Ordering::SeqCst)
    }

    pub fn scaled(&self) -> usize {
        self.scaled.load(Ordering::SeqCst)
    }

    pub fn stream_data(&self) -> usize {
        self.stream_data.load(Ordering::SeqCst)
    }
}

fn range_slots(n: u64, offset: f64) -> Vec<Option<Vec<ArrayBlock>>> {
    let xs: Vec<f64> = (0..n).map(|i| i as f64 + offset).collect();
    let ys: Vec<f64> = (0..n).map(|i| (i % 2) as f64).collect();
    vec![
        Some(vec![ArrayBlock::vector(xs)]),
        Some(vec![ArrayBlock::vector(ys)]),
    ]
}

/// Registry with the fixture functions, plus their call counters.
///
/// * `range_data(n=.., offset=..)`: `X = offset..offset+n`, `Y = i % 2`
/// * `scaled(data, factor=..)`: multiplies `X` of a nested procedure
/// * `stream_data(batches=..)`: streams batches of four samples
/// * `broken_data()`: leaves `Y` undefined
/// * `single_output()`: returns one element for two slots
pub fn registry() -> (FunctionRegistry, Calls) {
    let calls = Calls::default();
    let mut registry = FunctionRegistry::new();

    let counter = calls.range_data.clone();
    registry.register(MODULE, "range_data", move |args: CallArgs| {
        counter.fetch_add(1, Ordering::SeqCst);
        let n = args.kwarg_u64("n").unwrap_or(8);
        let offset = args.kwarg_f64("offset").unwrap_or(0.0);
        Ok(ProcOutput::Tuple(range_slots(n, offset)))
    });

    let counter = calls.scaled.clone();
    registry.register(MODULE, "scaled", move |args: CallArgs| {
        counter.fetch_add(1, Ordering::SeqCst);
        let factor = args.kwarg_f64("factor").unwrap_or(1.0);
        let data = match args.arg(0) {
            Some(Resolved::Data(data)) => data,
            _ => {
                return Err(TroveError::InvalidDataSource(ErrorInfo::new(
                    "fixtures.scaled",
                    "scaled expects materialised data",
                )))
            }
        };
        let mut slots = Vec::new();
        for (name, blocks) in data.iter() {
            let mut blocks = blocks.clone();
            if name == "X" {
                for block in &mut blocks {
                    block.values.iter_mut().for_each(|value| *value *= factor);
                }
            }
            slots.push(Some(blocks));
        }
        Ok(ProcOutput::Tuple(slots))
    });

    let counter = calls.stream_data.clone();
    registry.register(MODULE, "stream_data", move |args: CallArgs| {
        counter.fetch_add(1, Ordering::SeqCst);
        let batches = args.kwarg_u64("batches").unwrap_or(3);
        let names = vec!["X".to_string(), "Y".to_string()];
        let mut out = Vec::new();
        for batch in 0..batches {
            let slots = range_slots(4, (batch * 4) as f64)
                .into_iter()
                .flatten()
                .collect();
            out.push(DataSet::new(&names, slots)?);
        }
        Ok(ProcOutput::Stream(BatchStream::from_batches(out)))
    });

    registry.register(MODULE, "broken_data", |_args: CallArgs| {
        let mut slots = range_slots(4, 0.0);
        slots[1] = None;
        Ok(ProcOutput::Tuple(slots))
    });

    registry.register(MODULE, "single_output", |_args: CallArgs| {
        let mut slots = range_slots(4, 0.0);
        slots.truncate(1);
        Ok(ProcOutput::Tuple(slots))
    });

    (registry, calls)
}

/// Minimal layered model definition with a generated layer name.
pub fn model(units: u64) -> serde_json::Value {
    serde_json::json!({
        "class_name": "Sequential",
        "keras_version": "2.0.8",
        "config": [
            {"class_name": "Dense", "config": {"name": "dense_1", "units": units}},
            {"class_name": "Dense", "config": {"name": "dense_2", "units": 1}}
        ]
    })
}

/// Graph model whose layers reference each other by generated name.
pub fn functional_model(input: &str, dense: &str) -> serde_json::Value {
    serde_json::json!({
        "class_name": "Model",
        "keras_version": "2.0.8",
        "config": {
            "name": "model_1",
            "layers": [
                {"class_name": "InputLayer", "name": input, "config": {"name": input}, "inbound_nodes": []},
                {
                    "class_name": "Dense",
                    "name": dense,
                    "config": {"name": dense, "units": 4},
                    "inbound_nodes": [[[input, 0, 0, {}]]]
                }
            ],
            "input_layers": [[input, 0, 0]],
            "output_layers": [[dense, 0, 0]]
        }
    })
}
