use std::path::PathBuf;

use rayon::prelude::*;
use tracing::debug;
use trove_archive::Storable;
use trove_core::errors::{ErrorInfo, TroveError};

use crate::function::FunctionRegistry;
use crate::procedure::{EvalOptions, Outputs, Procedure};

/// Ensures every procedure's outputs exist in the archive and returns the
/// container paths in input order.
///
/// Uncached procedures are evaluated on a pool of `concurrency` threads and
/// archived regardless of their `cache_result` flag. Streaming procedures
/// cannot be materialised and are rejected.
pub fn assert_archived(
    procedures: &[Procedure],
    registry: &FunctionRegistry,
    concurrency: usize,
) -> Result<Vec<PathBuf>, TroveError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .build()
        .map_err(|err| TroveError::archive_io("trove.thread_pool", err))?;

    let results: Result<Vec<_>, TroveError> = pool.install(|| {
        procedures
            .par_iter()
            .enumerate()
            .map(|(index, procedure)| -> Result<(usize, PathBuf), TroveError> {
                let path = archive_one(procedure.clone(), registry)?;
                Ok((index, path))
            })
            .collect()
    });

    let mut ordered = results?;
    ordered.sort_by_key(|(index, _)| *index);
    Ok(ordered.into_iter().map(|(_, path)| path).collect())
}

fn archive_one(mut procedure: Procedure, registry: &FunctionRegistry) -> Result<PathBuf, TroveError> {
    let hash = procedure.hash()?;
    if procedure.is_cached()? {
        debug!(%hash, "procedure already archived");
        return procedure.container_path();
    }
    let outputs = procedure.evaluate(
        registry,
        EvalOptions {
            force_recompute: false,
            archive: true,
        },
    )?;
    if let Outputs::Stream(_) = outputs {
        return Err(TroveError::UnsupportedConfiguration(
            ErrorInfo::new(
                "trove.stream_archive",
                "streaming procedures cannot be materialised",
            )
            .with_context("hash", hash),
        ));
    }
    procedure.container_path()
}
