//! Binary output container holding a procedure's materialised slots.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use trove_archive::write_atomic;
use trove_core::errors::{ErrorInfo, TroveError};
use trove_core::{DataSet, SlotData};

/// File name of the output container inside an address directory.
pub const CONTAINER_FILE: &str = "archive.bin";

const FORMAT_VERSION: u32 = 1;

fn container_error(code: &str, path: &Path, err: impl ToString) -> TroveError {
    TroveError::ArchiveIo(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// Slots grouped by name, each an ordered list of array blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveContainer {
    version: u32,
    slots: Vec<(String, SlotData)>,
}

impl ArchiveContainer {
    /// Snapshot of a data set.
    pub fn from_data(data: &DataSet) -> Self {
        Self {
            version: FORMAT_VERSION,
            slots: data
                .iter()
                .map(|(name, blocks)| (name.to_string(), blocks.clone()))
                .collect(),
        }
    }

    /// Writes the container, replacing any previous file atomically.
    pub fn write(&self, path: &Path) -> Result<(), TroveError> {
        let bytes = bincode::serialize(self)
            .map_err(|err| TroveError::serde("trove.container_encode", err))?;
        write_atomic(path, &bytes, "trove.container_write")
    }

    /// Reads a container. Any decoding problem is reported as an archive
    /// read failure.
    pub fn read(path: &Path) -> Result<Self, TroveError> {
        let bytes = fs::read(path).map_err(|err| container_error("trove.container_read", path, err))?;
        let container: Self = bincode::deserialize(&bytes)
            .map_err(|err| container_error("trove.container_decode", path, err))?;
        if container.version != FORMAT_VERSION {
            return Err(TroveError::ArchiveIo(
                ErrorInfo::new("trove.container_version", "unsupported container version")
                    .with_context("path", path.display().to_string())
                    .with_context("version", container.version.to_string()),
            ));
        }
        for (_, blocks) in &container.slots {
            for block in blocks {
                block
                    .validate()
                    .map_err(|err| container_error("trove.container_decode", path, err))?;
            }
        }
        Ok(container)
    }

    /// Reads a container and returns its slots in `expected_slots` order.
    pub fn load(path: &Path, expected_slots: &[String]) -> Result<DataSet, TroveError> {
        let container = Self::read(path)?;
        if container.slots.len() != expected_slots.len() {
            return Err(TroveError::ShapeMismatch(
                ErrorInfo::new(
                    "trove.container_slots",
                    "stored slot count does not match declared output slots",
                )
                .with_context("path", path.display().to_string())
                .with_context("expected", expected_slots.len().to_string())
                .with_context("actual", container.slots.len().to_string()),
            ));
        }
        let mut slots = container.slots;
        let mut ordered = Vec::with_capacity(expected_slots.len());
        for name in expected_slots {
            let position = slots.iter().position(|(slot, _)| slot == name).ok_or_else(|| {
                TroveError::ShapeMismatch(
                    ErrorInfo::new("trove.container_slots", "declared slot missing from container")
                        .with_context("path", path.display().to_string())
                        .with_context("slot", name.clone()),
                )
            })?;
            ordered.push(slots.swap_remove(position).1);
        }
        DataSet::new(expected_slots, ordered)
    }

    /// Rows of the first block of the first slot.
    pub fn sample_count(&self) -> u64 {
        self.slots
            .first()
            .and_then(|(_, blocks)| blocks.first())
            .map(|block| block.rows() as u64)
            .unwrap_or(0)
    }

    /// Converts the container into a data set using the stored slot names.
    pub fn into_data_set(self) -> Result<DataSet, TroveError> {
        let (names, data): (Vec<String>, Vec<SlotData>) = self.slots.into_iter().unzip();
        DataSet::new(&names, data)
    }
}
