use serde::{Deserialize, Serialize};

use crate::errors::{ErrorInfo, TroveError};

/// Dense row-major block of numeric data, the unit stored per output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayBlock {
    /// Extent of every axis; the first axis counts samples.
    pub shape: Vec<usize>,
    /// Flattened values in row-major order.
    pub values: Vec<f64>,
}

impl ArrayBlock {
    /// Creates a block, rejecting shapes that disagree with the value count.
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, TroveError> {
        let block = Self { shape, values };
        block.validate()?;
        Ok(block)
    }

    /// Builds a one dimensional block.
    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    /// Checks that the shape product matches the number of values.
    pub fn validate(&self) -> Result<(), TroveError> {
        let expected: usize = self.shape.iter().product();
        if self.shape.is_empty() || expected != self.values.len() {
            return Err(TroveError::InvalidOutput(
                ErrorInfo::new("trove.block_shape", "array block shape does not match values")
                    .with_context("shape", format!("{:?}", self.shape))
                    .with_context("values", self.values.len().to_string()),
            ));
        }
        Ok(())
    }

    /// Number of samples (extent of the leading axis).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
}

/// Ordered list of blocks stored under one output slot.
pub type SlotData = Vec<ArrayBlock>;

/// Materialised outputs of a procedure, ordered by declared slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataSet {
    slots: Vec<(String, SlotData)>,
}

impl DataSet {
    /// Pairs slot names with their data, failing when the counts differ.
    pub fn new(names: &[String], data: Vec<SlotData>) -> Result<Self, TroveError> {
        if names.len() != data.len() {
            return Err(TroveError::ShapeMismatch(
                ErrorInfo::new(
                    "trove.slot_count",
                    "output count does not match declared output slots",
                )
                .with_context("expected", names.len().to_string())
                .with_context("actual", data.len().to_string())
                .with_context("slots", names.join(",")),
            ));
        }
        Ok(Self {
            slots: names.iter().cloned().zip(data).collect(),
        })
    }

    /// Returns the blocks stored under `name`.
    pub fn slot(&self, name: &str) -> Option<&SlotData> {
        self.slots
            .iter()
            .find(|(slot, _)| slot == name)
            .map(|(_, data)| data)
    }

    /// Slot names in declared order.
    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Iterates `(name, blocks)` pairs in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SlotData)> {
        self.slots.iter().map(|(name, data)| (name.as_str(), data))
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the data set holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Samples held by the first block of the first slot.
    pub fn sample_count(&self) -> u64 {
        self.slots
            .first()
            .and_then(|(_, blocks)| blocks.first())
            .map(|block| block.rows() as u64)
            .unwrap_or(0)
    }

    /// Consumes the data set returning its slots.
    pub fn into_slots(self) -> Vec<(String, SlotData)> {
        self.slots
    }
}
