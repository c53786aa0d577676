#![deny(missing_docs)]
#![doc = "Core error taxonomy and value types for the trove experiment archive."]

pub mod errors;
pub mod rng;
mod types;

pub use errors::{ErrorInfo, TroveError};
pub use rng::{derive_substream_seed, seed_from_hash};
pub use types::{ArrayBlock, DataSet, SlotData};
