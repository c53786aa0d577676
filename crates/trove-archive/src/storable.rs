//! Capabilities shared by every archived entity kind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use trove_core::errors::{ErrorInfo, TroveError};

use crate::address::{blob_path, expand_root, fan_out_dir};
use crate::canonical::encode;
use crate::hash::content_hash;
use crate::record::{self, MergePolicy, Record};
use crate::serde::write_json;

/// The closed set of entity kinds stored in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A cacheable deferred computation.
    Procedure,
    /// A cacheable, resumable experiment.
    Trial,
}

impl EntityKind {
    /// Name of the description file written at the entity's address.
    pub fn description_file(self) -> &'static str {
        match self {
            EntityKind::Procedure => "procedure.json",
            EntityKind::Trial => "trial.json",
        }
    }

    /// Lowercase label used in logs and summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Procedure => "procedure",
            EntityKind::Trial => "trial",
        }
    }
}

/// Lazily computed identity of an entity.
///
/// Both hashes are computed at most once; [`Storable::rehash`] is the only
/// way to force recomputation.
#[derive(Debug, Default)]
pub struct Identity {
    full: OnceLock<String>,
    generation: OnceLock<String>,
}

impl Identity {
    /// Creates an identity with nothing computed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an identity whose full hash is already known, e.g. the hash an
    /// entity was found under.
    pub fn seeded(hash: impl Into<String>) -> Self {
        let identity = Self::default();
        let _ = identity.full.set(hash.into());
        identity
    }

    /// Forgets both cached hashes.
    pub fn reset(&mut self) {
        self.full = OnceLock::new();
        self.generation = OnceLock::new();
    }

    fn get_or_compute(
        cell: &OnceLock<String>,
        compute: impl FnOnce() -> Result<String, TroveError>,
    ) -> Result<String, TroveError> {
        if let Some(hash) = cell.get() {
            return Ok(hash.clone());
        }
        let hash = compute()?;
        Ok(cell.get_or_init(|| hash).clone())
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        let copy = Self::default();
        if let Some(full) = self.full.get() {
            let _ = copy.full.set(full.clone());
        }
        if let Some(generation) = self.generation.get() {
            let _ = copy.generation.set(generation.clone());
        }
        copy
    }
}

/// Identity, addressing and record access for archived entities.
///
/// Implementors supply their canonicalisation through [`Storable::hashable`]
/// and their persisted form through [`Storable::description`].
pub trait Storable {
    /// Kind of the entity.
    fn kind(&self) -> EntityKind;

    /// Root directory of the archive this entity lives in.
    fn archive_root(&self) -> &Path;

    /// Cached identity cell.
    fn identity(&self) -> &Identity;

    /// Mutable identity cell, used to force rehashing.
    fn identity_mut(&mut self) -> &mut Identity;

    /// Identity-relevant view of the entity, normalised and default-stripped.
    /// With `with_seed == false` any random seed must be left out.
    fn hashable(&self, with_seed: bool) -> Result<Value, TroveError>;

    /// Full persisted description of the entity.
    fn description(&self) -> Result<Value, TroveError>;

    /// Digest of the canonical encoding, computed once.
    fn hash(&self) -> Result<String, TroveError> {
        Identity::get_or_compute(&self.identity().full, || {
            let hash = content_hash(&encode(&self.hashable(true)?)?);
            debug!(kind = self.kind().as_str(), %hash, "identity computed");
            Ok(hash)
        })
    }

    /// Digest of the canonical encoding with the seed forced absent.
    fn gen_hash(&self) -> Result<String, TroveError> {
        Identity::get_or_compute(&self.identity().generation, || {
            Ok(content_hash(&encode(&self.hashable(false)?)?))
        })
    }

    /// Discards cached hashes and computes the full hash again.
    fn rehash(&mut self) -> Result<String, TroveError> {
        self.identity_mut().reset();
        self.hash()
    }

    /// Address directory derived from the hash, beneath the expanded root.
    fn address(&self) -> Result<PathBuf, TroveError> {
        Ok(blob_path(&expand_root(self.archive_root()), &self.hash()?))
    }

    /// Path of the description file at the entity's address.
    fn description_path(&self) -> Result<PathBuf, TroveError> {
        Ok(self.address()?.join(self.kind().description_file()))
    }

    /// Writes the description file, returning its path.
    fn write_description(&self) -> Result<PathBuf, TroveError> {
        let hash = self.hash()?;
        let path = self.description_path()?;
        let description = self.description()?;
        write_json(&path, &description).map_err(|err| err.with_hash(hash))?;
        Ok(path)
    }

    /// Reads the record; an entity without one yields an empty record.
    fn read_record(&self) -> Result<Record, TroveError> {
        Ok(record::read_record(&self.address()?))
    }

    /// Replaces the whole record.
    fn write_record(&self, record: &Record) -> Result<(), TroveError> {
        let hash = self.hash()?;
        record::write_record(&self.address()?, record).map_err(|err| err.with_hash(hash))
    }

    /// Merges `partial` into the record under `policy`.
    fn update_record(&self, partial: &Record, policy: MergePolicy) -> Result<Record, TroveError> {
        let hash = self.hash()?;
        record::update_record(&self.address()?, partial, policy).map_err(|err| err.with_hash(hash))
    }

    /// Removes a key from the record, reporting whether it existed.
    fn remove_from_record(&self, key: &str) -> Result<bool, TroveError> {
        let hash = self.hash()?;
        record::remove_key(&self.address()?, key).map_err(|err| err.with_hash(hash))
    }

    /// Reads several record values at once.
    fn get_from_record(&self, keys: &[&str]) -> Result<Vec<Option<Value>>, TroveError> {
        Ok(record::get_values(&self.address()?, keys))
    }

    /// Deletes the entity's whole address subtree, and the fan-out directory
    /// when it is left empty. Returns whether anything was removed.
    fn remove_from_archive(&self) -> Result<bool, TroveError> {
        let hash = self.hash()?;
        let address = self.address()?;
        if !address.is_dir() {
            return Ok(false);
        }
        fs::remove_dir_all(&address).map_err(|err| {
            TroveError::ArchiveIo(
                ErrorInfo::new("trove.remove", err.to_string())
                    .with_context("path", address.display().to_string())
                    .with_context("hash", hash.clone()),
            )
        })?;
        let parent = fan_out_dir(&expand_root(self.archive_root()), &hash);
        let empty = fs::read_dir(&parent)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            let _ = fs::remove_dir(&parent);
        }
        debug!(kind = self.kind().as_str(), %hash, "removed from archive");
        Ok(true)
    }
}
