//! Enumeration and lookup over every entity stored beneath an archive root.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;
use trove_archive::record::read_record;
use trove_archive::{
    blob_path, expand_root, from_json_slice, hash_from_blob_path, list_blob_paths, EntityKind,
    Identity, Record, Storable,
};
use trove_core::errors::{ErrorInfo, TroveError};

use crate::procedure::Procedure;
use crate::trial::Trial;

const DEFAULT_TRIAL_NAME: &str = "trial";

/// An entity rebuilt from its stored description.
#[derive(Debug, Clone)]
pub enum Entity {
    /// A stored procedure.
    Procedure(Procedure),
    /// A stored trial.
    Trial(Trial),
}

impl Entity {
    /// Kind of the wrapped entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Procedure(_) => EntityKind::Procedure,
            Entity::Trial(_) => EntityKind::Trial,
        }
    }

    /// Hash of the wrapped entity.
    pub fn hash(&self) -> Result<String, TroveError> {
        match self {
            Entity::Procedure(procedure) => procedure.hash(),
            Entity::Trial(trial) => trial.hash(),
        }
    }

    /// Deletes the entity's address subtree.
    pub fn remove(&self) -> Result<bool, TroveError> {
        match self {
            Entity::Procedure(procedure) => procedure.remove_from_archive(),
            Entity::Trial(trial) => trial.remove_from_archive(),
        }
    }
}

/// Read-side view of an archive root.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    /// Opens the archive at `root`, expanding variables in the path.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: expand_root(root.as_ref()),
        }
    }

    /// Expanded archive root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every address directory, sorted by path.
    pub fn blob_paths(&self) -> Result<Vec<PathBuf>, TroveError> {
        list_blob_paths(&self.root)
    }

    /// Addresses holding a trial description.
    pub fn trial_paths(&self) -> Result<Vec<PathBuf>, TroveError> {
        self.paths_of(EntityKind::Trial)
    }

    /// Addresses holding a procedure description.
    pub fn procedure_paths(&self) -> Result<Vec<PathBuf>, TroveError> {
        self.paths_of(EntityKind::Procedure)
    }

    fn paths_of(&self, kind: EntityKind) -> Result<Vec<PathBuf>, TroveError> {
        Ok(self
            .blob_paths()?
            .into_iter()
            .filter(|path| path.join(kind.description_file()).is_file())
            .collect())
    }

    /// Non-empty records keyed by hash.
    pub fn all_records(&self) -> Result<Vec<(String, Record)>, TroveError> {
        let mut records = Vec::new();
        for path in self.blob_paths()? {
            let Some(hash) = hash_from_blob_path(&path) else {
                continue;
            };
            let record = read_record(&path);
            if !record.is_empty() {
                records.push((hash, record));
            }
        }
        Ok(records)
    }

    /// Rebuilds whatever entity lives under `hash`.
    pub fn find(&self, hash: &str) -> Result<Option<Entity>, TroveError> {
        if let Some(trial) = self.find_trial(hash)? {
            return Ok(Some(Entity::Trial(trial)));
        }
        Ok(self.find_procedure(hash)?.map(Entity::Procedure))
    }

    /// Rebuilds the trial stored under `hash`.
    ///
    /// The rebuilt trial keeps `hash` as its identity and takes its name
    /// from the record.
    pub fn find_trial(&self, hash: &str) -> Result<Option<Trial>, TroveError> {
        let address = blob_path(&self.root, hash);
        let Some(description) = read_description(&address, EntityKind::Trial, hash)? else {
            return Ok(None);
        };
        let name = record_name(&read_record(&address));
        let trial = Trial::from_description(self.root.clone(), name, &description)
            .map_err(|err| err.with_hash(hash))?
            .with_identity(Identity::seeded(hash));
        Ok(Some(trial))
    }

    /// Rebuilds the procedure stored under `hash`.
    pub fn find_procedure(&self, hash: &str) -> Result<Option<Procedure>, TroveError> {
        let address = blob_path(&self.root, hash);
        let Some(description) = read_description(&address, EntityKind::Procedure, hash)? else {
            return Ok(None);
        };
        let procedure = Procedure::from_description(self.root.clone(), &description)
            .map_err(|err| err.with_hash(hash))?
            .with_identity(Identity::seeded(hash));
        Ok(Some(procedure))
    }

    /// Every stored trial. Descriptions that fail to decode are skipped.
    pub fn trials(&self) -> Result<Vec<Trial>, TroveError> {
        let mut trials = Vec::new();
        for path in self.trial_paths()? {
            let Some(hash) = hash_from_blob_path(&path) else {
                continue;
            };
            match self.find_trial(&hash) {
                Ok(Some(trial)) => trials.push(trial),
                Ok(None) => {}
                Err(err) => warn!(%hash, %err, "skipping undecodable trial"),
            }
        }
        Ok(trials)
    }

    /// Every stored procedure. Descriptions that fail to decode are skipped.
    pub fn procedures(&self) -> Result<Vec<Procedure>, TroveError> {
        let mut procedures = Vec::new();
        for path in self.procedure_paths()? {
            let Some(hash) = hash_from_blob_path(&path) else {
                continue;
            };
            match self.find_procedure(&hash) {
                Ok(Some(procedure)) => procedures.push(procedure),
                Ok(None) => {}
                Err(err) => warn!(%hash, %err, "skipping undecodable procedure"),
            }
        }
        Ok(procedures)
    }

    /// Trials sharing a generation hash, i.e. differing at most by seed.
    pub fn trials_by_gen_hash(&self, gen_hash: &str) -> Result<Vec<Trial>, TroveError> {
        let mut matches = Vec::new();
        for trial in self.trials()? {
            if trial.gen_hash()? == gen_hash {
                matches.push(trial);
            }
        }
        Ok(matches)
    }

    /// Trials whose record lists `name`.
    pub fn trials_by_name(&self, name: &str) -> Result<Vec<Trial>, TroveError> {
        let mut matches = Vec::new();
        for trial in self.trials()? {
            let names = trial.get_from_record(&["name"])?;
            let listed = match names.into_iter().next().flatten() {
                Some(Value::String(single)) => single == name,
                Some(Value::Array(values)) => values.iter().any(|value| value.as_str() == Some(name)),
                _ => false,
            };
            if listed {
                matches.push(trial);
            }
        }
        Ok(matches)
    }

    /// Procedures invoking the function called `func`.
    pub fn procedures_by_function(&self, func: &str) -> Result<Vec<Procedure>, TroveError> {
        Ok(self
            .procedures()?
            .into_iter()
            .filter(|procedure| procedure.func().name == func)
            .collect())
    }
}

fn read_description(
    address: &Path,
    kind: EntityKind,
    hash: &str,
) -> Result<Option<Value>, TroveError> {
    let path = address.join(kind.description_file());
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path).map_err(|err| {
        TroveError::ArchiveIo(
            ErrorInfo::new("trove.description_read", err.to_string())
                .with_context("path", path.display().to_string())
                .with_context("hash", hash),
        )
    })?;
    from_json_slice(&bytes).map(Some).map_err(|err| err.with_hash(hash))
}

fn record_name(record: &Record) -> String {
    match record.get("name") {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Array(names)) => names
            .first()
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TRIAL_NAME)
            .to_string(),
        _ => DEFAULT_TRIAL_NAME.to_string(),
    }
}
