use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use trove_archive::{
    hash_from_blob_path, list_blob_paths, EntityKind, Identity, MergePolicy, Record, Storable,
};
use trove_core::TroveError;

struct Note {
    root: PathBuf,
    body: String,
    seed: Option<u64>,
    identity: Identity,
    hashed: Cell<usize>,
}

impl Note {
    fn new(root: &Path, body: &str, seed: Option<u64>) -> Self {
        Self {
            root: root.to_path_buf(),
            body: body.to_string(),
            seed,
            identity: Identity::new(),
            hashed: Cell::new(0),
        }
    }
}

impl Storable for Note {
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

    fn hashable(&self, with_seed: bool) -> Result<Value, TroveError> {
        self.hashed.set(self.hashed.get() + 1);
        let mut value = json!({"body": self.body});
        if with_seed {
            if let Some(seed) = self.seed {
                value["seed"] = json!(seed);
            }
        }
        Ok(value)
    }

    fn description(&self) -> Result<Value, TroveError> {
        self.hashable(true)
    }
}

#[test]
fn hash_is_computed_once_until_rehash() {
    let dir = tempfile::tempdir().unwrap();
    let mut note = Note::new(dir.path(), "hello", None);
    let first = note.hash().unwrap();
    let second = note.hash().unwrap();
    assert_eq!(first, second);
    assert_eq!(note.hashed.get(), 1);

    note.body = "changed".into();
    assert_eq!(note.hash().unwrap(), first);
    let fresh = note.rehash().unwrap();
    assert_ne!(fresh, first);
}

#[test]
fn gen_hash_ignores_the_seed() {
    let dir = tempfile::tempdir().unwrap();
    let one = Note::new(dir.path(), "run", Some(1));
    let two = Note::new(dir.path(), "run", Some(2));
    assert_ne!(one.hash().unwrap(), two.hash().unwrap());
    assert_eq!(one.gen_hash().unwrap(), two.gen_hash().unwrap());
}

#[test]
fn address_lives_under_blob_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let note = Note::new(dir.path(), "addr", None);
    let hash = note.hash().unwrap();
    let address = note.address().unwrap();
    assert_eq!(address, dir.path().join("blob").join(&hash[..2]).join(&hash[2..]));
    assert_eq!(hash_from_blob_path(&address).as_deref(), Some(hash.as_str()));
}

#[test]
fn description_and_records_persist_at_the_address() {
    let dir = tempfile::tempdir().unwrap();
    let note = Note::new(dir.path(), "persist", None);
    let path = note.write_description().unwrap();
    assert!(path.ends_with("procedure.json"));
    let stored: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(stored, json!({"body": "persist"}));

    let mut partial = Record::new();
    partial.insert("name".into(), json!("alpha"));
    note.update_record(&partial, MergePolicy::AppendUnique).unwrap();
    note.update_record(&partial, MergePolicy::AppendUnique).unwrap();
    assert_eq!(note.read_record().unwrap()["name"], json!(["alpha"]));
    assert_eq!(note.get_from_record(&["name", "x"]).unwrap()[1], None);
    assert!(note.remove_from_record("name").unwrap());

    assert_eq!(list_blob_paths(dir.path()).unwrap(), vec![note.address().unwrap()]);
}

#[test]
fn removal_prunes_empty_fan_out_directories() {
    let dir = tempfile::tempdir().unwrap();
    let note = Note::new(dir.path(), "gone", None);
    assert!(!note.remove_from_archive().unwrap());
    note.write_description().unwrap();
    let hash = note.hash().unwrap();
    assert!(note.remove_from_archive().unwrap());
    assert!(!dir.path().join("blob").join(&hash[..2]).exists());
    assert!(list_blob_paths(dir.path()).unwrap().is_empty());
}

#[test]
fn seeded_identity_skips_hashing() {
    let dir = tempfile::tempdir().unwrap();
    let mut note = Note::new(dir.path(), "found", None);
    note.identity = Identity::seeded("ffee00");
    assert_eq!(note.hash().unwrap(), "ffee00");
    assert_eq!(note.hashed.get(), 0);
}
