pub mod find_gen;
pub mod list;
pub mod record;
pub mod records_csv;
pub mod remove;
pub mod show;
pub mod version;

use std::error::Error;

use trove_exp::{Archive, Entity};

/// Looks up `hash`, failing with a readable message when nothing is stored.
pub(crate) fn require_entity(archive: &Archive, hash: &str) -> Result<Entity, Box<dyn Error>> {
    archive
        .find(hash)?
        .ok_or_else(|| format!("no entity stored under {hash} in {}", archive.root().display()).into())
}
