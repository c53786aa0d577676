use std::error::Error;

use clap::Args;
use serde::Serialize;
use trove_archive::to_canonical_json_bytes;

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Emit JSON including the archive layout constants.
    #[arg(long)]
    pub long: bool,
}

#[derive(Debug, Serialize)]
struct VersionInfo {
    version: &'static str,
    blob_dir: &'static str,
    hash_split_point: usize,
    container: &'static str,
    record: &'static str,
}

pub fn run(args: &VersionArgs) -> Result<(), Box<dyn Error>> {
    if !args.long {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let info = VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        blob_dir: trove_archive::BLOB_DIR,
        hash_split_point: trove_archive::HASH_SPLIT_POINT,
        container: trove_exp::CONTAINER_FILE,
        record: trove_archive::RECORD_FILE,
    };
    println!("{}", String::from_utf8(to_canonical_json_bytes(&info)?)?);
    Ok(())
}
