use std::error::Error;

use clap::Args;
use serde_json::{Map, Value};
use trove_archive::{to_pretty_json_bytes, Storable};
use trove_exp::{Archive, Entity};

use super::require_entity;

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Hash of the trial or procedure.
    pub hash: String,
    /// Only print these keys; absent keys print as null.
    #[arg(long = "key", value_name = "KEY")]
    pub keys: Vec<String>,
}

pub fn run(args: &RecordArgs, archive: &Archive) -> Result<(), Box<dyn Error>> {
    let entity = require_entity(archive, &args.hash)?;
    let record = match &entity {
        Entity::Trial(trial) => trial.read_record()?,
        Entity::Procedure(procedure) => procedure.read_record()?,
    };
    let selected = if args.keys.is_empty() {
        record
    } else {
        args.keys
            .iter()
            .map(|key| (key.clone(), record.get(key).cloned().unwrap_or(Value::Null)))
            .collect::<Map<String, Value>>()
    };
    println!("{}", String::from_utf8(to_pretty_json_bytes(&selected)?)?);
    Ok(())
}
