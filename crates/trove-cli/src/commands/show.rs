use std::error::Error;

use clap::Args;
use trove_archive::{to_pretty_json_bytes, Storable};
use trove_exp::{Archive, Entity, SummaryOptions};

use super::require_entity;

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Hash of the trial or procedure.
    pub hash: String,
    /// Print the stored description instead of the summary.
    #[arg(long)]
    pub json: bool,
    /// Include every summary section.
    #[arg(long)]
    pub all: bool,
    /// Print sections one entry per line.
    #[arg(long)]
    pub tall: bool,
}

pub fn run(args: &ShowArgs, archive: &Archive) -> Result<(), Box<dyn Error>> {
    let entity = require_entity(archive, &args.hash)?;
    if args.json {
        let description = match &entity {
            Entity::Trial(trial) => trial.description()?,
            Entity::Procedure(procedure) => procedure.description()?,
        };
        println!("{}", String::from_utf8(to_pretty_json_bytes(&description)?)?);
        return Ok(());
    }
    let summary = match &entity {
        Entity::Procedure(procedure) => procedure.summary()?,
        Entity::Trial(trial) => trial.summary(&SummaryOptions {
            show_name: true,
            show_directory: args.all,
            show_record: true,
            show_training: args.all,
            show_validation: args.all,
            show_compilation: args.all,
            show_fit: args.all,
            squat: !args.tall,
        })?,
    };
    println!("{summary}");
    Ok(())
}
