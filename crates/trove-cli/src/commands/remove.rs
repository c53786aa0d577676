use std::error::Error;

use clap::Args;
use trove_exp::Archive;

use super::require_entity;

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Hash of the trial or procedure to delete.
    pub hash: String,
    /// Confirm the deletion; without it the command only reports the target.
    #[arg(long)]
    pub yes: bool,
}

pub fn run(args: &RemoveArgs, archive: &Archive) -> Result<(), Box<dyn Error>> {
    let entity = require_entity(archive, &args.hash)?;
    let kind = entity.kind().as_str();
    if !args.yes {
        println!("would remove {kind} {}; pass --yes to delete", args.hash);
        return Ok(());
    }
    if entity.remove()? {
        println!("removed {kind} {}", args.hash);
    }
    Ok(())
}
