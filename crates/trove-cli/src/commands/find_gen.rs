use std::error::Error;

use clap::Args;
use trove_archive::Storable;
use trove_exp::Archive;

#[derive(Args, Debug)]
pub struct FindGenArgs {
    /// Generation hash, or the full hash of any trial in the group.
    pub hash: String,
}

pub fn run(args: &FindGenArgs, archive: &Archive) -> Result<(), Box<dyn Error>> {
    let gen_hash = match archive.find_trial(&args.hash)? {
        Some(trial) => trial.gen_hash()?,
        None => args.hash.clone(),
    };
    for trial in archive.trials_by_gen_hash(&gen_hash)? {
        let seed = trial
            .seed()
            .map(|seed| seed.to_string())
            .unwrap_or_else(|| "-".into());
        println!("{}  seed={seed}  {}", trial.hash()?, trial.name());
    }
    Ok(())
}
