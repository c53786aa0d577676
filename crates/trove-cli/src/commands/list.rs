use std::error::Error;

use clap::{Args, ValueEnum};
use trove_archive::Storable;
use trove_exp::Archive;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindFilter {
    All,
    Trial,
    Procedure,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Restrict the listing to one entity kind.
    #[arg(long, value_enum, default_value_t = KindFilter::All)]
    pub kind: KindFilter,
    /// Only list trials that finished training.
    #[arg(long)]
    pub complete: bool,
}

pub fn run(args: &ListArgs, archive: &Archive) -> Result<(), Box<dyn Error>> {
    if args.kind != KindFilter::Procedure {
        for trial in archive.trials()? {
            if args.complete && !trial.is_complete()? {
                continue;
            }
            let status = if trial.is_complete()? { "complete" } else { "pending" };
            println!("trial     {}  {:<9} {}", trial.hash()?, status, trial.name());
        }
    }
    if args.kind != KindFilter::Trial && !args.complete {
        for procedure in archive.procedures()? {
            let cached = if procedure.is_cached()? { "cached" } else { "described" };
            println!(
                "procedure {}  {:<9} {}",
                procedure.hash()?,
                cached,
                procedure.func()
            );
        }
    }
    Ok(())
}
