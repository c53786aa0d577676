use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use trove_exp::{Archive, TroveConfig};

use commands::{
    find_gen::{self, FindGenArgs},
    list::{self, ListArgs},
    record::{self, RecordArgs},
    records_csv::{self, RecordsCsvArgs},
    remove::{self, RemoveArgs},
    show::{self, ShowArgs},
    version::{self, VersionArgs},
};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "trove", about = "Inspect a content-addressed experiment archive")]
struct Cli {
    /// Archive root. Defaults to the config file's root, or $TROVE_ARCHIVE without one.
    #[arg(long, global = true)]
    archive: Option<PathBuf>,
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter directive, e.g. `debug` or `trove_exp=debug`.
    #[arg(long, global = true)]
    log: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored trials and procedures.
    List(ListArgs),
    /// Print the summary or description of one entity.
    Show(ShowArgs),
    /// Print the record of one entity.
    Record(RecordArgs),
    /// Export trial records as CSV.
    RecordsCsv(RecordsCsvArgs),
    /// Delete an entity's address subtree.
    Remove(RemoveArgs),
    /// List trials sharing a generation hash.
    FindGen(FindGenArgs),
    /// Print the CLI version.
    Version(VersionArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TroveConfig::load(path)?,
        None => TroveConfig::from_env(),
    };
    let filter = cli.log.clone().unwrap_or_else(|| config.log.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let root = cli.archive.clone().unwrap_or_else(|| config.archive_root());
    let archive = Archive::new(&root);
    tracing::debug!(root = %archive.root().display(), "archive opened");

    match cli.command {
        Command::List(args) => list::run(&args, &archive),
        Command::Show(args) => show::run(&args, &archive),
        Command::Record(args) => record::run(&args, &archive),
        Command::RecordsCsv(args) => records_csv::run(&args, &archive),
        Command::Remove(args) => remove::run(&args, &archive),
        Command::FindGen(args) => find_gen::run(&args, &archive),
        Command::Version(args) => version::run(&args),
    }
}
