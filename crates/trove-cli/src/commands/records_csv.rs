use std::collections::BTreeSet;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Args;
use serde_json::Value;
use trove_exp::Archive;

const DEFAULT_COLUMNS: [&str; 7] = [
    "name",
    "val_acc",
    "test_acc",
    "test_loss",
    "last_epoch",
    "elapse_time",
    "num_train",
];

#[derive(Args, Debug)]
pub struct RecordsCsvArgs {
    /// Destination CSV file.
    #[arg(long)]
    pub out: PathBuf,
    /// Record keys to export as columns, after the hash.
    #[arg(long = "column", value_name = "KEY")]
    pub columns: Vec<String>,
    /// Include procedure records as well as trial records.
    #[arg(long)]
    pub all: bool,
}

pub fn run(args: &RecordsCsvArgs, archive: &Archive) -> Result<(), Box<dyn Error>> {
    let columns: Vec<String> = if args.columns.is_empty() {
        DEFAULT_COLUMNS.iter().map(|column| column.to_string()).collect()
    } else {
        args.columns.clone()
    };
    let trial_hashes: BTreeSet<String> = archive
        .trial_paths()?
        .iter()
        .filter_map(|path| trove_archive::hash_from_blob_path(path))
        .collect();

    if let Some(parent) = args.out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(&args.out)?;
    let mut header = vec!["hash".to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    let mut rows = 0;
    for (hash, record) in archive.all_records()? {
        if !args.all && !trial_hashes.contains(&hash) {
            continue;
        }
        let mut row = vec![hash];
        row.extend(columns.iter().map(|key| cell(record.get(key))));
        writer.write_record(&row)?;
        rows += 1;
    }
    writer.flush()?;
    tracing::info!(rows, out = %args.out.display(), "records exported");
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| cell(Some(item)))
            .collect::<Vec<_>>()
            .join(";"),
        Some(other) => other.to_string(),
    }
}
