use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use layoutcrf_trainer::augment::write_dataset;
use tracing_subscriber::EnvFilter;

/// Generate cell merge training records from table cell texts.
#[derive(Debug, Parser)]
#[command(name = "build-cell-dataset", version)]
struct Args {
    /// Cell texts: `<a>`-separated cells, tables closed by `#` lines.
    #[arg(short, long)]
    input: PathBuf,

    /// Directory receiving the record files and `vocab.txt`.
    #[arg(short, long, default_value = "data")]
    out: PathBuf,

    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("cannot read {}", args.input.display()))?;
    let summary = write_dataset(&text, &args.out, args.seed)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
