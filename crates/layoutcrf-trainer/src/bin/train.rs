use std::path::PathBuf;

use clap::Parser;
use layoutcrf_core::Config;
use layoutcrf_trainer::{Mode, run};
use tracing_subscriber::EnvFilter;

/// Train, evaluate or export a layoutcrf model.
#[derive(Debug, Parser)]
#[command(name = "train", version)]
struct Args {
    /// Profile name, read from `<config-dir>/<name>.yml`.
    #[arg(short, long)]
    config: String,

    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    #[arg(short, long, value_enum, default_value_t = Mode::TrainAndEvaluate)]
    mode: Mode,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = Config::load(&args.config_dir, &args.config)
        .map_err(anyhow::Error::from)
        .and_then(|config| run(config, args.mode));
    if let Err(e) = result {
        eprintln!("Training failed: {e:#}");
        std::process::exit(1);
    }
}
