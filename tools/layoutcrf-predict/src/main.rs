use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use layoutcrf_core::{Config, ModelType, Prediction, Request, ServedModel, latest_export};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info";

/// Answer prediction requests typed on stdin with the latest export of a
/// profile's model.
#[derive(Debug, Parser)]
#[command(name = "layoutcrf-predict", version)]
struct Args {
    /// Profile name, read from `<config-dir>/<name>.yml`.
    #[arg(short, long)]
    config: String,

    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Export directory to load instead of the profile's latest export.
    #[arg(long)]
    export_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PredictOutput {
    input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prediction: Option<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Input lines that make up one request.
fn lines_per_request(model_type: ModelType) -> usize {
    match model_type {
        ModelType::TextDnn | ModelType::CellMerge => 2,
        ModelType::Text | ModelType::LineCrf | ModelType::Ocr | ModelType::Capsnet => 1,
    }
}

fn parse_request(model_type: ModelType, lines: &[String]) -> anyhow::Result<Request> {
    let first = lines.first().map(String::as_str).unwrap_or_default();
    match model_type {
        ModelType::Text => {
            let (left, right) = first.split_once('|').unwrap_or((first, ""));
            Ok(Request::Sentences {
                left: left.to_string(),
                right: right.to_string(),
            })
        }
        ModelType::TextDnn | ModelType::CellMerge => Ok(Request::Sentences {
            left: first.to_string(),
            right: lines.get(1).cloned().unwrap_or_default(),
        }),
        ModelType::LineCrf => {
            Ok(Request::Page(serde_json::from_str(first).context("expected a JSON line record")?))
        }
        ModelType::Ocr => {
            let bytes = std::fs::read(first).with_context(|| format!("cannot read image {first}"))?;
            Ok(Request::EncodedImage(bytes))
        }
        ModelType::Capsnet => Ok(Request::Pixels(
            serde_json::from_str(first).context("expected a JSON array of pixels")?,
        )),
    }
}

fn prompt() -> io::Result<()> {
    let mut err = io::stderr();
    write!(err, "> ")?;
    err.flush()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config_dir, &args.config)?;
    let export = match args.export_dir {
        Some(dir) => dir,
        None => latest_export(&config.servo_dir())?,
    };
    let model = ServedModel::load(&export)?;
    let model_type = model.model_type();
    info!(export = %export.display(), %model_type, "model loaded");

    let per_request = lines_per_request(model_type);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut stdout = io::stdout().lock();
    loop {
        let mut input = Vec::with_capacity(per_request);
        while input.len() < per_request {
            prompt()?;
            match lines.next() {
                Some(line) => input.push(line?.trim().to_string()),
                None => return Ok(()),
            }
        }
        if input.iter().all(String::is_empty) {
            continue;
        }

        let output = match parse_request(model_type, &input)
            .and_then(|request| Ok(model.predict_one(request)?))
        {
            Ok(prediction) => PredictOutput {
                input,
                prediction: Some(prediction),
                error: None,
            },
            Err(e) => PredictOutput {
                input,
                prediction: None,
                error: Some(format!("{e:#}")),
            },
        };
        writeln!(stdout, "{}", serde_json::to_string(&output)?)?;
        stdout.flush()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_request_splits_at_bar() {
        let request = parse_request(ModelType::Text, &["本期|合计".to_string()]).unwrap();
        match request {
            Request::Sentences { left, right } => {
                assert_eq!(left, "本期");
                assert_eq!(right, "合计");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn pair_models_read_two_lines() {
        assert_eq!(lines_per_request(ModelType::CellMerge), 2);
        assert_eq!(lines_per_request(ModelType::LineCrf), 1);
        let request =
            parse_request(ModelType::CellMerge, &["营业".to_string(), "收入".to_string()]).unwrap();
        assert!(matches!(request, Request::Sentences { ref right, .. } if right == "收入"));
    }

    #[test]
    fn logs_default_to_info() {
        assert_eq!(DEFAULT_LOG_FILTER, "info");
        assert!(DEFAULT_LOG_FILTER.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn capsnet_reads_pixel_arrays() {
        let request = parse_request(ModelType::Capsnet, &["[0, 128, 255]".to_string()]).unwrap();
        assert!(matches!(request, Request::Pixels(ref p) if p == &vec![0, 128, 255]));
        assert!(parse_request(ModelType::Capsnet, &["[300]".to_string()]).is_err());
    }
}
