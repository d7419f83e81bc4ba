//! # layoutcrf trainer
//!
//! Input pipelines, the training loop and dataset builders for the
//! layoutcrf models. [`run`] picks the model named by a profile and drives
//! it through one of the [`Mode`]s:
//!
//! - `train`: optimize until `train.train_steps`, checkpointing on the way;
//! - `evaluate`: evaluate the latest checkpoint on the evaluation split;
//! - `train-and-evaluate`: alternate training chunks and evaluations, then
//!   export a serving bundle;
//! - `export`: write a serving bundle from the latest checkpoint.

pub mod augment;
pub mod estimator;
pub mod hooks;
pub mod pipeline;

use candle_core::Device;
use layoutcrf_core::data::FontRecord;
use layoutcrf_core::models::{
    CapsNetModel, CellMergeModel, LayoutModel, LineCrfModel, OcrModel, TextDnnModel, TextRnnModel,
};
use layoutcrf_core::{Config, ModelType, load_vocab};
use tracing::info;

pub use estimator::{CheckpointState, Estimator, EvalReport};
pub use pipeline::{BatchSource, CorpusInput, RecordInput, Split};

use augment::BrightnessJitter;
use hooks::{TextDnnVerboseHook, TextVerboseHook};

/// What a training run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Train,
    #[value(alias = "test")]
    Evaluate,
    TrainAndEvaluate,
    Export,
}

/// Run `mode` for the model a profile describes.
pub fn run(mut config: Config, mode: Mode) -> anyhow::Result<()> {
    let vocab = load_vocab(&config)?;
    config.data.vocab_size = vocab.len();
    for (key, value) in &config.description {
        info!(%key, %value, "profile");
    }
    let device = Device::Cpu;
    let verbose = config.train.print_verbose;
    let every_n = config.train.check_hook_n_iter;
    info!(model_type = %config.model.model_type, ?mode, vocab = vocab.len(), "starting run");

    match config.model.model_type {
        ModelType::Text => {
            let mut estimator = Estimator::<TextRnnModel>::new(config.clone(), vocab.clone(), device)?;
            if verbose {
                estimator = estimator.with_hook(TextVerboseHook::new(every_n, vocab.clone()));
            }
            drive(
                &mut estimator,
                mode,
                || CorpusInput::from_config(&config, &vocab, Split::Train),
                || CorpusInput::from_config(&config, &vocab, Split::Eval),
            )
        }
        ModelType::TextDnn => {
            let mut estimator = Estimator::<TextDnnModel>::new(config.clone(), vocab.clone(), device)?;
            if verbose {
                estimator = estimator.with_hook(TextDnnVerboseHook::new(every_n, vocab));
            }
            drive_records(&mut estimator, &config, mode)
        }
        ModelType::LineCrf => {
            let mut estimator = Estimator::<LineCrfModel>::new(config.clone(), vocab, device)?;
            drive_records(&mut estimator, &config, mode)
        }
        ModelType::CellMerge => {
            let mut estimator = Estimator::<CellMergeModel>::new(config.clone(), vocab, device)?;
            drive_records(&mut estimator, &config, mode)
        }
        ModelType::Ocr => {
            let mut estimator = Estimator::<OcrModel>::new(config.clone(), vocab, device)?;
            drive(
                &mut estimator,
                mode,
                || {
                    let input = RecordInput::<FontRecord>::from_config(&config, Split::Train)?;
                    Ok(BrightnessJitter::new(input, config.train.seed))
                },
                || RecordInput::<FontRecord>::from_config(&config, Split::Eval),
            )
        }
        ModelType::Capsnet => {
            let mut estimator = Estimator::<CapsNetModel>::new(config.clone(), vocab, device)?;
            drive_records(&mut estimator, &config, mode)
        }
    }
}

fn drive_records<M: LayoutModel>(
    estimator: &mut Estimator<M>,
    config: &Config,
    mode: Mode,
) -> anyhow::Result<()> {
    drive(
        estimator,
        mode,
        || RecordInput::<M::Example>::from_config(config, Split::Train),
        || RecordInput::<M::Example>::from_config(config, Split::Eval),
    )
}

fn drive<M, S, E>(
    estimator: &mut Estimator<M>,
    mode: Mode,
    make_train: impl FnOnce() -> anyhow::Result<S>,
    mut make_eval: impl FnMut() -> anyhow::Result<E>,
) -> anyhow::Result<()>
where
    M: LayoutModel,
    S: BatchSource<M::Example>,
    E: BatchSource<M::Example>,
{
    match mode {
        Mode::Train => {
            estimator.restore()?;
            let total = estimator.config().train.train_steps;
            let remaining = total.saturating_sub(estimator.global_step());
            if remaining == 0 {
                info!(step = estimator.global_step(), "already trained to train_steps");
                return Ok(());
            }
            let loss = estimator.train(&mut make_train()?, remaining)?;
            info!(step = estimator.global_step(), loss, "training finished");
        }
        Mode::Evaluate => {
            let report = estimator.evaluate(&mut make_eval()?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Mode::TrainAndEvaluate => {
            let (reports, export) = estimator.train_and_evaluate(&mut make_train()?, make_eval)?;
            if let Some(last) = reports.last() {
                println!("{}", serde_json::to_string_pretty(last)?);
            }
            info!(export = %export.display(), "train and evaluate finished");
        }
        Mode::Export => {
            let export = estimator.export()?;
            info!(export = %export.display(), "export finished");
        }
    }
    Ok(())
}
