//! # Estimator
//!
//! Owns one model's variables and optimizer and drives training,
//! evaluation and export. Checkpoints are written as
//! `model.ckpt-<step>.safetensors` in `train.model_dir`, with the list of
//! live checkpoints kept in `checkpoint.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use layoutcrf_core::models::LayoutModel;
use layoutcrf_core::serving::export_bundle;
use layoutcrf_core::vocab::Vocab;
use layoutcrf_core::{Config, LayoutError, MetricSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hooks::{LoggingHook, StepContext, TrainHook};
use crate::pipeline::BatchSource;

pub const CHECKPOINT_STATE: &str = "checkpoint.json";
const CHECKPOINT_PREFIX: &str = "model.ckpt-";
const CHECKPOINT_SUFFIX: &str = ".safetensors";

/// Live checkpoints of a model directory, newest last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub model_checkpoint_path: String,
    pub all_model_checkpoint_paths: Vec<String>,
    pub global_step: usize,
}

impl CheckpointState {
    /// State of `model_dir`, or `None` when nothing was saved yet.
    pub fn read(model_dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = model_dir.join(CHECKPOINT_STATE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let state: Self = serde_json::from_str(&text)
            .with_context(|| format!("malformed {}", path.display()))?;
        if state.model_checkpoint_path.is_empty() {
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn write(&self, model_dir: &Path) -> anyhow::Result<()> {
        fs::write(model_dir.join(CHECKPOINT_STATE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub fn checkpoint_name(step: usize) -> String {
    format!("{CHECKPOINT_PREFIX}{step}{CHECKPOINT_SUFFIX}")
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub loss: f64,
    pub metrics: BTreeMap<String, f64>,
    pub global_step: usize,
}

pub struct Estimator<M: LayoutModel> {
    config: Config,
    vocab: Vocab,
    varmap: VarMap,
    model: M,
    optimizer: AdamW,
    device: Device,
    global_step: usize,
    hooks: Vec<Box<dyn TrainHook<M>>>,
}

impl<M: LayoutModel> Estimator<M> {
    /// Fresh variables for `config`, with Adam at the configured rate.
    pub fn new(config: Config, vocab: Vocab, device: Device) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = M::build(&config, &vocab, vb)?;
        let params = ParamsAdamW {
            lr: config.train.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        let hooks: Vec<Box<dyn TrainHook<M>>> = vec![Box::new(LoggingHook::new(
            config.train.check_hook_n_iter,
            config.train.learning_rate,
        ))];
        info!(
            model_type = %M::MODEL_TYPE,
            variables = varmap.all_vars().len(),
            model_dir = %config.train.model_dir.display(),
            "estimator ready"
        );
        Ok(Self {
            config,
            vocab,
            varmap,
            model,
            optimizer,
            device,
            global_step: 0,
            hooks,
        })
    }

    pub fn with_hook(mut self, hook: impl TrainHook<M> + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn model_dir(&self) -> &Path {
        &self.config.train.model_dir
    }

    /// Load the newest checkpoint if it is ahead of the in-memory weights.
    ///
    /// Returns whether any checkpoint exists.
    pub fn restore(&mut self) -> anyhow::Result<bool> {
        let Some(state) = CheckpointState::read(self.model_dir())? else {
            return Ok(false);
        };
        if state.global_step > self.global_step || self.global_step == 0 {
            let path = self.model_dir().join(&state.model_checkpoint_path);
            self.varmap
                .load(&path)
                .with_context(|| format!("cannot restore {}", path.display()))?;
            self.global_step = state.global_step;
            info!(step = self.global_step, path = %path.display(), "restored checkpoint");
        }
        Ok(true)
    }

    /// Write a checkpoint for the current step and drop the oldest ones
    /// beyond `keep_checkpoint_max`.
    pub fn save_checkpoint(&self) -> anyhow::Result<PathBuf> {
        let model_dir = self.model_dir();
        fs::create_dir_all(model_dir)?;
        let name = checkpoint_name(self.global_step);
        let path = model_dir.join(&name);
        self.varmap.save(&path)?;

        let mut state = CheckpointState::read(model_dir)?.unwrap_or_default();
        state.all_model_checkpoint_paths.retain(|p| *p != name);
        state.all_model_checkpoint_paths.push(name.clone());
        let keep = self.config.train.keep_checkpoint_max;
        if keep > 0 {
            let stale = state.all_model_checkpoint_paths.len().saturating_sub(keep);
            for old in state.all_model_checkpoint_paths.drain(..stale) {
                match fs::remove_file(model_dir.join(&old)) {
                    Ok(()) => debug!(checkpoint = %old, "removed old checkpoint"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        state.model_checkpoint_path = name;
        state.global_step = self.global_step;
        state.write(model_dir)?;
        info!(step = self.global_step, path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    /// Run `steps` optimizer steps, resuming from the latest checkpoint.
    ///
    /// Returns the last batch loss.
    pub fn train<S: BatchSource<M::Example>>(
        &mut self,
        input: &mut S,
        steps: usize,
    ) -> anyhow::Result<f32> {
        self.restore()?;
        let every = self.config.train.save_checkpoints_steps.max(1);
        let mut last_loss = f32::NAN;
        let mut saved_at = None;
        let mut done = 0;
        while done < steps {
            let model = &self.model;
            let Some(examples) = input.next_batch(&|e: &M::Example| model.keep(e))? else {
                warn!(step = self.global_step, "training input exhausted");
                break;
            };
            if examples.is_empty() {
                continue;
            }
            let batch = self.model.collate(&examples, &self.device)?;
            let loss = self.model.loss(&batch, true)?;
            self.optimizer.backward_step(&loss)?;
            self.global_step += 1;
            done += 1;

            last_loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            if !last_loss.is_finite() {
                bail!("loss diverged at step {}: {last_loss}", self.global_step);
            }
            let ctx = StepContext {
                step: self.global_step,
                loss: last_loss,
                model: &self.model,
                examples: &examples,
                batch: &batch,
            };
            for hook in &mut self.hooks {
                hook.after_step(&ctx)?;
            }
            if self.global_step % every == 0 {
                self.save_checkpoint()?;
                saved_at = Some(self.global_step);
            }
        }
        if done > 0 && saved_at != Some(self.global_step) {
            self.save_checkpoint()?;
        }
        Ok(last_loss)
    }

    /// Mean loss and metrics over at most `eval_steps` batches of the
    /// latest checkpoint.
    pub fn evaluate<S: BatchSource<M::Example>>(&mut self, input: &mut S) -> anyhow::Result<EvalReport> {
        if !self.restore()? {
            return Err(LayoutError::ModelLoad(format!(
                "no checkpoint in {}",
                self.model_dir().display()
            ))
            .into());
        }
        let mut metrics = MetricSet::new();
        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        while batches < self.config.train.eval_steps {
            let model = &self.model;
            let Some(examples) = input.next_batch(&|e: &M::Example| model.keep(e))? else {
                break;
            };
            if examples.is_empty() {
                continue;
            }
            let batch = self.model.collate(&examples, &self.device)?;
            let loss = self.model.loss(&batch, false)?;
            loss_sum += loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
            let outputs = self.model.predict(&batch)?;
            self.model.record_metrics(&batch, &outputs, &mut metrics);
            batches += 1;
        }
        if batches == 0 {
            bail!("evaluation input yielded no batches");
        }

        let report = EvalReport {
            loss: loss_sum / batches as f64,
            metrics: metrics.report(),
            global_step: self.global_step,
        };
        info!(
            step = report.global_step,
            loss = report.loss,
            batches,
            metrics = ?report.metrics,
            "evaluation"
        );
        Ok(report)
    }

    /// Alternate `min_eval_frequency` training steps with an evaluation
    /// until `train_steps`, then export.
    ///
    /// `eval_input` builds a fresh single-pass source for every evaluation.
    pub fn train_and_evaluate<S, E, F>(
        &mut self,
        train_input: &mut S,
        mut eval_input: F,
    ) -> anyhow::Result<(Vec<EvalReport>, PathBuf)>
    where
        S: BatchSource<M::Example>,
        E: BatchSource<M::Example>,
        F: FnMut() -> anyhow::Result<E>,
    {
        self.restore()?;
        let total = self.config.train.train_steps;
        let chunk = self.config.train.min_eval_frequency.max(1);
        let mut reports = Vec::new();
        while self.global_step < total {
            let before = self.global_step;
            self.train(train_input, chunk.min(total - self.global_step))?;
            if self.global_step == before {
                bail!("training made no progress at step {before}");
            }
            reports.push(self.evaluate(&mut eval_input()?)?);
        }
        let dir = self.export()?;
        Ok((reports, dir))
    }

    /// Write a serving bundle from the latest weights.
    ///
    /// Fails when nothing was trained or saved yet.
    pub fn export(&mut self) -> anyhow::Result<PathBuf> {
        if !self.restore()? && self.global_step == 0 {
            return Err(LayoutError::ModelLoad(format!(
                "no checkpoint in {}",
                self.model_dir().display()
            ))
            .into());
        }
        let dir = export_bundle(
            &self.config.servo_dir(),
            M::MODEL_TYPE,
            &self.config,
            &self.varmap,
            &self.model.signature(),
            &self.vocab,
        )?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RecordInput, Split};
    use layoutcrf_core::data::CellRecord;
    use layoutcrf_core::models::CellMergeModel;
    use layoutcrf_core::serving::ServedModel;
    use layoutcrf_core::vocab::{CELL_SEPARATOR, PAD_TOKEN, UNK_TOKEN, reserved};
    use std::io::Write;

    fn setup(dir: &Path) -> (Config, Vocab) {
        let yaml = format!(
            r#"
data:
  type: cell-records
  base_path: {base}
  train_data_pattern: cell-train-*.jsonl
  eval_data_pattern: cell-eval-*.jsonl
model:
  type: cell-merge
  batch_size: 4
  embed_dim: 4
  hidden_size: 3
train:
  model_dir: {base}/model
  train_steps: 4
  eval_steps: 2
  min_eval_frequency: 2
  save_checkpoints_steps: 3
  keep_checkpoint_max: 2
  check_hook_n_iter: 1
"#,
            base = dir.display()
        );
        let config = Config::from_yaml_str(&yaml).unwrap();
        let vocab = Vocab::from_tokens([UNK_TOKEN, PAD_TOKEN, CELL_SEPARATOR, "营", "业", "收"])
            .with_default(reserved::CELL_UNK);

        for name in ["cell-train-1.jsonl", "cell-eval-1.jsonl"] {
            let mut file = fs::File::create(dir.join(name)).unwrap();
            for (x_l, x_r, y) in [("营 业", "收", 1), ("收", "营", 0), ("业 收", "营 业", 0)] {
                let record = CellRecord {
                    x_l: x_l.into(),
                    x_r: x_r.into(),
                    y,
                    l: (x_l.split(' ').count() + x_r.split(' ').count() + 1) as i64,
                };
                writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
            }
        }
        (config, vocab)
    }

    #[test]
    fn evaluate_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (config, vocab) = setup(dir.path());
        let mut estimator = Estimator::<CellMergeModel>::new(config.clone(), vocab, Device::Cpu).unwrap();
        let mut input = RecordInput::<CellRecord>::from_config(&config, Split::Eval).unwrap();
        let err = estimator.evaluate(&mut input).unwrap_err();
        assert!(err.to_string().contains("no checkpoint"));
    }

    #[test]
    fn export_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (config, vocab) = setup(dir.path());
        let mut estimator = Estimator::<CellMergeModel>::new(config.clone(), vocab, Device::Cpu).unwrap();
        let err = estimator.export().unwrap_err();
        assert!(err.to_string().contains("no checkpoint"));
        assert!(!config.servo_dir().exists());
    }

    #[test]
    fn train_saves_and_prunes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (config, vocab) = setup(dir.path());
        let mut estimator =
            Estimator::<CellMergeModel>::new(config.clone(), vocab.clone(), Device::Cpu).unwrap();
        let mut input = RecordInput::<CellRecord>::from_config(&config, Split::Train).unwrap();
        let loss = estimator.train(&mut input, 4).unwrap();
        assert!(loss.is_finite());
        assert_eq!(estimator.global_step(), 4);

        let state = CheckpointState::read(&config.train.model_dir).unwrap().unwrap();
        assert_eq!(state.global_step, 4);
        assert_eq!(state.model_checkpoint_path, checkpoint_name(4));
        assert_eq!(
            state.all_model_checkpoint_paths,
            vec![checkpoint_name(3), checkpoint_name(4)]
        );

        // a new estimator resumes from the checkpoint
        let mut resumed = Estimator::<CellMergeModel>::new(config, vocab, Device::Cpu).unwrap();
        assert!(resumed.restore().unwrap());
        assert_eq!(resumed.global_step(), 4);
    }

    #[test]
    fn train_and_evaluate_exports_a_servable_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let (config, vocab) = setup(dir.path());
        let mut estimator =
            Estimator::<CellMergeModel>::new(config.clone(), vocab, Device::Cpu).unwrap();
        let mut train = RecordInput::<CellRecord>::from_config(&config, Split::Train).unwrap();
        let eval_config = config.clone();
        let (reports, export) = estimator
            .train_and_evaluate(&mut train, || {
                RecordInput::<CellRecord>::from_config(&eval_config, Split::Eval)
            })
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].global_step, 4);
        assert!(reports.iter().all(|r| r.metrics.contains_key("accuracy")));

        let served = ServedModel::load(&export).unwrap();
        assert_eq!(served.model_type(), layoutcrf_core::ModelType::CellMerge);
    }
}
