//! # Layout models
//!
//! Every model implements [`LayoutModel`]: it owns its weights (created
//! through a `VarBuilder`), turns records into a padded batch, and exposes
//! a training loss, host-side predictions and evaluation metrics. The
//! trainer and the serving layer only talk to this trait.

pub mod capsnet;
pub mod cell_merge;
pub mod line_crf;
pub mod ocr;
pub mod text_dnn;
pub mod text_rnn;

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{Config, ModelType};
use crate::error::{LayoutError, Result};
use crate::metrics::MetricSet;
use crate::serving::Signature;
use crate::vocab::{Vocab, reserved};

pub use capsnet::{CapsNetModel, DigitPrediction};
pub use cell_merge::{CellMergeModel, CellPrediction};
pub use line_crf::{LineCrfModel, PagePrediction};
pub use ocr::{GlyphPrediction, OcrModel};
pub use text_dnn::{MergePrediction, TextDnnModel};
pub use text_rnn::{TextPrediction, TextRnnModel};

/// A trainable, servable layout model.
pub trait LayoutModel: Sized + Send + Sync {
    /// One decoded record.
    type Example: DeserializeOwned + Clone + Send + Sync + 'static;
    /// Device tensors plus the host-side targets needed for metrics.
    type Batch;
    /// One prediction, serialized as the serving response.
    type Output: Serialize + Clone + Send;

    const MODEL_TYPE: ModelType;

    fn build(config: &Config, vocab: &Vocab, vb: VarBuilder) -> Result<Self>;

    /// Dataset filter applied after decoding.
    fn keep(&self, _example: &Self::Example) -> bool {
        true
    }

    fn collate(&self, examples: &[Self::Example], device: &Device) -> Result<Self::Batch>;

    /// Scalar training loss.
    fn loss(&self, batch: &Self::Batch, train: bool) -> Result<Tensor>;

    fn predict(&self, batch: &Self::Batch) -> Result<Vec<Self::Output>>;

    fn record_metrics(&self, batch: &Self::Batch, outputs: &[Self::Output], metrics: &mut MetricSet);

    fn signature(&self) -> Signature;
}

/// Id that out-of-vocabulary tokens map to for a model type.
pub fn unk_id(model_type: ModelType) -> u32 {
    match model_type {
        ModelType::Text => reserved::CORPUS_UNK,
        ModelType::TextDnn => reserved::TEXT_DNN_UNK,
        ModelType::CellMerge => reserved::CELL_UNK,
        ModelType::Ocr => reserved::OCR_UNK,
        ModelType::LineCrf | ModelType::Capsnet => 0,
    }
}

/// Load the vocabulary a model type reads, with its reserved default id.
///
/// Models without a vocabulary file get the configured label names, or an
/// empty vocabulary.
pub fn load_vocab(config: &Config) -> Result<Vocab> {
    let path = config.vocab_path();
    let model_type = config.model.model_type;
    let vocab = match model_type {
        ModelType::Text => Vocab::load_categorical(&path)?,
        ModelType::TextDnn | ModelType::CellMerge | ModelType::Ocr => Vocab::load(&path)?,
        ModelType::LineCrf if config.train.use_text => Vocab::load(&path)?,
        ModelType::LineCrf | ModelType::Capsnet => {
            Vocab::from_tokens(config.data.labels.iter().flatten().cloned())
        }
    };
    Ok(vocab.with_default(unk_id(model_type)))
}

/// Error unless `vocab` has entries.
pub(crate) fn require_vocab(vocab: &Vocab, model_type: ModelType) -> Result<()> {
    if vocab.is_empty() {
        return Err(LayoutError::Vocab(format!("{model_type} needs a non-empty vocabulary")));
    }
    Ok(())
}

/// Error when a collated batch has no rows or no time steps.
pub(crate) fn require_nonempty(batch: usize, steps: usize) -> Result<()> {
    if batch == 0 || steps == 0 {
        return Err(LayoutError::Data(format!(
            "cannot collate a batch of {batch} examples with {steps} steps"
        )));
    }
    Ok(())
}

/// Per-row softmax probabilities of `[b, n]` logits, on the host.
pub(crate) fn softmax_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    let probs = candle_nn::ops::softmax_last_dim(logits)?;
    Ok(probs.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capsnet_vocab_comes_from_labels() {
        let yaml = r#"
data:
  type: digit-records
  labels: ["zero", "one"]
model:
  type: capsnet
train:
  model_dir: logs/capsnet
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        let vocab = load_vocab(&config).unwrap();
        assert_eq!(vocab.reverse(1), Some("one"));
    }

    #[test]
    fn missing_vocab_file_is_error() {
        let yaml = r#"
data:
  type: cell-records
  base_path: /nonexistent/layoutcrf
model:
  type: cell-merge
train:
  model_dir: logs/cell
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(matches!(load_vocab(&config), Err(LayoutError::Vocab(_))));
    }

    #[test]
    fn empty_batches_rejected() {
        assert!(require_nonempty(0, 3).is_err());
        assert!(require_nonempty(2, 0).is_err());
        assert!(require_nonempty(2, 3).is_ok());
    }
}
