//! # Configuration profiles
//!
//! Every run is driven by a YAML profile `config/<name>.yml` with three
//! sections (`data`, `model`, `train`) and an optional `description` map.
//! Enumerated values are checked when the profile is parsed, so an unknown
//! model type or cell mode fails before any graph is built.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};

/// Which model a profile trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    /// Character LSTM deciding whether two text fragments break a line.
    Text,
    /// Line-pair merge classifier with an auxiliary CRF over the text.
    TextDnn,
    /// Page-level BiRNN + CRF line tagger (paragraphs and tables).
    LineCrf,
    /// Table cell merge classifier.
    CellMerge,
    /// Glyph OCR classifier.
    Ocr,
    /// Capsule network classifier.
    Capsnet,
}

impl ModelType {
    /// The record layout this model reads.
    pub fn data_type(&self) -> DataType {
        match self {
            ModelType::Text => DataType::Corpus,
            ModelType::TextDnn => DataType::TextRecords,
            ModelType::LineCrf => DataType::LineRecords,
            ModelType::CellMerge => DataType::CellRecords,
            ModelType::Ocr => DataType::FontRecords,
            ModelType::Capsnet => DataType::DigitRecords,
        }
    }

    /// Profile name used by exported bundles.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Text => "text",
            ModelType::TextDnn => "text-dnn",
            ModelType::LineCrf => "line-crf",
            ModelType::CellMerge => "cell-merge",
            ModelType::Ocr => "ocr",
            ModelType::Capsnet => "capsnet",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelType {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(ModelType::Text),
            "text-dnn" => Ok(ModelType::TextDnn),
            "line-crf" => Ok(ModelType::LineCrf),
            "cell-merge" => Ok(ModelType::CellMerge),
            "ocr" => Ok(ModelType::Ocr),
            "capsnet" => Ok(ModelType::Capsnet),
            other => Err(LayoutError::Config(format!("unknown model type {other}"))),
        }
    }
}

/// On-disk layout of the training data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    /// Raw text preprocessed into a character id stream.
    Corpus,
    /// JSON-lines text pair records.
    TextRecords,
    /// JSON-lines page records with per-line features.
    LineRecords,
    /// JSON-lines cell pair records.
    CellRecords,
    /// JSON-lines glyph image records.
    FontRecords,
    /// JSON-lines small digit-style image records.
    DigitRecords,
}

/// Recurrent cell variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RnnMode {
    Basic,
    Block,
    Lstm,
    Gru,
}

/// Sequence encoder of the line tagger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoder {
    #[default]
    Rnn,
    Cnn,
    Crnn,
}

/// Convolution stack of the OCR model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OcrNet {
    #[default]
    Cnn,
    CnnSmall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default)]
    pub train_data_pattern: String,
    #[serde(default)]
    pub eval_data_pattern: String,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Filled from `vocab.txt` at startup.
    #[serde(default)]
    pub vocab_size: usize,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default)]
    pub raw_data_path: Option<PathBuf>,
    #[serde(default)]
    pub processed_path: Option<PathBuf>,
    #[serde(default = "default_set_size")]
    pub trainset_size: usize,
    #[serde(default = "default_set_size")]
    pub testset_size: usize,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default = "default_text_vector_length")]
    pub text_vector_length: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_keep_prob")]
    pub keep_prob: f32,
    #[serde(default = "default_rnn_mode")]
    pub rnn_mode: RnnMode,
    #[serde(default)]
    pub tag_keys: Vec<i64>,
    #[serde(default)]
    pub tag_values: Vec<i64>,
    /// Forbid invalid paragraph, table and chart transitions when decoding
    /// the full line tag set.
    #[serde(default)]
    pub constrain_transitions: bool,
    /// Width of one line feature vector.
    #[serde(default = "default_vector_length")]
    pub vector_length: usize,
    #[serde(default)]
    pub net: OcrNet,
    #[serde(default = "default_m_plus")]
    pub m_plus: f32,
    #[serde(default = "default_m_minus")]
    pub m_minus: f32,
    #[serde(default = "default_lambda_val")]
    pub lambda_val: f32,
    #[serde(default = "default_regularization_scale")]
    pub regularization_scale: f32,
    #[serde(default = "default_true")]
    pub mask_with_y: bool,
    #[serde(default = "default_routing_iters")]
    pub routing_iters: usize,
    #[serde(default = "default_num_capsules")]
    pub num_capsules: usize,
    #[serde(default = "default_capsule_dim")]
    pub capsule_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_train_steps")]
    pub train_steps: usize,
    #[serde(default = "default_eval_steps")]
    pub eval_steps: usize,
    #[serde(default = "default_min_eval_frequency")]
    pub min_eval_frequency: usize,
    #[serde(default = "default_save_checkpoints_steps")]
    pub save_checkpoints_steps: usize,
    #[serde(default = "default_keep_checkpoint_max")]
    pub keep_checkpoint_max: usize,
    #[serde(default)]
    pub print_verbose: bool,
    #[serde(default = "default_check_hook_n_iter")]
    pub check_hook_n_iter: usize,
    #[serde(default)]
    pub encoder: Encoder,
    #[serde(default)]
    pub use_text: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// A complete run profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    #[serde(default)]
    pub description: BTreeMap<String, String>,
}

impl Config {
    /// Load `<dir>/<name>.yml`.
    pub fn load(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = dir.as_ref().join(format!("{name}.yml"));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            LayoutError::Config(format!("cannot read profile {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a profile.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject combinations the models cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.model_type.data_type() != self.data.data_type {
            return Err(LayoutError::Config(format!(
                "model type {} cannot read data type {:?}",
                model.model_type, self.data.data_type
            )));
        }
        if model.tag_keys.len() != model.tag_values.len() {
            return Err(LayoutError::Config(format!(
                "tag_keys has {} entries but tag_values has {}",
                model.tag_keys.len(),
                model.tag_values.len()
            )));
        }
        if !(model.keep_prob > 0.0 && model.keep_prob <= 1.0) {
            return Err(LayoutError::Config(format!(
                "keep_prob must be in (0, 1], got {}",
                model.keep_prob
            )));
        }
        if model.batch_size == 0 {
            return Err(LayoutError::Config("batch_size must be positive".into()));
        }
        self.rnn_mode_for(model.model_type)?;
        Ok(())
    }

    /// Check the cell mode against what each model supports.
    pub fn rnn_mode_for(&self, model_type: ModelType) -> Result<RnnMode> {
        let mode = self.model.rnn_mode;
        let supported = match model_type {
            ModelType::Text => matches!(mode, RnnMode::Basic | RnnMode::Block),
            ModelType::TextDnn | ModelType::LineCrf => {
                matches!(mode, RnnMode::Basic | RnnMode::Lstm | RnnMode::Gru)
            }
            ModelType::CellMerge => matches!(mode, RnnMode::Basic | RnnMode::Lstm),
            ModelType::Ocr | ModelType::Capsnet => true,
        };
        if supported {
            Ok(mode)
        } else {
            Err(LayoutError::Config(format!(
                "rnn_mode {mode:?} not supported by {model_type}"
            )))
        }
    }

    /// Dropout probability derived from `keep_prob`.
    pub fn drop_prob(&self) -> f32 {
        1.0 - self.model.keep_prob
    }

    pub fn vocab_path(&self) -> PathBuf {
        self.data.base_path.join("vocab.txt")
    }

    pub fn train_pattern(&self) -> PathBuf {
        self.data.base_path.join(&self.data.train_data_pattern)
    }

    pub fn eval_pattern(&self) -> PathBuf {
        self.data.base_path.join(&self.data.eval_data_pattern)
    }

    /// Directory holding exported serving bundles.
    pub fn servo_dir(&self) -> PathBuf {
        self.train.model_dir.join("export").join("Servo")
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("data")
}
fn default_num_classes() -> usize {
    2
}
fn default_max_seq_length() -> usize {
    40
}
fn default_set_size() -> usize {
    100
}
fn default_text_vector_length() -> usize {
    100
}
fn default_image_size() -> usize {
    64
}
fn default_batch_size() -> usize {
    32
}
fn default_embed_dim() -> usize {
    64
}
fn default_hidden_size() -> usize {
    64
}
fn default_num_layers() -> usize {
    1
}
fn default_keep_prob() -> f32 {
    1.0
}
fn default_rnn_mode() -> RnnMode {
    RnnMode::Basic
}
fn default_vector_length() -> usize {
    crate::data::line::LINE_FEATURE_WIDTH
}
fn default_m_plus() -> f32 {
    0.9
}
fn default_m_minus() -> f32 {
    0.1
}
fn default_lambda_val() -> f32 {
    0.5
}
fn default_regularization_scale() -> f32 {
    0.392
}
fn default_true() -> bool {
    true
}
fn default_routing_iters() -> usize {
    3
}
fn default_num_capsules() -> usize {
    10
}
fn default_capsule_dim() -> usize {
    16
}
fn default_learning_rate() -> f64 {
    0.001
}
fn default_train_steps() -> usize {
    10_000
}
fn default_eval_steps() -> usize {
    100
}
fn default_min_eval_frequency() -> usize {
    1_000
}
fn default_save_checkpoints_steps() -> usize {
    1_000
}
fn default_keep_checkpoint_max() -> usize {
    20
}
fn default_check_hook_n_iter() -> usize {
    100
}
fn default_seed() -> u64 {
    42
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE_PROFILE: &str = r#"
data:
  type: line-records
  base_path: data
  train_data_pattern: line-train-*.jsonl
  eval_data_pattern: line-eval-*.jsonl
  num_classes: 4
model:
  type: line-crf
  batch_size: 16
  hidden_size: 32
  rnn_mode: GRU
  tag_keys: [0, 1, 8, 9, 10, 11]
  tag_values: [0, 1, 2, 2, 3, 3]
train:
  model_dir: logs/line-crf
  learning_rate: 0.01
  encoder: rnn
description:
  purpose: table region tagging
"#;

    #[test]
    fn parses_line_profile() {
        let config = Config::from_yaml_str(LINE_PROFILE).unwrap();
        assert_eq!(config.model.model_type, ModelType::LineCrf);
        assert_eq!(config.model.rnn_mode, RnnMode::Gru);
        assert_eq!(config.data.num_classes, 4);
        assert_eq!(config.train.keep_checkpoint_max, 20);
        assert_eq!(config.model.vector_length, 55);
        assert_eq!(
            config.servo_dir(),
            PathBuf::from("logs/line-crf/export/Servo")
        );
        assert_eq!(config.description["purpose"], "table region tagging");
    }

    #[test]
    fn unknown_model_type_is_rejected() {
        let profile = LINE_PROFILE.replace("type: line-crf", "type: line-hmm");
        assert!(matches!(
            Config::from_yaml_str(&profile),
            Err(LayoutError::ConfigParse(_))
        ));
        assert!("line-hmm".parse::<ModelType>().is_err());
    }

    #[test]
    fn unknown_rnn_mode_is_rejected() {
        let profile = LINE_PROFILE.replace("rnn_mode: GRU", "rnn_mode: ELMAN");
        assert!(Config::from_yaml_str(&profile).is_err());
    }

    #[test]
    fn unsupported_rnn_mode_for_model_is_rejected() {
        let profile = LINE_PROFILE.replace("rnn_mode: GRU", "rnn_mode: BLOCK");
        let err = Config::from_yaml_str(&profile).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn mismatched_tag_map_is_rejected() {
        let profile = LINE_PROFILE.replace("tag_values: [0, 1, 2, 2, 3, 3]", "tag_values: [0, 1]");
        assert!(matches!(
            Config::from_yaml_str(&profile),
            Err(LayoutError::Config(_))
        ));
    }

    #[test]
    fn model_and_data_type_must_agree() {
        let profile = LINE_PROFILE.replace("type: line-records", "type: cell-records");
        assert!(Config::from_yaml_str(&profile).is_err());
    }

    #[test]
    fn yaml_roundtrip_keeps_model_type() {
        let config = Config::from_yaml_str(LINE_PROFILE).unwrap();
        let text = config.to_yaml_string().unwrap();
        let again = Config::from_yaml_str(&text).unwrap();
        assert_eq!(again.model.model_type, ModelType::LineCrf);
        assert_eq!(again.model.tag_values, config.model.tag_values);
    }
}
