//! # Serving bundles
//!
//! A trained model is exported as a directory
//! `<model_dir>/export/Servo/<timestamp>/` holding the weights
//! (`model.safetensors`, with the model type, profile and signature in the
//! safetensors metadata), a `signature.json` describing the inputs and
//! outputs, and the vocabulary under `assets/`. [`ServedModel`] rebuilds
//! the model from such a directory and answers typed [`Request`]s.

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::ops::Range;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Config, ModelType};
use crate::data::corpus::{NO_BREAK, join_at_break};
use crate::data::font::GLYPH_SIZE;
use crate::data::{CellRecord, DigitRecord, FontRecord, LineRecord, TextPairRecord, TextWindow};
use crate::error::{LayoutError, Result};
use crate::models::{
    CapsNetModel, CellMergeModel, CellPrediction, DigitPrediction, GlyphPrediction, LayoutModel,
    LineCrfModel, MergePrediction, OcrModel, PagePrediction, TextDnnModel, TextPrediction,
    TextRnnModel, unk_id,
};
use crate::regions::{LineInfo, ParagraphBlock, RegionAssembler, paragraph_blocks};
use crate::tags::{LineTag, TableTag};
use crate::vocab::{Vocab, char_tokens};

/// Shape entry for a dimension fixed only at request time.
pub const DYNAMIC: i64 = -1;
/// Exports kept in the Servo directory after a new one is written.
pub const EXPORTS_TO_KEEP: usize = 1;

const MODEL_FILE: &str = "model.safetensors";
const SIGNATURE_FILE: &str = "signature.json";
const ASSETS_DIR: &str = "assets";
const VOCAB_FILE: &str = "vocab.txt";

const META_MODEL_TYPE: &str = "model_type";
const META_CONFIG: &str = "config";
const META_SIGNATURE: &str = "signature";

/// Font size sent with line pairs that carry no layout.
const DEFAULT_FONT_SIZE: f32 = 9.0;

/// Name, element type and shape of one served tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<i64>,
}

/// Inputs and outputs of an exported model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub method_name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl Signature {
    pub fn predict() -> Self {
        Self {
            method_name: "predict".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, name: &str, dtype: &str, shape: &[i64]) -> Self {
        self.inputs.push(spec(name, dtype, shape));
        self
    }

    pub fn output(mut self, name: &str, dtype: &str, shape: &[i64]) -> Self {
        self.outputs.push(spec(name, dtype, shape));
        self
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|s| s.name.as_str())
    }
}

fn spec(name: &str, dtype: &str, shape: &[i64]) -> TensorSpec {
    TensorSpec {
        name: name.to_string(),
        dtype: dtype.to_string(),
        shape: shape.to_vec(),
    }
}

/// Write a serving bundle under `servo_dir` and prune older exports.
///
/// Returns the new export directory.
pub fn export_bundle(
    servo_dir: &Path,
    model_type: ModelType,
    config: &Config,
    varmap: &VarMap,
    signature: &Signature,
    vocab: &Vocab,
) -> Result<PathBuf> {
    let dir = next_export_dir(servo_dir)?;
    fs::create_dir_all(dir.join(ASSETS_DIR))?;

    let signature_json = serde_json::to_string_pretty(signature)?;
    let metadata = HashMap::from([
        (META_MODEL_TYPE.to_string(), model_type.as_str().to_string()),
        (META_CONFIG.to_string(), config.to_yaml_string()?),
        (META_SIGNATURE.to_string(), signature_json.clone()),
    ]);

    let tensors = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| LayoutError::ModelLoad("variable store lock poisoned".into()))?;
        let mut tensors: Vec<(String, Tensor)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        tensors
    };
    let count = tensors.len();
    safetensors::serialize_to_file(tensors, &Some(metadata), &dir.join(MODEL_FILE))?;
    fs::write(dir.join(SIGNATURE_FILE), signature_json)?;
    if !vocab.is_empty() {
        vocab.save(dir.join(ASSETS_DIR).join(VOCAB_FILE))?;
    }
    info!(dir = %dir.display(), tensors = count, %model_type, "exported model");

    prune_exports(servo_dir, EXPORTS_TO_KEEP)?;
    Ok(dir)
}

/// Timestamped directory that does not exist yet.
fn next_export_dir(servo_dir: &Path) -> Result<PathBuf> {
    let mut stamp = chrono::Utc::now().timestamp();
    loop {
        let dir = servo_dir.join(stamp.to_string());
        if !dir.exists() {
            return Ok(dir);
        }
        stamp += 1;
    }
}

/// Export directories under `servo_dir`, oldest first.
fn list_exports(servo_dir: &Path) -> Result<Vec<PathBuf>> {
    if !servo_dir.is_dir() {
        return Err(LayoutError::ModelLoad(format!(
            "no exports in {}",
            servo_dir.display()
        )));
    }
    let mut exports = Vec::new();
    for entry in fs::read_dir(servo_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let stamp = entry.file_name().to_string_lossy().parse::<i64>().unwrap_or(i64::MIN);
        exports.push((modified, stamp, entry.path()));
    }
    exports.sort();
    Ok(exports.into_iter().map(|(_, _, path)| path).collect())
}

/// The most recently written export.
pub fn latest_export(servo_dir: &Path) -> Result<PathBuf> {
    list_exports(servo_dir)?.pop().ok_or_else(|| {
        LayoutError::ModelLoad(format!("no exports in {}", servo_dir.display()))
    })
}

fn prune_exports(servo_dir: &Path, keep: usize) -> Result<()> {
    let exports = list_exports(servo_dir)?;
    let stale = exports.len().saturating_sub(keep);
    for dir in &exports[..stale] {
        debug!(dir = %dir.display(), "removing old export");
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

/// Decode an encoded image into 64x64 grayscale bytes.
pub fn decode_glyph(bytes: &[u8]) -> Result<Vec<u8>> {
    let gray = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?
        .to_luma8();
    let side = GLYPH_SIZE as u32;
    Ok(image::imageops::resize(&gray, side, side, FilterType::Triangle).into_raw())
}

/// One prediction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Two pieces of text: around a candidate break (`text`), consecutive
    /// lines without layout (`text-dnn`) or adjacent cells (`cell-merge`).
    Sentences { left: String, right: String },
    TextPair(TextPairRecord),
    Cell(CellRecord),
    Page(LineRecord),
    /// PNG or JPEG bytes of one glyph.
    EncodedImage(Vec<u8>),
    /// 64x64 grayscale bytes of one glyph.
    RawImage(Vec<u8>),
    /// `image_size * image_size` grayscale bytes.
    Pixels(Vec<u8>),
}

impl Request {
    fn kind(&self) -> &'static str {
        match self {
            Request::Sentences { .. } => "sentences",
            Request::TextPair(_) => "text_pair",
            Request::Cell(_) => "cell",
            Request::Page(_) => "page",
            Request::EncodedImage(_) => "encoded_image",
            Request::RawImage(_) => "raw_image",
            Request::Pixels(_) => "pixels",
        }
    }
}

/// Decoded line tags of a page with the regions built from them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageLayout {
    #[serde(flatten)]
    pub prediction: PagePrediction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<Range<usize>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paragraphs: Vec<ParagraphBlock>,
}

/// One response, shaped by the served model type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prediction {
    Page(PageLayout),
    Text(TextPrediction),
    Merge(MergePrediction),
    Cell(CellPrediction),
    Glyph(GlyphPrediction),
    Digit(DigitPrediction),
}

enum Served {
    LineCrf(LineCrfModel),
    Text(TextRnnModel),
    TextDnn(TextDnnModel),
    CellMerge(CellMergeModel),
    Ocr(OcrModel),
    Capsnet(CapsNetModel),
}

/// A model rebuilt from an export directory.
pub struct ServedModel {
    model: Served,
    config: Config,
    signature: Signature,
    vocab: Vocab,
    assembler: RegionAssembler,
    device: Device,
    dir: PathBuf,
}

impl ServedModel {
    /// Load the newest export under `servo_dir`.
    pub fn load_latest(servo_dir: impl AsRef<Path>) -> Result<Self> {
        Self::load(latest_export(servo_dir.as_ref())?)
    }

    /// Load the export in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `LayoutError::ModelLoad` when the weights file is missing or
    /// its metadata is incomplete.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let weights = dir.join(MODEL_FILE);
        let buffer = fs::read(&weights).map_err(|e| {
            LayoutError::ModelLoad(format!("cannot read {}: {e}", weights.display()))
        })?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&buffer)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let field = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                LayoutError::ModelLoad(format!("{} has no {key} metadata", weights.display()))
            })
        };

        let model_type: ModelType = field(META_MODEL_TYPE)?.parse()?;
        let config = Config::from_yaml_str(field(META_CONFIG)?)?;
        let signature: Signature = serde_json::from_str(field(META_SIGNATURE)?)?;
        if config.model.model_type != model_type {
            return Err(LayoutError::ModelLoad(format!(
                "bundle is tagged {model_type} but its profile builds {}",
                config.model.model_type
            )));
        }

        let vocab_path = dir.join(ASSETS_DIR).join(VOCAB_FILE);
        let vocab = if vocab_path.exists() {
            Vocab::load(&vocab_path)?.with_default(unk_id(model_type))
        } else {
            Vocab::from_tokens(config.data.labels.iter().flatten().cloned())
        };

        let device = Device::Cpu;
        let tensors = candle_core::safetensors::load_buffer(&buffer, &device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let model = match model_type {
            ModelType::LineCrf => Served::LineCrf(LineCrfModel::build(&config, &vocab, vb)?),
            ModelType::Text => Served::Text(TextRnnModel::build(&config, &vocab, vb)?),
            ModelType::TextDnn => Served::TextDnn(TextDnnModel::build(&config, &vocab, vb)?),
            ModelType::CellMerge => Served::CellMerge(CellMergeModel::build(&config, &vocab, vb)?),
            ModelType::Ocr => Served::Ocr(OcrModel::build(&config, &vocab, vb)?),
            ModelType::Capsnet => Served::Capsnet(CapsNetModel::build(&config, &vocab, vb)?),
        };
        info!(dir = %dir.display(), %model_type, "loaded export");

        Ok(Self {
            model,
            config,
            signature,
            vocab,
            assembler: RegionAssembler::new()?,
            device,
            dir,
        })
    }

    pub fn model_type(&self) -> ModelType {
        self.config.model.model_type
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn predict_one(&self, request: Request) -> Result<Prediction> {
        self.predict(std::slice::from_ref(&request))?
            .pop()
            .ok_or_else(|| LayoutError::Request("model returned no prediction".into()))
    }

    /// Answer a batch of requests, all addressed to this model type.
    pub fn predict(&self, requests: &[Request]) -> Result<Vec<Prediction>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        match &self.model {
            Served::LineCrf(model) => {
                let pages = self.examples(requests, |r| match r {
                    Request::Page(page) if !page.is_empty() => Ok(page.clone()),
                    Request::Page(_) => Err(LayoutError::Request("page has no lines".into())),
                    _ => Err(self.mismatch(r)),
                })?;
                let outputs = run(model, &pages, &self.device)?;
                pages
                    .iter()
                    .zip(outputs)
                    .map(|(page, prediction)| self.page_layout(model, page, prediction))
                    .collect()
            }
            Served::Text(model) => {
                let max_len = self.config.data.max_seq_length;
                let windows = self.examples(requests, |r| match r {
                    Request::Sentences { left, right } => Ok(TextWindow {
                        ids: join_at_break(
                            &self.vocab.encode_chars(left.trim()),
                            &self.vocab.encode_chars(right.trim()),
                            max_len,
                        ),
                        label: NO_BREAK,
                    }),
                    _ => Err(self.mismatch(r)),
                })?;
                wrap(run(model, &windows, &self.device)?, Prediction::Text)
            }
            Served::TextDnn(model) => {
                let pairs = self.examples(requests, |r| match r {
                    Request::TextPair(record) => Ok(record.clone()),
                    Request::Sentences { left, right } => Ok(line_pair(left, right)),
                    _ => Err(self.mismatch(r)),
                })?;
                wrap(run(model, &pairs, &self.device)?, Prediction::Merge)
            }
            Served::CellMerge(model) => {
                let cells = self.examples(requests, |r| match r {
                    Request::Cell(record) => Ok(record.clone()),
                    Request::Sentences { left, right } => Ok(cell_pair(left, right)),
                    _ => Err(self.mismatch(r)),
                })?;
                wrap(run(model, &cells, &self.device)?, Prediction::Cell)
            }
            Served::Ocr(model) => {
                let glyphs = self.examples(requests, |r| {
                    let image = match r {
                        Request::EncodedImage(bytes) => decode_glyph(bytes)?,
                        Request::RawImage(bytes) => bytes.clone(),
                        _ => return Err(self.mismatch(r)),
                    };
                    Ok(FontRecord {
                        image,
                        text: String::new(),
                    })
                })?;
                wrap(run(model, &glyphs, &self.device)?, Prediction::Glyph)
            }
            Served::Capsnet(model) => {
                let digits = self.examples(requests, |r| match r {
                    Request::Pixels(image) => Ok(DigitRecord {
                        image: image.clone(),
                        label: 0,
                    }),
                    _ => Err(self.mismatch(r)),
                })?;
                wrap(run(model, &digits, &self.device)?, Prediction::Digit)
            }
        }
    }

    fn examples<T>(&self, requests: &[Request], f: impl Fn(&Request) -> Result<T>) -> Result<Vec<T>> {
        requests.iter().map(f).collect()
    }

    fn mismatch(&self, request: &Request) -> LayoutError {
        LayoutError::Request(format!(
            "{} model cannot answer a {} request",
            self.model_type(),
            request.kind()
        ))
    }

    /// Table regions for four-tag models, paragraph blocks for the full
    /// line tag set.
    fn page_layout(&self, model: &LineCrfModel, page: &LineRecord, prediction: PagePrediction) -> Result<Prediction> {
        let mut layout = PageLayout {
            prediction,
            tables: Vec::new(),
            paragraphs: Vec::new(),
        };
        match model.num_tags() {
            TableTag::NUM_TAGS => {
                let lines = LineInfo::from_record(page);
                layout.tables = self
                    .assembler
                    .table_regions(&layout.prediction.crf_tags, &lines)?;
            }
            LineTag::NUM_TAGS => {
                let tags: Vec<LineTag> = layout
                    .prediction
                    .crf_tags
                    .iter()
                    .map(|&t| LineTag::from_index(t as usize).unwrap_or(LineTag::Unknown))
                    .collect();
                layout.paragraphs = paragraph_blocks(&tags);
            }
            _ => {}
        }
        Ok(Prediction::Page(layout))
    }
}

fn run<M: LayoutModel>(model: &M, examples: &[M::Example], device: &Device) -> Result<Vec<M::Output>> {
    let batch = model.collate(examples, device)?;
    model.predict(&batch)
}

fn wrap<T>(outputs: Vec<T>, f: impl Fn(T) -> Prediction) -> Result<Vec<Prediction>> {
    Ok(outputs.into_iter().map(f).collect())
}

/// Line pair without layout: zero margins and indents, 9pt fonts.
fn line_pair(text: &str, next_text: &str) -> TextPairRecord {
    TextPairRecord {
        text: char_tokens(text.trim()),
        text_length: text.trim().chars().count() as i64,
        next_text: char_tokens(next_text.trim()),
        next_text_length: next_text.trim().chars().count() as i64,
        font_size: [DEFAULT_FONT_SIZE; 2],
        ..Default::default()
    }
}

fn cell_pair(left: &str, right: &str) -> CellRecord {
    let (left, right) = (left.trim(), right.trim());
    CellRecord {
        x_l: char_tokens(left),
        x_r: char_tokens(right),
        y: 0,
        l: (left.chars().count() + right.chars().count() + 1) as i64,
    }
}
