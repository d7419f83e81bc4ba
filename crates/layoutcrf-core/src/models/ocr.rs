//! Single-glyph OCR: a VGG-style stack over 64x64 grayscale images with one
//! class per vocabulary entry.

use candle_core::{Device, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder, batch_norm};
use serde::{Deserialize, Serialize};

use super::{LayoutModel, require_nonempty, require_vocab, softmax_rows};
use crate::config::{Config, ModelType, OcrNet};
use crate::data::FontRecord;
use crate::data::font::GLYPH_SIZE;
use crate::error::{LayoutError, Result};
use crate::metrics::{MetricSet, in_top_k, top_k};
use crate::nn::Dense;
use crate::nn::loss::sparse_softmax_cross_entropy;
use crate::serving::{DYNAMIC, Signature};
use crate::vocab::{Vocab, reserved};

/// Keep probability of the classifier dropout, fixed by the net.
const OCR_KEEP_PROB: f32 = 0.8;
const TOP_K: usize = 3;

/// One entry of a conv stack.
#[derive(Debug, Clone, Copy)]
enum Layer {
    Conv(usize),
    Pool,
}

const CNN: &[Layer] = &[
    Layer::Conv(64),
    Layer::Pool,
    Layer::Conv(128),
    Layer::Pool,
    Layer::Conv(256),
    Layer::Pool,
    Layer::Conv(512),
    Layer::Conv(512),
    Layer::Pool,
];

const CNN_SMALL: &[Layer] = &[
    Layer::Conv(32),
    Layer::Conv(32),
    Layer::Pool,
    Layer::Conv(64),
    Layer::Pool,
    Layer::Conv(128),
    Layer::Pool,
    Layer::Conv(256),
    Layer::Pool,
];

impl OcrNet {
    fn layers(&self) -> &'static [Layer] {
        match self {
            OcrNet::Cnn => CNN,
            OcrNet::CnnSmall => CNN_SMALL,
        }
    }

    fn fc_width(&self) -> usize {
        match self {
            OcrNet::Cnn => 1024,
            OcrNet::CnnSmall => 512,
        }
    }
}

/// 3x3 SAME convolution without bias, batch norm, ReLU.
#[derive(Debug, Clone)]
struct ConvBn {
    conv: Conv2d,
    norm: BatchNorm,
}

impl ConvBn {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d_no_bias(in_channels, out_channels, 3, config, vb.clone())?,
            norm: batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.norm.forward_t(&self.conv.forward(xs)?, train)?.relu()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlyphPrediction {
    pub texts: String,
    pub top3_scores: Vec<f32>,
    pub top3_texts: Vec<String>,
}

pub struct GlyphBatch {
    /// `[b, 1, 64, 64]` pixels in `[0, 1]`.
    pub images: Tensor,
    /// `[b]` class ids.
    pub labels: Tensor,
    pub targets: Vec<u32>,
}

pub struct OcrModel {
    convs: Vec<Option<ConvBn>>,
    fc: Dense,
    logits: Dense,
    dropout: candle_nn::Dropout,
    vocab: Vocab,
}

impl OcrModel {
    fn logits(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let mut net = images.clone();
        for layer in &self.convs {
            net = match layer {
                Some(conv) => conv.forward_t(&net, train)?,
                None => net.max_pool2d(2)?,
            };
        }
        let net = self.dropout.forward(&net.flatten_from(1)?, train)?;
        self.logits.forward_t(&self.fc.forward_t(&net, train)?, train)
    }

    /// Unlabeled batch from `count` glyphs of unit-scaled pixels, as served.
    pub fn collate_pixels(&self, pixels: Vec<f32>, count: usize, device: &Device) -> Result<GlyphBatch> {
        require_nonempty(count, GLYPH_SIZE)?;
        Ok(GlyphBatch {
            images: Tensor::from_vec(pixels, (count, 1, GLYPH_SIZE, GLYPH_SIZE), device)?,
            labels: Tensor::zeros(count, candle_core::DType::U32, device)?,
            targets: vec![reserved::OCR_UNK; count],
        })
    }
}

impl LayoutModel for OcrModel {
    type Example = FontRecord;
    type Batch = GlyphBatch;
    type Output = GlyphPrediction;

    const MODEL_TYPE: ModelType = ModelType::Ocr;

    fn build(config: &Config, vocab: &Vocab, vb: VarBuilder) -> Result<Self> {
        require_vocab(vocab, ModelType::Ocr)?;
        if config.data.image_size != GLYPH_SIZE {
            return Err(LayoutError::Config(format!(
                "ocr expects {GLYPH_SIZE}x{GLYPH_SIZE} glyphs, image_size is {}",
                config.data.image_size
            )));
        }
        let net = config.model.net;
        let mut convs = Vec::new();
        let mut channels = 1;
        let mut side = GLYPH_SIZE;
        for (i, layer) in net.layers().iter().enumerate() {
            match *layer {
                Layer::Conv(out) => {
                    convs.push(Some(ConvBn::new(channels, out, vb.pp(format!("conv{}", i + 1)))?));
                    channels = out;
                }
                Layer::Pool => {
                    convs.push(None);
                    side /= 2;
                }
            }
        }

        let drop = 1.0 - OCR_KEEP_PROB;
        let width = net.fc_width();
        Ok(Self {
            convs,
            fc: Dense::relu(channels * side * side, width, vb.pp("fc1"))?
                .with_batch_norm(width, vb.pp("fc1"))?
                .with_dropout(drop),
            logits: Dense::new(width, vocab.len(), vb.pp("fc2"))?,
            dropout: candle_nn::Dropout::new(drop),
            vocab: vocab.clone(),
        })
    }

    /// Glyphs whose text is outside the vocabulary are skipped.
    fn keep(&self, example: &FontRecord) -> bool {
        self.vocab.lookup(&example.text) != reserved::OCR_UNK
    }

    fn collate(&self, examples: &[FontRecord], device: &Device) -> Result<GlyphBatch> {
        let mut pixels = Vec::with_capacity(examples.len() * GLYPH_SIZE * GLYPH_SIZE);
        for record in examples {
            pixels.extend(record.pixels()?);
        }
        let targets: Vec<u32> = examples.iter().map(|r| self.vocab.lookup(&r.text)).collect();
        let mut batch = self.collate_pixels(pixels, examples.len(), device)?;
        batch.labels = Tensor::from_slice(&targets, targets.len(), device)?;
        batch.targets = targets;
        Ok(batch)
    }

    fn loss(&self, batch: &GlyphBatch, train: bool) -> Result<Tensor> {
        sparse_softmax_cross_entropy(&self.logits(&batch.images, train)?, &batch.labels)
    }

    fn predict(&self, batch: &GlyphBatch) -> Result<Vec<GlyphPrediction>> {
        let probs = softmax_rows(&self.logits(&batch.images, false)?)?;
        Ok(probs
            .iter()
            .map(|row| {
                let best = top_k(row, TOP_K);
                let top3_texts: Vec<String> = best
                    .iter()
                    .map(|&(id, _)| self.vocab.reverse_or_unk(id as u32).to_string())
                    .collect();
                GlyphPrediction {
                    texts: top3_texts.first().cloned().unwrap_or_default(),
                    top3_scores: best.iter().map(|&(_, score)| score).collect(),
                    top3_texts,
                }
            })
            .collect())
    }

    fn record_metrics(&self, batch: &GlyphBatch, outputs: &[GlyphPrediction], metrics: &mut MetricSet) {
        for (&target, output) in batch.targets.iter().zip(outputs) {
            let predicted = self.vocab.lookup(&output.texts);
            metrics.accuracy("accuracy").update(predicted, target);
            let hit = output
                .top3_texts
                .iter()
                .any(|text| self.vocab.lookup(text) == target);
            metrics.accuracy("top3_accuracy").update(hit, true);
        }
    }

    fn signature(&self) -> Signature {
        let size = GLYPH_SIZE as i64;
        Signature::predict()
            .input("image", "float32", &[DYNAMIC, 1, size, size])
            .output("texts", "string", &[DYNAMIC])
            .output("top3_scores", "float32", &[DYNAMIC, TOP_K as i64])
            .output("top3_texts", "string", &[DYNAMIC, TOP_K as i64])
    }
}

/// Whether `target` is among the three best `scores`.
pub fn top3_hit(scores: &[f32], target: u32) -> bool {
    in_top_k(scores, target as usize, TOP_K)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::UNK_TOKEN;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn model(net: &str) -> (VarMap, OcrModel) {
        let config = Config::from_yaml_str(&format!(
            r#"
data:
  type: font-records
model:
  type: ocr
  net: {net}
train:
  model_dir: logs/ocr
"#
        ))
        .unwrap();
        let vocab = Vocab::from_tokens([UNK_TOKEN, "一", "二", "三", "四"])
            .with_default(reserved::OCR_UNK);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = OcrModel::build(&config, &vocab, vb).unwrap();
        (varmap, model)
    }

    fn glyph(text: &str, shade: u8) -> FontRecord {
        FontRecord {
            image: vec![shade; GLYPH_SIZE * GLYPH_SIZE],
            text: text.into(),
        }
    }

    #[test]
    fn unknown_glyphs_filtered() {
        let (_varmap, model) = model("cnn-small");
        assert!(model.keep(&glyph("二", 0)));
        assert!(!model.keep(&glyph("五", 0)));
    }

    #[test]
    fn small_net_returns_top3() {
        let (_varmap, model) = model("cnn-small");
        let batch = model
            .collate(&[glyph("一", 10), glyph("三", 200)], &Device::Cpu)
            .unwrap();
        assert_eq!(batch.targets, vec![1, 3]);
        assert!(model.loss(&batch, true).unwrap().to_scalar::<f32>().unwrap() > 0.0);

        let outputs = model.predict(&batch).unwrap();
        for output in &outputs {
            assert_eq!(output.top3_texts.len(), 3);
            assert_eq!(output.texts, output.top3_texts[0]);
            assert!(output.top3_scores.windows(2).all(|w| w[0] >= w[1]));
        }
        let mut metrics = MetricSet::new();
        model.record_metrics(&batch, &outputs, &mut metrics);
        assert!(metrics.get("top3_accuracy").unwrap() >= metrics.get("accuracy").unwrap());
    }

    #[test]
    fn top3_hit_counts_ties() {
        assert!(top3_hit(&[0.1, 0.4, 0.3, 0.2], 3));
        assert!(!top3_hit(&[0.1, 0.4, 0.3, 0.2], 0));
    }

    #[test]
    fn wrong_image_size_rejected() {
        let (_varmap, model) = model("cnn-small");
        let record = FontRecord {
            image: vec![0; 10],
            text: "一".into(),
        };
        assert!(model.collate(&[record], &Device::Cpu).is_err());
    }
}
