//! Line-pair merge classifier.
//!
//! A BiRNN + CRF tags the tokens of both lines; whether the first token of
//! the second line is tagged 1 becomes one input of an MLP over the layout
//! measurements, which predicts the merge.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder, embedding, linear};
use serde::{Deserialize, Serialize};

use super::{LayoutModel, require_nonempty, require_vocab};
use crate::config::{Config, ModelType};
use crate::crf::CrfHead;
use crate::data::{TextPairRecord, pad_ids};
use crate::error::{LayoutError, Result};
use crate::metrics::MetricSet;
use crate::nn::loss::sigmoid_cross_entropy;
use crate::nn::{BiRnn, Dense};
use crate::serving::{DYNAMIC, Signature};
use crate::vocab::{Vocab, reserved};

/// Tags of the auxiliary token CRF.
const TEXT_TAGS: usize = 4;
/// Token tag marking the start of a continued sentence.
const CONTINUATION_TAG: u32 = 1;
const LAYOUT_WIDTH: usize = 10;
const MLP_WIDTHS: [usize; 3] = [256, 128, 64];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePrediction {
    pub scores: f32,
    pub class: bool,
    pub crf_tags: Vec<u32>,
}

pub struct TextPairBatch {
    /// `[b, t]` token ids.
    pub ids: Tensor,
    /// `[b, t]` token tags.
    pub tags: Tensor,
    /// `[b, 10]` margin, indent and font size.
    pub layout: Tensor,
    /// `[b]` merge labels as floats.
    pub merge: Tensor,
    pub lengths: Vec<usize>,
    pub text_lengths: Vec<usize>,
    pub labels: Vec<u32>,
    pub targets: Vec<Vec<u32>>,
}

pub struct TextDnnModel {
    embedding: Embedding,
    birnn: BiRnn,
    proj: Linear,
    crf: CrfHead,
    mlp: Vec<Dense>,
    out: Dense,
    vocab: Vocab,
}

struct Forward {
    text_logits: Tensor,
    paths: Vec<Vec<u32>>,
    logit: Tensor,
}

impl TextDnnModel {
    fn forward(&self, batch: &TextPairBatch, train: bool) -> Result<Forward> {
        let xs = self.embedding.forward(&batch.ids)?;
        let encoded = self.birnn.forward_t(&xs, &batch.lengths, train)?;
        let text_logits = self.proj.forward(&encoded.outputs)?;

        let (paths, _) = self.crf.decode(&text_logits.detach(), &batch.lengths)?;
        let continued: Vec<f32> = paths
            .iter()
            .zip(&batch.text_lengths)
            .map(|(path, &at)| {
                if path.get(at) == Some(&CONTINUATION_TAG) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        let continued = Tensor::from_vec(continued, (paths.len(), 1), xs.device())?;

        let mut net = Tensor::cat(&[&batch.layout, &continued], 1)?;
        for layer in &self.mlp {
            net = layer.forward_t(&net, train)?;
        }
        let logit = self.out.forward_t(&net, train)?.squeeze(1)?;
        Ok(Forward {
            text_logits,
            paths,
            logit,
        })
    }
}

impl LayoutModel for TextDnnModel {
    type Example = TextPairRecord;
    type Batch = TextPairBatch;
    type Output = MergePrediction;

    const MODEL_TYPE: ModelType = ModelType::TextDnn;

    fn build(config: &Config, vocab: &Vocab, vb: VarBuilder) -> Result<Self> {
        require_vocab(vocab, ModelType::TextDnn)?;
        let mode = config.rnn_mode_for(ModelType::TextDnn)?;
        let model = &config.model;
        let drop = config.drop_prob();
        let birnn = BiRnn::new(mode, model.embed_dim, model.hidden_size, drop, vb.pp("rnn"))?;

        let mut mlp = Vec::with_capacity(MLP_WIDTHS.len());
        let mut in_dim = LAYOUT_WIDTH + 1;
        for (i, &width) in MLP_WIDTHS.iter().enumerate() {
            let vb = vb.pp(format!("fc{}", i + 1));
            mlp.push(
                Dense::relu(in_dim, width, vb.clone())?
                    .with_batch_norm(width, vb)?
                    .with_dropout(drop),
            );
            in_dim = width;
        }

        Ok(Self {
            embedding: embedding(vocab.len(), model.embed_dim, vb.pp("embedding"))?,
            proj: linear(birnn.output_dim(), TEXT_TAGS, vb.pp("proj"))?,
            birnn,
            crf: CrfHead::new(TEXT_TAGS, vb.pp("crf"))?,
            mlp,
            out: Dense::new(in_dim, 1, vb.pp("logits"))?,
            vocab: vocab.clone(),
        })
    }

    fn collate(&self, examples: &[TextPairRecord], device: &Device) -> Result<TextPairBatch> {
        let b = examples.len();
        let mut seqs = Vec::with_capacity(b);
        let mut targets = Vec::with_capacity(b);
        let mut lengths = Vec::with_capacity(b);
        let mut text_lengths = Vec::with_capacity(b);
        let mut layout = Vec::with_capacity(b * LAYOUT_WIDTH);
        let mut labels = Vec::with_capacity(b);

        for record in examples {
            let ids = record.token_ids(&self.vocab);
            let len = record.seq_length()?.min(ids.len());
            let mut tags = record
                .tags
                .iter()
                .take(len)
                .map(|&t| {
                    if (0..TEXT_TAGS as i64).contains(&t) {
                        Ok(t as u32)
                    } else {
                        Err(LayoutError::Data(format!("token tag {t} outside 0..{TEXT_TAGS}")))
                    }
                })
                .collect::<Result<Vec<u32>>>()?;
            tags.resize(len, 0);

            seqs.push(ids);
            targets.push(tags);
            lengths.push(len);
            text_lengths.push(record.text_length.max(0) as usize);
            layout.extend_from_slice(&record.layout_features());
            labels.push(u32::from(record.can_merge > 0));
        }

        let (flat_ids, t) = pad_ids(&seqs, reserved::TEXT_DNN_PAD);
        require_nonempty(b, t)?;
        let mut flat_tags = Vec::with_capacity(b * t);
        for tags in &targets {
            flat_tags.extend(tags.iter().copied().chain(std::iter::repeat(0)).take(t));
        }
        let merge: Vec<f32> = labels.iter().map(|&l| l as f32).collect();

        Ok(TextPairBatch {
            ids: Tensor::from_vec(flat_ids, (b, t), device)?,
            tags: Tensor::from_vec(flat_tags, (b, t), device)?,
            layout: Tensor::from_vec(layout, (b, LAYOUT_WIDTH), device)?,
            merge: Tensor::from_vec(merge, b, device)?,
            lengths,
            text_lengths,
            labels,
            targets,
        })
    }

    fn loss(&self, batch: &TextPairBatch, train: bool) -> Result<Tensor> {
        let forward = self.forward(batch, train)?;
        let merge_loss = sigmoid_cross_entropy(&forward.logit, &batch.merge)?;
        let text_loss = self.crf.loss(&forward.text_logits, &batch.tags, &batch.lengths)?;
        Ok((merge_loss + text_loss)?)
    }

    fn predict(&self, batch: &TextPairBatch) -> Result<Vec<MergePrediction>> {
        let forward = self.forward(batch, false)?;
        let scores = candle_nn::ops::sigmoid(&forward.logit)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        Ok(scores
            .into_iter()
            .zip(forward.paths)
            .map(|(score, crf_tags)| MergePrediction {
                scores: score,
                class: score > 0.5,
                crf_tags,
            })
            .collect())
    }

    fn record_metrics(&self, batch: &TextPairBatch, outputs: &[MergePrediction], metrics: &mut MetricSet) {
        for ((&label, target), output) in batch.labels.iter().zip(&batch.targets).zip(outputs) {
            metrics
                .accuracy("accuracy")
                .update(u32::from(output.class), label);
            for (&t, &p) in target.iter().zip(&output.crf_tags) {
                metrics.accuracy("text_accuracy").update(p, t);
            }
        }
    }

    fn signature(&self) -> Signature {
        Signature::predict()
            .input("ids", "int32", &[DYNAMIC, DYNAMIC])
            .input("lengths", "int64", &[DYNAMIC])
            .input("text_length", "int64", &[DYNAMIC])
            .input("layout", "float32", &[DYNAMIC, LAYOUT_WIDTH as i64])
            .output("scores", "float32", &[DYNAMIC])
            .output("class", "int64", &[DYNAMIC])
            .output("crf_tags", "int32", &[DYNAMIC, DYNAMIC])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{PAD_TOKEN, UNK_TOKEN};
    use candle_nn::VarMap;

    fn model() -> (VarMap, TextDnnModel) {
        let config = Config::from_yaml_str(
            r#"
data:
  type: text-records
model:
  type: text-dnn
  embed_dim: 6
  hidden_size: 4
  rnn_mode: GRU
  keep_prob: 0.8
train:
  model_dir: logs/text-dnn
"#,
        )
        .unwrap();
        let vocab = Vocab::from_tokens([PAD_TOKEN, UNK_TOKEN, "本", "期", "合", "计"])
            .with_default(reserved::TEXT_DNN_UNK);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = TextDnnModel::build(&config, &vocab, vb).unwrap();
        (varmap, model)
    }

    fn record(text: &str, next: &str, tags: Vec<i64>, can_merge: i64) -> TextPairRecord {
        TextPairRecord {
            text: text.into(),
            text_length: text.split(' ').count() as i64,
            next_text: next.into(),
            next_text_length: next.split(' ').count() as i64,
            tags,
            margin: [0.1, 0.2, 0.3, 0.4],
            indent: [0.0; 4],
            font_size: [10.0, 10.0],
            can_merge,
        }
    }

    #[test]
    fn loss_and_predictions_cover_both_heads() {
        let (_varmap, model) = model();
        let records = vec![
            record("本 期", "合 计", vec![0, 2, 1, 3], 1),
            record("本", "计", vec![0, 0], 0),
        ];
        let batch = model.collate(&records, &Device::Cpu).unwrap();
        assert_eq!(batch.ids.dims(), &[2, 4]);
        assert_eq!(batch.tags.to_vec2::<u32>().unwrap()[1], vec![0, 0, 0, 0]);

        let loss = model.loss(&batch, true).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());

        let outputs = model.predict(&batch).unwrap();
        assert_eq!(outputs[0].crf_tags.len(), 4);
        assert_eq!(outputs[1].crf_tags.len(), 2);
        assert!(outputs.iter().all(|o| (0.0..=1.0).contains(&o.scores)));
        assert!(outputs.iter().all(|o| o.class == (o.scores > 0.5)));

        let mut metrics = MetricSet::new();
        model.record_metrics(&batch, &outputs, &mut metrics);
        assert!(metrics.get("text_accuracy").is_some());
    }

    #[test]
    fn out_of_range_token_tag_rejected() {
        let (_varmap, model) = model();
        let records = vec![record("本", "计", vec![0, 9], 0)];
        assert!(model.collate(&records, &Device::Cpu).is_err());
    }
}
