//! Page-level line tagger: sequence encoder over line feature vectors and
//! a CRF over the line tags.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use super::{LayoutModel, require_nonempty};
use crate::config::{Config, Encoder, ModelType};
use crate::crf::CrfHead;
use crate::data::line::LINE_FEATURE_WIDTH;
use crate::data::{LineRecord, pad_ids, pad_rows};
use crate::error::{LayoutError, Result};
use crate::metrics::MetricSet;
use crate::nn::{BiRnn, CrnnBlock, Dense, LineConvBlock};
use crate::serving::{DYNAMIC, Signature};
use crate::tags::{LineTag, TagMap};
use crate::vocab::Vocab;

/// Width of the hidden layer between encoder and tag logits.
const LINE_HIDDEN: usize = 64;

/// Decoded tags of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagePrediction {
    pub crf_tags: Vec<u32>,
    pub crf_scores: f32,
}

enum LineEncoder {
    Rnn {
        birnn: BiRnn,
        hidden: Dense,
        out: Dense,
    },
    Cnn {
        block: LineConvBlock,
        hidden: Dense,
        out: Dense,
    },
    Crnn(CrnnBlock),
}

pub struct LineBatch {
    /// `[b, t, width]`
    pub features: Tensor,
    /// `[b, t]` remapped tags, zero past each length.
    pub tags: Tensor,
    pub lengths: Vec<usize>,
    pub targets: Vec<Vec<u32>>,
}

pub struct LineCrfModel {
    encoder: LineEncoder,
    crf: CrfHead,
    tag_map: TagMap,
    num_tags: usize,
    use_text: bool,
    text_width: usize,
    vocab: Vocab,
}

impl LineCrfModel {
    pub fn input_width(&self) -> usize {
        LINE_FEATURE_WIDTH + if self.use_text { self.text_width } else { 0 }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    fn logits(&self, batch: &LineBatch, train: bool) -> Result<Tensor> {
        match &self.encoder {
            LineEncoder::Rnn { birnn, hidden, out } => {
                let encoded = birnn.forward_t(&batch.features, &batch.lengths, train)?;
                out.forward_t(&hidden.forward_t(&encoded.outputs, train)?, train)
            }
            LineEncoder::Cnn { block, hidden, out } => {
                let net = block.forward_t(&batch.features, train)?;
                out.forward_t(&hidden.forward_t(&net, train)?, train)
            }
            LineEncoder::Crnn(block) => block.forward_t(&batch.features, &batch.lengths, train),
        }
    }

    /// Tags of one page after remapping; pages without tags get zeros.
    fn page_targets(&self, record: &LineRecord) -> Result<Vec<u32>> {
        if record.tags.is_empty() {
            return Ok(vec![0; record.len()]);
        }
        self.tag_map.remap_all(record.line_tags()?, self.num_tags)
    }

    fn page_features(&self, record: &LineRecord) -> Result<Vec<Vec<f32>>> {
        let mut rows = record.feature_matrix()?;
        if self.use_text {
            let text = record.text_vectors(&self.vocab, self.text_width);
            for (row, ids) in rows.iter_mut().zip(text) {
                row.extend(ids);
            }
        }
        Ok(rows)
    }
}

impl LayoutModel for LineCrfModel {
    type Example = LineRecord;
    type Batch = LineBatch;
    type Output = PagePrediction;

    const MODEL_TYPE: ModelType = ModelType::LineCrf;

    fn build(config: &Config, vocab: &Vocab, vb: VarBuilder) -> Result<Self> {
        let model = &config.model;
        if model.vector_length != LINE_FEATURE_WIDTH {
            return Err(LayoutError::Config(format!(
                "vector_length must be {LINE_FEATURE_WIDTH} for line records, got {}",
                model.vector_length
            )));
        }
        let mode = config.rnn_mode_for(ModelType::LineCrf)?;
        let num_tags = config.data.num_classes;
        let use_text = config.train.use_text;
        let text_width = config.data.text_vector_length;
        let width = LINE_FEATURE_WIDTH + if use_text { text_width } else { 0 };
        let drop = config.drop_prob();

        let encoder = match config.train.encoder {
            Encoder::Rnn => {
                let birnn = BiRnn::new(mode, width, model.hidden_size, drop, vb.pp("birnn"))?;
                LineEncoder::Rnn {
                    hidden: Dense::relu(birnn.output_dim(), LINE_HIDDEN, vb.pp("fc1"))?,
                    out: Dense::new(LINE_HIDDEN, num_tags, vb.pp("fc2"))?,
                    birnn,
                }
            }
            Encoder::Cnn => {
                let block = LineConvBlock::new(width, vb.pp("cnn"))?;
                LineEncoder::Cnn {
                    hidden: Dense::relu(block.output_dim(), LINE_HIDDEN, vb.pp("fc1"))?
                        .with_dropout(drop),
                    out: Dense::new(LINE_HIDDEN, num_tags, vb.pp("fc2"))?,
                    block,
                }
            }
            Encoder::Crnn => LineEncoder::Crnn(CrnnBlock::new(
                width,
                model.hidden_size,
                num_tags,
                vb.pp("crnn"),
            )?),
        };

        let mut crf = CrfHead::new(num_tags, vb.pp("crf"))?;
        if model.constrain_transitions {
            if num_tags != LineTag::NUM_TAGS {
                return Err(LayoutError::Config(format!(
                    "constrain_transitions needs the {} line tags, got num_classes {num_tags}",
                    LineTag::NUM_TAGS
                )));
            }
            crf = crf.with_constraints(LineTag::transition_mask())?;
        }

        Ok(Self {
            encoder,
            crf,
            tag_map: TagMap::new(&model.tag_keys, &model.tag_values)?,
            num_tags,
            use_text,
            text_width,
            vocab: vocab.clone(),
        })
    }

    fn keep(&self, example: &LineRecord) -> bool {
        !example.is_empty()
    }

    fn collate(&self, examples: &[LineRecord], device: &Device) -> Result<LineBatch> {
        let width = self.input_width();
        let pages = examples
            .iter()
            .map(|r| self.page_features(r))
            .collect::<Result<Vec<_>>>()?;
        let targets = examples
            .iter()
            .map(|r| self.page_targets(r))
            .collect::<Result<Vec<_>>>()?;
        let lengths: Vec<usize> = pages.iter().map(Vec::len).collect();

        let (flat, max_len) = pad_rows(&pages, width);
        require_nonempty(examples.len(), max_len)?;
        let features = Tensor::from_vec(flat, (examples.len(), max_len, width), device)?;
        let (flat_tags, _) = pad_ids(&targets, 0);
        let tags = Tensor::from_vec(flat_tags, (examples.len(), max_len), device)?;

        Ok(LineBatch {
            features,
            tags,
            lengths,
            targets,
        })
    }

    fn loss(&self, batch: &LineBatch, train: bool) -> Result<Tensor> {
        let logits = self.logits(batch, train)?;
        self.crf.loss(&logits, &batch.tags, &batch.lengths)
    }

    fn predict(&self, batch: &LineBatch) -> Result<Vec<PagePrediction>> {
        let logits = self.logits(batch, false)?.to_dtype(DType::F32)?;
        let (paths, scores) = self.crf.decode(&logits, &batch.lengths)?;
        Ok(paths
            .into_iter()
            .zip(scores)
            .map(|(crf_tags, crf_scores)| PagePrediction {
                crf_tags,
                crf_scores,
            })
            .collect())
    }

    fn record_metrics(&self, batch: &LineBatch, outputs: &[PagePrediction], metrics: &mut MetricSet) {
        let paragraph = |tag: u32| (2..=5).contains(&tag);
        let table = |tag: u32| (2..=3).contains(&tag);
        let weight = |hit: bool| if hit { 1.0 } else { 0.0 };

        for (target, output) in batch.targets.iter().zip(outputs) {
            let mut page_correct = true;
            for (&t, &p) in target.iter().zip(&output.crf_tags) {
                page_correct &= t == p;
                metrics.accuracy("accuracy").update(p, t);
                metrics
                    .accuracy("paragraph_accuracy")
                    .update_weighted(p, t, weight(paragraph(t)));
                metrics
                    .accuracy("table_recall")
                    .update_weighted(p, t, weight(table(t)));
                metrics
                    .accuracy("table_accuracy")
                    .update_weighted(p, t, weight(table(p)));
            }
            metrics
                .mean("total_accuracy")
                .update(weight(page_correct));
        }
    }

    fn signature(&self) -> Signature {
        Signature::predict()
            .input("features", "float32", &[DYNAMIC, DYNAMIC, self.input_width() as i64])
            .input("lengths", "int64", &[DYNAMIC])
            .output("crf_tags", "int32", &[DYNAMIC, DYNAMIC])
            .output("crf_scores", "float32", &[DYNAMIC])
    }
}
