//! Table cell merge classifier: should two adjacent cell texts be one cell?

use candle_core::{Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder, embedding};
use serde::{Deserialize, Serialize};

use super::{LayoutModel, require_nonempty, require_vocab, softmax_rows};
use crate::config::{Config, ModelType};
use crate::data::{CellRecord, pad_ids};
use crate::error::{LayoutError, Result};
use crate::metrics::{MetricSet, argmax};
use crate::nn::loss::{one_hot, softmax_cross_entropy};
use crate::nn::{BiRnn, Dense};
use crate::serving::{DYNAMIC, Signature};
use crate::vocab::{Vocab, reserved};

const CELL_CLASSES: usize = 2;
const CELL_HIDDEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPrediction {
    /// Probability of the predicted class.
    pub scores: f32,
    pub class: u32,
}

pub struct CellBatch {
    /// `[b, t]` token ids padded with `<PAD>`.
    pub ids: Tensor,
    /// `[b, 2]` one-hot labels.
    pub targets: Tensor,
    pub lengths: Vec<usize>,
    pub labels: Vec<u32>,
}

pub struct CellMergeModel {
    embedding: Embedding,
    birnn: BiRnn,
    hidden: Dense,
    out: Dense,
    vocab: Vocab,
}

impl CellMergeModel {
    fn logits(&self, batch: &CellBatch, train: bool) -> Result<Tensor> {
        let xs = self.embedding.forward(&batch.ids)?;
        let states = self
            .birnn
            .forward_t(&xs, &batch.lengths, train)?
            .final_features()?;
        self.out.forward_t(&self.hidden.forward_t(&states, train)?, train)
    }
}

impl LayoutModel for CellMergeModel {
    type Example = CellRecord;
    type Batch = CellBatch;
    type Output = CellPrediction;

    const MODEL_TYPE: ModelType = ModelType::CellMerge;

    fn build(config: &Config, vocab: &Vocab, vb: VarBuilder) -> Result<Self> {
        require_vocab(vocab, ModelType::CellMerge)?;
        let mode = config.rnn_mode_for(ModelType::CellMerge)?;
        let model = &config.model;
        let drop = config.drop_prob();
        let hidden = model.hidden_size;
        Ok(Self {
            embedding: embedding(vocab.len(), model.embed_dim, vb.pp("embedding"))?,
            birnn: BiRnn::new(mode, model.embed_dim, hidden, drop, vb.pp("bi-lstm"))?,
            hidden: Dense::relu(4 * hidden, CELL_HIDDEN, vb.pp("fc1"))?
                .with_batch_norm(CELL_HIDDEN, vb.pp("fc1"))?
                .with_dropout(drop),
            out: Dense::new(CELL_HIDDEN, CELL_CLASSES, vb.pp("fc2"))?,
            vocab: vocab.clone(),
        })
    }

    fn collate(&self, examples: &[CellRecord], device: &Device) -> Result<CellBatch> {
        let seqs: Vec<Vec<u32>> = examples.iter().map(|r| r.token_ids(&self.vocab)).collect();
        let lengths: Vec<usize> = examples.iter().map(CellRecord::length).collect();
        let labels = examples
            .iter()
            .map(|r| match r.y {
                0 | 1 => Ok(r.y as u32),
                y => Err(LayoutError::Data(format!("cell label {y} is not 0 or 1"))),
            })
            .collect::<Result<Vec<u32>>>()?;

        let (flat, t) = pad_ids(&seqs, reserved::CELL_PAD);
        require_nonempty(examples.len(), t)?;
        Ok(CellBatch {
            ids: Tensor::from_vec(flat, (examples.len(), t), device)?,
            targets: one_hot(&labels, CELL_CLASSES, device)?,
            lengths,
            labels,
        })
    }

    fn loss(&self, batch: &CellBatch, train: bool) -> Result<Tensor> {
        softmax_cross_entropy(&self.logits(batch, train)?, &batch.targets)
    }

    fn predict(&self, batch: &CellBatch) -> Result<Vec<CellPrediction>> {
        let probs = softmax_rows(&self.logits(batch, false)?)?;
        Ok(probs
            .iter()
            .map(|row| {
                let class = argmax(row);
                CellPrediction {
                    scores: row[class],
                    class: class as u32,
                }
            })
            .collect())
    }

    fn record_metrics(&self, batch: &CellBatch, outputs: &[CellPrediction], metrics: &mut MetricSet) {
        for (&label, output) in batch.labels.iter().zip(outputs) {
            metrics.accuracy("accuracy").update(output.class, label);
        }
    }

    fn signature(&self) -> Signature {
        Signature::predict()
            .input("x_l", "string", &[DYNAMIC])
            .input("x_r", "string", &[DYNAMIC])
            .input("l", "int64", &[DYNAMIC])
            .output("scores", "float32", &[DYNAMIC])
            .output("class", "int64", &[DYNAMIC])
    }
}
