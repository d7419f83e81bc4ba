//! Character LSTM that decides whether an `<EOL>` inside a window is a real
//! line break.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, VarBuilder, embedding};
use serde::{Deserialize, Serialize};

use super::{LayoutModel, require_nonempty, require_vocab, softmax_rows};
use crate::config::{Config, ModelType};
use crate::data::TextWindow;
use crate::error::Result;
use crate::metrics::{MetricSet, argmax};
use crate::nn::loss::{one_hot, softmax_cross_entropy};
use crate::nn::{Dense, StackedRnn};
use crate::serving::{DYNAMIC, Signature};
use crate::vocab::{Vocab, reserved};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPrediction {
    pub scores: Vec<f32>,
    pub class: u32,
}

pub struct TextBatch {
    /// `[b, max_seq_length]` ids.
    pub ids: Tensor,
    /// `[b, num_classes]` one-hot targets.
    pub targets: Tensor,
    pub labels: Vec<u32>,
}

pub struct TextRnnModel {
    embedding: Embedding,
    dropout: Dropout,
    rnn: StackedRnn,
    hidden: Dense,
    out: Dense,
    num_classes: usize,
    max_len: usize,
}

impl TextRnnModel {
    fn logits(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.dropout.forward(&self.embedding.forward(ids)?, train)?;
        let outputs = self.rnn.forward_t(&xs, train)?;
        let last = outputs.get_on_dim(1, outputs.dim(1)? - 1)?;
        self.out.forward_t(&self.hidden.forward_t(&last, train)?, train)
    }
}

impl LayoutModel for TextRnnModel {
    type Example = TextWindow;
    type Batch = TextBatch;
    type Output = TextPrediction;

    const MODEL_TYPE: ModelType = ModelType::Text;

    fn build(config: &Config, vocab: &Vocab, vb: VarBuilder) -> Result<Self> {
        require_vocab(vocab, ModelType::Text)?;
        config.rnn_mode_for(ModelType::Text)?;
        let model = &config.model;
        let drop = config.drop_prob();
        Ok(Self {
            embedding: embedding(vocab.len(), model.embed_dim, vb.pp("embedding"))?,
            dropout: Dropout::new(drop),
            rnn: StackedRnn::new(
                model.num_layers,
                model.embed_dim,
                model.hidden_size,
                drop,
                vb.pp("rnn"),
            )?,
            hidden: Dense::relu(model.hidden_size, model.hidden_size, vb.pp("fc1"))?
                .with_dropout(drop),
            out: Dense::new(model.hidden_size, config.data.num_classes, vb.pp("fc2"))?,
            num_classes: config.data.num_classes,
            max_len: config.data.max_seq_length,
        })
    }

    fn collate(&self, examples: &[TextWindow], device: &Device) -> Result<TextBatch> {
        require_nonempty(examples.len(), self.max_len)?;
        let mut flat = Vec::with_capacity(examples.len() * self.max_len);
        for window in examples {
            let mut ids = window.ids.clone();
            ids.resize(self.max_len, reserved::CORPUS_PAD);
            flat.extend(ids);
        }
        let labels: Vec<u32> = examples.iter().map(|w| w.label).collect();
        Ok(TextBatch {
            ids: Tensor::from_vec(flat, (examples.len(), self.max_len), device)?,
            targets: one_hot(&labels, self.num_classes, device)?,
            labels,
        })
    }

    fn loss(&self, batch: &TextBatch, train: bool) -> Result<Tensor> {
        softmax_cross_entropy(&self.logits(&batch.ids, train)?, &batch.targets)
    }

    fn predict(&self, batch: &TextBatch) -> Result<Vec<TextPrediction>> {
        let logits = self.logits(&batch.ids, false)?;
        Ok(softmax_rows(&logits)?
            .into_iter()
            .map(|scores| TextPrediction {
                class: argmax(&scores) as u32,
                scores,
            })
            .collect())
    }

    fn record_metrics(&self, batch: &TextBatch, outputs: &[TextPrediction], metrics: &mut MetricSet) {
        for (&label, output) in batch.labels.iter().zip(outputs) {
            metrics.accuracy("accuracy").update(output.class, label);
        }
    }

    fn signature(&self) -> Signature {
        Signature::predict()
            .input("ids", "int32", &[DYNAMIC, self.max_len as i64])
            .output("scores", "float32", &[DYNAMIC, self.num_classes as i64])
            .output("class", "int64", &[DYNAMIC])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::corpus::{BREAK, NO_BREAK};
    use candle_core::DType;
    use candle_nn::VarMap;

    fn model() -> (VarMap, TextRnnModel) {
        let config = Config::from_yaml_str(
            r#"
data:
  type: corpus
  max_seq_length: 12
model:
  type: text
  embed_dim: 6
  hidden_size: 5
  num_layers: 2
  keep_prob: 0.5
train:
  model_dir: logs/text
"#,
        )
        .unwrap();
        let vocab = Vocab::from_tokens(["<UNK>", "<PAD>", "<EOS>", "<EOL>", "a", "b"]);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = TextRnnModel::build(&config, &vocab, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn windows_pad_to_max_len() {
        let (_varmap, model) = model();
        let windows = vec![
            TextWindow {
                ids: vec![4, 5, reserved::EOL, 4],
                label: BREAK,
            },
            TextWindow {
                ids: vec![5; 12],
                label: NO_BREAK,
            },
        ];
        let batch = model.collate(&windows, &Device::Cpu).unwrap();
        assert_eq!(batch.ids.dims(), &[2, 12]);
        assert!(model.loss(&batch, true).unwrap().to_scalar::<f32>().unwrap() > 0.0);

        let outputs = model.predict(&batch).unwrap();
        for output in &outputs {
            let total: f32 = output.scores.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        let mut metrics = MetricSet::new();
        model.record_metrics(&batch, &outputs, &mut metrics);
        assert!(metrics.get("accuracy").is_some());
    }
}
