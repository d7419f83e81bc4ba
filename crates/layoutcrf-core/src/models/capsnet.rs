//! Capsule network classifier with dynamic routing and a reconstruction
//! decoder.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, Linear, VarBuilder, conv2d, linear};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LayoutModel, require_nonempty, softmax_rows};
use crate::config::{Config, ModelType};
use crate::data::DigitRecord;
use crate::error::{LayoutError, Result};
use crate::metrics::{MetricSet, argmax};
use crate::nn::Dense;
use crate::nn::loss::one_hot;
use crate::serving::{DYNAMIC, Signature};
use crate::vocab::Vocab;

const CONV1_CHANNELS: usize = 256;
const CAPS_KERNEL: usize = 9;
const PRIMARY_MAPS: usize = 32;
const PRIMARY_DIM: usize = 8;
const DECODER_WIDTHS: [usize; 2] = [512, 1024];
const EPSILON: f64 = 1e-9;

/// Scale vectors along the last axis to length `|s|^2 / (1 + |s|^2)`.
pub fn squash(s: &Tensor) -> Result<Tensor> {
    let norm_sq = s.sqr()?.sum_keepdim(D::Minus1)?;
    let scale = (norm_sq.affine(1.0, 1.0)?.recip()? * &norm_sq)?
        .div(&norm_sq.affine(1.0, EPSILON)?.sqrt()?)?;
    Ok(s.broadcast_mul(&scale)?)
}

/// Side of the primary capsule grid for a square input.
fn primary_grid(image_size: usize) -> Option<usize> {
    let conv1 = image_size.checked_sub(CAPS_KERNEL - 1)?;
    let span = conv1.checked_sub(CAPS_KERNEL)?;
    Some(span / 2 + 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitPrediction {
    /// Softmax over the class capsule lengths.
    pub scores: Vec<f32>,
    pub class: u32,
}

pub struct DigitBatch {
    /// `[b, 1, s, s]` pixels in `[0, 1]`.
    pub images: Tensor,
    /// `[b, num_capsules]` one-hot labels.
    pub targets: Tensor,
    pub labels: Vec<u32>,
}

struct Forward {
    /// `[b, num_capsules, capsule_dim]`
    capsules: Tensor,
    /// `[b, num_capsules]`
    lengths: Tensor,
}

pub struct CapsNetModel {
    conv1: Conv2d,
    primary: Conv2d,
    /// `[n_in, num_capsules * capsule_dim, 8]`
    weights: Tensor,
    /// `[num_capsules, capsule_dim]`
    bias: Tensor,
    decoder: Vec<Dense>,
    reconstruct: Linear,
    image_size: usize,
    num_capsules: usize,
    capsule_dim: usize,
    routing_iters: usize,
    m_plus: f64,
    m_minus: f64,
    lambda_val: f64,
    regularization_scale: f64,
    mask_with_y: bool,
}

impl CapsNetModel {
    fn primary_capsules(&self, images: &Tensor) -> Result<Tensor> {
        let b = images.dim(0)?;
        let net = self.conv1.forward(images)?.relu()?;
        let net = self.primary.forward(&net)?.relu()?;
        // [b, c, g, g] -> [b, g, g, c] so each 8-wide run is one capsule
        let net = net.permute((0, 2, 3, 1))?.contiguous()?;
        let n_in = net.elem_count() / (b * PRIMARY_DIM);
        squash(&net.reshape((b, n_in, PRIMARY_DIM))?)
    }

    fn forward(&self, images: &Tensor) -> Result<Forward> {
        let u = self.primary_capsules(images)?;
        let (b, n_in, _) = u.dims3()?;
        let (num, dim) = (self.num_capsules, self.capsule_dim);

        let u_hat = u
            .unsqueeze(2)?
            .broadcast_mul(&self.weights.unsqueeze(0)?)?
            .sum(D::Minus1)?
            .reshape((b, n_in, num, dim))?;
        let u_hat_stopped = u_hat.detach();

        let mut logits = Tensor::zeros((b, n_in, num), u_hat.dtype(), u_hat.device())?;
        let mut capsules = None;
        for iter in 0..self.routing_iters {
            let coupling = candle_nn::ops::softmax(&logits, 2)?.unsqueeze(3)?;
            let last = iter + 1 == self.routing_iters;
            let votes = if last { &u_hat } else { &u_hat_stopped };
            let s = coupling
                .broadcast_mul(votes)?
                .sum(1)?
                .broadcast_add(&self.bias)?;
            let v = squash(&s)?;
            if !last {
                let agreement = u_hat_stopped
                    .broadcast_mul(&v.unsqueeze(1)?)?
                    .sum(D::Minus1)?;
                logits = (logits + agreement)?;
            }
            capsules = Some(v);
        }
        let capsules = capsules
            .ok_or_else(|| LayoutError::Config("routing_iters must be positive".into()))?;
        let lengths = capsules.sqr()?.sum(D::Minus1)?.affine(1.0, EPSILON)?.sqrt()?;
        Ok(Forward { capsules, lengths })
    }

    /// Decoder output `[b, s*s]` from the capsules kept by `mask`.
    fn reconstruct(&self, capsules: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let b = capsules.dim(0)?;
        let masked = capsules
            .broadcast_mul(&mask.unsqueeze(2)?)?
            .reshape((b, self.num_capsules * self.capsule_dim))?;
        let mut net = masked;
        for layer in &self.decoder {
            net = layer.forward_t(&net, false)?;
        }
        Ok(candle_nn::ops::sigmoid(&self.reconstruct.forward(&net)?)?)
    }

    /// One-hot rows of the longest capsule.
    fn argmax_mask(&self, lengths: &Tensor) -> Result<Tensor> {
        let classes: Vec<u32> = lengths
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?
            .iter()
            .map(|row| argmax(row) as u32)
            .collect();
        one_hot(&classes, self.num_capsules, lengths.device())
    }

    fn margin_loss(&self, lengths: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let present = lengths.affine(-1.0, self.m_plus)?.relu()?.sqr()?;
        let absent = lengths.affine(1.0, -self.m_minus)?.relu()?.sqr()?;
        let negatives = targets.affine(-1.0, 1.0)?;
        let loss = (targets.mul(&present)? + negatives.mul(&absent)?.affine(self.lambda_val, 0.0)?)?;
        Ok(loss.sum(1)?.mean_all()?)
    }

    /// Reconstructions `[b, s*s]` masked by the predicted class.
    pub fn reconstructions(&self, batch: &DigitBatch) -> Result<Tensor> {
        let forward = self.forward(&batch.images)?;
        let mask = self.argmax_mask(&forward.lengths)?;
        self.reconstruct(&forward.capsules, &mask)
    }
}

impl LayoutModel for CapsNetModel {
    type Example = DigitRecord;
    type Batch = DigitBatch;
    type Output = DigitPrediction;

    const MODEL_TYPE: ModelType = ModelType::Capsnet;

    fn build(config: &Config, _vocab: &Vocab, vb: VarBuilder) -> Result<Self> {
        let model = &config.model;
        let image_size = config.data.image_size;
        let grid = primary_grid(image_size).ok_or_else(|| {
            LayoutError::Config(format!("image_size {image_size} is too small for capsules"))
        })?;
        if model.routing_iters == 0 || model.num_capsules == 0 || model.capsule_dim == 0 {
            return Err(LayoutError::Config(
                "routing_iters, num_capsules and capsule_dim must be positive".into(),
            ));
        }
        let n_in = grid * grid * PRIMARY_MAPS;
        let (num, dim) = (model.num_capsules, model.capsule_dim);
        debug!(image_size, n_in, num, dim, "building capsule network");

        let primary_config = Conv2dConfig {
            stride: 2,
            ..Default::default()
        };
        let caps = vb.pp("digit_caps");
        let mut decoder = Vec::with_capacity(DECODER_WIDTHS.len());
        let mut in_dim = num * dim;
        for (i, &width) in DECODER_WIDTHS.iter().enumerate() {
            decoder.push(Dense::relu(in_dim, width, vb.pp(format!("decoder/fc{}", i + 1)))?);
            in_dim = width;
        }

        Ok(Self {
            conv1: conv2d(1, CONV1_CHANNELS, CAPS_KERNEL, Conv2dConfig::default(), vb.pp("conv1"))?,
            primary: conv2d(
                CONV1_CHANNELS,
                PRIMARY_MAPS * PRIMARY_DIM,
                CAPS_KERNEL,
                primary_config,
                vb.pp("primary_caps"),
            )?,
            weights: caps.get_with_hints(
                (n_in, num * dim, PRIMARY_DIM),
                "weight",
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.01,
                },
            )?,
            bias: caps.get_with_hints((num, dim), "bias", Init::Const(0.0))?,
            decoder,
            reconstruct: linear(in_dim, image_size * image_size, vb.pp("decoder/fc3"))?,
            image_size,
            num_capsules: num,
            capsule_dim: dim,
            routing_iters: model.routing_iters,
            m_plus: f64::from(model.m_plus),
            m_minus: f64::from(model.m_minus),
            lambda_val: f64::from(model.lambda_val),
            regularization_scale: f64::from(model.regularization_scale),
            mask_with_y: model.mask_with_y,
        })
    }

    fn collate(&self, examples: &[DigitRecord], device: &Device) -> Result<DigitBatch> {
        require_nonempty(examples.len(), self.image_size)?;
        let mut pixels = Vec::with_capacity(examples.len() * self.image_size * self.image_size);
        let mut labels = Vec::with_capacity(examples.len());
        for record in examples {
            if record.label as usize >= self.num_capsules {
                return Err(LayoutError::Data(format!(
                    "label {} outside {} classes",
                    record.label, self.num_capsules
                )));
            }
            pixels.extend(record.pixels(self.image_size)?);
            labels.push(record.label);
        }
        let side = self.image_size;
        Ok(DigitBatch {
            images: Tensor::from_vec(pixels, (examples.len(), 1, side, side), device)?,
            targets: one_hot(&labels, self.num_capsules, device)?,
            labels,
        })
    }

    fn loss(&self, batch: &DigitBatch, _train: bool) -> Result<Tensor> {
        let forward = self.forward(&batch.images)?;
        let margin = self.margin_loss(&forward.lengths, &batch.targets)?;

        let mask = if self.mask_with_y {
            batch.targets.clone()
        } else {
            self.argmax_mask(&forward.lengths)?
        };
        let decoded = self.reconstruct(&forward.capsules, &mask)?;
        let original = batch.images.flatten_from(1)?;
        let reconstruction = (decoded - original)?.sqr()?.mean_all()?;
        Ok((margin + reconstruction.affine(self.regularization_scale, 0.0)?)?)
    }

    fn predict(&self, batch: &DigitBatch) -> Result<Vec<DigitPrediction>> {
        let forward = self.forward(&batch.images)?;
        Ok(softmax_rows(&forward.lengths)?
            .into_iter()
            .map(|scores| DigitPrediction {
                class: argmax(&scores) as u32,
                scores,
            })
            .collect())
    }

    fn record_metrics(&self, batch: &DigitBatch, outputs: &[DigitPrediction], metrics: &mut MetricSet) {
        for (&label, output) in batch.labels.iter().zip(outputs) {
            metrics.accuracy("accuracy").update(output.class, label);
        }
    }

    fn signature(&self) -> Signature {
        let side = self.image_size as i64;
        Signature::predict()
            .input("image", "float32", &[DYNAMIC, 1, side, side])
            .output("scores", "float32", &[DYNAMIC, self.num_capsules as i64])
            .output("class", "int64", &[DYNAMIC])
    }
}
