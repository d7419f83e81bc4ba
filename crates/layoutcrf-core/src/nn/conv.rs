//! Convolution blocks over page line sequences.
//!
//! A page batch `[b, t, f]` is treated as a one-channel image of height
//! `t` (lines) and width `f` (features). Kernels span lines only.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{
    BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init, Linear, VarBuilder, batch_norm, linear,
};

use super::rnn::BiRnn;
use crate::config::RnnMode;
use crate::error::Result;

/// TensorFlow "SAME" split of `kernel - 1` padding cells.
pub fn same_padding(kernel: usize) -> (usize, usize) {
    let total = kernel.saturating_sub(1);
    let before = total / 2;
    (before, total - before)
}

/// Convolution with a `[kernel, 1]` window, SAME padding along lines.
#[derive(Debug, Clone)]
pub struct LineConv {
    conv: Conv2d,
    kernel: usize,
}

impl LineConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fan_in = (in_channels * kernel) as f64;
        let bound = 1.0 / fan_in.sqrt();
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel, 1),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self {
            conv: Conv2d::new(weight, bias, Conv2dConfig::default()),
            kernel,
        })
    }

    /// `[b, c, t, f]` to `[b, out, t, f]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (before, after) = same_padding(self.kernel);
        let xs = xs.pad_with_zeros(2, before, after)?;
        Ok(self.conv.forward(&xs)?)
    }
}

/// 2x2 max pooling with stride 1 that keeps both spatial sizes.
///
/// Inputs must be non-negative (post-ReLU); the trailing zero padding
/// then never wins the max.
pub fn same_max_pool(xs: &Tensor) -> Result<Tensor> {
    let xs = xs.pad_with_zeros(2, 0, 1)?.pad_with_zeros(3, 0, 1)?;
    Ok(xs.max_pool2d_with_stride((2, 2), (1, 1))?)
}

const LINE_KERNELS: [usize; 4] = [1, 2, 4, 8];
const LINE_FILTERS: usize = 64;

/// Four parallel line convolutions (heights 1, 2, 4, 8), each followed by
/// batch norm and ReLU, concatenated per line.
#[derive(Debug, Clone)]
pub struct LineConvBlock {
    branches: Vec<(LineConv, BatchNorm)>,
    width: usize,
}

impl LineConvBlock {
    pub fn new(width: usize, vb: VarBuilder) -> Result<Self> {
        let branches = LINE_KERNELS
            .iter()
            .enumerate()
            .map(|(i, &k)| -> Result<(LineConv, BatchNorm)> {
                let vb = vb.pp(format!("conv{}", i + 1));
                let conv = LineConv::new(1, LINE_FILTERS, k, false, vb.clone())?;
                let norm = batch_norm(LINE_FILTERS, BatchNormConfig::default(), vb.pp("bn"))?;
                Ok((conv, norm))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { branches, width })
    }

    /// Width of one output line vector.
    pub fn output_dim(&self) -> usize {
        LINE_FILTERS * LINE_KERNELS.len() * self.width
    }

    /// `[b, t, f]` to `[b, t, 256 * f]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let image = xs.unsqueeze(1)?;
        let maps = self
            .branches
            .iter()
            .map(|(conv, norm)| -> Result<Tensor> {
                Ok(norm.forward_t(&conv.forward(&image)?, train)?.relu()?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&maps, 1)?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((b, t, self.output_dim()))?)
    }
}

/// Convolutional front end followed by a BiLSTM and a tag projection.
#[derive(Debug, Clone)]
pub struct CrnnBlock {
    conv1: LineConv,
    conv2: LineConv,
    conv3: LineConv,
    norm: BatchNorm,
    rnn: BiRnn,
    proj: Linear,
    width: usize,
}

impl CrnnBlock {
    pub fn new(width: usize, hidden: usize, num_tags: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: LineConv::new(1, 64, 1, true, vb.pp("conv1"))?,
            conv2: LineConv::new(64, 128, 2, true, vb.pp("conv2"))?,
            conv3: LineConv::new(128, 256, 4, true, vb.pp("conv3"))?,
            norm: batch_norm(256, BatchNormConfig::default(), vb.pp("bn"))?,
            rnn: BiRnn::new(RnnMode::Basic, 256 * width, hidden, 0.0, vb.pp("birnn"))?,
            proj: linear(2 * hidden, num_tags, vb.pp("proj"))?,
            width,
        })
    }

    /// `[b, t, f]` to `[b, t, num_tags]` logits.
    pub fn forward_t(&self, xs: &Tensor, lengths: &[usize], train: bool) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let net = self.conv1.forward(&xs.unsqueeze(1)?)?.relu()?;
        let net = same_max_pool(&net)?;
        let net = self.conv2.forward(&net)?.relu()?;
        let net = same_max_pool(&net)?;
        let net = self.conv3.forward(&net)?.relu()?;
        let net = self.norm.forward_t(&net, train)?;
        let seq = net
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((b, t, 256 * self.width))?;
        let encoded = self.rnn.forward_t(&seq, lengths, train)?;
        Ok(self.proj.forward(&encoded.outputs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn same_padding_matches_tensorflow() {
        assert_eq!(same_padding(1), (0, 0));
        assert_eq!(same_padding(2), (0, 1));
        assert_eq!(same_padding(4), (1, 2));
        assert_eq!(same_padding(8), (3, 4));
    }

    #[test]
    fn same_max_pool_keeps_size() {
        let xs = Tensor::arange(0f32, 6., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 3, 2))
            .unwrap();
        let pooled = same_max_pool(&xs).unwrap();
        assert_eq!(pooled.dims(), &[1, 1, 3, 2]);
        assert_eq!(
            pooled.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![3.0, 3.0, 5.0, 5.0, 5.0, 5.0]
        );
    }

    #[test]
    fn line_conv_block_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = LineConvBlock::new(5, vb).unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 7, 5), &Device::Cpu).unwrap();
        let out = block.forward_t(&xs, true).unwrap();
        assert_eq!(out.dims(), &[2, 7, 256 * 5]);
        assert_eq!(block.output_dim(), 1280);
    }

    #[test]
    fn crnn_block_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = CrnnBlock::new(3, 4, 4, vb).unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 5, 3), &Device::Cpu).unwrap();
        let out = block.forward_t(&xs, &[5, 3], false).unwrap();
        assert_eq!(out.dims(), &[2, 5, 4]);
    }
}
