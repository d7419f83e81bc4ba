//! Differentiable classification losses.

use candle_core::{D, DType, Tensor};
use candle_nn::ops::log_softmax;

use crate::error::Result;

/// Mean sparse softmax cross-entropy of `[b, n]` logits against `[b]`
/// class ids.
pub fn sparse_softmax_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::loss::cross_entropy(logits, &labels.to_dtype(DType::U32)?)?)
}

/// Mean softmax cross-entropy against `[b, n]` one-hot (or soft) targets.
pub fn softmax_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = log_softmax(logits, D::Minus1)?;
    Ok(log_probs
        .mul(&targets.to_dtype(log_probs.dtype())?)?
        .sum(D::Minus1)?
        .neg()?
        .mean_all()?)
}

/// Mean sigmoid cross-entropy, computed as
/// `max(x, 0) - x * z + log(1 + exp(-|x|))`.
pub fn sigmoid_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let z = targets.to_dtype(logits.dtype())?;
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok((logits.relu()? - logits.mul(&z)?)?
        .add(&softplus)?
        .mean_all()?)
}

/// One-hot `[b, n]` f32 rows for `labels`.
pub fn one_hot(labels: &[u32], num_classes: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut data = vec![0f32; labels.len() * num_classes];
    for (i, &label) in labels.iter().enumerate() {
        if (label as usize) < num_classes {
            data[i * num_classes + label as usize] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (labels.len(), num_classes), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn one_hot_and_sparse_agree() {
        let logits = Tensor::new(&[[2.0f32, 0.5, -1.0], [0.1, 0.2, 0.3]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let targets = one_hot(&[0, 2], 3, &Device::Cpu).unwrap();

        let a = scalar(sparse_softmax_cross_entropy(&logits, &labels).unwrap());
        let b = scalar(softmax_cross_entropy(&logits, &targets).unwrap());
        assert!((a - b).abs() < 1e-5);
    }

    #[test]
    fn sigmoid_cross_entropy_matches_definition() {
        let logits = Tensor::new(&[1.5f32, -2.0], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1.0f32, 0.0], &Device::Cpu).unwrap();
        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        let expected = (-(sigmoid(1.5).ln()) - (1.0 - sigmoid(-2.0)).ln()) / 2.0;
        let got = scalar(sigmoid_cross_entropy(&logits, &targets).unwrap());
        assert!((got - expected).abs() < 1e-5);
    }
}
