use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};

use super::viterbi::ViterbiDecoder;
use crate::error::{LayoutError, Result};

/// Linear-chain CRF over per-position tag scores.
///
/// `transitions[prev][curr]` is learned as `trans_params`.
#[derive(Debug, Clone)]
pub struct CrfHead {
    transitions: Tensor,
    num_tags: usize,
    decoder: ViterbiDecoder,
}

/// Numerically stable `log(sum(exp(xs)))` over `dim`, removing it.
pub(crate) fn log_sum_exp(xs: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let max = xs.max_keepdim(dim)?.detach();
    xs.broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .broadcast_add(&max)?
        .squeeze(dim)
}

/// `[b, t]` float mask with ones inside each length.
pub(crate) fn length_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask = vec![0f32; lengths.len() * max_len];
    for (i, &len) in lengths.iter().enumerate() {
        for m in mask[i * max_len..i * max_len + len.min(max_len)].iter_mut() {
            *m = 1.0;
        }
    }
    Ok(Tensor::from_vec(mask, (lengths.len(), max_len), device)?)
}

impl CrfHead {
    pub fn new(num_tags: usize, vb: VarBuilder) -> Result<Self> {
        let bound = (6.0 / (2 * num_tags) as f64).sqrt();
        let transitions = vb.get_with_hints(
            (num_tags, num_tags),
            "trans_params",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            transitions,
            num_tags,
            decoder: ViterbiDecoder::new(num_tags),
        })
    }

    /// Decode only through transitions where `allowed[prev][curr]` holds.
    pub fn with_constraints(mut self, allowed: Vec<Vec<bool>>) -> Result<Self> {
        self.decoder = self.decoder.with_constraints(allowed)?;
        Ok(self)
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn transitions(&self) -> &Tensor {
        &self.transitions
    }

    fn check_shapes(&self, logits: &Tensor, lengths: &[usize]) -> Result<(usize, usize)> {
        let (b, t, n) = logits.dims3()?;
        if n != self.num_tags {
            return Err(LayoutError::Data(format!(
                "logits carry {n} tags, CRF expects {}",
                self.num_tags
            )));
        }
        if lengths.len() != b {
            return Err(LayoutError::Data(format!(
                "{} lengths for a batch of {b}",
                lengths.len()
            )));
        }
        if let Some(&len) = lengths.iter().find(|&&len| len > t) {
            return Err(LayoutError::Data(format!(
                "length {len} exceeds padded length {t}"
            )));
        }
        Ok((b, t))
    }

    /// Log-likelihood of `tags` under the CRF, one value per sequence.
    ///
    /// * `logits` - `[b, t, num_tags]` f32
    /// * `tags` - `[b, t]` u32, padding positions ignored
    /// * `lengths` - valid positions per sequence; zero-length sequences
    ///   score 0
    pub fn log_likelihood(&self, logits: &Tensor, tags: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let (b, t) = self.check_shapes(logits, lengths)?;
        let device = logits.device();
        let mask = length_mask(lengths, t, device)?;

        // Gold path: emissions plus transitions.
        let tags = tags.to_dtype(DType::U32)?.contiguous()?;
        let unary = logits
            .gather(&tags.unsqueeze(2)?, 2)?
            .squeeze(2)?
            .mul(&mask)?
            .sum(1)?;

        let mut gold = unary;
        if t > 1 {
            let prev = tags.narrow(1, 0, t - 1)?.flatten_all()?;
            let curr = tags.narrow(1, 1, t - 1)?.flatten_all()?.unsqueeze(1)?;
            let binary = self
                .transitions
                .index_select(&prev, 0)?
                .gather(&curr, 1)?
                .reshape((b, t - 1))?
                .mul(&mask.narrow(1, 1, t - 1)?)?
                .sum(1)?;
            gold = (gold + binary)?;
        }

        // Partition function by the forward algorithm.
        let trans = self.transitions.unsqueeze(0)?;
        let mut alpha = logits.narrow(1, 0, 1)?.squeeze(1)?;
        for i in 1..t {
            let emit = logits.narrow(1, i, 1)?;
            let scores = alpha
                .unsqueeze(2)?
                .broadcast_add(&trans)?
                .broadcast_add(&emit)?;
            let next = log_sum_exp(&scores, 1)?;
            let m = mask.narrow(1, i, 1)?;
            let keep = m.affine(-1.0, 1.0)?;
            alpha = (next.broadcast_mul(&m)? + alpha.broadcast_mul(&keep)?)?;
        }
        let log_norm = log_sum_exp(&alpha, 1)?;

        let nonempty: Vec<f32> = lengths
            .iter()
            .map(|&len| if len > 0 { 1.0 } else { 0.0 })
            .collect();
        let nonempty = Tensor::from_vec(nonempty, b, device)?;

        Ok((gold - log_norm)?.mul(&nonempty)?)
    }

    /// Mean negative log-likelihood over the batch.
    pub fn loss(&self, logits: &Tensor, tags: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        Ok(self.log_likelihood(logits, tags, lengths)?.neg()?.mean_all()?)
    }

    /// Viterbi paths and scores, each truncated to its length.
    pub fn decode(&self, logits: &Tensor, lengths: &[usize]) -> Result<(Vec<Vec<u32>>, Vec<f32>)> {
        self.check_shapes(logits, lengths)?;
        let emissions = logits.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let transitions = self.transitions.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        let mut paths = Vec::with_capacity(lengths.len());
        let mut scores = Vec::with_capacity(lengths.len());
        for (seq, &len) in emissions.iter().zip(lengths) {
            let (path, score) = self.decoder.decode(&seq[..len], &transitions)?;
            paths.push(path.into_iter().map(|tag| tag as u32).collect());
            scores.push(score);
        }
        Ok((paths, scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn head(n: usize) -> (VarMap, CrfHead) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = CrfHead::new(n, vb).unwrap();
        (varmap, head)
    }

    fn set_transitions(varmap: &VarMap, values: &[f32], n: usize) {
        let data = varmap.data().lock().unwrap();
        let var = data.get("trans_params").unwrap();
        var.set(&Tensor::from_slice(values, (n, n), &Device::Cpu).unwrap())
            .unwrap();
    }

    #[test]
    fn likelihood_matches_brute_force() {
        let (varmap, head) = head(2);
        set_transitions(&varmap, &[0.5, -0.2, 0.1, 0.3], 2);

        let emissions = [[0.2f32, 1.0], [0.7, -0.4], [0.0, 0.9]];
        let logits = Tensor::from_slice(
            &emissions.concat(),
            (1, 3, 2),
            &Device::Cpu,
        )
        .unwrap();
        let tags = Tensor::from_slice(&[1u32, 0, 1], (1, 3), &Device::Cpu).unwrap();

        let trans = [[0.5f32, -0.2], [0.1, 0.3]];
        let path_score = |p: [usize; 3]| {
            emissions[0][p[0]]
                + trans[p[0]][p[1]]
                + emissions[1][p[1]]
                + trans[p[1]][p[2]]
                + emissions[2][p[2]]
        };
        let mut log_z = 0f32;
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    log_z += path_score([a, b, c]).exp();
                }
            }
        }
        let expected = path_score([1, 0, 1]) - log_z.ln();

        let ll = head
            .log_likelihood(&logits, &tags, &[3])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((ll[0] - expected).abs() < 1e-4, "{} vs {}", ll[0], expected);
    }

    #[test]
    fn padding_does_not_change_likelihood() {
        let (varmap, head) = head(3);
        set_transitions(&varmap, &[0.1, 0.2, 0.3, -0.1, 0.0, 0.4, 0.2, -0.3, 0.1], 3);

        let short = Tensor::from_slice(&[0.5f32, 0.1, -0.2, 0.3, 0.8, 0.0], (1, 2, 3), &Device::Cpu)
            .unwrap();
        let padded = Tensor::from_slice(
            &[0.5f32, 0.1, -0.2, 0.3, 0.8, 0.0, 9.0, 9.0, 9.0],
            (1, 3, 3),
            &Device::Cpu,
        )
        .unwrap();
        let short_tags = Tensor::from_slice(&[2u32, 1], (1, 2), &Device::Cpu).unwrap();
        let padded_tags = Tensor::from_slice(&[2u32, 1, 0], (1, 3), &Device::Cpu).unwrap();

        let a = head.log_likelihood(&short, &short_tags, &[2]).unwrap();
        let b = head.log_likelihood(&padded, &padded_tags, &[2]).unwrap();
        let (a, b) = (a.to_vec1::<f32>().unwrap(), b.to_vec1::<f32>().unwrap());
        assert!((a[0] - b[0]).abs() < 1e-5);
        assert!(a[0] < 0.0);
    }

    #[test]
    fn zero_length_scores_zero() {
        let (_varmap, head) = head(2);
        let logits = Tensor::ones((2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let tags = Tensor::zeros((2, 2), DType::U32, &Device::Cpu).unwrap();
        let ll = head
            .log_likelihood(&logits, &tags, &[0, 2])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(ll[0], 0.0);

        let (paths, scores) = head.decode(&logits, &[0, 1]).unwrap();
        assert!(paths[0].is_empty());
        assert_eq!(scores[0], 0.0);
        assert_eq!(paths[1].len(), 1);
    }

    #[test]
    fn decode_truncates_to_length() {
        let (varmap, head) = head(2);
        set_transitions(&varmap, &[0.0, 0.0, 0.0, 0.0], 2);
        let logits = Tensor::from_slice(
            &[1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0],
            (1, 3, 2),
            &Device::Cpu,
        )
        .unwrap();
        let (paths, scores) = head.decode(&logits, &[2]).unwrap();
        assert_eq!(paths[0], vec![0, 1]);
        assert!((scores[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn length_longer_than_batch_is_error() {
        let (_varmap, head) = head(2);
        let logits = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(head.decode(&logits, &[3]).is_err());
    }
}
