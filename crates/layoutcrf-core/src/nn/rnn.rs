//! Recurrent encoders over padded batches.

use candle_core::{Device, Tensor};
use candle_nn::rnn::{GRU, GRUConfig, LSTM, LSTMConfig, RNN, gru, lstm};
use candle_nn::{Dropout, VarBuilder};

use crate::config::RnnMode;
use crate::crf::length_mask;
use crate::error::{LayoutError, Result};

/// Recurrent state after the last valid step of each sequence.
#[derive(Debug, Clone)]
pub struct FinalState {
    /// `[b, hidden]`
    pub h: Tensor,
    /// `[b, hidden]`, LSTM only.
    pub c: Option<Tensor>,
}

/// One unidirectional recurrent layer.
#[derive(Debug, Clone)]
pub enum RnnLayer {
    Lstm(LSTM),
    Gru(GRU),
}

impl RnnLayer {
    /// BASIC, BLOCK and LSTM all build an LSTM; GRU builds a GRU.
    pub fn new(mode: RnnMode, in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match mode {
            RnnMode::Basic | RnnMode::Block | RnnMode::Lstm => {
                RnnLayer::Lstm(lstm(in_dim, hidden, LSTMConfig::default(), vb)?)
            }
            RnnMode::Gru => RnnLayer::Gru(gru(in_dim, hidden, GRUConfig::default(), vb)?),
        })
    }

    /// Run over `[b, t, in]`, returning `[b, t, hidden]` outputs and the
    /// state at `lengths[i] - 1` for every sequence.
    pub fn run(&self, xs: &Tensor, lengths: &[usize]) -> Result<(Tensor, FinalState)> {
        let (outputs, cells) = match self {
            RnnLayer::Lstm(cell) => {
                let states = cell.seq(xs)?;
                let cs: Vec<Tensor> = states.iter().map(|s| s.c().clone()).collect();
                (cell.states_to_tensor(&states)?, Some(Tensor::stack(&cs, 1)?))
            }
            RnnLayer::Gru(cell) => {
                let states = cell.seq(xs)?;
                (cell.states_to_tensor(&states)?, None)
            }
        };

        let (b, _, hidden) = outputs.dims3()?;
        let last = last_step_index(lengths, hidden, xs.device())?;
        if last.dim(0)? != b {
            return Err(LayoutError::Data(format!(
                "{} lengths for a batch of {b}",
                lengths.len()
            )));
        }
        let h = outputs.gather(&last, 1)?.squeeze(1)?;
        let c = match cells {
            Some(cs) => Some(cs.gather(&last, 1)?.squeeze(1)?),
            None => None,
        };
        Ok((outputs, FinalState { h, c }))
    }
}

/// `[b, 1, hidden]` gather index pointing at each sequence's last step.
fn last_step_index(lengths: &[usize], hidden: usize, device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = lengths
        .iter()
        .map(|&len| len.saturating_sub(1) as u32)
        .collect();
    let b = idx.len();
    Ok(Tensor::from_vec(idx, (b, 1, 1), device)?
        .broadcast_as((b, 1, hidden))?
        .contiguous()?)
}

/// `[b, t]` index reversing each sequence inside its own length and
/// leaving padding in place.
pub(crate) fn reverse_index(lengths: &[usize], t: usize, device: &Device) -> Result<Tensor> {
    let mut idx = Vec::with_capacity(lengths.len() * t);
    for &len in lengths {
        let len = len.min(t);
        idx.extend((0..t).map(|j| if j < len { (len - 1 - j) as u32 } else { j as u32 }));
    }
    Ok(Tensor::from_vec(idx, (lengths.len(), t), device)?)
}

/// Apply a `[b, t]` reverse index to `[b, t, d]`.
pub(crate) fn reverse_padded(xs: &Tensor, index: &Tensor) -> Result<Tensor> {
    let (b, t, d) = xs.dims3()?;
    let index = index.unsqueeze(2)?.broadcast_as((b, t, d))?.contiguous()?;
    Ok(xs.gather(&index, 1)?)
}

/// Output of a [`BiRnn`] pass.
#[derive(Debug, Clone)]
pub struct BiRnnOutput {
    /// `[b, t, 2 * hidden]`, zero past each length.
    pub outputs: Tensor,
    pub fw: FinalState,
    pub bw: FinalState,
}

impl BiRnnOutput {
    /// `[c_fw, h_fw, c_bw, h_bw]` for LSTM cells, `[h_fw, h_bw]` otherwise.
    pub fn final_features(&self) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(4);
        for state in [&self.fw, &self.bw] {
            if let Some(c) = &state.c {
                parts.push(c.clone());
            }
            parts.push(state.h.clone());
        }
        Ok(Tensor::cat(&parts, 1)?)
    }
}

/// Bidirectional recurrent encoder with per-sequence lengths.
#[derive(Debug, Clone)]
pub struct BiRnn {
    fw: RnnLayer,
    bw: RnnLayer,
    dropout: Dropout,
    hidden: usize,
}

impl BiRnn {
    pub fn new(
        mode: RnnMode,
        in_dim: usize,
        hidden: usize,
        drop_prob: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fw: RnnLayer::new(mode, in_dim, hidden, vb.pp("fw"))?,
            bw: RnnLayer::new(mode, in_dim, hidden, vb.pp("bw"))?,
            dropout: Dropout::new(drop_prob),
            hidden,
        })
    }

    pub fn output_dim(&self) -> usize {
        2 * self.hidden
    }

    pub fn forward_t(&self, xs: &Tensor, lengths: &[usize], train: bool) -> Result<BiRnnOutput> {
        let (b, t, _) = xs.dims3()?;
        if lengths.len() != b {
            return Err(LayoutError::Data(format!(
                "{} lengths for a batch of {b}",
                lengths.len()
            )));
        }
        let device = xs.device();

        let (fw_out, fw) = self.fw.run(xs, lengths)?;

        let rev = reverse_index(lengths, t, device)?;
        let (bw_out, bw) = self.bw.run(&reverse_padded(xs, &rev)?, lengths)?;
        let bw_out = reverse_padded(&bw_out, &rev)?;

        let mask = length_mask(lengths, t, device)?.unsqueeze(2)?;
        let outputs = Tensor::cat(&[fw_out, bw_out], 2)?.broadcast_mul(&mask)?;
        let outputs = self.dropout.forward(&outputs, train)?;

        Ok(BiRnnOutput { outputs, fw, bw })
    }
}

/// `num_layers` stacked unidirectional LSTM layers with dropout on every
/// layer output.
#[derive(Debug, Clone)]
pub struct StackedRnn {
    layers: Vec<LSTM>,
    dropout: Dropout,
}

impl StackedRnn {
    pub fn new(
        num_layers: usize,
        in_dim: usize,
        hidden: usize,
        drop_prob: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(LayoutError::Config("num_layers must be positive".into()));
        }
        let layers = (0..num_layers)
            .map(|i| {
                let dim = if i == 0 { in_dim } else { hidden };
                lstm(dim, hidden, LSTMConfig::default(), vb.pp(format!("layer_{i}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            dropout: Dropout::new(drop_prob),
        })
    }

    /// `[b, t, in]` to `[b, t, hidden]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            let states = layer.seq(&xs)?;
            xs = self.dropout.forward(&layer.states_to_tensor(&states)?, train)?;
        }
        Ok(xs)
    }
}
