use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Dropout, Linear, VarBuilder, batch_norm, linear};

use crate::error::Result;

/// Fully connected layer with optional batch norm, ReLU and dropout,
/// applied in that order.
#[derive(Debug, Clone)]
pub struct Dense {
    linear: Linear,
    norm: Option<BatchNorm>,
    relu: bool,
    dropout: Option<Dropout>,
}

impl Dense {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: linear(in_dim, out_dim, vb.pp("dense"))?,
            norm: None,
            relu: false,
            dropout: None,
        })
    }

    /// Hidden layer: linear, ReLU.
    pub fn relu(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            relu: true,
            ..Self::new(in_dim, out_dim, vb)?
        })
    }

    pub fn with_batch_norm(mut self, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        self.norm = Some(batch_norm(out_dim, BatchNormConfig::default(), vb.pp("bn"))?);
        Ok(self)
    }

    pub fn with_dropout(mut self, drop_prob: f32) -> Self {
        self.dropout = (drop_prob > 0.0).then(|| Dropout::new(drop_prob));
        self
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self.linear.forward(xs)?;
        if let Some(norm) = &self.norm {
            xs = norm.forward_t(&xs, train)?;
        }
        if self.relu {
            xs = xs.relu()?;
        }
        if let Some(dropout) = &self.dropout {
            xs = dropout.forward(&xs, train)?;
        }
        Ok(xs)
    }
}
