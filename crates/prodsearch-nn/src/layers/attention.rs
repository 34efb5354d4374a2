//! Multi-head scaled dot-product self-attention.
//!
//! ```text
//! Attention(Q, K, V) = softmax(Q K^T / sqrt(d_head) + M) V
//! ```
//!
//! `M` is `0` for real keys and a large negative value for padded keys, so
//! padding never receives attention weight.

use crate::error::{Error, Result};
use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Added to attention logits of padded keys.
const MASK_PENALTY: f64 = 1e9;

/// Self-attention over a padded word sequence.
pub struct MultiHeadSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadSelfAttention {
    /// Create the layer. `dim` must be divisible by `num_heads`.
    pub fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "attention dim {dim} is not divisible by {num_heads} heads"
            )));
        }
        Ok(Self {
            query: linear(dim, dim, vb.pp("query"))?,
            key: linear(dim, dim, vb.pp("key"))?,
            value: linear(dim, dim, vb.pp("value"))?,
            output: linear(dim, dim, vb.pp("output"))?,
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Sequence features (B x L x dim)
    /// - `key_mask`: 1 for real positions, 0 for padding (B x L)
    ///
    /// # Returns
    /// - Attended features (B x L x dim)
    pub fn forward(&self, x: &Tensor, key_mask: &Tensor) -> Result<Tensor> {
        let (batch, len, dim) = x.dims3()?;

        let q = self.split_heads(&self.query.forward(x)?, batch, len)?;
        let k = self.split_heads(&self.key.forward(x)?, batch, len)?;
        let v = self.split_heads(&self.value.forward(x)?, batch, len)?;

        // (B, H, L, L)
        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let penalty = ((key_mask - 1.0)? * MASK_PENALTY)?.reshape((batch, 1, 1, len))?;
        let scores = scores.broadcast_add(&penalty)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let attended = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, len, dim))?;
        Ok(self.output.forward(&attended)?)
    }

    /// (B, L, dim) -> (B, H, L, head_dim)
    fn split_heads(&self, x: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        Ok(x.reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}
