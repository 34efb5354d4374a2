//! Training objectives.
//!
//! # Noise-contrastive estimation
//!
//! For an input vector `x`, its positive item `p` and `k` sampled items
//! `n_1..n_k` (with per-item biases):
//!
//! ```text
//! L(x) = -log σ(x·p + b_p) - Σ_j log σ(-(x·n_j + b_{n_j}))
//! ```
//!
//! # Pairwise ranking
//!
//! ```text
//! L = mean_{b,j} softplus(s_neg[b, j] - s_pos[b])
//! ```

use crate::error::Result;
use candle_core::Tensor;

/// Added under the square root so the norm stays differentiable at zero.
const NORM_EPS: f64 = 1e-12;

/// Numerically stable `log σ(x) = min(x, 0) - ln(1 + e^{-|x|})`, elementwise.
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    // min(x, 0) = x - relu(x)
    let negative_part = (x - x.relu()?)?;
    let log_term = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((negative_part - log_term)?)
}

/// Per-example NCE loss.
///
/// # Arguments
/// - `x`: Inputs (B x d)
/// - `pos`: Positive item vectors (B x d)
/// - `neg`: Sampled item vectors (B x k x d)
/// - `pos_bias`: Positive item biases (B)
/// - `neg_bias`: Sampled item biases (B x k)
///
/// # Returns
/// - Loss per example (B)
pub fn nce_loss(
    x: &Tensor,
    pos: &Tensor,
    neg: &Tensor,
    pos_bias: &Tensor,
    neg_bias: &Tensor,
) -> Result<Tensor> {
    let pos_logits = ((x * pos)?.sum(1)? + pos_bias)?;
    let neg_logits = (neg.broadcast_mul(&x.unsqueeze(1)?)?.sum(2)? + neg_bias)?;

    let pos_term = log_sigmoid(&pos_logits)?;
    let neg_term = log_sigmoid(&neg_logits.neg()?)?.sum(1)?;
    Ok((pos_term + neg_term)?.neg()?)
}

/// Mean softplus of score differences.
///
/// `pos_scores` is (B), `neg_scores` is (B x k).
pub fn pairwise_loss(pos_scores: &Tensor, neg_scores: &Tensor) -> Result<Tensor> {
    // softplus(n - p) = -log σ(p - n)
    let margin = pos_scores.unsqueeze(1)?.broadcast_sub(neg_scores)?;
    Ok(log_sigmoid(&margin)?.neg()?.mean_all()?)
}

/// Frobenius norm of a weight matrix, as a scalar tensor.
pub fn weight_norm(w: &Tensor) -> Result<Tensor> {
    Ok((w.sqr()?.sum_all()? + NORM_EPS)?.sqrt()?)
}
