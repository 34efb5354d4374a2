//! Mean-aggregation graph convolution.
//!
//! Message passing over a COO edge index:
//!
//! ```text
//! m_v   = (1 / max(deg(v), 1)) * sum_{u -> v} x_u
//! h'_v  = tanh(W [h_v || m_v] + b)
//! ```
//!
//! Gathering uses `index_select` on the sources and scattering uses
//! `index_add` on the destinations, so gradients flow back into `x`.

use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use prodsearch_core::EdgeList;

/// Edge index with precomputed inverse in-degrees.
#[derive(Debug, Clone)]
pub struct EdgeIndex {
    /// `(src, dst)` as u32 tensors, `None` when there are no edges.
    edges: Option<(Tensor, Tensor)>,
    /// `(num_dst, 1)`, `1 / max(deg, 1)`.
    inv_degree: Tensor,
    num_edges: usize,
    num_dst: usize,
}

impl EdgeIndex {
    /// Index edges whose destinations lie in `0..num_dst`.
    pub fn new(edges: &EdgeList, num_dst: usize, device: &Device) -> Result<Self> {
        let inv: Vec<f32> = edges
            .in_degree(num_dst)
            .into_iter()
            .map(|d| 1.0 / d.max(1) as f32)
            .collect();
        let inv_degree = Tensor::from_vec(inv, (num_dst, 1), device)?;
        let edges_len = edges.len();
        let edges = if edges.is_empty() {
            None
        } else {
            let src = Tensor::from_slice(&edges.src, edges.len(), device)?;
            let dst = Tensor::from_slice(&edges.dst, edges.len(), device)?;
            Some((src, dst))
        };
        Ok(Self {
            edges,
            inv_degree,
            num_edges: edges_len,
            num_dst,
        })
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn num_dst(&self) -> usize {
        self.num_dst
    }

    /// Mean of incoming source rows of `x` for every destination, `(num_dst, d)`.
    ///
    /// Destinations without incoming edges get the zero vector.
    pub fn mean(&self, x: &Tensor) -> Result<Tensor> {
        let dim = x.dim(1)?;
        let zeros = Tensor::zeros((self.num_dst, dim), x.dtype(), x.device())?;
        let Some((src, dst)) = &self.edges else {
            return Ok(zeros);
        };
        let messages = x.index_select(src, 0)?;
        let summed = zeros.index_add(dst, &messages, 0)?;
        Ok(summed.broadcast_mul(&self.inv_degree.to_dtype(x.dtype())?)?)
    }
}

/// One propagation layer for entity nodes.
///
/// Input rows are `[entities ; other nodes]`; only the first
/// `edges.num_dst()` rows are updated and returned.
pub struct EntityConv {
    linear: Linear,
}

impl EntityConv {
    /// Create a new layer mapping `in_features -> out_features`.
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let linear = linear(2 * in_features, out_features, vb)?;
        Ok(Self { linear })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Node features over the global node space (N x in_features)
    /// - `edges`: Edges into the entity rows
    ///
    /// # Returns
    /// - Updated entity features (num_dst x out_features)
    pub fn forward(&self, x: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let h = x.narrow(0, 0, edges.num_dst())?;
        let neighbours = edges.mean(x)?;
        let combined = Tensor::cat(&[&h, &neighbours], 1)?;
        Ok(self.linear.forward(&combined)?.tanh()?)
    }
}

/// Zero `(rows, cols)` f32 block, used for the empty halves of node rows.
pub(crate) fn zeros(rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((rows, cols), DType::F32, device)?)
}
