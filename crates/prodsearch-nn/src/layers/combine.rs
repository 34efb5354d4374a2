//! Jumping-Knowledge style combination of per-layer outputs.
//!
//! Given layer representations h^{(0)}, ..., h^{(L)} for the same nodes:
//!
//! | Mode | Output | Dim |
//! |------|--------|-----|
//! | Mean | (1/(L+1)) Σ h^{(l)} | d |
//! | Sum | Σ h^{(l)} | d |
//! | Max | element-wise max | d |
//! | Last | h^{(L)} | d |
//! | Concat | [h^{(0)} ‖ ... ‖ h^{(L)}] | (L+1)·d |
//!
//! Reference: Xu et al., "Representation Learning on Graphs with Jumping
//! Knowledge Networks", ICML 2018.

use crate::error::{Error, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// How layer outputs are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    #[default]
    Mean,
    Sum,
    Max,
    Last,
    Concat,
}

/// Stateless layer combination.
#[derive(Debug, Clone, Copy)]
pub struct LayerCombination {
    mode: CombineMode,
}

impl LayerCombination {
    pub fn new(mode: CombineMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> CombineMode {
        self.mode
    }

    /// Output width for `num_layers` inputs of width `dim`.
    pub fn output_dim(&self, dim: usize, num_layers: usize) -> usize {
        match self.mode {
            CombineMode::Concat => dim * num_layers,
            _ => dim,
        }
    }

    /// Merge `(N, d)` layer outputs.
    pub fn forward(&self, layer_outputs: &[Tensor]) -> Result<Tensor> {
        let Some((first, rest)) = layer_outputs.split_first() else {
            return Err(Error::InvalidConfig("no layer outputs to combine".to_string()));
        };

        let combined = match self.mode {
            CombineMode::Concat => Tensor::cat(layer_outputs, 1)?,
            CombineMode::Last => rest.last().unwrap_or(first).clone(),
            CombineMode::Max => {
                let mut result = first.clone();
                for layer in rest {
                    result = result.maximum(layer)?;
                }
                result
            }
            CombineMode::Sum | CombineMode::Mean => {
                let mut result = first.clone();
                for layer in rest {
                    result = (&result + layer)?;
                }
                if self.mode == CombineMode::Mean {
                    (result / layer_outputs.len() as f64)?
                } else {
                    result
                }
            }
        };
        Ok(combined)
    }
}
