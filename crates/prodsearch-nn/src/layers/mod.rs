//! Neural building blocks.
//!
//! - [`EntityConv`]: mean-aggregation graph convolution over an edge index
//! - [`MultiHeadSelfAttention`]: masked self-attention for query words
//! - [`LayerCombination`]: Jumping-Knowledge style merge of layer outputs
//! - [`masked_mean`]: pooling that ignores padded positions

mod attention;
mod combine;
mod conv;

pub use attention::MultiHeadSelfAttention;
pub use combine::{CombineMode, LayerCombination};
pub use conv::{EdgeIndex, EntityConv};
pub(crate) use conv::zeros;

use crate::error::Result;
use candle_core::{Device, Tensor, D};
use prodsearch_core::Padded;

/// `max(x, 1)` for non-negative counts, built from differentiable ops.
pub(crate) fn at_least_one(x: &Tensor) -> candle_core::Result<Tensor> {
    (x - 1.0)?.relu()? + 1.0
}

/// Mean over the sequence axis of `x (b, L, d)`, ignoring positions where
/// `mask (b, L)` is zero.
///
/// Rows that are all padding give the zero vector.
pub fn masked_mean(x: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let weights = mask.unsqueeze(D::Minus1)?;
    let summed = x.broadcast_mul(&weights)?.sum(1)?;
    let count = at_least_one(&mask.sum_keepdim(1)?)?;
    Ok(summed.broadcast_div(&count)?)
}

/// `(ids (rows, width) u32, mask (rows, width) f32)` tensors for a padded batch.
pub fn padded_tensors(padded: &Padded, device: &Device) -> Result<(Tensor, Tensor)> {
    let shape = (padded.rows, padded.width);
    let ids = Tensor::from_slice(&padded.ids, shape, device)?;
    let mask = Tensor::from_slice(&padded.mask, shape, device)?;
    Ok((ids, mask))
}

/// Look up rows of `table` for a `(rows, width)` id matrix, giving `(rows, width, d)`.
pub fn lookup(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let (rows, width) = ids.dims2()?;
    let dim = table.dim(1)?;
    let flat = ids.flatten_all()?;
    Ok(table.index_select(&flat, 0)?.reshape((rows, width, dim))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prodsearch_core::sampling::pad_sequences;

    #[test]
    fn test_masked_mean_ignores_padding() {
        let device = Device::Cpu;
        let x = Tensor::from_vec(
            vec![1f32, 1., 3., 3., 100., 100., 5., 5., 7., 7., 9., 9.],
            (2, 3, 2),
            &device,
        )
        .unwrap();
        let mask = Tensor::from_vec(vec![1f32, 1., 0., 0., 0., 0.], (2, 3), &device).unwrap();

        let out = masked_mean(&x, &mask).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out[0], vec![2.0, 2.0]);
        // all padding -> zero vector
        assert_eq!(out[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_lookup_shape() {
        let device = Device::Cpu;
        let table = Tensor::arange(0f32, 12., &device).unwrap().reshape((6, 2)).unwrap();
        let padded = pad_sequences(&[vec![1u32, 2], vec![5]]);
        let (ids, mask) = padded_tensors(&padded, &device).unwrap();

        let rows = lookup(&table, &ids).unwrap();
        assert_eq!(rows.dims(), &[2, 2, 2]);
        assert_eq!(mask.to_vec2::<f32>().unwrap(), vec![vec![1., 1.], vec![1., 0.]]);
        let values = rows.to_vec3::<f32>().unwrap();
        assert_eq!(values[1][0], vec![10.0, 11.0]);
        assert_eq!(values[1][1], vec![0.0, 1.0]);
    }
}
