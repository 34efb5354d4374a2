//! LSE: latent semantic entity model.
//!
//! Words and items live in one `e`-dimensional space. A word sequence
//! (query or review n-gram) maps into it through
//!
//! ```text
//! f(words) = tanh(P · masked_mean(E_word[words]) + b)
//! ```
//!
//! Training asks `f(review n-gram)` to identify the reviewed item against
//! sampled items with NCE. Ranking scores are `f(q)·E_item[i] + bias[i]`,
//! independent of the user.

use crate::error::{Error, Result};
use crate::layers::{lookup, masked_mean, padded_tensors};
use crate::loss::{nce_loss, weight_norm};
use crate::model::{zero_row, ModelConfig, ModelKind, RankingSnapshot, SearchModel};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder, VarMap};
use prodsearch_core::{LseBatch, NegativeSampler, Padded, PreparedData, PAD_ID};
use serde::{Deserialize, Serialize};

const WORD_EMBEDDING: &str = "word_embedding";

/// LSE hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LseConfig {
    /// Shared word/item space size (default: 64).
    pub embedding_size: usize,
    /// Embedding norm penalty (default: 0.001).
    pub l2: f64,
    /// Review n-gram length used for training (default: 5).
    pub window_size: usize,
}

impl Default for LseConfig {
    fn default() -> Self {
        Self {
            embedding_size: 64,
            l2: 0.001,
            window_size: 5,
        }
    }
}

impl LseConfig {
    pub fn with_embedding_size(mut self, size: usize) -> Self {
        self.embedding_size = size;
        self
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.embedding_size == 0 {
            return Err(Error::InvalidConfig("embedding_size must be positive".to_string()));
        }
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be positive".to_string()));
        }
        if !self.l2.is_finite() || self.l2 < 0.0 {
            return Err(Error::InvalidConfig(format!("invalid l2 {}", self.l2)));
        }
        Ok(())
    }
}

/// Latent semantic entity model.
pub struct Lse {
    config: LseConfig,
    varmap: VarMap,
    device: Device,
    word_embedding: Tensor,
    item_embedding: Tensor,
    /// (num_items)
    item_bias: Tensor,
    query_projection: Linear,
}

impl Lse {
    pub fn new(config: LseConfig, num_words: usize, num_items: usize, device: &Device) -> Result<Self> {
        config.validate()?;
        if num_items == 0 || num_words == 0 {
            return Err(Error::InvalidConfig("LSE needs words and items".to_string()));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let e = config.embedding_size;

        let word_embedding = vb.get_with_hints(
            (num_words, e),
            WORD_EMBEDDING,
            Init::Randn {
                mean: 0.0,
                stdev: 0.1,
            },
        )?;
        zero_row(&varmap, WORD_EMBEDDING, PAD_ID as usize)?;
        let item_embedding = vb.get_with_hints((num_items, e), "item_embedding", Init::Const(0.0))?;
        let item_bias = vb.get_with_hints(num_items, "item_bias", Init::Const(0.0))?;

        // Xavier-normal weight, U(0, 0.1) bias
        let xavier_std = (2.0 / (e + e) as f64).sqrt();
        let projection = vb.pp("query_projection");
        let weight = projection.get_with_hints(
            (e, e),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: xavier_std,
            },
        )?;
        let bias = projection.get_with_hints(e, "bias", Init::Uniform { lo: 0.0, up: 0.1 })?;
        let query_projection = Linear::new(weight, Some(bias));

        tracing::debug!(words = num_words, items = num_items, dim = e, "initialized LSE");

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            word_embedding,
            item_embedding,
            item_bias,
            query_projection,
        })
    }

    /// `f(words)` with gradient tracking, `(rows, e)`.
    fn project(&self, words: &Padded) -> Result<Tensor> {
        let (ids, mask) = padded_tensors(words, &self.device)?;
        let embedded = lookup(&self.word_embedding, &ids)?;
        let pooled = masked_mean(&embedded, &mask)?;
        Ok(self.query_projection.forward(&pooled)?.tanh()?)
    }

    /// Item vectors and biases for the given items.
    pub fn item_embeddings(&self, items: &[u32]) -> Result<(Tensor, Tensor)> {
        let ids = Tensor::from_slice(items, items.len(), &self.device)?;
        Ok((
            self.item_embedding.index_select(&ids, 0)?.detach(),
            self.item_bias.index_select(&ids, 0)?.detach(),
        ))
    }
}

impl SearchModel for Lse {
    fn kind(&self) -> ModelKind {
        ModelKind::Lse
    }

    fn config(&self) -> ModelConfig {
        ModelConfig::Lse(self.config.clone())
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn batch_loss(
        &self,
        data: &PreparedData,
        indices: &[usize],
        sampler: &mut NegativeSampler,
        neg_sample_num: usize,
    ) -> Result<Tensor> {
        let batch = LseBatch::build(data, indices, sampler, neg_sample_num, self.config.window_size);
        if batch.is_empty() || neg_sample_num == 0 {
            return Err(Error::Training(
                "batch needs interactions and negatives".to_string(),
            ));
        }
        let b = batch.len();
        let k = batch.neg_sample_num;
        let e = self.config.embedding_size;

        let items = Tensor::from_slice(&batch.items, b, &self.device)?;
        let negs = Tensor::from_slice(&batch.neg_items, b * k, &self.device)?;

        let review = self.project(&batch.review)?;
        let pos = self.item_embedding.index_select(&items, 0)?;
        let neg = self.item_embedding.index_select(&negs, 0)?.reshape((b, k, e))?;
        let pos_bias = self.item_bias.index_select(&items, 0)?;
        let neg_bias = self.item_bias.index_select(&negs, 0)?.reshape((b, k))?;

        let nce = nce_loss(&review, &pos, &neg, &pos_bias, &neg_bias)?.mean_all()?;
        let penalty = ((weight_norm(&self.word_embedding)? + weight_norm(&self.item_embedding)?)?
            * self.config.l2)?;
        Ok((nce + penalty)?)
    }

    fn snapshot(&self) -> Result<RankingSnapshot> {
        Ok(RankingSnapshot {
            items: self.item_embedding.detach(),
            item_bias: Some(self.item_bias.detach()),
            users: None,
        })
    }

    fn encode_queries(&self, queries: &Padded) -> Result<Tensor> {
        Ok(self.project(queries)?.detach())
    }
}
