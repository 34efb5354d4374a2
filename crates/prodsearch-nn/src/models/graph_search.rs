//! GraphSearch: graph propagation over users, items and review words.
//!
//! # Node representations
//!
//! Every node row has width `d = de + dw` (entity + word embedding sizes):
//!
//! ```text
//! entity v:  [ E_entity[v] || mean_{w -> v} E_word[w] ]    (text part zero under NoTextProp)
//! word w:    [ 0           || E_word[w]                ]    (static)
//! ```
//!
//! `convolution_num` [`EntityConv`] layers update the entity rows from
//! their neighbours. Entity neighbours are skipped under `NoIdProp` and word
//! neighbours under `NoTextProp`. The outputs of all layers (including the
//! input) are merged by a [`LayerCombination`].
//!
//! # Queries and scores
//!
//! ```text
//! q             = tanh(P · masked_mean(MHSA(E_word[query words])) + b)
//! score(u,i,q)  = <h_u + q, h_i>
//! ```
//!
//! Training minimizes a pairwise softplus loss of the positive item against
//! sampled negatives, plus `l2 · (‖E_entity‖ + ‖E_word‖)`.

use crate::error::{Error, Result};
use crate::layers::{
    lookup, masked_mean, padded_tensors, zeros, CombineMode, EdgeIndex, EntityConv,
    LayerCombination, MultiHeadSelfAttention,
};
use crate::loss::{pairwise_loss, weight_norm};
use crate::model::{set_var, zero_row, ModelConfig, ModelKind, RankingSnapshot, SearchModel};
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Init, Linear, Module, VarBuilder, VarMap};
use prodsearch_core::{
    EdgeSelection, GraphSearchBatch, NegativeSampler, Padded, PreparedData, SearchGraph, PAD_ID,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const ENTITY_EMBEDDING: &str = "entity_embedding";
const WORD_EMBEDDING: &str = "word_embedding";
/// Key looked up in pretrained word-vector files.
const WORD_MATRIX_KEY: &str = "word_matrix";

/// Which information flows along graph edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationMode {
    /// Id and text propagation.
    #[default]
    Ordinary,
    /// Entity neighbours only; entities start with an empty text part.
    NoTextProp,
    /// Word neighbours only.
    NoIdProp,
}

impl PropagationMode {
    /// Edges used by the convolution layers.
    pub fn edge_selection(self) -> EdgeSelection {
        match self {
            Self::Ordinary => EdgeSelection::All,
            Self::NoTextProp => EdgeSelection::Entity,
            Self::NoIdProp => EdgeSelection::Word,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ordinary => "ordinary",
            Self::NoTextProp => "no_text_prop",
            Self::NoIdProp => "no_id_prop",
        }
    }
}

impl fmt::Display for PropagationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropagationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ordinary" => Ok(Self::Ordinary),
            "no_text_prop" => Ok(Self::NoTextProp),
            "no_id_prop" => Ok(Self::NoIdProp),
            other => Err(Error::InvalidConfig(format!(
                "unknown propagation mode {other:?} (expected ordinary, no_text_prop or no_id_prop)"
            ))),
        }
    }
}

/// GraphSearch hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSearchConfig {
    /// Word embedding size `dw` (default: 64).
    pub word_embedding_size: usize,
    /// Entity embedding size `de` (default: 64).
    pub entity_embedding_size: usize,
    /// Attention heads, must divide `dw` (default: 4).
    pub head_num: usize,
    /// Convolution layers (default: 4).
    pub convolution_num: usize,
    /// Embedding norm penalty (default: 0.001).
    pub l2: f64,
    /// Propagation setup (default: ordinary).
    pub mode: PropagationMode,
    /// Layer merge (default: mean).
    #[serde(default)]
    pub combine: CombineMode,
}

impl Default for GraphSearchConfig {
    fn default() -> Self {
        Self {
            word_embedding_size: 64,
            entity_embedding_size: 64,
            head_num: 4,
            convolution_num: 4,
            l2: 0.001,
            mode: PropagationMode::Ordinary,
            combine: CombineMode::Mean,
        }
    }
}

impl GraphSearchConfig {
    /// Set both embedding sizes.
    pub fn with_embedding_size(mut self, size: usize) -> Self {
        self.word_embedding_size = size;
        self.entity_embedding_size = size;
        self
    }

    pub fn with_word_embedding_size(mut self, size: usize) -> Self {
        self.word_embedding_size = size;
        self
    }

    pub fn with_entity_embedding_size(mut self, size: usize) -> Self {
        self.entity_embedding_size = size;
        self
    }

    pub fn with_head_num(mut self, head_num: usize) -> Self {
        self.head_num = head_num;
        self
    }

    pub fn with_convolution_num(mut self, n: usize) -> Self {
        self.convolution_num = n;
        self
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn with_mode(mut self, mode: PropagationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_combine(mut self, combine: CombineMode) -> Self {
        self.combine = combine;
        self
    }

    /// Node row width `de + dw`.
    pub fn node_dim(&self) -> usize {
        self.entity_embedding_size + self.word_embedding_size
    }

    fn validate(&self) -> Result<()> {
        if self.word_embedding_size == 0 || self.entity_embedding_size == 0 {
            return Err(Error::InvalidConfig(
                "embedding sizes must be positive".to_string(),
            ));
        }
        if self.head_num == 0 || self.word_embedding_size % self.head_num != 0 {
            return Err(Error::InvalidConfig(format!(
                "word_embedding_size {} is not divisible by head_num {}",
                self.word_embedding_size, self.head_num
            )));
        }
        if !self.l2.is_finite() || self.l2 < 0.0 {
            return Err(Error::InvalidConfig(format!("invalid l2 {}", self.l2)));
        }
        Ok(())
    }
}

/// The `k` most similar other users of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarUser {
    pub user: u32,
    /// `(user, σ(u·v))`, most similar first.
    pub neighbours: Vec<(u32, f32)>,
}

/// Read a pretrained `(num_words, dw)` word matrix from a safetensors file.
///
/// Uses the `word_matrix` tensor, or the only tensor in the file.
pub fn load_word_matrix(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let mut tensors = candle_core::safetensors::load(path, device)?;
    if let Some(matrix) = tensors.remove(WORD_MATRIX_KEY) {
        return Ok(matrix);
    }
    if tensors.len() == 1 {
        if let Some((_, matrix)) = tensors.into_iter().next() {
            return Ok(matrix);
        }
    }
    Err(Error::InvalidConfig(format!(
        "{} has no {WORD_MATRIX_KEY} tensor",
        path.display()
    )))
}

/// Graph propagation model for personalized product search.
pub struct GraphSearch {
    config: GraphSearchConfig,
    varmap: VarMap,
    device: Device,
    entity_embedding: Tensor,
    word_embedding: Tensor,
    convs: Vec<EntityConv>,
    combine: LayerCombination,
    attention: MultiHeadSelfAttention,
    query_projection: Linear,
    /// Edges into entities over `[entities ; words]`.
    propagation_edges: EdgeIndex,
    /// Word -> entity edges with word-local sources.
    text_edges: EdgeIndex,
    num_users: usize,
    num_items: usize,
    num_words: usize,
}

impl GraphSearch {
    /// Build an untrained model for `graph`.
    pub fn new(config: GraphSearchConfig, graph: &SearchGraph, device: &Device) -> Result<Self> {
        config.validate()?;
        let num_entities = graph.num_entities();
        if num_entities == 0 {
            return Err(Error::InvalidConfig("graph has no entities".to_string()));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let de = config.entity_embedding_size;
        let dw = config.word_embedding_size;
        let d = config.node_dim();
        let init = Init::Randn {
            mean: 0.0,
            stdev: 0.1,
        };

        let entity_embedding = vb.get_with_hints((num_entities, de), ENTITY_EMBEDDING, init)?;
        let word_embedding = vb.get_with_hints((graph.num_words(), dw), WORD_EMBEDDING, init)?;
        zero_row(&varmap, WORD_EMBEDDING, PAD_ID as usize)?;

        let convs = (0..config.convolution_num)
            .map(|layer| EntityConv::new(d, d, vb.pp(format!("conv{layer}"))))
            .collect::<Result<Vec<_>>>()?;
        let combine = LayerCombination::new(config.combine);
        let out_dim = combine.output_dim(d, config.convolution_num + 1);
        let attention = MultiHeadSelfAttention::new(dw, config.head_num, vb.pp("attention"))?;
        let query_projection = linear(dw, out_dim, vb.pp("query_projection"))?;

        let propagation_edges = EdgeIndex::new(
            &graph.edge_list(config.mode.edge_selection()),
            num_entities,
            device,
        )?;
        let text_edges = EdgeIndex::new(&graph.word_edges(), num_entities, device)?;

        tracing::debug!(
            entities = num_entities,
            words = graph.num_words(),
            edges = propagation_edges.num_edges(),
            mode = %config.mode,
            "initialized GraphSearch"
        );

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            entity_embedding,
            word_embedding,
            convs,
            combine,
            attention,
            query_projection,
            propagation_edges,
            text_edges,
            num_users: graph.num_users(),
            num_items: graph.num_items(),
            num_words: graph.num_words(),
        })
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Replace the word embedding with a pretrained `(num_words, dw)` matrix.
    pub fn apply_word2vec(&self, matrix: &Tensor) -> Result<()> {
        let (rows, cols) = matrix.dims2()?;
        if rows != self.num_words {
            return Err(Error::DimensionMismatch {
                expected: self.num_words,
                got: rows,
            });
        }
        if cols != self.config.word_embedding_size {
            return Err(Error::DimensionMismatch {
                expected: self.config.word_embedding_size,
                got: cols,
            });
        }
        set_var(&self.varmap, WORD_EMBEDDING, matrix)?;
        tracing::info!(words = rows, dim = cols, "applied pretrained word vectors");
        Ok(())
    }

    /// Propagated entity rows, `(num_entities, out_dim)`.
    pub fn graph_propagation(&self) -> Result<Tensor> {
        let num_entities = self.num_users + self.num_items;
        let de = self.config.entity_embedding_size;
        let dw = self.config.word_embedding_size;

        let text = match self.config.mode {
            PropagationMode::NoTextProp => zeros(num_entities, dw, &self.device)?,
            _ => self.text_edges.mean(&self.word_embedding)?,
        };
        let h0 = Tensor::cat(&[&self.entity_embedding, &text], 1)?;
        let word_rows = Tensor::cat(
            &[&zeros(self.num_words, de, &self.device)?, &self.word_embedding],
            1,
        )?;

        let mut layers = Vec::with_capacity(self.convs.len() + 1);
        layers.push(h0.clone());
        let mut h = h0;
        for conv in &self.convs {
            let x = Tensor::cat(&[&h, &word_rows], 0)?;
            h = conv.forward(&x, &self.propagation_edges)?;
            layers.push(h.clone());
        }
        self.combine.forward(&layers)
    }

    /// Query vectors with gradient tracking.
    fn query_vectors(&self, queries: &Padded) -> Result<Tensor> {
        let (ids, mask) = padded_tensors(queries, &self.device)?;
        let words = lookup(&self.word_embedding, &ids)?;
        let attended = self.attention.forward(&words, &mask)?;
        let pooled = masked_mean(&attended, &mask)?;
        Ok(self.query_projection.forward(&pooled)?.tanh()?)
    }

    /// First column of the entity-embedding part in [`Self::graph_propagation`].
    ///
    /// Under `Concat` this is the last layer's block, not the unpropagated `h0`.
    fn entity_columns(&self) -> usize {
        match self.config.combine {
            CombineMode::Concat => self.config.convolution_num * self.config.node_dim(),
            _ => 0,
        }
    }

    /// The `k` most similar other users of every user.
    ///
    /// Similarity is `σ(u·v)` on the entity-embedding part of the propagated
    /// user rows.
    pub fn similar_users(&self, k: usize) -> Result<Vec<SimilarUser>> {
        if self.num_users == 0 {
            return Ok(Vec::new());
        }
        let users = self
            .graph_propagation()?
            .detach()
            .narrow(0, 0, self.num_users)?
            .narrow(1, self.entity_columns(), self.config.entity_embedding_size)?
            .contiguous()?;
        let logits = users.matmul(&users.t()?.contiguous()?)?.to_vec2::<f32>()?;

        let result = logits
            .into_iter()
            .enumerate()
            .map(|(user, row)| {
                let mut neighbours: Vec<(u32, f32)> = row
                    .into_iter()
                    .enumerate()
                    .filter(|&(other, _)| other != user)
                    .map(|(other, logit)| (other as u32, 1.0 / (1.0 + (-logit).exp())))
                    .collect();
                neighbours.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                neighbours.truncate(k);
                SimilarUser {
                    user: user as u32,
                    neighbours,
                }
            })
            .collect();
        Ok(result)
    }
}

impl SearchModel for GraphSearch {
    fn kind(&self) -> ModelKind {
        ModelKind::GraphSearch
    }

    fn config(&self) -> ModelConfig {
        ModelConfig::GraphSearch(self.config.clone())
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
        let batch = GraphSearchBatch::build(data, indices, sampler, neg_sample_num);
        if batch.is_empty() || neg_sample_num == 0 {
            return Err(Error::Training(
                "batch needs interactions and negatives".to_string(),
            ));
        }
        let b = batch.len();
        let k = batch.neg_sample_num;
        let offset = self.num_users as u32;

        let nodes = self.graph_propagation()?;
        let dim = nodes.dim(1)?;
        let users = Tensor::from_slice(&batch.users, b, &self.device)?;
        let items: Vec<u32> = batch.items.iter().map(|&i| offset + i).collect();
        let items = Tensor::from_vec(items, b, &self.device)?;
        let negs: Vec<u32> = batch.neg_items.iter().map(|&i| offset + i).collect();
        let negs = Tensor::from_vec(negs, b * k, &self.device)?;

        let user_rows = nodes.index_select(&users, 0)?;
        let item_rows = nodes.index_select(&items, 0)?;
        let neg_rows = nodes.index_select(&negs, 0)?.reshape((b, k, dim))?;
        let personalized = (user_rows + self.query_vectors(&batch.query)?)?;

        let pos_scores = (&personalized * &item_rows)?.sum(1)?;
        let neg_scores = neg_rows
            .broadcast_mul(&personalized.unsqueeze(1)?)?
            .sum(2)?;

        let ranking = pairwise_loss(&pos_scores, &neg_scores)?;
        let penalty = ((weight_norm(&self.entity_embedding)? + weight_norm(&self.word_embedding)?)?
            * self.config.l2)?;
        Ok((ranking + penalty)?)
    }

    fn snapshot(&self) -> Result<RankingSnapshot> {
        let nodes = self.graph_propagation()?.detach();
        Ok(RankingSnapshot {
            users: Some(nodes.narrow(0, 0, self.num_users)?),
            items: nodes.narrow(0, self.num_users, self.num_items)?,
            item_bias: None,
        })
    }

    fn encode_queries(&self, queries: &Padded) -> Result<Tensor> {
        Ok(self.query_vectors(queries)?.detach())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prodsearch_core::sampling::pad_sequences;
    use prodsearch_core::{prepare, DataConfig, Review};

    fn data() -> PreparedData {
        let records = vec![
            Review::new("alice", "case", "sturdy red phone case", vec!["phone case".into()], 1),
            Review::new("alice", "cable", "long usb cable", vec!["usb cable".into()], 2),
            Review::new("alice", "charger", "fast charger", vec!["charger".into()], 3),
            Review::new("bob", "case", "cheap red case", vec!["red case".into()], 1),
            Review::new("bob", "stand", "wobbly stand", vec!["phone stand".into()], 2),
            Review::new("carol", "cable", "usb cable works", vec!["cable".into()], 1),
            Review::new("carol", "stand", "solid stand", vec!["stand".into()], 2),
        ];
        prepare(&records, &DataConfig::default()).unwrap()
    }

    fn small_config() -> GraphSearchConfig {
        GraphSearchConfig::default()
            .with_embedding_size(8)
            .with_head_num(2)
            .with_convolution_num(2)
    }

    fn model(config: GraphSearchConfig, data: &PreparedData) -> GraphSearch {
        GraphSearch::new(config, &SearchGraph::build(data), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_propagation_shape_per_mode() {
        let data = data();
        for mode in [
            PropagationMode::Ordinary,
            PropagationMode::NoTextProp,
            PropagationMode::NoIdProp,
        ] {
            let model = model(small_config().with_mode(mode), &data);
            let nodes = model.graph_propagation().unwrap();
            assert_eq!(nodes.dims(), &[data.num_entities(), 16]);
        }
    }

    #[test]
    fn test_concat_widens_query_projection() {
        let data = data();
        let model = model(small_config().with_combine(CombineMode::Concat), &data);
        let nodes = model.graph_propagation().unwrap();
        assert_eq!(nodes.dim(1).unwrap(), 16 * 3);
        let q = model.encode_queries(&pad_sequences(&[vec![1u32, 2]])).unwrap();
        assert_eq!(q.dim(1).unwrap(), 16 * 3);
    }

    #[test]
    fn test_batch_loss_is_finite_and_differentiable() {
        let data = data();
        let model = model(small_config(), &data);
        let mut sampler = NegativeSampler::new(data.num_items(), 1);
        let indices: Vec<usize> = (0..data.train.len()).collect();

        let loss = model.batch_loss(&data, &indices, &mut sampler, 3).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value > 0.0);

        let grads = loss.backward().unwrap();
        assert!(grads.get(&model.entity_embedding).is_some());
        assert!(grads.get(&model.word_embedding).is_some());
    }

    #[test]
    fn test_padding_row_starts_at_zero() {
        let data = data();
        let model = model(small_config(), &data);
        let pad = model.word_embedding.get(PAD_ID as usize).unwrap();
        assert_eq!(pad.to_vec1::<f32>().unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn test_snapshot_splits_users_and_items() {
        let data = data();
        let model = model(small_config(), &data);
        let snapshot = model.snapshot().unwrap();
        assert_eq!(snapshot.items.dims(), &[data.num_items(), 16]);
        assert_eq!(snapshot.users.unwrap().dims(), &[data.num_users(), 16]);
        assert!(snapshot.item_bias.is_none());
    }

    #[test]
    fn test_word2vec_shape_is_checked() {
        let data = data();
        let model = model(small_config(), &data);
        let wrong = Tensor::zeros((data.num_words() + 1, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.apply_word2vec(&wrong),
            Err(Error::DimensionMismatch { .. })
        ));

        let right = Tensor::ones((data.num_words(), 8), DType::F32, &Device::Cpu).unwrap();
        model.apply_word2vec(&right).unwrap();
        let row = model.word_embedding.get(1).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(row, vec![1.0; 8]);
    }

    #[test]
    fn test_word_matrix_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.safetensors");
        let matrix = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        candle_core::safetensors::save(
            &std::collections::HashMap::from([("anything".to_string(), matrix)]),
            &path,
        )
        .unwrap();
        let loaded = load_word_matrix(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.dims(), &[3, 4]);
    }

    #[test]
    fn test_similar_users_excludes_self() {
        let data = data();
        let model = model(small_config(), &data);
        let similar = model.similar_users(5).unwrap();
        assert_eq!(similar.len(), data.num_users());
        for entry in &similar {
            assert_eq!(entry.neighbours.len(), data.num_users() - 1);
            assert!(entry.neighbours.iter().all(|(u, _)| *u != entry.user));
            assert!(entry
                .neighbours
                .windows(2)
                .all(|w| w[0].1 >= w[1].1));
            assert!(entry.neighbours.iter().all(|(_, p)| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_similar_users_concat_uses_last_layer() {
        let data = data();
        let model = model(small_config().with_combine(CombineMode::Concat), &data);
        let similar = model.similar_users(1).unwrap();

        // last of three 16-wide blocks, its first 8 columns
        let users = model
            .graph_propagation()
            .unwrap()
            .narrow(0, 0, data.num_users())
            .unwrap()
            .narrow(1, 32, 8)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let sigmoid = |a: &[f32], b: &[f32]| {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            1.0 / (1.0 + (-dot).exp())
        };
        for entry in &similar {
            let (other, p) = entry.neighbours[0];
            let expected = sigmoid(&users[entry.user as usize], &users[other as usize]);
            assert!((p - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_invalid_configs() {
        let graph = SearchGraph::build(&data());
        let bad_heads = small_config().with_head_num(3);
        assert!(GraphSearch::new(bad_heads, &graph, &Device::Cpu).is_err());
        let bad_l2 = small_config().with_l2(-1.0);
        assert!(GraphSearch::new(bad_l2, &graph, &Device::Cpu).is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "no_id_prop".parse::<PropagationMode>().unwrap(),
            PropagationMode::NoIdProp
        );
        assert!("sideways".parse::<PropagationMode>().is_err());
        assert_eq!(PropagationMode::NoTextProp.to_string(), "no_text_prop");
    }
}
