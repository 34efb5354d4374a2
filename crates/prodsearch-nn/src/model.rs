//! The interface shared by both ranking models.

use crate::error::{Error, Result};
use crate::models::{GraphSearch, GraphSearchConfig, Lse, LseConfig};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use prodsearch_core::{NegativeSampler, Padded, PreparedData, SearchGraph};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which model a checkpoint or config describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    GraphSearch,
    Lse,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GraphSearch => write!(f, "graph_search"),
            Self::Lse => write!(f, "lse"),
        }
    }
}

/// Hyper-parameters of either model, tagged by `model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ModelConfig {
    GraphSearch(GraphSearchConfig),
    Lse(LseConfig),
}

impl ModelConfig {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::GraphSearch(_) => ModelKind::GraphSearch,
            Self::Lse(_) => ModelKind::Lse,
        }
    }
}

/// Detached tensors needed to rank every item.
#[derive(Debug, Clone)]
pub struct RankingSnapshot {
    /// (num_items, d)
    pub items: Tensor,
    /// (num_items), added to every score when present.
    pub item_bias: Option<Tensor>,
    /// (num_users, d), added to the query vector when present.
    pub users: Option<Tensor>,
}

/// A trainable personalized product search model.
pub trait SearchModel {
    fn kind(&self) -> ModelKind;

    /// The config the model was built from.
    fn config(&self) -> ModelConfig;

    /// Every trainable variable.
    fn varmap(&self) -> &VarMap;

    fn device(&self) -> &Device;

    /// Scalar training loss for the training interactions at `indices`.
    ///
    /// The model assembles its own batch; `sampler` provides the negatives.
    fn batch_loss(
        &self,
        data: &PreparedData,
        indices: &[usize],
        sampler: &mut NegativeSampler,
        neg_sample_num: usize,
    ) -> Result<Tensor>;

    /// Item (and user) representations frozen for ranking.
    fn snapshot(&self) -> Result<RankingSnapshot>;

    /// Query vectors `(rows, d)` for padded query word ids.
    fn encode_queries(&self, queries: &Padded) -> Result<Tensor>;
}

/// Build an untrained model of the configured kind for a prepared corpus.
pub fn build_model(
    config: &ModelConfig,
    data: &PreparedData,
    device: &Device,
) -> Result<Box<dyn SearchModel>> {
    match config {
        ModelConfig::GraphSearch(config) => {
            let graph = SearchGraph::build(data);
            Ok(Box::new(GraphSearch::new(config.clone(), &graph, device)?))
        }
        ModelConfig::Lse(config) => Ok(Box::new(Lse::new(
            config.clone(),
            data.num_words(),
            data.num_items(),
            device,
        )?)),
    }
}

/// Overwrite a named variable, checking its shape.
pub(crate) fn set_var(varmap: &VarMap, name: &str, value: &Tensor) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| Error::Training("variable map lock poisoned".to_string()))?;
    let var = vars
        .get(name)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown variable {name}")))?;
    if var.dims() != value.dims() {
        return Err(Error::InvalidConfig(format!(
            "shape mismatch for {name}: expected {:?}, got {:?}",
            var.dims(),
            value.dims()
        )));
    }
    var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)?;
    Ok(())
}

/// Zero one row of a named `(rows, d)` variable.
pub(crate) fn zero_row(varmap: &VarMap, name: &str, row: usize) -> Result<()> {
    let current = {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| Error::Training("variable map lock poisoned".to_string()))?;
        vars.get(name)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown variable {name}")))?
            .as_tensor()
            .detach()
    };
    let rows = current.dim(0)?;
    let keep: Vec<f32> = (0..rows).map(|r| if r == row { 0.0 } else { 1.0 }).collect();
    let keep = Tensor::from_vec(keep, (rows, 1), current.device())?.to_dtype(current.dtype())?;
    set_var(varmap, name, &current.broadcast_mul(&keep)?)
}
