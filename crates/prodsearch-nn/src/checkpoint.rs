//! Checkpoints on disk.
//!
//! A checkpoint is a directory holding
//!
//! - `model.safetensors`: every variable of the model's `VarMap`
//! - `meta.json`: a [`CheckpointMeta`] with the model and data configs
//!
//! Loading rebuilds an untrained model from the metadata against freshly
//! prepared data, then copies the stored weights into it. Preparation is
//! deterministic, so the same corpus and [`DataConfig`] give back the same
//! ids.

use crate::error::{Error, Result};
use crate::evaluation::RankingMetrics;
use crate::model::{build_model, ModelConfig, SearchModel};
use candle_core::Device;
use prodsearch_core::{DataConfig, PreparedData};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MODEL_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";

/// What a checkpoint was trained on, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model: ModelConfig,
    pub data: DataConfig,
    pub num_users: usize,
    pub num_items: usize,
    pub num_words: usize,
    /// Epochs trained.
    pub epochs: usize,
    /// Last evaluation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RankingMetrics>,
}

impl CheckpointMeta {
    /// Metadata for a model trained on `data`.
    pub fn for_data(model: ModelConfig, config: DataConfig, data: &PreparedData) -> Self {
        Self {
            model,
            data: config,
            num_users: data.num_users(),
            num_items: data.num_items(),
            num_words: data.num_words(),
            epochs: 0,
            metrics: None,
        }
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<RankingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Check that `data` has the dimensions the checkpoint was trained with.
    pub fn check_data(&self, data: &PreparedData) -> Result<()> {
        let pairs = [
            ("users", self.num_users, data.num_users()),
            ("items", self.num_items, data.num_items()),
            ("words", self.num_words, data.num_words()),
        ];
        for (what, expected, got) in pairs {
            if expected != got {
                return Err(Error::Checkpoint(format!(
                    "checkpoint has {expected} {what}, data has {got}"
                )));
            }
        }
        Ok(())
    }
}

/// Write `model` and `meta` into `dir`, creating it if needed.
pub fn save(dir: impl AsRef<Path>, model: &dyn SearchModel, meta: &CheckpointMeta) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    model.varmap().save(dir.join(MODEL_FILE))?;
    fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)?;
    tracing::info!(dir = %dir.display(), model = %model.kind(), "saved checkpoint");
    Ok(())
}

/// Read `meta.json` from a checkpoint directory.
pub fn load_meta(dir: impl AsRef<Path>) -> Result<CheckpointMeta> {
    let path = dir.as_ref().join(META_FILE);
    if !path.exists() {
        return Err(Error::Checkpoint(format!("missing {}", path.display())));
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Copy the stored weights into an already built model.
pub fn restore(dir: impl AsRef<Path>, model: &dyn SearchModel) -> Result<()> {
    let path = dir.as_ref().join(MODEL_FILE);
    if !path.exists() {
        return Err(Error::Checkpoint(format!("missing {}", path.display())));
    }
    // VarMap clones share their variables.
    let mut varmap = model.varmap().clone();
    varmap
        .load(&path)
        .map_err(|e| Error::Checkpoint(format!("loading {}: {e}", path.display())))
}

/// Rebuild the checkpointed model for `data`.
pub fn load(
    dir: impl AsRef<Path>,
    data: &PreparedData,
    device: &Device,
) -> Result<(Box<dyn SearchModel>, CheckpointMeta)> {
    let dir = dir.as_ref();
    let meta = load_meta(dir)?;
    meta.check_data(data)?;
    let model = build_model(&meta.model, data, device)?;
    restore(dir, model.as_ref())?;
    tracing::info!(dir = %dir.display(), model = %meta.model.kind(), "loaded checkpoint");
    Ok((model, meta))
}
