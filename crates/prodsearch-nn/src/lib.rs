#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

//! Personalized product search models on candle.
//!
//! Two rankers share one [`SearchModel`] interface:
//!
//! - [`GraphSearch`]: convolutions over the user/item/word graph, with
//!   self-attention over query words
//! - [`Lse`]: a latent space where projected review n-grams identify items
//!
//! # Modules
//!
//! - [`layers`]: graph convolution, self-attention, layer combination
//! - [`loss`]: NCE and pairwise ranking losses
//! - [`optim`]: Adagrad as a `candle_nn::Optimizer`
//! - [`evaluation`]: MRR, hit rate and NDCG at k
//! - [`training`]: the epoch loop
//! - [`checkpoint`]: safetensors weights plus JSON metadata
//!
//! # Example
//!
//! ```rust,ignore
//! use prodsearch_core::{load_jsonl, prepare, DataConfig};
//! use prodsearch_nn::{build_model, Trainer, TrainingConfig, ModelConfig, LseConfig};
//! use candle_core::Device;
//!
//! let data = prepare(&load_jsonl("reviews.jsonl")?, &DataConfig::default())?;
//! let model = build_model(&ModelConfig::Lse(LseConfig::default()), &data, &Device::Cpu)?;
//! let report = Trainer::new(TrainingConfig::default().with_epochs(5)).fit(model.as_ref(), &data)?;
//! println!("{}", report.final_metrics().unwrap());
//! ```

pub mod checkpoint;
pub mod error;
pub mod evaluation;
pub mod layers;
pub mod loss;
pub mod model;
pub mod models;
pub mod optim;
pub mod training;

pub use checkpoint::CheckpointMeta;
pub use error::{Error, Result};
pub use evaluation::{evaluate, query_ranks, EvalConfig, RankingMetrics};
pub use model::{build_model, ModelConfig, ModelKind, RankingSnapshot, SearchModel};
pub use models::{GraphSearch, GraphSearchConfig, Lse, LseConfig, PropagationMode, SimilarUser};
pub use optim::{Adagrad, AdagradConfig};
pub use training::{EpochReport, Trainer, TrainingConfig, TrainingReport};
