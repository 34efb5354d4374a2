// Allow minor clippy style warnings at crate level
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

//! Data layer for personalized product search.
//!
//! This crate turns Amazon-style review dumps into everything the models
//! need, without touching tensors:
//!
//! - [`Review`] / [`load_jsonl`] - raw records
//! - [`Vocabulary`] / [`IndexMap`] - word, user, item and query ids
//! - [`prepare`] - clipping, query expansion and the train/test split
//! - [`SearchGraph`] - the heterogeneous user/item/word graph
//! - [`sampling`] - negative sampling and mini-batch assembly
//!
//! # Example
//!
//! ```rust
//! use prodsearch_core::{prepare, DataConfig, Review, SearchGraph};
//!
//! let reviews = vec![
//!     Review::new("alice", "case", "sturdy red case", vec!["phone case".into()], 1),
//!     Review::new("alice", "cable", "long usb cable", vec!["usb cable".into()], 2),
//!     Review::new("bob", "case", "cheap case", vec!["phone case".into()], 1),
//! ];
//!
//! let data = prepare(&reviews, &DataConfig::default()).unwrap();
//! assert_eq!(data.num_users(), 2);
//! assert_eq!(data.test.len(), 1); // alice's latest purchase
//!
//! let graph = SearchGraph::build(&data);
//! assert_eq!(graph.num_entities(), 4);
//! ```

pub mod dataset;
mod error;
pub mod graph;
pub mod record;
pub mod sampling;
pub mod vocab;

pub use dataset::{clip_words, prepare, DataConfig, DatasetStats, Interaction, PreparedData};
pub use error::{Error, Result};
pub use graph::{EdgeList, EdgeSelection, GraphStats, Relation, SearchGraph};
pub use record::{load_jsonl, Review, Split};
pub use sampling::{GraphSearchBatch, LseBatch, NegativeSampler, Padded};
pub use vocab::{tokenize, IndexMap, Vocabulary, PAD_ID};
