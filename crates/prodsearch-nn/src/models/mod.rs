//! The two ranking models.

mod graph_search;
mod lse;

pub use graph_search::{
    load_word_matrix, GraphSearch, GraphSearchConfig, PropagationMode, SimilarUser,
};
pub use lse::{Lse, LseConfig};
