//! Heterogeneous user/item/word graph.
//!
//! Edges are kept per [`Relation`], COO style, with indices local to the
//! node type on each side:
//!
//! ```text
//!            purchased
//!   user  -------------->  item        (entity -> entity, plus reverse)
//!     ^                     ^
//!     | written_by          | describes
//!     |                     |
//!   word                  word          (word -> entity)
//! ```
//!
//! Users and items share the `entity` node type: users occupy indices
//! `0..num_users`, item `i` sits at `num_users + i`. Word node indices are
//! vocabulary ids.
//!
//! # Example
//!
//! ```rust
//! use prodsearch_core::{prepare, DataConfig, EdgeSelection, Review, SearchGraph};
//!
//! let reviews = vec![
//!     Review::new("alice", "case", "red case", vec!["phone case".into()], 1),
//!     Review::new("bob", "case", "cheap case", vec!["phone case".into()], 1),
//! ];
//! let data = prepare(&reviews, &DataConfig::default()).unwrap();
//! let graph = SearchGraph::build(&data);
//!
//! // two purchases, each stored in both directions
//! assert_eq!(graph.edge_list(EdgeSelection::Entity).len(), 4);
//! ```

use crate::dataset::PreparedData;
use crate::vocab::PAD_ID;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Edge types of the search graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// user -> item
    Purchased,
    /// item -> user
    RevPurchased,
    /// review word -> reviewing user
    WrittenBy,
    /// review word -> reviewed item
    Describes,
}

impl Relation {
    pub const ALL: [Relation; 4] = [
        Relation::Purchased,
        Relation::RevPurchased,
        Relation::WrittenBy,
        Relation::Describes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchased => "purchased",
            Self::RevPurchased => "rev_purchased",
            Self::WrittenBy => "written_by",
            Self::Describes => "describes",
        }
    }

    /// Whether the source side is a word node.
    pub fn from_word(self) -> bool {
        matches!(self, Self::WrittenBy | Self::Describes)
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = if self.from_word() { "word" } else { "entity" };
        write!(f, "{src}->entity:{}", self.as_str())
    }
}

/// Statistics for the search graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub nodes_by_type: BTreeMap<String, usize>,
    /// Keyed by `src->dst:relation`.
    pub edges_by_type: BTreeMap<String, usize>,
}

/// Which edges to include when flattening the graph for propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSelection {
    /// Entity -> entity (purchases both ways).
    Entity,
    /// Word -> entity.
    Word,
    /// Both.
    All,
}

impl EdgeSelection {
    fn includes(self, relation: Relation) -> bool {
        match self {
            Self::Entity => !relation.from_word(),
            Self::Word => relation.from_word(),
            Self::All => true,
        }
    }
}

/// Flat edge list over a single index space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeList {
    pub src: Vec<u32>,
    pub dst: Vec<u32>,
}

impl EdgeList {
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    /// In-degree of every destination in `0..num_nodes`.
    pub fn in_degree(&self, num_nodes: usize) -> Vec<u32> {
        let mut degree = vec![0u32; num_nodes];
        for &d in &self.dst {
            if let Some(slot) = degree.get_mut(d as usize) {
                *slot += 1;
            }
        }
        degree
    }

    fn push(&mut self, src: usize, dst: usize) {
        self.src.push(src as u32);
        self.dst.push(dst as u32);
    }

    fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.src.iter().copied().zip(self.dst.iter().copied())
    }
}

/// The product search graph: users, items and review words.
#[derive(Debug, Clone)]
pub struct SearchGraph {
    /// Indexed by [`Relation`] discriminant.
    edges: [EdgeList; 4],
    num_users: usize,
    num_items: usize,
    num_words: usize,
}

impl SearchGraph {
    /// Build the graph from the training interactions.
    ///
    /// Repeated purchases and repeated review words give a single edge.
    pub fn build(data: &PreparedData) -> Self {
        let num_users = data.num_users();
        let num_items = data.num_items();
        let num_words = data.num_words();

        let mut edges: [EdgeList; 4] = Default::default();
        let mut seen = HashSet::new();
        let mut add = |relation: Relation, src: usize, dst: usize| {
            if seen.insert((relation, src, dst)) {
                edges[relation.slot()].push(src, dst);
            }
        };

        for interaction in &data.train {
            let user = interaction.user as usize;
            let item = num_users + interaction.item as usize;
            add(Relation::Purchased, user, item);
            add(Relation::RevPurchased, item, user);
            for &w in &interaction.review_words {
                if w == PAD_ID {
                    continue;
                }
                add(Relation::WrittenBy, w as usize, user);
                add(Relation::Describes, w as usize, item);
            }
        }

        let graph = Self {
            edges,
            num_users,
            num_items,
            num_words,
        };
        tracing::debug!(
            entities = graph.num_entities(),
            words = num_words,
            edges = graph.num_edges(),
            "built search graph"
        );
        graph
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn num_entities(&self) -> usize {
        self.num_users + self.num_items
    }

    pub fn num_edges(&self) -> usize {
        self.edges.iter().map(EdgeList::len).sum()
    }

    /// Edges of one relation, indices local to their node types.
    pub fn relation(&self, relation: Relation) -> &EdgeList {
        &self.edges[relation.slot()]
    }

    pub fn stats(&self) -> GraphStats {
        let nodes_by_type = BTreeMap::from([
            ("user".to_string(), self.num_users),
            ("item".to_string(), self.num_items),
            ("word".to_string(), self.num_words),
        ]);
        let edges_by_type = Relation::ALL
            .iter()
            .map(|&r| (r.to_string(), self.relation(r).len()))
            .collect();
        GraphStats {
            total_nodes: self.num_entities() + self.num_words,
            total_edges: self.num_edges(),
            nodes_by_type,
            edges_by_type,
        }
    }

    /// Edges into entity nodes over the global space `[entities ; words]`.
    ///
    /// Word `w` is node `num_entities + w`.
    pub fn edge_list(&self, selection: EdgeSelection) -> EdgeList {
        let offset = self.num_entities() as u32;
        let mut out = EdgeList::default();
        for relation in Relation::ALL.into_iter().filter(|&r| selection.includes(r)) {
            let shift = if relation.from_word() { offset } else { 0 };
            for (s, d) in self.relation(relation).iter() {
                out.src.push(s + shift);
                out.dst.push(d);
            }
        }
        out
    }

    /// Word -> entity edges with word-local source ids.
    pub fn word_edges(&self) -> EdgeList {
        let mut out = EdgeList::default();
        for relation in [Relation::WrittenBy, Relation::Describes] {
            let edges = self.relation(relation);
            out.src.extend_from_slice(&edges.src);
            out.dst.extend_from_slice(&edges.dst);
        }
        out
    }
}
