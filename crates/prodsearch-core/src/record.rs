//! Review records as they appear in Amazon-style review dumps.
//!
//! One JSON object per line:
//!
//! ```text
//! {"reviewerID": "A2SUAM1J3GNN3B", "asin": "0000013714", "reviewText": "...",
//!  "unixReviewTime": 1355616000, "queries": ["cell phones accessories cases"]}
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Which split a record belongs to, when the corpus carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training interaction.
    Train,
    /// Held-out ranking interaction.
    Test,
}

/// A single purchase with its review and the queries that lead to the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Reviewer (user) identifier.
    #[serde(rename = "reviewerID")]
    pub user_id: String,
    /// Product identifier.
    #[serde(rename = "asin")]
    pub item_id: String,
    /// Free review text.
    #[serde(rename = "reviewText", default)]
    pub review_text: String,
    /// Search queries associated with the purchased item.
    #[serde(default, alias = "query")]
    pub queries: Vec<String>,
    /// Review timestamp, used for the leave-one-out split.
    #[serde(rename = "unixReviewTime", default)]
    pub unix_time: i64,
    /// Explicit split assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<Split>,
}

impl Review {
    /// Create a review without split assignment.
    pub fn new(
        user_id: impl Into<String>,
        item_id: impl Into<String>,
        review_text: impl Into<String>,
        queries: Vec<String>,
        unix_time: i64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            review_text: review_text.into(),
            queries,
            unix_time,
            split: None,
        }
    }

    /// Assign an explicit split.
    pub fn with_split(mut self, split: Split) -> Self {
        self.split = Some(split);
        self
    }
}

/// Read reviews from a JSON Lines file.
///
/// Blank lines are skipped. The first malformed line aborts with
/// [`Error::Parse`].
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<Review>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut reviews = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let review: Review = serde_json::from_str(line).map_err(|e| Error::Parse {
            line: i + 1,
            message: e.to_string(),
        })?;
        reviews.push(review);
    }

    tracing::debug!(count = reviews.len(), path = %path.as_ref().display(), "loaded reviews");
    Ok(reviews)
}
