//! Turning raw reviews into indexed train/test interactions.
//!
//! Preparation is deterministic: the same corpus and [`DataConfig`] always
//! produce the same user, item, query and word ids. Checkpoints rely on
//! this to line their embedding tables back up with the data.

use crate::error::{Error, Result};
use crate::record::{Review, Split};
use crate::vocab::{tokenize, IndexMap, Vocabulary, VocabularyBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Data preparation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Reviews are clipped to this many in-vocabulary words (default: 20).
    pub max_review_words: usize,
    /// Review words seen fewer times are dropped (default: 1).
    pub min_word_count: usize,
    /// Users need this many distinct items to get a test interaction (default: 2).
    pub min_user_purchases: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_review_words: 20,
            min_word_count: 1,
            min_user_purchases: 2,
        }
    }
}

impl DataConfig {
    pub fn with_max_review_words(mut self, n: usize) -> Self {
        self.max_review_words = n;
        self
    }

    pub fn with_min_word_count(mut self, n: usize) -> Self {
        self.min_word_count = n;
        self
    }

    pub fn with_min_user_purchases(mut self, n: usize) -> Self {
        self.min_user_purchases = n;
        self
    }
}

/// One (user, item, query) purchase with the clipped review words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    /// User index.
    pub user: u32,
    /// Item index.
    pub item: u32,
    /// Query index (see [`PreparedData::query_words`]).
    pub query: u32,
    /// Review word ids, clipped.
    pub review_words: Vec<u32>,
}

/// Summary counts for a prepared corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub num_users: usize,
    pub num_items: usize,
    pub num_queries: usize,
    /// Vocabulary size including padding.
    pub num_words: usize,
    pub num_train: usize,
    pub num_test: usize,
}

/// Indexed corpus ready for graph construction and training.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub users: IndexMap,
    pub items: IndexMap,
    pub queries: IndexMap,
    pub vocab: Vocabulary,
    pub train: Vec<Interaction>,
    pub test: Vec<Interaction>,
    query_words: Vec<Vec<u32>>,
    purchases: Vec<HashSet<u32>>,
}

impl PreparedData {
    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    /// Vocabulary size including the padding slot.
    pub fn num_words(&self) -> usize {
        self.vocab.len()
    }

    /// Users followed by items.
    pub fn num_entities(&self) -> usize {
        self.users.len() + self.items.len()
    }

    /// Word ids of a query. Unknown query ids give an empty slice.
    pub fn query_words(&self, query: u32) -> &[u32] {
        self.query_words
            .get(query as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Items the user bought in the training split.
    pub fn purchased(&self, user: u32) -> Option<&HashSet<u32>> {
        self.purchases.get(user as usize)
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            num_users: self.num_users(),
            num_items: self.num_items(),
            num_queries: self.queries.len(),
            num_words: self.num_words(),
            num_train: self.train.len(),
            num_test: self.test.len(),
        }
    }
}

/// Keep only the first `max_words` words of a review.
pub fn clip_words(words: &mut Vec<u32>, max_words: usize) {
    words.truncate(max_words);
}

fn query_key(tokens: &[String]) -> String {
    tokens.join(" ")
}

/// Index a review corpus and split it into train/test interactions.
pub fn prepare(records: &[Review], config: &DataConfig) -> Result<PreparedData> {
    if records.is_empty() {
        return Err(Error::EmptyDataset("no reviews".to_string()));
    }
    if config.max_review_words == 0 {
        return Err(Error::InvalidConfig(
            "max_review_words must be positive".to_string(),
        ));
    }
    if config.min_user_purchases < 2 {
        return Err(Error::InvalidConfig(format!(
            "min_user_purchases must be at least 2, got {}",
            config.min_user_purchases
        )));
    }

    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        records[a]
            .user_id
            .cmp(&records[b].user_id)
            .then(records[a].unix_time.cmp(&records[b].unix_time))
            .then(records[a].item_id.cmp(&records[b].item_id))
    });

    // Tokenize once.
    let review_tokens: Vec<Vec<String>> =
        records.iter().map(|r| tokenize(&r.review_text)).collect();
    let query_tokens: Vec<Vec<Vec<String>>> = records
        .iter()
        .map(|r| r.queries.iter().map(|q| tokenize(q)).collect())
        .collect();

    let mut builder = VocabularyBuilder::new();
    for tokens in &review_tokens {
        for t in tokens {
            builder.add(t);
        }
    }
    for queries in &query_tokens {
        for t in queries.iter().flatten() {
            builder.force(t);
        }
    }
    let vocab = builder.build(config.min_word_count);

    let mut users = IndexMap::new();
    let mut items = IndexMap::new();
    let mut queries = IndexMap::new();
    let mut query_words: Vec<Vec<u32>> = Vec::new();

    for &i in &order {
        users.insert(records[i].user_id.as_str());
        items.insert(records[i].item_id.as_str());
        if query_tokens[i].is_empty() {
            if !queries.contains("") {
                queries.insert("");
                query_words.push(Vec::new());
            }
            continue;
        }
        for tokens in &query_tokens[i] {
            let key = query_key(tokens);
            if !queries.contains(&key) {
                queries.insert(key);
                query_words.push(vocab.encode(tokens));
            }
        }
    }

    let test_records = split_records(records, &order, config);

    let mut train = Vec::new();
    let mut test = Vec::new();
    for &i in &order {
        let record = &records[i];
        let (Some(user), Some(item)) = (users.get(&record.user_id), items.get(&record.item_id))
        else {
            continue;
        };
        let mut review_words = vocab.encode(&review_tokens[i]);
        clip_words(&mut review_words, config.max_review_words);

        let keys: Vec<String> = if query_tokens[i].is_empty() {
            vec![String::new()]
        } else {
            query_tokens[i].iter().map(|t| query_key(t)).collect()
        };
        let target = if test_records.contains(&i) {
            &mut test
        } else {
            &mut train
        };
        for key in keys {
            if let Some(query) = queries.get(&key) {
                target.push(Interaction {
                    user,
                    item,
                    query,
                    review_words: review_words.clone(),
                });
            }
        }
    }

    if train.is_empty() {
        return Err(Error::EmptyDataset("training split is empty".to_string()));
    }

    let mut purchases = vec![HashSet::new(); users.len()];
    for interaction in &train {
        purchases[interaction.user as usize].insert(interaction.item);
    }

    let data = PreparedData {
        users,
        items,
        queries,
        vocab,
        train,
        test,
        query_words,
        purchases,
    };
    let stats = data.stats();
    tracing::info!(
        users = stats.num_users,
        items = stats.num_items,
        queries = stats.num_queries,
        words = stats.num_words,
        train = stats.num_train,
        test = stats.num_test,
        "prepared dataset"
    );
    Ok(data)
}

/// Record indices that go to the test split.
fn split_records(records: &[Review], order: &[usize], config: &DataConfig) -> HashSet<usize> {
    if records.iter().all(|r| r.split.is_some()) {
        return (0..records.len())
            .filter(|&i| records[i].split == Some(Split::Test))
            .collect();
    }

    // Leave-one-out: `order` groups records by user, oldest first.
    let mut test = HashSet::new();
    let mut start = 0;
    while start < order.len() {
        let user = &records[order[start]].user_id;
        let mut end = start;
        while end < order.len() && &records[order[end]].user_id == user {
            end += 1;
        }
        let group = &order[start..end];
        let distinct: HashSet<&str> = group.iter().map(|&i| records[i].item_id.as_str()).collect();
        if distinct.len() >= config.min_user_purchases {
            if let Some(&latest) = group.last() {
                test.insert(latest);
            }
        }
        start = end;
    }
    test
}
