//! Tokenization, word vocabularies and dense index maps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Identifier reserved for padding in every word sequence.
pub const PAD_ID: u32 = 0;

/// Token used for the padding slot.
pub const PAD_TOKEN: &str = "<pad>";

/// Lowercase and split on any non-alphanumeric character.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Dense string -> index map, indices assigned in insertion order.
///
/// Used for users, items and distinct queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexMap {
    /// Keys by index.
    pub keys: Vec<String>,
    key_to_idx: HashMap<String, u32>,
}

impl IndexMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Insert a key if missing, returning its index.
    pub fn insert(&mut self, key: impl Into<String>) -> u32 {
        let key = key.into();
        if let Some(&idx) = self.key_to_idx.get(&key) {
            return idx;
        }
        let idx = self.keys.len() as u32;
        self.key_to_idx.insert(key.clone(), idx);
        self.keys.push(key);
        idx
    }

    /// Index of a key.
    pub fn get(&self, key: &str) -> Option<u32> {
        self.key_to_idx.get(key).copied()
    }

    /// Key at an index.
    pub fn key(&self, idx: u32) -> Option<&str> {
        self.keys.get(idx as usize).map(String::as_str)
    }

    /// Whether a key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_idx.contains_key(key)
    }
}

/// Word vocabulary. Id 0 is the padding slot, real words start at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    words: Vec<String>,
    word_to_id: HashMap<String, u32>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            words: vec![PAD_TOKEN.to_string()],
            word_to_id: HashMap::new(),
        }
    }
}

impl Vocabulary {
    /// Vocabulary size including the padding slot.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True when only the padding slot exists.
    pub fn is_empty(&self) -> bool {
        self.words.len() <= 1
    }

    /// Id of a word.
    pub fn id(&self, word: &str) -> Option<u32> {
        self.word_to_id.get(word).copied()
    }

    /// Word for an id.
    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    /// Map tokens to ids, dropping out-of-vocabulary tokens.
    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<u32> {
        tokens.iter().filter_map(|t| self.id(t.as_ref())).collect()
    }

    fn push(&mut self, word: String) {
        let id = self.words.len() as u32;
        self.word_to_id.insert(word.clone(), id);
        self.words.push(word);
    }
}

/// Counts words and decides which ones make it into the [`Vocabulary`].
#[derive(Debug, Default)]
pub struct VocabularyBuilder {
    counts: BTreeMap<String, usize>,
    forced: BTreeSet<String>,
}

impl VocabularyBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of a word.
    pub fn add(&mut self, word: &str) {
        *self.counts.entry(word.to_string()).or_insert(0) += 1;
    }

    /// Keep a word regardless of its count.
    pub fn force(&mut self, word: &str) {
        self.forced.insert(word.to_string());
    }

    /// Build the vocabulary. Words are assigned ids in lexicographic order.
    pub fn build(self, min_count: usize) -> Vocabulary {
        let mut kept: BTreeSet<String> = self
            .counts
            .into_iter()
            .filter(|(_, c)| *c >= min_count)
            .map(|(w, _)| w)
            .collect();
        kept.extend(self.forced);
        kept.remove(PAD_TOKEN);

        let mut vocab = Vocabulary::default();
        for word in kept {
            vocab.push(word);
        }
        vocab
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Great  Case, fits iPhone-6!"),
            vec!["great", "case", "fits", "iphone", "6"]
        );
        assert!(tokenize("  ,,  ").is_empty());
    }

    #[test]
    fn test_index_map_insertion_order() {
        let mut map = IndexMap::new();
        assert_eq!(map.insert("b"), 0);
        assert_eq!(map.insert("a"), 1);
        assert_eq!(map.insert("b"), 0);
        assert_eq!(map.len(), 2);
        assert_eq!(map.key(1), Some("a"));
        assert_eq!(map.get("c"), None);
    }

    #[test]
    fn test_vocabulary_reserves_padding() {
        let mut builder = VocabularyBuilder::new();
        builder.add("zebra");
        builder.add("apple");
        let vocab = builder.build(1);

        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.word(PAD_ID), Some(PAD_TOKEN));
        assert_eq!(vocab.id("apple"), Some(1));
        assert_eq!(vocab.id("zebra"), Some(2));
    }

    #[test]
    fn test_min_count_and_forced_words() {
        let mut builder = VocabularyBuilder::new();
        builder.add("rare");
        builder.add("common");
        builder.add("common");
        builder.force("query");
        let vocab = builder.build(2);

        assert!(vocab.id("rare").is_none());
        assert!(vocab.id("common").is_some());
        assert!(vocab.id("query").is_some());
        assert_eq!(vocab.encode(&["rare", "common"]).len(), 1);
    }
}
