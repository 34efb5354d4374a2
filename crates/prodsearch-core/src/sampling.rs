//! Negative sampling and mini-batch assembly.
//!
//! Batches are plain index buffers; the models turn them into tensors.

use crate::dataset::PreparedData;
use crate::vocab::PAD_ID;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

/// Draws per negative before an excluded item is accepted anyway.
const MAX_RETRIES: usize = 32;

/// Uniform item sampler with rejection of excluded items.
#[derive(Debug, Clone)]
pub struct NegativeSampler {
    num_items: u32,
    rng: ChaCha8Rng,
}

impl NegativeSampler {
    pub fn new(num_items: usize, seed: u64) -> Self {
        Self {
            num_items: num_items as u32,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Draw `k` items, retrying when `is_excluded` holds.
    ///
    /// When the exclusion covers (nearly) every item, the last draw is kept
    /// after [`MAX_RETRIES`] attempts so sampling always terminates.
    pub fn sample<F: Fn(u32) -> bool>(&mut self, k: usize, is_excluded: F) -> Vec<u32> {
        if self.num_items == 0 {
            return Vec::new();
        }
        (0..k)
            .map(|_| {
                let mut candidate = self.rng.gen_range(0..self.num_items);
                for _ in 0..MAX_RETRIES {
                    if !is_excluded(candidate) {
                        break;
                    }
                    candidate = self.rng.gen_range(0..self.num_items);
                }
                candidate
            })
            .collect()
    }

    /// The sampler's generator, shared for shuffling and window picks.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

/// Shuffle `0..n` and cut it into batches, dropping the ragged tail.
///
/// A corpus smaller than one batch yields a single partial batch.
pub fn batch_indices<R: Rng>(n: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    if n == 0 || batch_size == 0 {
        return Vec::new();
    }
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    if n < batch_size {
        return vec![indices];
    }
    indices
        .chunks_exact(batch_size)
        .map(<[usize]>::to_vec)
        .collect()
}

/// Right-padded id matrix with its 0/1 mask, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Padded {
    pub ids: Vec<u32>,
    pub mask: Vec<f32>,
    pub rows: usize,
    pub width: usize,
}

/// Pad sequences with [`PAD_ID`] to the longest length (at least 1).
pub fn pad_sequences<S: AsRef<[u32]>>(seqs: &[S]) -> Padded {
    let width = seqs
        .iter()
        .map(|s| s.as_ref().len())
        .max()
        .unwrap_or(0)
        .max(1);
    let mut ids = Vec::with_capacity(seqs.len() * width);
    let mut mask = Vec::with_capacity(seqs.len() * width);
    for seq in seqs {
        let seq = seq.as_ref();
        for pos in 0..width {
            match seq.get(pos) {
                Some(&id) if id != PAD_ID => {
                    ids.push(id);
                    mask.push(1.0);
                }
                _ => {
                    ids.push(PAD_ID);
                    mask.push(0.0);
                }
            }
        }
    }
    Padded {
        ids,
        mask,
        rows: seqs.len(),
        width,
    }
}

/// Training batch for the graph model.
#[derive(Debug, Clone)]
pub struct GraphSearchBatch {
    pub users: Vec<u32>,
    pub items: Vec<u32>,
    /// Row-major `(batch, neg_sample_num)`.
    pub neg_items: Vec<u32>,
    pub neg_sample_num: usize,
    pub query: Padded,
}

impl GraphSearchBatch {
    /// Assemble a batch from training interaction indices.
    ///
    /// Negatives avoid everything the user bought in training.
    pub fn build(
        data: &PreparedData,
        indices: &[usize],
        sampler: &mut NegativeSampler,
        neg_sample_num: usize,
    ) -> Self {
        let mut users = Vec::with_capacity(indices.len());
        let mut items = Vec::with_capacity(indices.len());
        let mut neg_items = Vec::with_capacity(indices.len() * neg_sample_num);
        let mut queries = Vec::with_capacity(indices.len());

        for &i in indices {
            let interaction = &data.train[i];
            users.push(interaction.user);
            items.push(interaction.item);
            let bought = data.purchased(interaction.user);
            neg_items.extend(sampler.sample(neg_sample_num, |c| {
                c == interaction.item || bought.is_some_and(|b| b.contains(&c))
            }));
            queries.push(data.query_words(interaction.query));
        }

        Self {
            users,
            items,
            neg_items,
            neg_sample_num,
            query: pad_sequences(&queries),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Training batch for the latent semantic model.
#[derive(Debug, Clone)]
pub struct LseBatch {
    pub items: Vec<u32>,
    /// Row-major `(batch, neg_sample_num)`.
    pub neg_items: Vec<u32>,
    pub neg_sample_num: usize,
    pub query: Padded,
    /// Review n-grams, one per interaction.
    pub review: Padded,
}

impl LseBatch {
    /// Assemble a batch, sampling one review window per interaction.
    pub fn build(
        data: &PreparedData,
        indices: &[usize],
        sampler: &mut NegativeSampler,
        neg_sample_num: usize,
        window_size: usize,
    ) -> Self {
        let mut items = Vec::with_capacity(indices.len());
        let mut neg_items = Vec::with_capacity(indices.len() * neg_sample_num);
        let mut queries = Vec::with_capacity(indices.len());
        let mut windows = Vec::with_capacity(indices.len());

        for &i in indices {
            let interaction = &data.train[i];
            items.push(interaction.item);
            neg_items.extend(sampler.sample(neg_sample_num, |c| c == interaction.item));
            let query = data.query_words(interaction.query);
            queries.push(query);

            let source = if interaction.review_words.is_empty() {
                query
            } else {
                interaction.review_words.as_slice()
            };
            windows.push(review_window(source, window_size, sampler.rng()).to_vec());
        }

        Self {
            items,
            neg_items,
            neg_sample_num,
            query: pad_sequences(&queries),
            review: pad_sequences(&windows),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A random run of `window_size` consecutive words (all words when shorter).
pub fn review_window<'a, R: Rng>(words: &'a [u32], window_size: usize, rng: &mut R) -> &'a [u32] {
    let window_size = window_size.max(1);
    if words.len() <= window_size {
        return words;
    }
    let start = rng.gen_range(0..=words.len() - window_size);
    &words[start..start + window_size]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{prepare, DataConfig};
    use crate::record::Review;
    use std::collections::HashSet;

    fn data() -> PreparedData {
        let records = vec![
            Review::new("alice", "case", "a very sturdy red phone case", vec!["phone case".into()], 1),
            Review::new("alice", "cable", "long cable", vec!["usb cable".into()], 2),
            Review::new("alice", "charger", "", vec!["charger".into()], 3),
            Review::new("bob", "case", "cheap", vec!["phone case".into()], 1),
            Review::new("bob", "stand", "wobbly stand", vec!["stand".into()], 2),
        ];
        prepare(&records, &DataConfig::default()).unwrap()
    }

    #[test]
    fn test_sampler_respects_exclusion() {
        let mut sampler = NegativeSampler::new(10, 7);
        let negatives = sampler.sample(200, |c| c < 5);
        assert_eq!(negatives.len(), 200);
        // 32 retries at p=0.5 each: essentially never exhausted
        assert!(negatives.iter().filter(|&&c| c < 5).count() < 5);
    }

    #[test]
    fn test_sampler_terminates_when_everything_excluded() {
        let mut sampler = NegativeSampler::new(3, 1);
        let negatives = sampler.sample(4, |_| true);
        assert_eq!(negatives.len(), 4);
    }

    #[test]
    fn test_batch_indices_drop_last() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let batches = batch_indices(10, 4, &mut rng);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));

        let small = batch_indices(3, 4, &mut rng);
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].len(), 3);
    }

    #[test]
    fn test_pad_sequences() {
        let padded = pad_sequences(&[vec![3, 4], vec![5], vec![]]);
        assert_eq!(padded.width, 2);
        assert_eq!(padded.ids, vec![3, 4, 5, 0, 0, 0]);
        assert_eq!(padded.mask, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);

        let empty: Vec<Vec<u32>> = vec![vec![]];
        assert_eq!(pad_sequences(&empty).width, 1);
    }

    #[test]
    fn test_graph_search_batch_negatives_avoid_purchases() {
        let data = data();
        let mut sampler = NegativeSampler::new(data.num_items(), 3);
        let indices: Vec<usize> = (0..data.train.len()).collect();
        let batch = GraphSearchBatch::build(&data, &indices, &mut sampler, 3);

        assert_eq!(batch.len(), data.train.len());
        assert_eq!(batch.neg_items.len(), data.train.len() * 3);
        assert_eq!(batch.query.rows, batch.len());
        for (row, &user) in batch.users.iter().enumerate() {
            let bought: HashSet<u32> = data.purchased(user).cloned().unwrap_or_default();
            let negs = &batch.neg_items[row * 3..row * 3 + 3];
            // 4 items, users bought at most 2 of them in training
            assert!(negs.iter().all(|n| !bought.contains(n)));
        }
    }

    #[test]
    fn test_lse_batch_windows() {
        let data = data();
        let mut sampler = NegativeSampler::new(data.num_items(), 3);
        let indices: Vec<usize> = (0..data.train.len()).collect();
        let batch = LseBatch::build(&data, &indices, &mut sampler, 2, 3);

        assert_eq!(batch.review.rows, batch.len());
        assert!(batch.review.width <= 3);
        for row in 0..batch.len() {
            let mask = &batch.review.mask[row * batch.review.width..(row + 1) * batch.review.width];
            assert!(mask.iter().any(|&m| m > 0.0), "every window has a word");
        }
    }

    #[test]
    fn test_review_window_is_contiguous() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let words = [1, 2, 3, 4, 5, 6];
        let window = review_window(&words, 3, &mut rng);
        assert_eq!(window.len(), 3);
        assert_eq!(window[1], window[0] + 1);
        assert_eq!(review_window(&words[..2], 3, &mut rng), &[1, 2]);
    }
}
