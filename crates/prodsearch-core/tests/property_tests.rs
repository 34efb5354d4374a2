use prodsearch_core::sampling::{batch_indices, pad_sequences, review_window};
use prodsearch_core::{prepare, tokenize, DataConfig, NegativeSampler, Review, SearchGraph, PAD_ID};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn arb_review() -> impl Strategy<Value = Review> {
    (
        0..6u8,
        0..8u8,
        "[a-z ]{0,40}",
        prop::collection::vec("[a-z]{1,6}( [a-z]{1,6})?", 0..3),
        0..100i64,
    )
        .prop_map(|(u, i, text, queries, t)| {
            Review::new(format!("u{u}"), format!("i{i}"), text, queries, t)
        })
}

proptest! {
    #[test]
    fn prop_tokens_are_lowercase_alphanumeric(text in ".{0,80}") {
        for token in tokenize(&text) {
            prop_assert!(!token.is_empty());
            prop_assert!(token.chars().all(char::is_alphanumeric));
            prop_assert_eq!(token.to_lowercase(), token.clone());
        }
    }

    #[test]
    fn prop_padding_preserves_content(seqs in prop::collection::vec(prop::collection::vec(1..50u32, 0..6), 1..8)) {
        let padded = pad_sequences(&seqs);
        prop_assert_eq!(padded.ids.len(), padded.rows * padded.width);
        for (row, seq) in seqs.iter().enumerate() {
            let ids = &padded.ids[row * padded.width..(row + 1) * padded.width];
            prop_assert_eq!(&ids[..seq.len()], seq.as_slice());
            prop_assert!(ids[seq.len()..].iter().all(|&id| id == PAD_ID));
            let live = padded.mask[row * padded.width..(row + 1) * padded.width]
                .iter()
                .filter(|&&m| m > 0.0)
                .count();
            prop_assert_eq!(live, seq.len());
        }
    }

    #[test]
    fn prop_batches_are_disjoint(n in 1..200usize, batch_size in 1..32usize, seed in any::<u64>()) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let batches = batch_indices(n, batch_size, &mut rng);
        let mut seen = std::collections::HashSet::new();
        for batch in &batches {
            prop_assert!(batch.len() == batch_size || n < batch_size);
            for &i in batch {
                prop_assert!(i < n);
                prop_assert!(seen.insert(i));
            }
        }
    }

    #[test]
    fn prop_window_is_a_slice_of_words(words in prop::collection::vec(1..100u32, 0..30), size in 1..10usize, seed in any::<u64>()) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let window = review_window(&words, size, &mut rng);
        prop_assert_eq!(window.len(), words.len().min(size));
        if !window.is_empty() {
            prop_assert!(words.windows(window.len()).any(|w| w == window));
        }
    }

    #[test]
    fn prop_negatives_in_range(num_items in 1..50usize, k in 0..20usize, seed in any::<u64>()) {
        let mut sampler = NegativeSampler::new(num_items, seed);
        let negatives = sampler.sample(k, |c| c == 0);
        prop_assert_eq!(negatives.len(), k);
        prop_assert!(negatives.iter().all(|&c| (c as usize) < num_items));
    }

    #[test]
    fn prop_prepared_ids_are_dense(reviews in prop::collection::vec(arb_review(), 1..40)) {
        let Ok(data) = prepare(&reviews, &DataConfig::default()) else {
            return Ok(());
        };
        for interaction in data.train.iter().chain(&data.test) {
            prop_assert!((interaction.user as usize) < data.num_users());
            prop_assert!((interaction.item as usize) < data.num_items());
            prop_assert!((interaction.query as usize) < data.queries.len());
            prop_assert!(interaction.review_words.len() <= DataConfig::default().max_review_words);
            prop_assert!(interaction.review_words.iter().all(|&w| w != PAD_ID && (w as usize) < data.num_words()));
        }
        // one held-out purchase per user at most
        let mut held_out = std::collections::HashSet::new();
        for interaction in &data.test {
            held_out.insert((interaction.user, interaction.item));
        }
        let users: std::collections::HashSet<u32> = held_out.iter().map(|(u, _)| *u).collect();
        prop_assert_eq!(users.len(), held_out.len());

        let graph = SearchGraph::build(&data);
        prop_assert_eq!(graph.num_entities(), data.num_entities());
    }
}
