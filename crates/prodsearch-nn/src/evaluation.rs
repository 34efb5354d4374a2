//! Rank-based evaluation for product search.
//!
//! Each test interaction `(user, item, query)` is scored against every
//! item and the true item's 1-based rank is recorded.
//!
//! # Metrics @k
//!
//! | Metric | Per query | Range |
//! |--------|-----------|-------|
//! | HR | 1 if rank ≤ k | [0, 1] |
//! | MRR | 1/rank if rank ≤ k, else 0 | [0, 1] |
//! | NDCG | 1/log2(rank + 1) if rank ≤ k, else 0 | [0, 1] |
//!
//! # Filtering
//!
//! With `filter_purchased`, the user's other training purchases are
//! removed from the candidate list, mirroring the filtered protocol of
//! link-prediction benchmarks.

use crate::error::Result;
use crate::model::{RankingSnapshot, SearchModel};
use candle_core::Tensor;
use prodsearch_core::sampling::pad_sequences;
use prodsearch_core::{Interaction, PreparedData};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Cutoff (default: 10).
    pub k: usize,
    /// Drop the user's other training purchases from the ranking (default: true).
    pub filter_purchased: bool,
    /// Test queries scored per tensor op (default: 256).
    pub chunk_size: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            k: 10,
            filter_purchased: true,
            chunk_size: 256,
        }
    }
}

impl EvalConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_filter_purchased(mut self, filter: bool) -> Self {
        self.filter_purchased = filter;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Ranking metrics at a cutoff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub k: usize,
    /// Mean reciprocal rank, truncated at k.
    pub mrr: f64,
    /// Hit rate: P(rank ≤ k).
    pub hit_rate: f64,
    /// Normalized discounted cumulative gain (one relevant item).
    pub ndcg: f64,
    /// Number of ranked test queries.
    pub num_queries: usize,
}

impl RankingMetrics {
    /// Zeroed metrics at cutoff `k`.
    pub fn empty(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }

    /// Compute metrics from 1-based ranks.
    pub fn from_ranks(ranks: &[usize], k: usize) -> Self {
        if ranks.is_empty() {
            return Self::empty(k);
        }

        let n = ranks.len() as f64;
        let within = || ranks.iter().copied().filter(|&r| r >= 1 && r <= k);
        let hit_rate = within().count() as f64 / n;
        let mrr = within().map(|r| 1.0 / r as f64).sum::<f64>() / n;
        let ndcg = within().map(|r| 1.0 / (r as f64 + 1.0).log2()).sum::<f64>() / n;

        Self {
            k,
            mrr,
            hit_rate,
            ndcg,
            num_queries: ranks.len(),
        }
    }

    /// Merge metrics from several runs, weighted by query count.
    pub fn merge(metrics: &[Self]) -> Self {
        let k = metrics.first().map_or(0, |m| m.k);
        let total: usize = metrics.iter().map(|m| m.num_queries).sum();
        if total == 0 {
            return Self::empty(k);
        }
        let total_f = total as f64;
        let weighted = |f: fn(&Self) -> f64| {
            metrics
                .iter()
                .map(|m| f(m) * m.num_queries as f64)
                .sum::<f64>()
                / total_f
        };

        Self {
            k,
            mrr: weighted(|m| m.mrr),
            hit_rate: weighted(|m| m.hit_rate),
            ndcg: weighted(|m| m.ndcg),
            num_queries: total,
        }
    }

    /// Format as summary string.
    pub fn summary(&self) -> String {
        format!(
            "MRR@{k}: {:.4} | HR@{k}: {:.4} | NDCG@{k}: {:.4} (n={})",
            self.mrr,
            self.hit_rate,
            self.ndcg,
            self.num_queries,
            k = self.k
        )
    }
}

impl fmt::Display for RankingMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// 1-based rank of `target`: one plus the number of other, non-excluded
/// candidates scoring at least as high.
///
/// Ties count against the target, so a model that scores every item the
/// same ranks the target last.
pub fn rank_of<F: Fn(usize) -> bool>(target: usize, scores: &[f32], is_excluded: F) -> usize {
    let Some(&target_score) = scores.get(target) else {
        return scores.len() + 1;
    };
    1 + scores
        .iter()
        .enumerate()
        .filter(|&(j, &s)| j != target && s >= target_score && !is_excluded(j))
        .count()
}

/// Scores `(rows, num_items)` for a chunk of test interactions.
fn score_chunk(
    model: &dyn SearchModel,
    snapshot: &RankingSnapshot,
    data: &PreparedData,
    chunk: &[Interaction],
) -> Result<Vec<Vec<f32>>> {
    let queries: Vec<&[u32]> = chunk.iter().map(|i| data.query_words(i.query)).collect();
    let mut q = model.encode_queries(&pad_sequences(&queries))?;

    if let Some(users) = &snapshot.users {
        let ids: Vec<u32> = chunk.iter().map(|i| i.user).collect();
        let ids = Tensor::from_vec(ids, chunk.len(), model.device())?;
        q = (q + users.index_select(&ids, 0)?)?;
    }

    let mut scores = q.matmul(&snapshot.items.t()?.contiguous()?)?;
    if let Some(bias) = &snapshot.item_bias {
        scores = scores.broadcast_add(&bias.unsqueeze(0)?)?;
    }
    Ok(scores.to_vec2::<f32>()?)
}

/// 1-based rank of the true item for every test interaction, in
/// `data.test` order.
pub fn query_ranks(
    model: &dyn SearchModel,
    data: &PreparedData,
    config: &EvalConfig,
) -> Result<Vec<usize>> {
    if data.test.is_empty() {
        return Ok(Vec::new());
    }

    let snapshot = model.snapshot()?;
    let mut ranks = Vec::with_capacity(data.test.len());
    for chunk in data.test.chunks(config.chunk_size.max(1)) {
        let scores = score_chunk(model, &snapshot, data, chunk)?;
        for (interaction, row) in chunk.iter().zip(&scores) {
            let purchased = data.purchased(interaction.user);
            let rank = rank_of(interaction.item as usize, row, |j| {
                config.filter_purchased && purchased.is_some_and(|p| p.contains(&(j as u32)))
            });
            ranks.push(rank);
        }
    }
    Ok(ranks)
}

/// Rank every test interaction and aggregate the metrics.
pub fn evaluate(
    model: &dyn SearchModel,
    data: &PreparedData,
    config: &EvalConfig,
) -> Result<RankingMetrics> {
    let ranks = query_ranks(model, data, config)?;
    let metrics = RankingMetrics::from_ranks(&ranks, config.k);
    tracing::debug!(
        queries = metrics.num_queries,
        mrr = metrics.mrr,
        hit_rate = metrics.hit_rate,
        ndcg = metrics.ndcg,
        "evaluated"
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_from_ranks() {
        let metrics = RankingMetrics::from_ranks(&[1, 2, 20], 10);
        assert!(approx(metrics.hit_rate, 2.0 / 3.0));
        assert!(approx(metrics.mrr, (1.0 + 0.5) / 3.0));
        assert!(approx(metrics.ndcg, (1.0 + 1.0 / 3f64.log2()) / 3.0));
        assert_eq!(metrics.num_queries, 3);
    }

    #[test]
    fn test_empty_ranks() {
        let metrics = RankingMetrics::from_ranks(&[], 5);
        assert_eq!(metrics, RankingMetrics::empty(5));
        assert_eq!(metrics.mrr, 0.0);
    }

    #[test]
    fn test_merge_weights_by_queries() {
        let a = RankingMetrics::from_ranks(&[1], 10);
        let b = RankingMetrics::from_ranks(&[20, 20, 20], 10);
        let merged = RankingMetrics::merge(&[a, b]);
        assert_eq!(merged.num_queries, 4);
        assert!(approx(merged.hit_rate, 0.25));
        assert!(approx(merged.mrr, 0.25));
    }

    #[test]
    fn test_rank_of() {
        let scores = [0.1, 0.9, 0.5, 0.5, 0.7];
        // 0.9, 0.7 and the tied 0.5 all count against the target
        assert_eq!(rank_of(2, &scores, |_| false), 4);
        assert_eq!(rank_of(3, &scores, |_| false), 4);
        assert_eq!(rank_of(2, &scores, |j| j == 1), 3);
        assert_eq!(rank_of(1, &scores, |_| false), 1);
    }

    #[test]
    fn test_constant_scores_rank_last() {
        let scores = [0.0f32; 6];
        assert_eq!(rank_of(0, &scores, |_| false), 6);
        assert_eq!(rank_of(4, &scores, |_| false), 6);
        // excluded candidates leave the ranking
        assert_eq!(rank_of(4, &scores, |j| j < 2), 4);
    }

    #[test]
    fn test_rank_of_excluding_target_is_ignored() {
        let scores = [0.3, 0.2];
        assert_eq!(rank_of(1, &scores, |_| true), 1);
        assert_eq!(rank_of(1, &scores, |_| false), 2);
    }

    #[test]
    fn test_untrained_lse_is_not_perfect() {
        use crate::models::{Lse, LseConfig};
        use candle_core::Device;
        use prodsearch_core::{prepare, DataConfig, Review};

        // five users, six purchases each, over ten items
        let mut records = Vec::new();
        for u in 0..5 {
            for t in 0..6 {
                let item = format!("item{}", (u + t) % 10);
                let text = format!("review of {item}");
                records.push(Review::new(format!("user{u}"), item.clone(), text, vec![item], t));
            }
        }
        let data = prepare(&records, &DataConfig::default()).unwrap();
        let model = Lse::new(
            LseConfig::default().with_embedding_size(8),
            data.num_words(),
            data.num_items(),
            &Device::Cpu,
        )
        .unwrap();

        // zero items and biases tie every score
        let eval = EvalConfig::default().with_k(1);
        let ranks = query_ranks(&model, &data, &eval).unwrap();
        assert_eq!(ranks.len(), 5);
        assert!(ranks.iter().all(|&r| r > 1));
        let metrics = evaluate(&model, &data, &eval).unwrap();
        assert_eq!(metrics.mrr, 0.0);
        assert_eq!(metrics.hit_rate, 0.0);
    }

    #[test]
    fn test_summary_format() {
        let metrics = RankingMetrics::from_ranks(&[1], 10);
        assert_eq!(
            metrics.summary(),
            "MRR@10: 1.0000 | HR@10: 1.0000 | NDCG@10: 1.0000 (n=1)"
        );
    }
}
