//! Cross-brain normalization and diversity-capped selection

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::Candidate;

/// Per-brain-batch score normalization
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// (x - min) / (max - min); a flat batch maps to 0.5
    #[default]
    MinMax,
    /// Standard score squashed through a logistic into (0, 1)
    ZScore,
}

impl Normalization {
    pub fn apply(&self, raw: &[f64]) -> Vec<f64> {
        if raw.is_empty() {
            return Vec::new();
        }
        match self {
            Normalization::MinMax => {
                let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
                let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let span = max - min;
                if !span.is_finite() || span < 1e-12 {
                    return vec![0.5; raw.len()];
                }
                raw.iter().map(|x| (x - min) / span).collect()
            }
            Normalization::ZScore => {
                let n = raw.len() as f64;
                let mean = raw.iter().sum::<f64>() / n;
                let var = raw.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                if !std.is_finite() || std < 1e-12 {
                    return vec![0.5; raw.len()];
                }
                raw.iter()
                    .map(|x| 1.0 / (1.0 + (-(x - mean) / std).exp()))
                    .collect()
            }
        }
    }
}

/// Pairwise similarity of two number sets
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// |A ∩ B| / min(|A|, |B|)
    #[default]
    OverlapFraction,
    /// |A ∩ B| / |A ∪ B|
    Jaccard,
}

impl SimilarityMetric {
    /// Both inputs must be sorted ascending
    pub fn similarity(&self, a: &[u8], b: &[u8]) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = sorted_intersection(a, b) as f64;
        match self {
            SimilarityMetric::OverlapFraction => shared / a.len().min(b.len()) as f64,
            SimilarityMetric::Jaccard => shared / ((a.len() + b.len()) as f64 - shared),
        }
    }
}

fn sorted_intersection(a: &[u8], b: &[u8]) -> usize {
    let (mut i, mut j, mut shared) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                shared += 1;
                i += 1;
                j += 1;
            }
        }
    }
    shared
}

/// A candidate with the score trail the hub built for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    /// Brain's own pre-outcome score, kept for audit
    pub raw_score: f64,
    /// Score after per-brain normalization
    pub normalized_score: f64,
    /// Relevance weight of the originating brain this round
    pub relevance: f64,
    /// Blended, noised and consensus-adjusted score used for ranking
    pub final_score: f64,
    /// Number of brains that proposed this exact set
    pub votes: usize,
}

/// Highest final score first; ties go to the more relevant brain, then the
/// lower brain id, then the lexicographically smaller ticket
pub fn rank_order(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then_with(|| b.relevance.total_cmp(&a.relevance))
        .then_with(|| a.candidate.brain_id.cmp(&b.candidate.brain_id))
        .then_with(|| a.candidate.numbers.cmp(&b.candidate.numbers))
}

/// Greedy walk over `ranked` (already in rank order). A candidate is accepted
/// only when its similarity to every accepted one is within `max_similarity`
/// and its brain is under `per_brain_cap`. Returns fewer than `k` rather than
/// loosening either limit.
pub fn select_diverse_top_k(
    ranked: &[RankedCandidate],
    k: usize,
    max_similarity: f64,
    metric: SimilarityMetric,
    per_brain_cap: Option<usize>,
) -> Vec<RankedCandidate> {
    let mut accepted: Vec<RankedCandidate> = Vec::with_capacity(k);
    let mut per_brain: BTreeMap<&str, usize> = BTreeMap::new();

    for entry in ranked {
        if accepted.len() >= k {
            break;
        }
        let brain = entry.candidate.brain_id.as_str();
        if let Some(cap) = per_brain_cap {
            if per_brain.get(brain).copied().unwrap_or(0) >= cap {
                continue;
            }
        }
        let diverse = accepted.iter().all(|kept| {
            metric.similarity(&kept.candidate.numbers, &entry.candidate.numbers) <= max_similarity
        });
        if diverse {
            *per_brain.entry(brain).or_insert(0) += 1;
            accepted.push(entry.clone());
        }
    }
    accepted
}

/// Quota derived from a share of the selection, never below two
pub fn brain_quota(k: usize, share: f64) -> usize {
    ((k as f64 * share).floor() as usize).max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(brain: &str, numbers: Vec<u8>, score: f64) -> RankedCandidate {
        RankedCandidate {
            candidate: Candidate::new(brain, 2, numbers),
            raw_score: score,
            normalized_score: score,
            relevance: 1.0,
            final_score: score,
            votes: 1,
        }
    }

    #[test]
    fn test_minmax_bounds_and_flat_batch() {
        let norm = Normalization::MinMax.apply(&[2.0, 4.0, 6.0]);
        assert_eq!(norm, vec![0.0, 0.5, 1.0]);
        assert_eq!(Normalization::MinMax.apply(&[3.0, 3.0]), vec![0.5, 0.5]);
        assert!(Normalization::MinMax.apply(&[]).is_empty());
    }

    #[test]
    fn test_zscore_is_monotonic_in_unit_interval() {
        let norm = Normalization::ZScore.apply(&[1.0, 2.0, 10.0]);
        assert!(norm.windows(2).all(|w| w[0] < w[1]));
        assert!(norm.iter().all(|&x| x > 0.0 && x < 1.0));
        assert_eq!(Normalization::ZScore.apply(&[7.0]), vec![0.5]);
    }

    #[test]
    fn test_similarity_metrics() {
        let a: Vec<u8> = (1..=15).collect();
        let b: Vec<u8> = (4..=18).collect();
        let overlap = SimilarityMetric::OverlapFraction.similarity(&a, &b);
        assert!((overlap - 12.0 / 15.0).abs() < 1e-12);
        let jaccard = SimilarityMetric::Jaccard.similarity(&a, &b);
        assert!((jaccard - 12.0 / 18.0).abs() < 1e-12);
        assert_eq!(SimilarityMetric::Jaccard.similarity(&a, &a), 1.0);
        assert_eq!(SimilarityMetric::OverlapFraction.similarity(&[], &a), 0.0);
    }

    #[test]
    fn test_near_identical_pool_yields_fewer_than_k() {
        // 66 tickets that all share the numbers 1..=13 with each other
        let mut pool = Vec::new();
        for (i, tail) in (14..=25u8).flat_map(|x| (14..=25u8).map(move |y| (x, y))).enumerate() {
            if tail.0 >= tail.1 {
                continue;
            }
            let mut numbers: Vec<u8> = (1..=13).collect();
            numbers.extend([tail.0, tail.1]);
            pool.push(ranked("b", numbers, 1.0 - i as f64 * 1e-4));
        }
        pool.sort_by(rank_order);

        let picked = select_diverse_top_k(&pool, 10, 0.78, SimilarityMetric::OverlapFraction, None);
        assert!(picked.len() < 10);
        assert_eq!(picked.len(), 1);
        for (i, a) in picked.iter().enumerate() {
            for b in &picked[i + 1..] {
                let sim = SimilarityMetric::OverlapFraction
                    .similarity(&a.candidate.numbers, &b.candidate.numbers);
                assert!(sim <= 0.78);
            }
        }
    }

    #[test]
    fn test_selection_respects_cap_and_quota() {
        let pool = vec![
            ranked("a", (1..=15).collect(), 0.9),
            ranked("a", (11..=25).collect(), 0.8),
            ranked("a", (1..=5).chain(16..=25).collect(), 0.7),
            ranked("b", (1..=8).chain(18..=24).collect(), 0.6),
        ];
        let all = select_diverse_top_k(&pool, 10, 0.78, SimilarityMetric::OverlapFraction, None);
        assert_eq!(all.len(), 3);

        let capped =
            select_diverse_top_k(&pool, 10, 0.78, SimilarityMetric::OverlapFraction, Some(2));
        let from_a = capped.iter().filter(|r| r.candidate.brain_id == "a").count();
        assert_eq!(from_a, 2);
    }

    #[test]
    fn test_tie_break_prefers_relevance_then_brain_id() {
        let mut x = ranked("zeta", (1..=15).collect(), 0.5);
        let mut y = ranked("alpha", (2..=16).collect(), 0.5);
        x.relevance = 1.2;
        y.relevance = 0.9;
        let mut pool = vec![y.clone(), x.clone()];
        pool.sort_by(rank_order);
        assert_eq!(pool[0].candidate.brain_id, "zeta");

        x.relevance = 0.9;
        let mut pool = vec![x, y];
        pool.sort_by(rank_order);
        assert_eq!(pool[0].candidate.brain_id, "alpha");
    }

    #[test]
    fn test_brain_quota_floor() {
        assert_eq!(brain_quota(10, 0.05), 2);
        assert_eq!(brain_quota(40, 0.25), 10);
    }
}
