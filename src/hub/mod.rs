//! BrainHub - runs one round across every enabled brain
//!
//! A round is: weigh each brain's relevance, fan generation out to a blocking
//! worker per brain (bounded by a time budget), join, normalize scores per
//! brain batch, blend, add seeded exploration noise, rank, then pick a
//! diversity-capped top-k per requested size. Learning happens later, once
//! the real outcome is known, and only produces values; persisting them is
//! the caller's job.

pub mod selection;

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::brain::sampling::seeded_rng;
use crate::brain::{Brain, BrainRegistry, BrainState, GenerationRequest};
use crate::config::{EngineConfig, RoundConfig};
use crate::error::{EngineError, Result};
use crate::scorer::Scorer;
use crate::types::{
    BrainPerformance, Candidate, Draw, DrawContext, Score, ScoredCandidate, StrongGameMemory,
};

pub use selection::{
    brain_quota, rank_order, select_diverse_top_k, Normalization, RankedCandidate,
    SimilarityMetric,
};

/// Meta weight bounds applied on top of a brain's prior relevance
const META_MIN: f64 = 0.85;
const META_MAX: f64 = 1.25;

/// Why a brain sat out (part of) a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The generator returned an error
    Error,
    /// Exceeded the per-brain time budget
    Timeout,
    /// The worker panicked
    Panicked,
    /// Ran but produced no valid candidate
    Empty,
}

/// Absorbed brain-local failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainFailure {
    pub brain_id: String,
    pub size: usize,
    pub kind: FailureKind,
    pub reason: String,
}

/// What one brain produced for one size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainBatch {
    pub brain_id: String,
    pub size: usize,
    pub candidates: Vec<Candidate>,
    /// Pre-outcome scores, aligned with `candidates`
    pub raw_scores: Vec<f64>,
    pub failed_attempts: u32,
}

/// Final pick for one candidate size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeSelection {
    pub size: usize,
    /// Pool size after ranking and top-n truncation
    pub pool_size: usize,
    pub selected: Vec<RankedCandidate>,
}

/// Everything a round produced before the outcome is known
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round_id: Uuid,
    pub contest: u64,
    pub target_contest: u64,
    pub relevance: BTreeMap<String, f64>,
    pub batches: Vec<BrainBatch>,
    pub selections: Vec<SizeSelection>,
    pub failures: Vec<BrainFailure>,
}

impl RoundOutcome {
    pub fn candidates_generated(&self) -> usize {
        self.batches.iter().map(|b| b.candidates.len()).sum()
    }

    /// Brains that contributed at least one candidate
    pub fn contributing_brains(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.batches.iter().map(|b| b.brain_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// A selected candidate once the real outcome is known
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedOutcome {
    pub ranked: RankedCandidate,
    pub score: Score,
}

/// Results of learning from one round. Nothing here is persisted yet.
#[derive(Debug, Clone)]
pub struct LearningUpdate {
    pub contest: u64,
    pub states: Vec<BrainState>,
    pub performance: Vec<BrainPerformance>,
    pub memories: Vec<StrongGameMemory>,
    pub selected: Vec<SelectedOutcome>,
}

enum Generated {
    Ok(BrainBatch),
    Failed(BrainFailure),
}

pub struct BrainHub {
    config: Arc<EngineConfig>,
    scorer: Scorer,
}

impl BrainHub {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let scorer = Scorer::new(config.rules.clone()).with_curve(config.hub.score_curve);
        Ok(Self {
            config: Arc::new(config),
            scorer,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Prior relevance scaled by a performance meta weight in [0.85, 1.25],
    /// then held inside [relevance_floor, relevance_ceiling] so brains with no
    /// record keep a non-zero share
    pub fn relevance(
        &self,
        brain: &dyn Brain,
        state: &BrainState,
        ctx: &DrawContext,
        history: &[BrainPerformance],
    ) -> f64 {
        let hub = &self.config.hub;
        let prior = brain.evaluate_context(ctx, state);
        let meta = self.meta_weight(brain.id(), history);
        (prior * meta).clamp(hub.relevance_floor, hub.relevance_ceiling)
    }

    /// 1.0 with no history; grows with mean hits and high-tier hit rates
    pub fn meta_weight(&self, brain_id: &str, history: &[BrainPerformance]) -> f64 {
        let rules = &self.config.rules;
        let mut rows: Vec<&BrainPerformance> =
            history.iter().filter(|p| p.brain_id == brain_id).collect();
        if rows.is_empty() {
            return 1.0;
        }
        rows.sort_by_key(|p| std::cmp::Reverse(p.contest));
        rows.truncate(self.config.hub.relevance_window);

        let uses: f64 = rows.iter().map(|p| p.candidates_generated as f64).sum();
        if uses <= 0.0 {
            return 1.0;
        }
        let hits: f64 = rows
            .iter()
            .map(|p| p.mean_hits * p.candidates_generated as f64)
            .sum();
        let top: f64 = rows.iter().map(|p| p.top_hits as f64).sum();
        let full: f64 = rows
            .iter()
            .map(|p| {
                p.tier_counts
                    .get(&(rules.draw_size as u32))
                    .copied()
                    .unwrap_or(0) as f64
            })
            .sum();

        let mean = hits / uses;
        let bonus = (top * 0.6 + full * 1.2) / uses;
        let weight = 1.0 + (mean / rules.draw_size as f64) * 0.15 + bonus * 0.25;
        weight.clamp(META_MIN, META_MAX)
    }

    /// Fan generation out to every participant for one size and join.
    /// Failed, slow or empty brains come back as `BrainFailure`.
    pub async fn collect_candidates(
        &self,
        ctx: &Arc<DrawContext>,
        participants: &[(Arc<dyn Brain>, BrainState)],
        size: usize,
        per_brain_budget: usize,
    ) -> (Vec<BrainBatch>, Vec<BrainFailure>) {
        let budget = Duration::from_millis(self.config.hub.brain_time_budget_ms);
        let seed = self.config.hub.seed;

        let jobs = participants.iter().map(|(brain, state)| {
            let brain = Arc::clone(brain);
            let state = state.clone();
            let ctx = Arc::clone(ctx);
            let brain_id = brain.id().to_string();
            async move {
                let request = GenerationRequest {
                    size,
                    count: per_brain_budget,
                };
                let worker = tokio::task::spawn_blocking(move || {
                    let mut rng = seeded_rng(seed, ctx.contest, brain.id(), size);
                    let batch = brain.generate(&ctx, &state, request, &mut rng)?;
                    let scores = brain.score_batch(&batch.candidates, &ctx, &state);
                    Ok::<_, EngineError>((batch, scores))
                });
                let failure = |kind, reason: String| {
                    Generated::Failed(BrainFailure {
                        brain_id: brain_id.clone(),
                        size,
                        kind,
                        reason,
                    })
                };
                // A timed-out worker is left to finish on its own; its result is dropped
                match tokio::time::timeout(budget, worker).await {
                    Err(_) => failure(
                        FailureKind::Timeout,
                        format!("exceeded {} ms", budget.as_millis()),
                    ),
                    Ok(Err(join_err)) => failure(FailureKind::Panicked, join_err.to_string()),
                    Ok(Ok(Err(e))) => failure(FailureKind::Error, e.to_string()),
                    Ok(Ok(Ok((batch, scores)))) => {
                        Generated::Ok(BrainBatch {
                            brain_id: brain_id.clone(),
                            size,
                            candidates: batch.candidates,
                            raw_scores: scores,
                            failed_attempts: batch.failed_attempts,
                        })
                    }
                }
            }
        });

        let mut batches = Vec::new();
        let mut failures = Vec::new();
        for generated in join_all(jobs).await {
            match generated {
                Generated::Ok(batch) => match self.validate_batch(ctx, batch) {
                    Ok(batch) => batches.push(batch),
                    Err(failure) => failures.push(failure),
                },
                Generated::Failed(failure) => failures.push(failure),
            }
        }

        for failure in &failures {
            warn!(
                brain_id = %failure.brain_id,
                size = failure.size,
                "Brain skipped ({:?}): {}",
                failure.kind,
                failure.reason
            );
        }
        (batches, failures)
    }

    /// Drop candidates that break the candidate invariants; an emptied batch
    /// becomes a failure
    fn validate_batch(
        &self,
        ctx: &DrawContext,
        mut batch: BrainBatch,
    ) -> std::result::Result<BrainBatch, BrainFailure> {
        let rules = &self.config.rules;
        let before = batch.candidates.len();
        let mut kept = Vec::with_capacity(before);
        let mut scores = Vec::with_capacity(before);
        for (i, candidate) in batch.candidates.into_iter().enumerate() {
            let valid = candidate.is_valid(rules, batch.size)
                && candidate.brain_id == batch.brain_id
                && candidate.target_contest == ctx.target_contest;
            if valid {
                scores.push(batch.raw_scores.get(i).copied().unwrap_or(0.0));
                kept.push(candidate);
            }
        }
        let dropped = before - kept.len();
        if dropped > 0 {
            debug!(brain_id = %batch.brain_id, "Dropped {} invalid candidates", dropped);
            batch.failed_attempts += dropped as u32;
        }
        if kept.is_empty() {
            return Err(BrainFailure {
                brain_id: batch.brain_id,
                size: batch.size,
                kind: FailureKind::Empty,
                reason: format!("no valid candidate ({} failed attempts)", batch.failed_attempts),
            });
        }
        batch.candidates = kept;
        batch.raw_scores = scores;
        Ok(batch)
    }

    /// Normalize each brain batch on its own, blend with relevance, add
    /// exploration noise and the consensus bonus. Returned in rank order.
    pub fn normalize_scores(
        &self,
        contest: u64,
        size: usize,
        batches: &[BrainBatch],
        relevance: &BTreeMap<String, f64>,
    ) -> Vec<RankedCandidate> {
        let hub = &self.config.hub;
        let blend = self.config.relevance_blend();
        let exploration = self.config.exploration_rate();
        let mut rng = seeded_rng(hub.seed, contest, "hub", size);

        let mut votes: BTreeMap<&[u8], Vec<&str>> = BTreeMap::new();
        for batch in batches {
            for c in &batch.candidates {
                let voters = votes.entry(c.numbers.as_slice()).or_default();
                if !voters.contains(&batch.brain_id.as_str()) {
                    voters.push(batch.brain_id.as_str());
                }
            }
        }

        let mut ranked = Vec::new();
        for batch in batches.iter().filter(|b| b.size == size) {
            let normalized = hub.normalization.apply(&batch.raw_scores);
            let rel = relevance.get(&batch.brain_id).copied().unwrap_or(hub.relevance_floor);
            for (i, candidate) in batch.candidates.iter().enumerate() {
                let norm = normalized.get(i).copied().unwrap_or(0.5);
                let combined = norm * (1.0 - blend) + rel * blend;
                let noise = if exploration > 0.0 {
                    rng.gen_range(0.0..=exploration)
                } else {
                    0.0
                };
                let mut score = combined * (1.0 - exploration) + noise;
                let n_votes = votes
                    .get(candidate.numbers.as_slice())
                    .map(Vec::len)
                    .unwrap_or(1);
                if hub.consensus_enabled && n_votes >= hub.consensus_min_votes {
                    score += hub.consensus_bonus;
                }
                ranked.push(RankedCandidate {
                    candidate: candidate.clone(),
                    raw_score: batch.raw_scores.get(i).copied().unwrap_or(0.0),
                    normalized_score: norm,
                    relevance: rel,
                    final_score: score,
                    votes: n_votes,
                });
            }
        }

        ranked.sort_by(rank_order);
        // Identical tickets from several brains keep their best-ranked copy
        let mut seen = std::collections::BTreeSet::new();
        ranked.retain(|r| seen.insert(r.candidate.numbers.clone()));
        ranked
    }

    /// Generate, rank and select for every configured size
    pub async fn run_round(
        &self,
        ctx: Arc<DrawContext>,
        registry: &BrainRegistry,
        history: &[BrainPerformance],
    ) -> Result<RoundOutcome> {
        self.run_round_with(ctx, registry, history, &self.config.round)
            .await
    }

    /// `run_round` with an explicit round shape (backtests vary it per block)
    pub async fn run_round_with(
        &self,
        ctx: Arc<DrawContext>,
        registry: &BrainRegistry,
        history: &[BrainPerformance],
        round: &RoundConfig,
    ) -> Result<RoundOutcome> {
        round.validate(&self.config.rules)?;
        let participants = registry.participants();
        let relevance: BTreeMap<String, f64> = participants
            .iter()
            .map(|(brain, state)| {
                (
                    brain.id().to_string(),
                    self.relevance(brain.as_ref(), state, &ctx, history),
                )
            })
            .collect();
        debug!(contest = ctx.contest, "Relevance: {:?}", relevance);

        let mut batches = Vec::new();
        let mut failures = Vec::new();
        for &size in &round.sizes {
            let (mut got, mut failed) = self
                .collect_candidates(&ctx, &participants, size, round.effective_budget())
                .await;
            batches.append(&mut got);
            failures.append(&mut failed);
        }

        if batches.is_empty() {
            return Err(EngineError::EmptyRound {
                contest: ctx.contest,
            });
        }

        let max_similarity = round.effective_max_similarity();
        let quota = round
            .max_brain_share
            .map(|share| brain_quota(round.quantity_per_size, share));
        let mut selections = Vec::with_capacity(round.sizes.len());
        for &size in &round.sizes {
            let mut ranked = self.normalize_scores(ctx.contest, size, &batches, &relevance);
            ranked.truncate(round.top_n);
            let selected = select_diverse_top_k(
                &ranked,
                round.quantity_per_size,
                max_similarity,
                self.config.hub.similarity,
                quota,
            );
            if selected.len() < round.quantity_per_size {
                debug!(
                    contest = ctx.contest,
                    size,
                    "Selected {} of {} requested under similarity cap {}",
                    selected.len(),
                    round.quantity_per_size,
                    max_similarity
                );
            }
            selections.push(SizeSelection {
                size,
                pool_size: ranked.len(),
                selected,
            });
        }

        let outcome = RoundOutcome {
            round_id: Uuid::new_v4(),
            contest: ctx.contest,
            target_contest: ctx.target_contest,
            relevance,
            batches,
            selections,
            failures,
        };
        info!(
            contest = outcome.contest,
            "Round generated {} candidates from {} brains ({} failures)",
            outcome.candidates_generated(),
            outcome.contributing_brains().len(),
            outcome.failures.len()
        );
        Ok(outcome)
    }

    /// Score every generated candidate against the realized draw and let each
    /// contributing brain fold the outcome into a new state
    pub fn update_learning(
        &self,
        registry: &BrainRegistry,
        ctx: &DrawContext,
        outcome: &RoundOutcome,
        draw: &Draw,
        run_tag: &str,
    ) -> Result<LearningUpdate> {
        if draw.contest != outcome.target_contest {
            return Err(EngineError::DrawNotFound(outcome.target_contest));
        }
        let rules = &self.config.rules;

        let mut by_brain: BTreeMap<&str, Vec<ScoredCandidate>> = BTreeMap::new();
        for batch in &outcome.batches {
            by_brain
                .entry(batch.brain_id.as_str())
                .or_default()
                .extend(self.scorer.score_all(&batch.candidates, draw));
        }

        let mut states = Vec::new();
        let mut performance = Vec::new();
        for (brain_id, scored) in &by_brain {
            let (Some(brain), Some(state)) = (registry.get(brain_id), registry.state(brain_id))
            else {
                continue;
            };
            // A brain that fails to learn gets no performance row either
            match brain.learn(state.clone(), ctx, draw, scored) {
                Ok(next) => {
                    states.push(next);
                    performance.push(BrainPerformance::from_scored(
                        brain_id,
                        outcome.contest,
                        scored,
                        rules,
                    ));
                }
                Err(e) => warn!(brain_id = %brain_id, "Learning skipped: {}", e),
            }
        }

        let mut selected = Vec::new();
        let mut memories = Vec::new();
        for selection in &outcome.selections {
            for ranked in &selection.selected {
                let score = self.scorer.score(&ranked.candidate, draw);
                if score.hits >= rules.memory_min_hits {
                    memories.push(StrongGameMemory {
                        contest: outcome.contest,
                        target_contest: outcome.target_contest,
                        size: ranked.candidate.size(),
                        numbers: ranked.candidate.numbers.clone(),
                        hits: score.hits,
                        weight: 1.0 + (score.hits - rules.memory_min_hits) as f64 * 0.25,
                        origin: format!("{}:{}", run_tag, ranked.candidate.brain_id),
                        created_at: Utc::now(),
                    });
                }
                selected.push(SelectedOutcome {
                    ranked: ranked.clone(),
                    score,
                });
            }
        }

        Ok(LearningUpdate {
            contest: outcome.contest,
            states,
            performance,
            memories,
            selected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameRules;

    fn hub() -> BrainHub {
        BrainHub::new(EngineConfig::default()).unwrap()
    }

    fn perf(brain: &str, contest: u64, mean_hits: f64, top: u32) -> BrainPerformance {
        BrainPerformance {
            brain_id: brain.to_string(),
            contest,
            candidates_generated: 10,
            mean_hits,
            mean_score: mean_hits,
            max_hits: 14,
            top_hits: top,
            strong_hits: top,
            tier_counts: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_meta_weight_bounds() {
        let hub = hub();
        assert_eq!(hub.meta_weight("x", &[]), 1.0);

        let poor = vec![perf("x", 1, 0.0, 0)];
        assert!(hub.meta_weight("x", &poor) >= META_MIN);

        let great = vec![perf("x", 1, 15.0, 10), perf("x", 2, 15.0, 10)];
        assert_eq!(hub.meta_weight("x", &great), META_MAX);

        let good = vec![perf("x", 1, 11.0, 1)];
        let mid = hub.meta_weight("x", &good);
        assert!(mid > 1.0 && mid < META_MAX);
    }

    #[test]
    fn test_normalize_scores_per_brain() {
        let hub = BrainHub::new(EngineConfig {
            hub: crate::config::HubConfig {
                exploration_rate: Some(0.0),
                relevance_blend: Some(0.0),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        // Brain b scores on a scale 100x larger; normalization removes that
        let batches = vec![
            BrainBatch {
                brain_id: "a".into(),
                size: 15,
                candidates: vec![
                    Candidate::new("a", 2, (1..=15).collect()),
                    Candidate::new("a", 2, (2..=16).collect()),
                ],
                raw_scores: vec![0.1, 0.2],
                failed_attempts: 0,
            },
            BrainBatch {
                brain_id: "b".into(),
                size: 15,
                candidates: vec![
                    Candidate::new("b", 2, (11..=25).collect()),
                    Candidate::new("b", 2, (10..=24).collect()),
                ],
                raw_scores: vec![10.0, 20.0],
                failed_attempts: 0,
            },
        ];
        let relevance = BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 0.5)]);
        let ranked = hub.normalize_scores(1, 15, &batches, &relevance);

        assert_eq!(ranked.len(), 4);
        // Top two both normalized to 1.0; tie goes to the more relevant brain
        assert_eq!(ranked[0].candidate.brain_id, "a");
        assert_eq!(ranked[0].normalized_score, 1.0);
        assert_eq!(ranked[1].candidate.brain_id, "b");
        assert_eq!(ranked[1].raw_score, 20.0);
    }

    #[test]
    fn test_consensus_bonus_and_dedup() {
        let hub = BrainHub::new(EngineConfig {
            hub: crate::config::HubConfig {
                exploration_rate: Some(0.0),
                consensus_enabled: true,
                consensus_bonus: 0.5,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let shared: Vec<u8> = (1..=15).collect();
        let batches = vec![
            BrainBatch {
                brain_id: "a".into(),
                size: 15,
                candidates: vec![
                    Candidate::new("a", 2, shared.clone()),
                    Candidate::new("a", 2, (5..=19).collect()),
                ],
                raw_scores: vec![0.0, 1.0],
                failed_attempts: 0,
            },
            BrainBatch {
                brain_id: "b".into(),
                size: 15,
                candidates: vec![Candidate::new("b", 2, shared.clone())],
                raw_scores: vec![0.3],
                failed_attempts: 0,
            },
        ];
        let relevance = BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 1.0)]);
        let ranked = hub.normalize_scores(1, 15, &batches, &relevance);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].candidate.numbers, shared);
        assert_eq!(ranked[0].votes, 2);
    }

    #[test]
    fn test_memory_weight_and_origin() {
        let hub = hub();
        let mut registry = BrainRegistry::new();
        registry.register(Arc::new(crate::brain::DelayBrain::new()), true);
        let rules = GameRules::default();
        let ctx = DrawContext::build(1, vec![Draw::new(1, (1..=15).collect())], &rules);
        let draw = Draw::new(2, (1..=15).collect());
        let top = Candidate::new("temporal_delay", 2, (1..=14).chain([20]).collect());
        let outcome = RoundOutcome {
            round_id: Uuid::new_v4(),
            contest: 1,
            target_contest: 2,
            relevance: BTreeMap::new(),
            batches: vec![BrainBatch {
                brain_id: "temporal_delay".into(),
                size: 15,
                candidates: vec![top.clone()],
                raw_scores: vec![0.5],
                failed_attempts: 0,
            }],
            selections: vec![SizeSelection {
                size: 15,
                pool_size: 1,
                selected: vec![RankedCandidate {
                    candidate: top,
                    raw_score: 0.5,
                    normalized_score: 0.5,
                    relevance: 1.0,
                    final_score: 0.5,
                    votes: 1,
                }],
            }],
            failures: vec![],
        };

        let update = hub
            .update_learning(&registry, &ctx, &outcome, &draw, "trainer")
            .unwrap();
        assert_eq!(update.states.len(), 1);
        assert_eq!(update.states[0].as_of, Some(1));
        assert_eq!(update.performance[0].top_hits, 1);
        assert_eq!(update.memories.len(), 1);
        assert_eq!(update.memories[0].weight, 1.25);
        assert_eq!(update.memories[0].origin, "trainer:temporal_delay");

        let wrong_draw = Draw::new(3, (1..=15).collect());
        assert!(hub
            .update_learning(&registry, &ctx, &outcome, &wrong_draw, "trainer")
            .is_err());

        // A state that no longer decodes: no new state and no performance row
        registry.set_state(BrainState::new(
            "temporal_delay",
            serde_json::json!("not a state"),
        ));
        let update = hub
            .update_learning(&registry, &ctx, &outcome, &draw, "trainer")
            .unwrap();
        assert!(update.states.is_empty());
        assert!(update.performance.is_empty());
        assert_eq!(update.selected.len(), 1);
    }
}
