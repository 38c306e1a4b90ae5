//! Frequency brains
//!
//! `stat_freq_global` keeps a running count of every realized draw it has
//! learned from. `stat_freq_recent` holds no counts of its own and weights
//! numbers by their frequency in the round's context window.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::sampling::{core_then_fill, distinct_tickets, rank_by_weight};
use super::{BrainCategory, GenerationBatch, GenerationRequest, TypedBrain};
use crate::error::Result;
use crate::types::{Candidate, Draw, DrawContext, ScoredCandidate};

pub const GLOBAL_BRAIN_ID: &str = "stat_freq_global";
pub const RECENT_BRAIN_ID: &str = "stat_freq_recent";

/// Reinforcement per number of a candidate that reached the top tier
const TOP_BONUS: f64 = 0.25;
/// Reinforcement when the candidate covered the whole draw
const FULL_BONUS: f64 = 0.50;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalFrequencyState {
    /// Number -> accumulated weight (draw appearances plus bonuses)
    #[serde(default)]
    pub freq: BTreeMap<u8, f64>,
    #[serde(default)]
    pub draws_seen: u64,
}

impl GlobalFrequencyState {
    fn weight(&self, number: u8) -> f64 {
        self.freq.get(&number).copied().unwrap_or(0.0)
    }
}

pub struct GlobalFrequencyBrain;

impl GlobalFrequencyBrain {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GlobalFrequencyBrain {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean of per-number weights scaled by the largest weight
fn mean_relative(numbers: &[u8], weight: impl Fn(u8) -> f64, max_weight: f64) -> f64 {
    if numbers.is_empty() || max_weight <= 0.0 {
        return 0.0;
    }
    numbers.iter().map(|&n| weight(n) / max_weight).sum::<f64>() / numbers.len() as f64
}

impl TypedBrain for GlobalFrequencyBrain {
    type State = GlobalFrequencyState;

    fn id(&self) -> &str {
        GLOBAL_BRAIN_ID
    }

    fn name(&self) -> &str {
        "Global frequency"
    }

    fn category(&self) -> BrainCategory {
        BrainCategory::Statistical
    }

    fn evaluate_context(&self, _ctx: &DrawContext, state: &Self::State) -> f64 {
        if state.draws_seen > 0 {
            1.0
        } else {
            0.6
        }
    }

    fn generate(
        &self,
        ctx: &DrawContext,
        state: &Self::State,
        request: GenerationRequest,
        rng: &mut StdRng,
    ) -> Result<GenerationBatch> {
        let size = request.size;
        let weights: Vec<(u8, f64)> = ctx
            .universe()
            .into_iter()
            .map(|n| (n, state.weight(n) + 1.0))
            .collect();

        let core_size = if size <= ctx.rules.draw_size {
            size + 3
        } else {
            size + 4
        }
        .min(weights.len());
        let core_share = if size <= ctx.rules.draw_size { 0.70 } else { 0.65 };
        let ranked = rank_by_weight(&weights);
        let core: Vec<(u8, f64)> = ranked
            .iter()
            .take(core_size)
            .filter_map(|n| weights.iter().find(|(m, _)| m == n).copied())
            .collect();
        let flattened: Vec<(u8, f64)> = weights.iter().map(|&(n, w)| (n, w.powf(0.70))).collect();
        let k_core = ((size as f64 * core_share).round() as usize).min(size);

        let (tickets, failed_attempts) = distinct_tickets(request.count, rng, |rng| {
            core_then_fill(&core, k_core, &flattened, size, rng)
        });
        Ok(GenerationBatch {
            candidates: tickets
                .into_iter()
                .map(|t| Candidate::new(GLOBAL_BRAIN_ID, ctx.target_contest, t))
                .collect(),
            failed_attempts,
        })
    }

    fn score(&self, candidate: &Candidate, _ctx: &DrawContext, state: &Self::State) -> f64 {
        let max = state.freq.values().copied().fold(0.0, f64::max);
        mean_relative(&candidate.numbers, |n| state.weight(n), max)
    }

    fn learn(
        &self,
        state: &mut Self::State,
        ctx: &DrawContext,
        draw: &Draw,
        outcomes: &[ScoredCandidate],
    ) {
        for &n in &draw.numbers {
            *state.freq.entry(n).or_insert(0.0) += 1.0;
        }
        state.draws_seen += 1;

        // Light reinforcement only; it must not dominate the draw counts
        for outcome in outcomes {
            let hits = outcome.score.hits;
            if hits < ctx.rules.top_threshold {
                continue;
            }
            let bonus = if hits >= ctx.rules.draw_size {
                FULL_BONUS
            } else {
                TOP_BONUS
            };
            for &n in &outcome.candidate.numbers {
                *state.freq.entry(n).or_insert(0.0) += bonus;
            }
        }
    }

    fn summary(&self, state: &Self::State) -> serde_json::Value {
        let weights: Vec<(u8, f64)> = state.freq.iter().map(|(&n, &w)| (n, w)).collect();
        let ranked = rank_by_weight(&weights);
        let bottom: Vec<u8> = ranked.iter().rev().take(10).copied().collect();
        serde_json::json!({
            "draws_seen": state.draws_seen,
            "top10": ranked.iter().take(10).collect::<Vec<_>>(),
            "bottom10": bottom,
        })
    }
}

/// Round counter only; frequencies come from the context window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecentFrequencyState {
    #[serde(default)]
    pub rounds_seen: u64,
}

pub struct RecentFrequencyBrain;

impl RecentFrequencyBrain {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RecentFrequencyBrain {
    fn default() -> Self {
        Self::new()
    }
}

impl TypedBrain for RecentFrequencyBrain {
    type State = RecentFrequencyState;

    fn id(&self) -> &str {
        RECENT_BRAIN_ID
    }

    fn name(&self) -> &str {
        "Recent frequency"
    }

    fn category(&self) -> BrainCategory {
        BrainCategory::Statistical
    }

    /// More trustworthy as the context window fills up
    fn evaluate_context(&self, ctx: &DrawContext, _state: &Self::State) -> f64 {
        if ctx.recent.is_empty() {
            return 0.55;
        }
        let fill = ctx.recent.len() as f64 / 120.0;
        0.70 + 0.30 * fill.min(1.0)
    }

    fn generate(
        &self,
        ctx: &DrawContext,
        _state: &Self::State,
        request: GenerationRequest,
        rng: &mut StdRng,
    ) -> Result<GenerationBatch> {
        let size = request.size;
        let weights: Vec<(u8, f64)> = ctx
            .universe()
            .into_iter()
            .map(|n| (n, ctx.frequency_of(n) as f64 + 1.0))
            .collect();
        let core_size = (size + 1).min(weights.len());
        let ranked = rank_by_weight(&weights);
        let core: Vec<(u8, f64)> = ranked
            .iter()
            .take(core_size)
            .map(|&n| (n, ctx.frequency_of(n) as f64 + 1.0))
            .collect();
        // Remaining slots lean towards the core without excluding anything
        let fill: Vec<(u8, f64)> = weights
            .iter()
            .map(|&(n, _)| (n, if core.iter().any(|(c, _)| *c == n) { 1.85 } else { 1.0 }))
            .collect();
        let k_core = ((size as f64 * 0.60).round() as usize).min(size);

        let (tickets, failed_attempts) = distinct_tickets(request.count, rng, |rng| {
            core_then_fill(&core, k_core, &fill, size, rng)
        });
        Ok(GenerationBatch {
            candidates: tickets
                .into_iter()
                .map(|t| Candidate::new(RECENT_BRAIN_ID, ctx.target_contest, t))
                .collect(),
            failed_attempts,
        })
    }

    fn score(&self, candidate: &Candidate, ctx: &DrawContext, _state: &Self::State) -> f64 {
        let max = ctx.frequency.iter().copied().max().unwrap_or(0) as f64;
        if max <= 0.0 {
            return 0.1;
        }
        mean_relative(&candidate.numbers, |n| ctx.frequency_of(n) as f64, max)
    }

    fn learn(
        &self,
        state: &mut Self::State,
        _ctx: &DrawContext,
        _draw: &Draw,
        _outcomes: &[ScoredCandidate],
    ) {
        state.rounds_seen += 1;
    }

    fn summary(&self, state: &Self::State) -> serde_json::Value {
        serde_json::json!({ "rounds_seen": state.rounds_seen })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameRules;
    use crate::types::{Score, ScoreTag};
    use rand::SeedableRng;

    fn ctx() -> DrawContext {
        let draws = vec![
            Draw::new(1, (1..=15).collect()),
            Draw::new(2, (1..=15).collect()),
            Draw::new(3, (6..=20).collect()),
        ];
        DrawContext::build(3, draws, &GameRules::default())
    }

    #[test]
    fn test_global_learns_from_realized_draw() {
        let brain = GlobalFrequencyBrain::new();
        let mut state = GlobalFrequencyState::default();
        let draw = Draw::new(4, (11..=25).collect());
        TypedBrain::learn(&brain, &mut state, &ctx(), &draw, &[]);

        assert_eq!(state.draws_seen, 1);
        assert_eq!(state.weight(11), 1.0);
        assert_eq!(state.weight(1), 0.0);
    }

    #[test]
    fn test_global_reinforces_top_candidates() {
        let brain = GlobalFrequencyBrain::new();
        let mut state = GlobalFrequencyState::default();
        let draw = Draw::new(4, (1..=15).collect());
        let top = ScoredCandidate {
            candidate: Candidate::new(GLOBAL_BRAIN_ID, 4, (1..=14).chain([25]).collect()),
            score: Score {
                hits: 14,
                value: 14.0,
                tag: ScoreTag::Top,
            },
        };
        TypedBrain::learn(&brain, &mut state, &ctx(), &draw, &[top]);

        assert_eq!(state.weight(1), 1.0 + TOP_BONUS);
        assert_eq!(state.weight(25), TOP_BONUS);
        assert_eq!(state.weight(15), 1.0);
    }

    #[test]
    fn test_generated_tickets_are_valid() {
        let rules = GameRules::default();
        let mut state = GlobalFrequencyState::default();
        for n in 1..=10u8 {
            state.freq.insert(n, 50.0);
        }
        let mut rng = StdRng::seed_from_u64(21);
        for size in [15usize, 18] {
            let request = GenerationRequest { size, count: 25 };
            let global = TypedBrain::generate(&GlobalFrequencyBrain, &ctx(), &state, request, &mut rng)
                .unwrap();
            let recent = TypedBrain::generate(
                &RecentFrequencyBrain,
                &ctx(),
                &RecentFrequencyState::default(),
                request,
                &mut rng,
            )
            .unwrap();
            assert_eq!(global.candidates.len(), 25);
            for c in global.candidates.iter().chain(recent.candidates.iter()) {
                assert!(c.is_valid(&rules, size), "{:?}", c.numbers);
            }
        }
    }

    #[test]
    fn test_recent_score_prefers_frequent_numbers() {
        let brain = RecentFrequencyBrain;
        let state = RecentFrequencyState::default();
        let hot = Candidate::new(RECENT_BRAIN_ID, 4, (6..=20).collect());
        let cold = Candidate::new(RECENT_BRAIN_ID, 4, (11..=25).collect());
        assert!(
            TypedBrain::score(&brain, &hot, &ctx(), &state)
                > TypedBrain::score(&brain, &cold, &ctx(), &state)
        );
    }
}
