//! Temporal delay brain - favours numbers that have not been drawn for a while

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::sampling::{core_then_fill, distinct_tickets, rank_by_weight};
use super::{BrainCategory, GenerationBatch, GenerationRequest, TypedBrain};
use crate::error::Result;
use crate::types::{Candidate, Draw, DrawContext, ScoredCandidate};

pub const BRAIN_ID: &str = "temporal_delay";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayState {
    /// Number -> contest it last appeared in
    #[serde(default)]
    pub last_seen: BTreeMap<u8, u64>,
    #[serde(default)]
    pub latest_contest: u64,
}

pub struct DelayBrain;

impl DelayBrain {
    pub fn new() -> Self {
        Self
    }

    /// Contests since each number last appeared, as of contest N. The context
    /// window fills in numbers the state has not seen yet.
    pub fn delays(ctx: &DrawContext, state: &DelayState) -> Vec<(u8, u64)> {
        let mut last_seen = state.last_seen.clone();
        for draw in &ctx.recent {
            for &n in &draw.numbers {
                let slot = last_seen.entry(n).or_insert(0);
                *slot = (*slot).max(draw.contest);
            }
        }
        ctx.universe()
            .into_iter()
            .map(|n| {
                let seen = last_seen.get(&n).copied().unwrap_or(0);
                (n, ctx.contest.saturating_sub(seen))
            })
            .collect()
    }
}

impl Default for DelayBrain {
    fn default() -> Self {
        Self::new()
    }
}

impl TypedBrain for DelayBrain {
    type State = DelayState;

    fn id(&self) -> &str {
        BRAIN_ID
    }

    fn name(&self) -> &str {
        "Temporal delay"
    }

    fn category(&self) -> BrainCategory {
        BrainCategory::Temporal
    }

    fn evaluate_context(&self, _ctx: &DrawContext, state: &Self::State) -> f64 {
        if state.latest_contest > 0 {
            0.85
        } else {
            0.70
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
        let weights: Vec<(u8, f64)> = Self::delays(ctx, state)
            .into_iter()
            .map(|(n, d)| (n, d as f64 + 1.0))
            .collect();
        let universe = weights.len();
        let core_size = (size + 4)
            .max((universe as f64 * 0.6).round() as usize)
            .min(universe);
        let core: Vec<(u8, f64)> = rank_by_weight(&weights)
            .into_iter()
            .take(core_size)
            .filter_map(|n| weights.iter().find(|(m, _)| *m == n).copied())
            .collect();
        let fill: Vec<(u8, f64)> = weights
            .iter()
            .map(|&(n, _)| (n, if core.iter().any(|(c, _)| *c == n) { 1.5 } else { 1.0 }))
            .collect();
        let k_core = ((size as f64 * 0.5).round() as usize).min(size);

        let (tickets, failed_attempts) = distinct_tickets(request.count, rng, |rng| {
            core_then_fill(&core, k_core, &fill, size, rng)
        });
        Ok(GenerationBatch {
            candidates: tickets
                .into_iter()
                .map(|t| Candidate::new(BRAIN_ID, ctx.target_contest, t))
                .collect(),
            failed_attempts,
        })
    }

    /// Mean delay of the candidate's numbers over the universe size
    fn score(&self, candidate: &Candidate, ctx: &DrawContext, state: &Self::State) -> f64 {
        if candidate.numbers.is_empty() {
            return 0.0;
        }
        let delays: BTreeMap<u8, u64> = Self::delays(ctx, state).into_iter().collect();
        let total: u64 = candidate
            .numbers
            .iter()
            .map(|n| delays.get(n).copied().unwrap_or(0))
            .sum();
        total as f64 / (candidate.numbers.len() as f64 * ctx.rules.universe_max as f64)
    }

    fn learn(
        &self,
        state: &mut Self::State,
        _ctx: &DrawContext,
        draw: &Draw,
        _outcomes: &[ScoredCandidate],
    ) {
        for &n in &draw.numbers {
            state.last_seen.insert(n, draw.contest);
        }
        state.latest_contest = state.latest_contest.max(draw.contest);
    }

    fn summary(&self, state: &Self::State) -> serde_json::Value {
        let mut overdue: Vec<(u8, u64)> = state
            .last_seen
            .iter()
            .map(|(&n, &seen)| (n, state.latest_contest.saturating_sub(seen)))
            .collect();
        overdue.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        overdue.truncate(10);
        serde_json::json!({
            "latest_contest": state.latest_contest,
            "most_overdue": overdue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameRules;
    use rand::SeedableRng;

    fn ctx() -> DrawContext {
        let draws = vec![
            Draw::new(8, (1..=15).collect()),
            Draw::new(9, (1..=15).collect()),
            Draw::new(10, (6..=20).collect()),
        ];
        DrawContext::build(10, draws, &GameRules::default())
    }

    #[test]
    fn test_delays_from_window() {
        let delays: BTreeMap<u8, u64> = DelayBrain::delays(&ctx(), &DelayState::default())
            .into_iter()
            .collect();
        assert_eq!(delays[&6], 0);
        assert_eq!(delays[&1], 1);
        // Never seen anywhere: delay runs back to contest 0
        assert_eq!(delays[&25], 10);
    }

    #[test]
    fn test_learn_tracks_last_seen() {
        let mut state = DelayState::default();
        let draw = Draw::new(11, (11..=25).collect());
        TypedBrain::learn(&DelayBrain, &mut state, &ctx(), &draw, &[]);
        assert_eq!(state.last_seen[&25], 11);
        assert_eq!(state.latest_contest, 11);
        assert!(!state.last_seen.contains_key(&1));
    }

    #[test]
    fn test_overdue_numbers_score_higher() {
        let state = DelayState::default();
        let overdue = Candidate::new(BRAIN_ID, 11, (11..=25).collect());
        let fresh = Candidate::new(BRAIN_ID, 11, (6..=20).collect());
        assert!(
            TypedBrain::score(&DelayBrain, &overdue, &ctx(), &state)
                > TypedBrain::score(&DelayBrain, &fresh, &ctx(), &state)
        );
    }

    #[test]
    fn test_generate_valid_tickets() {
        let rules = GameRules::default();
        let mut rng = StdRng::seed_from_u64(8);
        let batch = TypedBrain::generate(
            &DelayBrain,
            &ctx(),
            &DelayState::default(),
            GenerationRequest { size: 16, count: 12 },
            &mut rng,
        )
        .unwrap();
        assert_eq!(batch.candidates.len(), 12);
        assert!(batch.candidates.iter().all(|c| c.is_valid(&rules, 16)));
    }
}
