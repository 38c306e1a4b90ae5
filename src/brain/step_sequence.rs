//! Step-sequence brain
//!
//! Builds a candidate by walking a delta pattern around the number wheel:
//! pick a start, pick a base pattern (weighted by what it has hit before),
//! stretch it to the requested size, optionally jitter a few steps, and
//! accumulate. Collisions escape to the next free number within a bounded
//! attempt budget.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{BrainCategory, GenerationBatch, GenerationRequest, TypedBrain};
use crate::config::{StepSequenceConfig, WrapMode};
use crate::error::{EngineError, Result};
use crate::types::{Candidate, Draw, DrawContext, ScoredCandidate};

pub const BRAIN_ID: &str = "heur_step_sequences";

/// Base delta patterns, 14 steps each (15 numbers on the 25 wheel)
pub const BASE_PATTERNS: [(&str, [u8; 14]); 12] = [
    ("P1", [2, 2, 1, 2, 1, 1, 2, 2, 1, 2, 1, 1, 2, 2]),
    ("P2", [1, 2, 2, 1, 1, 2, 2, 1, 2, 1, 2, 1, 1, 2]),
    ("P3", [2, 1, 2, 1, 2, 2, 1, 2, 1, 2, 1, 2, 2, 1]),
    ("P4", [1, 1, 2, 2, 1, 2, 1, 2, 2, 1, 2, 1, 2, 1]),
    ("P5", [2, 1, 1, 2, 2, 1, 2, 1, 1, 2, 2, 1, 2, 1]),
    ("P6", [1, 2, 1, 2, 1, 1, 2, 3, 1, 2, 1, 1, 2, 3]),
    ("P7", [2, 1, 3, 1, 2, 1, 2, 1, 3, 1, 2, 1, 2, 1]),
    ("P8", [1, 2, 1, 1, 2, 2, 1, 3, 1, 2, 2, 1, 1, 2]),
    ("P9", [2, 2, 1, 3, 1, 2, 1, 2, 1, 3, 1, 2, 2, 1]),
    ("P10", [1, 2, 2, 1, 2, 1, 3, 1, 2, 1, 2, 2, 1, 2]),
    ("P11", [2, 1, 2, 2, 1, 1, 3, 1, 2, 1, 2, 1, 2, 1]),
    ("P12", [1, 3, 1, 2, 1, 2, 1, 2, 2, 1, 1, 2, 1, 2]),
];

/// Score given to a candidate that carries no known pattern
const UNPATTERNED_SCORE: f64 = 0.4;

/// Learned counters for one pattern at one size
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub uses: u64,
    pub top_hits: u64,
    pub best_hits: u64,
    /// Running mean of hits
    pub avg_score: f64,
    pub score_count: u64,
}

impl PatternStats {
    /// Selection weight; unseen patterns keep weight 1
    pub fn weight(&self) -> f64 {
        1.0 + self.top_hits as f64 * 0.4 + self.best_hits as f64 * 0.2 + self.avg_score * 0.03
    }

    fn record(&mut self, hits: usize, top_threshold: usize, strong_threshold: usize) {
        self.uses += 1;
        if hits >= top_threshold {
            self.top_hits += 1;
        }
        if hits >= strong_threshold {
            self.best_hits += 1;
        }
        self.score_count += 1;
        let n = self.score_count as f64;
        self.avg_score += (hits as f64 - self.avg_score) / n;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSequenceState {
    /// Keyed by pattern id, "<base>-s<size>"
    #[serde(default)]
    pub pattern_stats: BTreeMap<String, PatternStats>,
    #[serde(default)]
    pub rounds_learned: u64,
}

pub fn pattern_id(base: &str, size: usize) -> String {
    format!("{}-s{}", base, size)
}

/// Stretch a base pattern to `steps` deltas by cycling it, each clamped to [1, delta_max]
pub fn expand_pattern(base: &[u8], steps: usize, delta_max: u8) -> Vec<u8> {
    if base.is_empty() {
        return Vec::new();
    }
    let cap = delta_max.max(1);
    base.iter()
        .cycle()
        .take(steps)
        .map(|&d| d.clamp(1, cap))
        .collect()
}

/// Map a raw position onto [1, universe]
pub fn place(value: i32, universe: u8, mode: WrapMode) -> u8 {
    let u = universe as i32;
    match mode {
        WrapMode::Wrap => ((value - 1).rem_euclid(u) + 1) as u8,
        WrapMode::Clamp => value.clamp(1, u) as u8,
    }
}

/// Position of the `probe`-th escape from a collided number `at`.
/// Wrap mode walks forward around the wheel; clamp mode walks up to the
/// ceiling and then back down below the collision.
fn escape(at: u8, probe: u32, universe: u8, mode: WrapMode) -> u8 {
    let at = at as i32;
    let probe = probe as i32;
    match mode {
        WrapMode::Wrap => place(at + probe, universe, mode),
        WrapMode::Clamp => {
            let headroom = universe as i32 - at;
            if probe <= headroom {
                (at + probe) as u8
            } else {
                place(at - (probe - headroom), universe, mode)
            }
        }
    }
}

/// Outcome of one walk
#[derive(Debug, Clone, PartialEq)]
pub struct Walk {
    pub numbers: Vec<u8>,
    /// Attempts consumed: one for the walk plus one per escape probe
    pub attempts: u32,
}

/// Accumulate `deltas` from `start` until `size` distinct numbers are placed.
/// Returns None once `budget` attempts are spent.
pub fn walk(
    start: u8,
    deltas: &[u8],
    size: usize,
    universe: u8,
    mode: WrapMode,
    budget: u32,
) -> Option<Walk> {
    if size == 0 || size > universe as usize || deltas.len() + 1 < size {
        return None;
    }
    let mut attempts = 1u32;
    let mut seen = BTreeSet::new();
    let mut current = place(start as i32, universe, mode);
    seen.insert(current);

    for &delta in deltas.iter().take(size - 1) {
        let target = place(current as i32 + delta as i32, universe, mode);
        let mut next = target;
        let mut probe = 0u32;
        while seen.contains(&next) {
            probe += 1;
            attempts += 1;
            if attempts > budget || probe >= universe as u32 {
                return None;
            }
            next = escape(target, probe, universe, mode);
        }
        seen.insert(next);
        current = next;
    }

    Some(Walk {
        numbers: seen.into_iter().collect(),
        attempts,
    })
}

pub struct StepSequenceBrain {
    config: StepSequenceConfig,
}

impl StepSequenceBrain {
    pub fn new(config: StepSequenceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StepSequenceConfig {
        &self.config
    }

    fn pick_pattern(&self, state: &StepSequenceState, size: usize, rng: &mut StdRng) -> usize {
        if rng.gen::<f64>() < self.config.exploration_rate {
            return rng.gen_range(0..BASE_PATTERNS.len());
        }
        let weights: Vec<f64> = BASE_PATTERNS
            .iter()
            .map(|(base, _)| {
                state
                    .pattern_stats
                    .get(&pattern_id(base, size))
                    .map(PatternStats::weight)
                    .unwrap_or(1.0)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        let mut roll = rng.gen::<f64>() * total;
        for (idx, w) in weights.iter().enumerate() {
            if roll < *w {
                return idx;
            }
            roll -= w;
        }
        BASE_PATTERNS.len() - 1
    }

    /// Per step, with probability mutation_rate, shift the delta by a
    /// non-zero offset in [-delta_max, delta_max], kept within [1, delta_max]
    fn mutate(&self, deltas: &mut [u8], rng: &mut StdRng) -> bool {
        let cap = self.config.delta_max.max(1) as i32;
        let mut mutated = false;
        for delta in deltas.iter_mut() {
            if rng.gen::<f64>() >= self.config.mutation_rate {
                continue;
            }
            let mut offset = rng.gen_range(-cap..=cap);
            if offset == 0 {
                offset = if rng.gen::<bool>() { 1 } else { -1 };
            }
            let shifted = (*delta as i32 + offset).clamp(1, cap) as u8;
            if shifted != *delta {
                *delta = shifted;
                mutated = true;
            }
        }
        mutated
    }

    /// One candidate attempt; None when the walk exhausted the budget
    fn build_one(
        &self,
        ctx: &DrawContext,
        state: &StepSequenceState,
        size: usize,
        budget: u32,
        rng: &mut StdRng,
    ) -> Option<(Candidate, u32)> {
        let universe = ctx.rules.universe_max;
        let (base, pattern) = BASE_PATTERNS[self.pick_pattern(state, size, rng)];
        let mut deltas = expand_pattern(&pattern, size.saturating_sub(1), self.config.delta_max);
        let mutated = self.mutate(&mut deltas, rng);
        let start = rng.gen_range(1..=universe);

        let w = walk(start, &deltas, size, universe, self.config.wrap_mode, budget)?;
        let candidate = Candidate::new(BRAIN_ID, ctx.target_contest, w.numbers)
            .with_pattern(pattern_id(base, size), mutated);
        Some((candidate, w.attempts))
    }
}

impl TypedBrain for StepSequenceBrain {
    type State = StepSequenceState;

    fn id(&self) -> &str {
        BRAIN_ID
    }

    fn name(&self) -> &str {
        "Step sequences"
    }

    fn category(&self) -> BrainCategory {
        BrainCategory::Heuristic
    }

    fn evaluate_context(&self, ctx: &DrawContext, _state: &Self::State) -> f64 {
        let history = ctx.recent.len();
        let base: f64 = if history >= 150 {
            0.9
        } else if history >= 60 {
            0.75
        } else {
            0.6
        };
        base.min(0.95)
    }

    fn generate(
        &self,
        ctx: &DrawContext,
        state: &Self::State,
        request: GenerationRequest,
        rng: &mut StdRng,
    ) -> Result<GenerationBatch> {
        let size = request.size;
        if size < ctx.rules.min_size || size > ctx.rules.max_size {
            return Err(EngineError::Generation {
                brain_id: BRAIN_ID.to_string(),
                reason: format!("size {} outside allowed range", size),
            });
        }

        let budget = self.config.max_attempts_per_candidate;
        let mut batch = GenerationBatch::default();
        let mut seen: BTreeSet<Vec<u8>> = BTreeSet::new();

        for _ in 0..request.count {
            let mut spent = 0u32;
            let mut placed = false;
            while spent < budget {
                match self.build_one(ctx, state, size, budget - spent, rng) {
                    Some((candidate, attempts)) => {
                        spent += attempts;
                        if seen.insert(candidate.numbers.clone()) {
                            batch.candidates.push(candidate);
                            placed = true;
                            break;
                        }
                    }
                    None => break,
                }
            }
            if !placed {
                batch.failed_attempts += 1;
            }
        }
        Ok(batch)
    }

    fn score(&self, candidate: &Candidate, _ctx: &DrawContext, state: &Self::State) -> f64 {
        let Some(stats) = candidate
            .pattern
            .as_ref()
            .and_then(|p| state.pattern_stats.get(p))
        else {
            return UNPATTERNED_SCORE;
        };
        let base = 0.35 + (stats.avg_score / 15.0).min(0.6);
        let bonus = (0.02 * stats.top_hits as f64 + 0.01 * stats.best_hits as f64).min(0.2);
        (base + bonus).min(1.0)
    }

    fn learn(
        &self,
        state: &mut Self::State,
        ctx: &DrawContext,
        _draw: &Draw,
        outcomes: &[ScoredCandidate],
    ) {
        let rules = &ctx.rules;
        for outcome in outcomes {
            let Some(pattern) = outcome.candidate.pattern.as_ref() else {
                continue;
            };
            state.pattern_stats.entry(pattern.clone()).or_default().record(
                outcome.score.hits,
                rules.top_threshold,
                rules.strong_threshold,
            );
        }
        state.rounds_learned += 1;
    }

    fn summary(&self, state: &Self::State) -> serde_json::Value {
        let mut ranked: Vec<(&String, &PatternStats)> = state.pattern_stats.iter().collect();
        ranked.sort_by(|a, b| b.1.weight().total_cmp(&a.1.weight()).then(a.0.cmp(b.0)));
        let top: Vec<serde_json::Value> = ranked
            .into_iter()
            .take(5)
            .map(|(id, s)| {
                serde_json::json!({
                    "pattern": id,
                    "uses": s.uses,
                    "top_hits": s.top_hits,
                    "best_hits": s.best_hits,
                    "avg_score": s.avg_score,
                })
            })
            .collect();
        serde_json::json!({
            "patterns_tracked": state.pattern_stats.len(),
            "rounds_learned": state.rounds_learned,
            "top_patterns": top,
            "wrap_mode": self.config.wrap_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameRules;
    use crate::scorer::Scorer;
    use crate::types::{Score, ScoreTag};
    use rand::SeedableRng;

    fn ctx() -> DrawContext {
        let rules = GameRules::default();
        let draws = (1..=5)
            .map(|c| Draw::new(c, ((c as u8)..(c as u8) + 15).collect()))
            .collect();
        DrawContext::build(5, draws, &rules)
    }

    fn brain() -> StepSequenceBrain {
        StepSequenceBrain::new(StepSequenceConfig::default()).unwrap()
    }

    #[test]
    fn test_expand_pattern_cycles_and_clamps() {
        let (_, p6) = BASE_PATTERNS[5];
        let expanded = expand_pattern(&p6, 17, 2);
        assert_eq!(expanded.len(), 17);
        assert!(expanded.iter().all(|&d| (1..=2).contains(&d)));
        assert_eq!(expanded[14], p6[0]);
    }

    #[test]
    fn test_place_wraps_and_clamps() {
        assert_eq!(place(26, 25, WrapMode::Wrap), 1);
        assert_eq!(place(25, 25, WrapMode::Wrap), 25);
        assert_eq!(place(0, 25, WrapMode::Wrap), 25);
        assert_eq!(place(30, 25, WrapMode::Clamp), 25);
    }

    #[test]
    fn test_fourteen_deltas_make_fifteen_numbers() {
        for (_, pattern) in BASE_PATTERNS {
            for start in 1..=25u8 {
                let w = walk(start, &pattern, 15, 25, WrapMode::Wrap, 50).unwrap();
                assert_eq!(w.numbers.len(), 15);
                assert!(w.numbers.windows(2).all(|p| p[0] < p[1]));
                assert!(w.numbers.iter().all(|&n| (1..=25).contains(&n)));
                assert!(w.attempts <= 50);
            }
        }
    }

    #[test]
    fn test_walk_respects_budget() {
        // All-ones deltas from 1 never collide; a budget of 1 still succeeds
        assert!(walk(1, &[1; 14], 15, 25, WrapMode::Wrap, 1).is_some());
        // Clamp mode piles up at the ceiling and needs escapes
        let clamped = walk(20, &[3; 14], 15, 25, WrapMode::Clamp, 1);
        assert!(clamped.is_none());
        let w = walk(20, &[3; 14], 15, 25, WrapMode::Clamp, 500).unwrap();
        assert_eq!(w.numbers.len(), 15);
    }

    #[test]
    fn test_generate_sizes_and_uniqueness() {
        let brain = brain();
        let state = StepSequenceState::default();
        let mut rng = StdRng::seed_from_u64(42);
        for size in [15usize, 18] {
            let batch = TypedBrain::generate(
                &brain,
                &ctx(),
                &state,
                GenerationRequest { size, count: 30 },
                &mut rng,
            )
            .unwrap();
            assert!(!batch.candidates.is_empty());
            let rules = GameRules::default();
            for c in &batch.candidates {
                assert!(c.is_valid(&rules, size));
                assert!(c.pattern.as_ref().unwrap().ends_with(&format!("-s{}", size)));
            }
        }
    }

    #[test]
    fn test_generate_rejects_bad_size() {
        let brain = brain();
        let mut rng = StdRng::seed_from_u64(1);
        let res = TypedBrain::generate(
            &brain,
            &ctx(),
            &StepSequenceState::default(),
            GenerationRequest { size: 3, count: 1 },
            &mut rng,
        );
        assert!(matches!(res, Err(EngineError::Generation { .. })));
    }

    #[test]
    fn test_generate_deterministic_under_seed() {
        let brain = brain();
        let state = StepSequenceState::default();
        let request = GenerationRequest { size: 15, count: 20 };
        let a = TypedBrain::generate(&brain, &ctx(), &state, request, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = TypedBrain::generate(&brain, &ctx(), &state, request, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let numbers = |batch: &GenerationBatch| {
            batch
                .candidates
                .iter()
                .map(|c| c.numbers.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(numbers(&a), numbers(&b));
    }

    fn scored(pattern: &str, hits: usize) -> ScoredCandidate {
        let scorer = Scorer::new(GameRules::default());
        ScoredCandidate {
            candidate: Candidate::new(BRAIN_ID, 6, (1..=15).collect()).with_pattern(pattern, false),
            score: Score {
                hits,
                value: hits as f64,
                tag: scorer.tag(hits),
            },
        }
    }

    #[test]
    fn test_learning_top_versus_baseline() {
        let brain = brain();
        let mut state = StepSequenceState::default();
        let draw = Draw::new(6, (1..=15).collect());
        let outcomes = vec![scored("P1-s15", 14), scored("P2-s15", 9)];
        assert_eq!(outcomes[0].score.tag, ScoreTag::Top);

        TypedBrain::learn(&brain, &mut state, &ctx(), &draw, &outcomes);

        let p1 = &state.pattern_stats["P1-s15"];
        assert_eq!(p1.uses, 1);
        assert_eq!(p1.top_hits, 1);
        assert_eq!(p1.best_hits, 1);
        assert_eq!(p1.avg_score, 14.0);

        let p2 = &state.pattern_stats["P2-s15"];
        assert_eq!(p2.uses, 1);
        assert_eq!(p2.top_hits, 0);
        assert_eq!(p2.best_hits, 0);
        assert_eq!(p2.avg_score, 9.0);
    }

    #[test]
    fn test_running_mean() {
        let mut stats = PatternStats::default();
        for hits in [10, 12, 14] {
            stats.record(hits, 14, 13);
        }
        assert_eq!(stats.score_count, 3);
        assert!((stats.avg_score - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_prehoc_score() {
        let brain = brain();
        let mut state = StepSequenceState::default();
        let plain = Candidate::new(BRAIN_ID, 6, (1..=15).collect());
        assert_eq!(TypedBrain::score(&brain, &plain, &ctx(), &state), UNPATTERNED_SCORE);

        state.pattern_stats.insert(
            "P1-s15".into(),
            PatternStats {
                uses: 10,
                top_hits: 20,
                best_hits: 20,
                avg_score: 15.0,
                score_count: 10,
            },
        );
        let tagged = plain.with_pattern("P1-s15", false);
        assert_eq!(TypedBrain::score(&brain, &tagged, &ctx(), &state), 1.0);
    }

    #[test]
    fn test_relevance_grows_with_history() {
        let brain = brain();
        let state = StepSequenceState::default();
        let rules = GameRules::default();
        let history = |n: u64| {
            let draws = (1..=n).map(|c| Draw::new(c, (1..=15).collect())).collect();
            DrawContext::build(n, draws, &rules)
        };
        assert_eq!(TypedBrain::evaluate_context(&brain, &history(10), &state), 0.6);
        assert_eq!(TypedBrain::evaluate_context(&brain, &history(60), &state), 0.75);
        assert_eq!(TypedBrain::evaluate_context(&brain, &history(200), &state), 0.9);
    }
}
