//! Backtest engine
//!
//! Replays trainable contests in circular blocks on a forked registry. Each
//! block samples its own exploration setup (profile, context window, budget,
//! pool size) and sits some brains out. Learning only touches the fork and a
//! private in-memory store, so the production store is never written.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::brain::sampling::seeded_rng;
use crate::brain::BrainRegistry;
use crate::config::{Profile, RoundConfig};
use crate::error::{EngineError, Result};
use crate::hub::BrainHub;
use crate::store::{BrainStateStore, DrawHistory, MemoryStateStore};
use crate::types::DrawContext;

/// When a backtest stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepBudget {
    Steps(usize),
    WallClock(Duration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Contests replayed under one sampled exploration setup
    pub block_size: usize,
    pub budget: StepBudget,
    /// Profiles a block may draw from
    pub profiles: Vec<Profile>,
    /// Favour larger budgets and pools, fewer dropped brains
    pub aggressive: bool,
    pub seed: u64,
    pub window_choices: Vec<usize>,
    pub per_brain_choices: Vec<usize>,
    pub top_n_choices: Vec<usize>,
    /// Start right after this contest instead of at the oldest one
    pub start_after: Option<u64>,
    /// Tag prefix for memory provenance
    pub run_tag: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            block_size: 250,
            budget: StepBudget::Steps(250),
            profiles: Profile::ALL.to_vec(),
            aggressive: false,
            seed: 0xB4C7_7E57,
            window_choices: vec![120, 200, 300, 500],
            per_brain_choices: vec![60, 80, 120],
            top_n_choices: vec![80, 120, 180, 250],
            start_after: None,
            run_tag: "backtest".to_string(),
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(EngineError::config("block_size must be > 0"));
        }
        if self.budget == StepBudget::Steps(0) || self.budget == StepBudget::WallClock(Duration::ZERO)
        {
            return Err(EngineError::config("backtest budget must be non-zero"));
        }
        if self.profiles.is_empty()
            || self.window_choices.is_empty()
            || self.per_brain_choices.is_empty()
            || self.top_n_choices.is_empty()
        {
            return Err(EngineError::config("backtest choice lists must not be empty"));
        }
        if self.window_choices.contains(&0) {
            return Err(EngineError::config("context windows must be > 0"));
        }
        Ok(())
    }
}

/// Exploration setup sampled for one block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreConfig {
    pub profile: Profile,
    pub window: usize,
    pub per_brain: usize,
    pub top_n: usize,
    pub drop_rate: f64,
    pub tag: String,
}

impl ExploreConfig {
    pub fn sample(config: &BacktestConfig, rng: &mut impl Rng) -> Self {
        let window = pick(&config.window_choices, rng);
        let mut per_brain = pick(&config.per_brain_choices, rng);
        let mut top_n = pick(&config.top_n_choices, rng);
        let profile = config
            .profiles
            .choose(rng)
            .copied()
            .unwrap_or_default();

        let drop_rate = if config.aggressive {
            per_brain = per_brain.max(120);
            top_n = top_n.max(180);
            Profile::Aggressive.preset().drop_rate
        } else {
            profile.preset().drop_rate
        };

        Self {
            tag: format!(
                "{}:{}:J{}:P{}:T{}",
                config.run_tag,
                profile.as_str(),
                window,
                per_brain,
                top_n
            ),
            profile,
            window,
            per_brain,
            top_n,
            drop_rate,
        }
    }
}

/// Best selected candidate of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBest {
    pub contest: u64,
    pub target_contest: u64,
    pub tag: String,
    pub brain_id: String,
    pub numbers: Vec<u8>,
    pub hits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub blocks: usize,
    pub steps: usize,
    /// Steps where every participating brain came back empty
    pub empty_steps: usize,
    /// Hit count -> selected candidates with exactly that many hits
    pub hit_distribution: BTreeMap<usize, u64>,
    /// Tier -> selected candidates with at least that many hits
    pub tier_totals: BTreeMap<u32, u64>,
    pub memory_worthy: u64,
    pub best_per_step: Vec<StepBest>,
    /// Mean hits over every candidate each brain generated
    pub brain_mean_hits: BTreeMap<String, f64>,
}

impl BacktestSummary {
    pub fn selected_total(&self) -> u64 {
        self.hit_distribution.values().sum()
    }

    pub fn best_hits(&self) -> Option<usize> {
        self.best_per_step.iter().map(|b| b.hits).max()
    }
}

pub struct BacktestEngine {
    hub: Arc<BrainHub>,
    history: Arc<dyn DrawHistory>,
}

impl BacktestEngine {
    pub fn new(hub: Arc<BrainHub>, history: Arc<dyn DrawHistory>) -> Self {
        Self { hub, history }
    }

    /// Contests N whose outcome N+1 is known, ascending
    pub async fn trainable_contests(&self) -> Result<Vec<u64>> {
        let contests = self.history.contests().await?;
        let known: BTreeSet<u64> = contests.iter().copied().collect();
        Ok(contests
            .into_iter()
            .filter(|n| known.contains(&(n + 1)))
            .collect())
    }

    /// Replay on a fork of `base`. `base` and every persistent store are
    /// left exactly as they were.
    pub async fn run(&self, base: &BrainRegistry, config: &BacktestConfig) -> Result<BacktestSummary> {
        config.validate()?;
        let trainable = self.trainable_contests().await?;
        if trainable.is_empty() {
            return Err(EngineError::InsufficientHistory(
                "no contest has a known successor draw".to_string(),
            ));
        }
        let base_enabled = base.enabled_ids();
        if base_enabled.is_empty() {
            return Err(EngineError::config("backtest needs at least one enabled brain"));
        }

        let engine = self.hub.config();
        let rules = &engine.rules;
        let mut registry = base.fork();
        let scratch = MemoryStateStore::new();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut summary = BacktestSummary {
            run_id,
            started_at,
            finished_at: started_at,
            blocks: 0,
            steps: 0,
            empty_steps: 0,
            hit_distribution: BTreeMap::new(),
            tier_totals: rules
                .performance_tiers
                .iter()
                .map(|&t| (t as u32, 0))
                .collect(),
            memory_worthy: 0,
            best_per_step: Vec::new(),
            brain_mean_hits: BTreeMap::new(),
        };
        let mut hit_sums: BTreeMap<String, (f64, u64)> = BTreeMap::new();

        let mut pos = config
            .start_after
            .and_then(|after| trainable.iter().position(|&c| c == after))
            .map(|i| i + 1)
            .unwrap_or(0);

        info!(
            run_id = %run_id,
            "Backtest over {} trainable contests (budget {:?})",
            trainable.len(),
            config.budget
        );

        'blocks: loop {
            if exhausted(config.budget, summary.steps, clock) {
                break;
            }
            let mut rng = seeded_rng(config.seed, summary.blocks as u64, "backtest", 0);
            let explore = ExploreConfig::sample(config, &mut rng);
            let active = drop_brains(&mut registry, &base_enabled, explore.drop_rate, &mut rng);
            summary.blocks += 1;
            info!(
                block = summary.blocks,
                "Block {}: {}/{} brains active",
                explore.tag,
                active,
                base_enabled.len()
            );

            let round = RoundConfig {
                per_brain_budget: explore.per_brain,
                top_n: explore.top_n,
                profile: explore.profile,
                max_similarity: None,
                ..engine.round.clone()
            };

            for _ in 0..config.block_size {
                if exhausted(config.budget, summary.steps, clock) {
                    break 'blocks;
                }
                if pos >= trainable.len() {
                    pos = 0;
                }
                let contest = trainable[pos];
                pos += 1;

                let window = self.history.window(contest, explore.window).await?;
                let ctx = Arc::new(DrawContext::build(contest, window, rules));
                let performance = scratch
                    .load_performance(contest, engine.hub.relevance_window)
                    .await?;

                summary.steps += 1;
                let outcome = match self
                    .hub
                    .run_round_with(Arc::clone(&ctx), &registry, &performance, &round)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(EngineError::EmptyRound { contest }) => {
                        warn!(contest, "Backtest step produced no candidates");
                        summary.empty_steps += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let draw = self
                    .history
                    .get_draw(ctx.target_contest)
                    .await?
                    .ok_or(EngineError::DrawNotFound(ctx.target_contest))?;
                let update = self
                    .hub
                    .update_learning(&registry, &ctx, &outcome, &draw, &explore.tag)?;

                for state in update.states.iter().cloned() {
                    registry.set_state(state);
                }
                for row in &update.performance {
                    scratch.append_performance(row).await?;
                    let entry = hit_sums.entry(row.brain_id.clone()).or_insert((0.0, 0));
                    entry.0 += row.mean_hits * row.candidates_generated as f64;
                    entry.1 += row.candidates_generated as u64;
                }

                summary.memory_worthy += update.memories.len() as u64;
                for selected in &update.selected {
                    let hits = selected.score.hits;
                    *summary.hit_distribution.entry(hits).or_insert(0) += 1;
                    for (tier, total) in summary.tier_totals.iter_mut() {
                        if hits >= *tier as usize {
                            *total += 1;
                        }
                    }
                }
                if let Some(best) = update.selected.iter().max_by(|a, b| {
                    a.score
                        .hits
                        .cmp(&b.score.hits)
                        .then(a.ranked.final_score.total_cmp(&b.ranked.final_score))
                }) {
                    summary.best_per_step.push(StepBest {
                        contest,
                        target_contest: ctx.target_contest,
                        tag: explore.tag.clone(),
                        brain_id: best.ranked.candidate.brain_id.clone(),
                        numbers: best.ranked.candidate.numbers.clone(),
                        hits: best.score.hits,
                    });
                }
                debug!(contest, step = summary.steps, "Backtest step done");
            }
        }

        summary.brain_mean_hits = hit_sums
            .into_iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(id, (sum, n))| (id, sum / n as f64))
            .collect();
        summary.finished_at = Utc::now();
        info!(
            run_id = %run_id,
            steps = summary.steps,
            memory_worthy = summary.memory_worthy,
            best_hits = ?summary.best_hits(),
            "Backtest finished"
        );
        Ok(summary)
    }
}

fn pick(choices: &[usize], rng: &mut impl Rng) -> usize {
    choices.choose(rng).copied().unwrap_or(1)
}

fn exhausted(budget: StepBudget, steps: usize, clock: Instant) -> bool {
    match budget {
        StepBudget::Steps(max) => steps >= max,
        StepBudget::WallClock(limit) => clock.elapsed() >= limit,
    }
}

/// Sit brains out with probability `drop_rate`; at least one stays in.
/// Returns how many are active.
fn drop_brains(
    registry: &mut BrainRegistry,
    base_enabled: &[String],
    drop_rate: f64,
    rng: &mut impl Rng,
) -> usize {
    let mut active: Vec<&String> = Vec::new();
    for id in base_enabled {
        let keep = !rng.gen_bool(drop_rate.clamp(0.0, 1.0));
        registry.set_enabled(id, keep);
        if keep {
            active.push(id);
        }
    }
    if active.is_empty() {
        if let Some(id) = base_enabled.choose(rng) {
            registry.set_enabled(id, true);
            active.push(id);
        }
    }
    active.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::MemoryDrawHistory;
    use crate::types::Draw;

    fn engine(n: u64) -> (BacktestEngine, BrainRegistry) {
        let mut config = EngineConfig::default();
        config.round.quantity_per_size = 5;
        let registry = BrainRegistry::from_config(&config).unwrap();
        let hub = Arc::new(BrainHub::new(config).unwrap());
        let draws = (1..=n).map(|c| {
            let start = (c % 9) as u8 + 1;
            Draw::new(c, (start..start + 15).collect())
        });
        let history = Arc::new(MemoryDrawHistory::from_draws(draws));
        (BacktestEngine::new(hub, history), registry)
    }

    fn quick(steps: usize) -> BacktestConfig {
        BacktestConfig {
            block_size: 3,
            budget: StepBudget::Steps(steps),
            per_brain_choices: vec![10],
            top_n_choices: vec![40],
            window_choices: vec![20],
            ..Default::default()
        }
    }

    #[test]
    fn test_drop_never_disables_everything() {
        let mut registry = BrainRegistry::from_config(&EngineConfig::default()).unwrap();
        let base = registry.enabled_ids();
        let mut rng = seeded_rng(1, 0, "t", 0);
        assert_eq!(drop_brains(&mut registry, &base, 1.0, &mut rng), 1);
        assert_eq!(registry.enabled_ids().len(), 1);
        assert_eq!(drop_brains(&mut registry, &base, 0.0, &mut rng), base.len());
    }

    #[test]
    fn test_aggressive_sampling_raises_floors() {
        let config = BacktestConfig {
            aggressive: true,
            per_brain_choices: vec![60],
            top_n_choices: vec![80],
            ..Default::default()
        };
        let mut rng = seeded_rng(3, 0, "t", 0);
        let explore = ExploreConfig::sample(&config, &mut rng);
        assert_eq!(explore.per_brain, 120);
        assert_eq!(explore.top_n, 180);
        assert_eq!(explore.drop_rate, 0.12);
        assert!(explore.tag.starts_with("backtest:"));
    }

    #[tokio::test]
    async fn test_circular_replay_respects_step_budget() {
        let (bt, registry) = engine(4);
        let before = registry.states().clone();

        let summary = bt.run(&registry, &quick(7)).await.unwrap();
        assert_eq!(summary.steps, 7);
        // 3 trainable contests, replayed circularly
        assert_eq!(summary.blocks, 3);
        assert_eq!(
            summary.best_per_step.len() + summary.empty_steps,
            summary.steps
        );
        assert!(summary.selected_total() > 0);
        assert_eq!(registry.states(), &before);
    }

    #[tokio::test]
    async fn test_needs_trainable_history() {
        let (bt, registry) = engine(1);
        let err = bt.run(&registry, &quick(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientHistory(_)));
    }
}
