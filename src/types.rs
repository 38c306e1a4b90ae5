//! Core types shared by brains, the hub and the stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::GameRules;

/// A published draw. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draw {
    /// Contest index (strictly increasing in the history store)
    pub contest: u64,
    /// Drawn numbers, sorted ascending
    pub numbers: Vec<u8>,
}

impl Draw {
    pub fn new(contest: u64, mut numbers: Vec<u8>) -> Self {
        numbers.sort_unstable();
        numbers.dedup();
        Self { contest, numbers }
    }

    /// Check the draw against the game's universe and draw size
    pub fn is_valid(&self, rules: &GameRules) -> bool {
        self.numbers.len() == rules.draw_size
            && self
                .numbers
                .iter()
                .all(|&n| n >= 1 && n <= rules.universe_max)
    }
}

/// One proposed combination for a future draw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Originating brain
    pub brain_id: String,
    /// Contest this candidate bets on
    pub target_contest: u64,
    /// Distinct numbers, sorted ascending
    pub numbers: Vec<u8>,
    /// Pattern / mutation tag set by the generator, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub mutated: bool,
}

impl Candidate {
    /// Build a candidate from raw numbers; sorts and deduplicates
    pub fn new(brain_id: impl Into<String>, target_contest: u64, mut numbers: Vec<u8>) -> Self {
        numbers.sort_unstable();
        numbers.dedup();
        Self {
            brain_id: brain_id.into(),
            target_contest,
            numbers,
            pattern: None,
            mutated: false,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>, mutated: bool) -> Self {
        self.pattern = Some(pattern.into());
        self.mutated = mutated;
        self
    }

    pub fn size(&self) -> usize {
        self.numbers.len()
    }

    /// Size within range, numbers unique, sorted and inside [1, U]
    pub fn is_valid(&self, rules: &GameRules, expected_size: usize) -> bool {
        if self.numbers.len() != expected_size
            || expected_size < rules.min_size
            || expected_size > rules.max_size
        {
            return false;
        }
        let in_range = self
            .numbers
            .iter()
            .all(|&n| n >= 1 && n <= rules.universe_max);
        let strictly_sorted = self.numbers.windows(2).all(|w| w[0] < w[1]);
        in_range && strictly_sorted
    }

    /// Number of shared numbers with another set
    pub fn overlap(&self, other: &[u8]) -> usize {
        let mine: BTreeSet<u8> = self.numbers.iter().copied().collect();
        other.iter().filter(|n| mine.contains(n)).count()
    }
}

/// Categorical tag derived from a hit count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTag {
    Baseline,
    Strong,
    Top,
}

impl ScoreTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreTag::Baseline => "baseline",
            ScoreTag::Strong => "strong",
            ScoreTag::Top => "top",
        }
    }
}

/// Fitness of a candidate against a realized draw
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub hits: usize,
    pub value: f64,
    pub tag: ScoreTag,
}

/// A candidate paired with its realized score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: Score,
}

/// Per (brain, contest) counters. Upserted once per round, never edited later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainPerformance {
    pub brain_id: String,
    pub contest: u64,
    pub candidates_generated: u32,
    /// Mean hit count over the scored candidates
    pub mean_hits: f64,
    /// Mean scorer value over the scored candidates
    pub mean_score: f64,
    pub max_hits: u32,
    pub top_hits: u32,
    pub strong_hits: u32,
    /// Count of candidates with hits >= tier, per configured tier
    pub tier_counts: BTreeMap<u32, u32>,
    pub updated_at: DateTime<Utc>,
}

impl BrainPerformance {
    /// Aggregate one round of scored candidates for a brain
    pub fn from_scored(
        brain_id: &str,
        contest: u64,
        scored: &[ScoredCandidate],
        rules: &GameRules,
    ) -> Self {
        let n = scored.len();
        let (hits_sum, value_sum) = scored.iter().fold((0usize, 0.0f64), |(h, v), s| {
            (h + s.score.hits, v + s.score.value)
        });
        let mut tier_counts = BTreeMap::new();
        for &tier in &rules.performance_tiers {
            let count = scored.iter().filter(|s| s.score.hits >= tier).count();
            tier_counts.insert(tier as u32, count as u32);
        }

        Self {
            brain_id: brain_id.to_string(),
            contest,
            candidates_generated: n as u32,
            mean_hits: if n > 0 { hits_sum as f64 / n as f64 } else { 0.0 },
            mean_score: if n > 0 { value_sum / n as f64 } else { 0.0 },
            max_hits: scored.iter().map(|s| s.score.hits).max().unwrap_or(0) as u32,
            top_hits: scored.iter().filter(|s| s.score.tag == ScoreTag::Top).count() as u32,
            strong_hits: scored
                .iter()
                .filter(|s| s.score.tag >= ScoreTag::Strong)
                .count() as u32,
            tier_counts,
            updated_at: Utc::now(),
        }
    }
}

/// Archived high-performing candidate. Identity is (contest, target, size, numbers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrongGameMemory {
    pub contest: u64,
    pub target_contest: u64,
    pub size: usize,
    pub numbers: Vec<u8>,
    pub hits: usize,
    pub weight: f64,
    /// Provenance tag, "<run_tag>:<brain_id>"
    pub origin: String,
    pub created_at: DateTime<Utc>,
}

impl StrongGameMemory {
    pub fn key(&self) -> (u64, u64, usize, Vec<u8>) {
        (self.contest, self.target_contest, self.size, self.numbers.clone())
    }
}

/// Processing stage recorded with the checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    LoadingCheckpoint,
    Processing,
    UpdatingState,
    CheckpointAdvance,
    Terminal,
}

/// Durable marker of incremental progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Checkpoint {
    /// Last fully processed contest; None means "before the first contest"
    pub last_contest: Option<u64>,
    pub stage: Stage,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Whether contest N still needs processing
    pub fn is_pending(&self, contest: u64) -> bool {
        self.last_contest.map(|last| contest > last).unwrap_or(true)
    }
}

/// Everything a brain may look at when generating for contest N+1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawContext {
    /// Contest N (latest known outcome)
    pub contest: u64,
    /// Contest N+1, the generation target
    pub target_contest: u64,
    pub last_draw: Vec<u8>,
    /// Recent draws up to and including N, oldest first
    pub recent: Vec<Draw>,
    /// Frequency of each number over `recent`, indexed by number (slot 0 unused)
    pub frequency: Vec<u32>,
    pub rules: GameRules,
}

impl DrawContext {
    pub fn build(contest: u64, recent: Vec<Draw>, rules: &GameRules) -> Self {
        let mut frequency = vec![0u32; rules.universe_max as usize + 1];
        for draw in &recent {
            for &n in &draw.numbers {
                if let Some(slot) = frequency.get_mut(n as usize) {
                    *slot += 1;
                }
            }
        }
        let last_draw = recent.last().map(|d| d.numbers.clone()).unwrap_or_default();

        Self {
            contest,
            target_contest: contest + 1,
            last_draw,
            recent,
            frequency,
            rules: rules.clone(),
        }
    }

    pub fn frequency_of(&self, number: u8) -> u32 {
        self.frequency.get(number as usize).copied().unwrap_or(0)
    }

    /// Universe as a vector, 1..=U
    pub fn universe(&self) -> Vec<u8> {
        (1..=self.rules.universe_max).collect()
    }
}
