//! Post-hoc scoring of candidates against a realized draw

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::GameRules;
use crate::types::{Candidate, Draw, Score, ScoreTag, ScoredCandidate};

/// Monotonic map from hit count to score value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ScoreCurve {
    #[default]
    Identity,
    Quadratic,
    /// base^hits - 1; base must exceed 1
    Exponential { base: f64 },
}

impl ScoreCurve {
    pub fn apply(&self, hits: usize) -> f64 {
        let h = hits as f64;
        match *self {
            ScoreCurve::Identity => h,
            ScoreCurve::Quadratic => h * h,
            ScoreCurve::Exponential { base } => base.max(1.0 + f64::EPSILON).powf(h) - 1.0,
        }
    }
}

/// Assigns hit counts, tags and values
#[derive(Debug, Clone)]
pub struct Scorer {
    rules: GameRules,
    curve: ScoreCurve,
}

impl Scorer {
    pub fn new(rules: GameRules) -> Self {
        Self {
            rules,
            curve: ScoreCurve::Identity,
        }
    }

    pub fn with_curve(mut self, curve: ScoreCurve) -> Self {
        self.curve = curve;
        self
    }

    /// |candidate ∩ draw|
    pub fn hits(numbers: &[u8], draw: &[u8]) -> usize {
        if numbers.is_empty() || draw.is_empty() {
            return 0;
        }
        let drawn: BTreeSet<u8> = draw.iter().copied().collect();
        numbers
            .iter()
            .copied()
            .collect::<BTreeSet<u8>>()
            .intersection(&drawn)
            .count()
    }

    pub fn tag(&self, hits: usize) -> ScoreTag {
        if hits >= self.rules.top_threshold {
            ScoreTag::Top
        } else if hits >= self.rules.strong_threshold {
            ScoreTag::Strong
        } else {
            ScoreTag::Baseline
        }
    }

    pub fn score(&self, candidate: &Candidate, draw: &Draw) -> Score {
        let hits = Self::hits(&candidate.numbers, &draw.numbers);
        Score {
            hits,
            value: self.curve.apply(hits),
            tag: self.tag(hits),
        }
    }

    pub fn score_all(&self, candidates: &[Candidate], draw: &Draw) -> Vec<ScoredCandidate> {
        candidates
            .iter()
            .map(|c| ScoredCandidate {
                candidate: c.clone(),
                score: self.score(c, draw),
            })
            .collect()
    }

    pub fn rules(&self) -> &GameRules {
        &self.rules
    }
}
