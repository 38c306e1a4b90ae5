//! Engine configuration
//!
//! Single source of truth for game rules, round shape, hub tuning, trainer
//! cadence and the brain registry. Every field is defaulted so a partial file
//! (or nothing at all) yields a runnable engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::brain::KNOWN_BRAINS;
use crate::error::{EngineError, Result};
use crate::hub::selection::{Normalization, SimilarityMetric};
use crate::presets::{preset_for, ProfilePreset};
use crate::scorer::ScoreCurve;

/// Environment prefix for overrides, e.g. `BRAINHUB__ROUND__TOP_N=120`
pub const ENV_PREFIX: &str = "BRAINHUB";

/// Rules of the game being played
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRules {
    pub name: String,
    /// Numbers range over [1, universe_max]
    pub universe_max: u8,
    /// Numbers per published draw
    pub draw_size: usize,
    /// Allowed candidate sizes
    pub min_size: usize,
    pub max_size: usize,
    /// Hits at or above this are tagged "top"
    pub top_threshold: usize,
    /// Hits at or above this (and below top) are tagged "strong"
    pub strong_threshold: usize,
    /// Tiers counted in BrainPerformance
    pub performance_tiers: Vec<usize>,
    /// Minimum hits for the strong game memory archive
    pub memory_min_hits: usize,
}

impl GameRules {
    /// 25-number wheel, 15 drawn, tickets of 15..=20
    pub fn wheel_25() -> Self {
        Self {
            name: "wheel-25".to_string(),
            universe_max: 25,
            draw_size: 15,
            min_size: 15,
            max_size: 20,
            top_threshold: 14,
            strong_threshold: 13,
            performance_tiers: vec![11, 12, 13, 14, 15],
            memory_min_hits: 13,
        }
    }

    /// 31-number board, 7 drawn, tickets of 7..=15
    pub fn board_31() -> Self {
        Self {
            name: "board-31".to_string(),
            universe_max: 31,
            draw_size: 7,
            min_size: 7,
            max_size: 15,
            top_threshold: 7,
            strong_threshold: 6,
            performance_tiers: vec![4, 5, 6, 7],
            memory_min_hits: 5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let u = self.universe_max as usize;
        if u < 2 {
            return Err(EngineError::config("universe_max must be at least 2"));
        }
        if self.draw_size == 0 || self.draw_size > u {
            return Err(EngineError::config(format!(
                "draw_size {} must be in 1..={}",
                self.draw_size, u
            )));
        }
        if self.min_size == 0 || self.min_size > self.max_size || self.max_size > u {
            return Err(EngineError::config(format!(
                "candidate size range {}..={} invalid for universe {}",
                self.min_size, self.max_size, u
            )));
        }
        if self.strong_threshold > self.top_threshold || self.top_threshold > self.draw_size {
            return Err(EngineError::config(format!(
                "thresholds must satisfy strong ({}) <= top ({}) <= draw_size ({})",
                self.strong_threshold, self.top_threshold, self.draw_size
            )));
        }
        Ok(())
    }
}

impl Default for GameRules {
    fn default() -> Self {
        Self::wheel_25()
    }
}

/// How the step-sequence wheel treats overflow
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WrapMode {
    /// Modular arithmetic over [1, U]
    #[default]
    Wrap,
    /// Saturate at 1 and U
    Clamp,
}

/// Recognized step-sequence options
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct StepSequenceConfig {
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    #[serde(default = "default_step_exploration_rate")]
    pub exploration_rate: f64,
    #[serde(default = "default_delta_max")]
    pub delta_max: u8,
    #[serde(default)]
    pub wrap_mode: WrapMode,
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_candidate: u32,
}

impl Default for StepSequenceConfig {
    fn default() -> Self {
        Self {
            mutation_rate: default_mutation_rate(),
            exploration_rate: default_step_exploration_rate(),
            delta_max: default_delta_max(),
            wrap_mode: WrapMode::default(),
            max_attempts_per_candidate: default_max_attempts(),
        }
    }
}

impl StepSequenceConfig {
    pub fn validate(&self) -> Result<()> {
        check_rate("mutation_rate", self.mutation_rate)?;
        check_rate("exploration_rate", self.exploration_rate)?;
        if self.max_attempts_per_candidate == 0 {
            return Err(EngineError::config("max_attempts_per_candidate must be > 0"));
        }
        Ok(())
    }
}

fn default_mutation_rate() -> f64 {
    0.10
}

fn default_step_exploration_rate() -> f64 {
    0.10
}

fn default_delta_max() -> u8 {
    3
}

fn default_max_attempts() -> u32 {
    50
}

/// Registry entry for one brain
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BrainSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Only read by the step-sequence brain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_sequence: Option<StepSequenceConfig>,
}

impl Default for BrainSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            step_sequence: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Operating profile mapping to preset exploration/diversity parameters
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Conservative, Profile::Balanced, Profile::Aggressive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Conservative => "conservative",
            Profile::Balanced => "balanced",
            Profile::Aggressive => "aggressive",
        }
    }

    pub fn preset(&self) -> ProfilePreset {
        preset_for(*self)
    }
}

/// Shape of one generation round
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RoundConfig {
    /// Candidate sizes requested per round (one or two)
    pub sizes: Vec<usize>,
    /// Final selected candidates per size
    pub quantity_per_size: usize,
    /// Candidates requested from each brain per size
    pub per_brain_budget: usize,
    /// Pool kept after ranking, before diversity selection
    pub top_n: usize,
    /// Overrides the profile's similarity cap
    pub max_similarity: Option<f64>,
    pub profile: Profile,
    /// Optional cap on the share of the selection one brain may take
    pub max_brain_share: Option<f64>,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            sizes: vec![15],
            quantity_per_size: 40,
            per_brain_budget: 80,
            top_n: 250,
            max_similarity: None,
            profile: Profile::Balanced,
            max_brain_share: None,
        }
    }
}

impl RoundConfig {
    pub fn effective_max_similarity(&self) -> f64 {
        self.max_similarity
            .unwrap_or_else(|| self.profile.preset().max_similarity)
    }

    /// Per-brain budget after the profile's multiplier
    pub fn effective_budget(&self) -> usize {
        let scaled = self.per_brain_budget as f64 * self.profile.preset().budget_multiplier;
        (scaled.round() as usize).max(1)
    }

    pub fn validate(&self, rules: &GameRules) -> Result<()> {
        if self.sizes.is_empty() || self.sizes.len() > 2 {
            return Err(EngineError::config(format!(
                "a round requests one or two sizes, got {}",
                self.sizes.len()
            )));
        }
        for &size in &self.sizes {
            if size < rules.min_size || size > rules.max_size {
                return Err(EngineError::config(format!(
                    "candidate size {} outside allowed range {}..={}",
                    size, rules.min_size, rules.max_size
                )));
            }
        }
        if self.quantity_per_size == 0 {
            return Err(EngineError::config("quantity_per_size must be > 0"));
        }
        if self.per_brain_budget == 0 {
            return Err(EngineError::config("per_brain_budget must be > 0"));
        }
        if self.top_n == 0 {
            return Err(EngineError::config("top_n must be > 0"));
        }
        let sim = self.effective_max_similarity();
        if !(sim > 0.0 && sim <= 1.0) {
            return Err(EngineError::config(format!(
                "max_similarity {} must be in (0, 1]",
                sim
            )));
        }
        if let Some(share) = self.max_brain_share {
            if !(share > 0.0 && share <= 1.0) {
                return Err(EngineError::config(format!(
                    "max_brain_share {} must be in (0, 1]",
                    share
                )));
            }
        }
        Ok(())
    }
}

/// Hub tuning
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Overrides the profile's exploration noise
    pub exploration_rate: Option<f64>,
    /// Overrides the profile's relevance blend
    pub relevance_blend: Option<f64>,
    /// Minimum relevance weight any enabled brain keeps
    pub relevance_floor: f64,
    pub relevance_ceiling: f64,
    /// Contests of BrainPerformance history considered for relevance
    pub relevance_window: usize,
    pub normalization: Normalization,
    pub similarity: SimilarityMetric,
    /// Hit count to score value, used by learning and performance rows
    pub score_curve: ScoreCurve,
    pub consensus_enabled: bool,
    pub consensus_bonus: f64,
    pub consensus_min_votes: usize,
    /// Wall-clock budget for one brain's generation call
    pub brain_time_budget_ms: u64,
    /// Root seed; every round derives its generators from it
    pub seed: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            exploration_rate: None,
            relevance_blend: None,
            relevance_floor: 0.05,
            relevance_ceiling: 1.5,
            relevance_window: 50,
            normalization: Normalization::MinMax,
            similarity: SimilarityMetric::OverlapFraction,
            score_curve: ScoreCurve::Identity,
            consensus_enabled: false,
            consensus_bonus: 0.02,
            consensus_min_votes: 2,
            brain_time_budget_ms: 5_000,
            seed: 0x5EED_B4A1,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.exploration_rate {
            check_rate("exploration_rate", rate)?;
        }
        if let Some(blend) = self.relevance_blend {
            check_rate("relevance_blend", blend)?;
        }
        if !(self.relevance_floor > 0.0) || self.relevance_ceiling < self.relevance_floor {
            return Err(EngineError::config(
                "relevance_floor must be > 0 and <= relevance_ceiling",
            ));
        }
        if self.relevance_window == 0 {
            return Err(EngineError::config("relevance_window must be > 0"));
        }
        if let ScoreCurve::Exponential { base } = self.score_curve {
            if !(base.is_finite() && base > 1.0) {
                return Err(EngineError::config(format!(
                    "exponential score curve base {} must be finite and > 1",
                    base
                )));
            }
        }
        if self.consensus_bonus < 0.0 || self.consensus_min_votes < 2 {
            return Err(EngineError::config(
                "consensus_bonus must be >= 0 and consensus_min_votes >= 2",
            ));
        }
        if self.brain_time_budget_ms == 0 {
            return Err(EngineError::config("brain_time_budget_ms must be > 0"));
        }
        Ok(())
    }
}

/// Incremental trainer cadence
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrainerConfig {
    /// Draws of history in each round's context
    pub context_window: usize,
    /// Loop mode: seconds between polls when no contest is pending
    pub poll_interval_secs: u64,
    /// Cap on contests processed by one run
    pub max_contests_per_run: Option<usize>,
    /// Provenance tag written on archived memories
    pub run_tag: String,
    /// Where file stores and the journal live
    pub workspace_dir: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            context_window: 300,
            poll_interval_secs: 1_800,
            max_contests_per_run: None,
            run_tag: "trainer".to_string(),
            workspace_dir: None,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub rules: GameRules,
    pub round: RoundConfig,
    pub hub: HubConfig,
    pub trainer: TrainerConfig,
    pub brains: BTreeMap<String, BrainSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let brains = KNOWN_BRAINS
            .iter()
            .map(|id| (id.to_string(), BrainSettings::default()))
            .collect();
        Self {
            rules: GameRules::default(),
            round: RoundConfig::default(),
            hub: HubConfig::default(),
            trainer: TrainerConfig::default(),
            brains,
        }
    }
}

impl EngineConfig {
    /// Layer an optional file under `BRAINHUB__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject bad parameters before any round starts
    pub fn validate(&self) -> Result<()> {
        self.rules.validate()?;
        self.round.validate(&self.rules)?;
        self.hub.validate()?;
        if self.trainer.context_window == 0 {
            return Err(EngineError::config("context_window must be > 0"));
        }
        for (id, settings) in &self.brains {
            if !KNOWN_BRAINS.contains(&id.as_str()) {
                return Err(EngineError::config(format!("unknown brain id '{}'", id)));
            }
            if let Some(step) = &settings.step_sequence {
                step.validate()?;
            }
        }
        Ok(())
    }

    /// Settings for a brain id; unlisted brains are disabled
    pub fn brain(&self, id: &str) -> Option<&BrainSettings> {
        self.brains.get(id)
    }

    pub fn exploration_rate(&self) -> f64 {
        self.hub
            .exploration_rate
            .unwrap_or_else(|| self.round.profile.preset().exploration_rate)
    }

    pub fn relevance_blend(&self) -> f64 {
        self.hub
            .relevance_blend
            .unwrap_or_else(|| self.round.profile.preset().relevance_blend)
    }
}

fn check_rate(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "{} {} must be within [0, 1]",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.brains.len(), KNOWN_BRAINS.len());
        assert_eq!(config.round.effective_max_similarity(), 0.78);
    }

    #[test]
    fn test_step_sequence_defaults() {
        let step = StepSequenceConfig::default();
        assert_eq!(step.mutation_rate, 0.10);
        assert_eq!(step.exploration_rate, 0.10);
        assert_eq!(step.delta_max, 3);
        assert_eq!(step.wrap_mode, WrapMode::Wrap);
        assert_eq!(step.max_attempts_per_candidate, 50);
    }

    #[test]
    fn test_rejects_size_out_of_range() {
        let mut config = EngineConfig::default();
        config.round.sizes = vec![14];
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        config.round.sizes = vec![15, 18, 20];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_step_options() {
        let mut config = EngineConfig::default();
        config.brains.insert(
            "heur_step_sequences".to_string(),
            BrainSettings {
                enabled: true,
                step_sequence: Some(StepSequenceConfig {
                    max_attempts_per_candidate: 0,
                    ..Default::default()
                }),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_brain() {
        let mut config = EngineConfig::default();
        config
            .brains
            .insert("nonexistent".to_string(), BrainSettings::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_relevance_window() {
        let mut config = EngineConfig::default();
        config.hub.relevance_window = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_score_curve_validation() {
        let mut config = EngineConfig::default();
        config.hub.score_curve = ScoreCurve::Exponential { base: 1.0 };
        assert!(config.validate().is_err());

        config.hub.score_curve = ScoreCurve::Exponential { base: 2.0 };
        config.validate().unwrap();
    }

    #[test]
    fn test_rules_presets_validate() {
        GameRules::wheel_25().validate().unwrap();
        GameRules::board_31().validate().unwrap();

        let broken = GameRules {
            strong_threshold: 15,
            top_threshold: 14,
            ..GameRules::wheel_25()
        };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{
                "round": { "sizes": [15, 18], "top_n": 120, "profile": "aggressive" },
                "hub": { "score_curve": { "kind": "exponential", "base": 1.5 } },
                "brains": {
                    "heur_step_sequences": {
                        "enabled": true,
                        "step_sequence": { "wrap_mode": "clamp", "delta_max": 4 }
                    },
                    "temporal_delay": { "enabled": false }
                }
            }"#,
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.round.sizes, vec![15, 18]);
        assert_eq!(config.round.top_n, 120);
        assert_eq!(config.round.profile, Profile::Aggressive);
        assert_eq!(config.hub.score_curve, ScoreCurve::Exponential { base: 1.5 });
        let step = config
            .brain("heur_step_sequences")
            .and_then(|b| b.step_sequence)
            .unwrap();
        assert_eq!(step.wrap_mode, WrapMode::Clamp);
        assert_eq!(step.delta_max, 4);
        assert_eq!(step.mutation_rate, 0.10);
        assert!(!config.brain("temporal_delay").unwrap().enabled);
    }
}
