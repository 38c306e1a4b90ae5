//! Operating profile presets
//!
//! These are the internal parameters behind each profile. Operators pick a
//! profile; explicit config fields still override individual values.

use serde::Serialize;

use crate::config::Profile;

/// Exploration/diversity parameters for one profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfilePreset {
    /// Share of the final score replaced by uniform noise
    pub exploration_rate: f64,
    /// Pairwise similarity cap for diversity selection
    pub max_similarity: f64,
    /// Scales the per-brain candidate budget
    pub budget_multiplier: f64,
    /// Weight of brain relevance in the combined score
    pub relevance_blend: f64,
    /// Backtest only: chance a brain sits out a block
    pub drop_rate: f64,
}

/// Get preset for a profile
pub fn preset_for(profile: Profile) -> ProfilePreset {
    match profile {
        Profile::Conservative => ProfilePreset {
            exploration_rate: 0.04,
            max_similarity: 0.72,
            budget_multiplier: 1.0,
            relevance_blend: 0.45,
            drop_rate: 0.18,
        },
        Profile::Balanced => ProfilePreset {
            exploration_rate: 0.08,
            max_similarity: 0.78,
            budget_multiplier: 1.0,
            relevance_blend: 0.35,
            drop_rate: 0.18,
        },
        Profile::Aggressive => ProfilePreset {
            exploration_rate: 0.15,
            max_similarity: 0.85,
            budget_multiplier: 1.5,
            relevance_blend: 0.25,
            drop_rate: 0.12,
        },
    }
}
