//! Persistence seams - draw history and brain state
//!
//! The engine only talks to these traits. `memory` backs tests and
//! backtests; `file` keeps everything in JSON files under a workspace.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::brain::BrainState;
use crate::config::GameRules;
use crate::error::{EngineError, Result};
use crate::types::{BrainPerformance, Checkpoint, Draw, Stage, StrongGameMemory};

pub use file::{FileDrawHistory, FileStateStore};
pub use memory::{MemoryDrawHistory, MemoryStateStore};

/// State versions kept per brain. Two is enough to step back over a round
/// whose checkpoint never landed.
pub const STATE_VERSIONS: usize = 2;

/// Append-only, ordered sequence of published draws
#[async_trait]
pub trait DrawHistory: Send + Sync {
    async fn get_draw(&self, contest: u64) -> Result<Option<Draw>>;

    async fn latest_contest(&self) -> Result<Option<u64>>;

    /// All known contests, ascending
    async fn contests(&self) -> Result<Vec<u64>>;

    /// Up to `len` most recent draws with contest <= `up_to`, oldest first
    async fn window(&self, up_to: u64, len: usize) -> Result<Vec<Draw>>;

    /// Rejects a contest that is not newer than the latest one, and a draw
    /// that does not fit the game's rules
    async fn append(&self, draw: Draw) -> Result<()>;
}

/// Everything one round writes, applied as a unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundCommit {
    pub contest: u64,
    pub states: Vec<BrainState>,
    pub performance: Vec<BrainPerformance>,
    pub memories: Vec<StrongGameMemory>,
}

/// What a commit actually changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub states_saved: usize,
    pub performance_rows: usize,
    pub memories_archived: usize,
    pub memories_duplicate: usize,
}

/// Learned state, performance counters, memory archive and checkpoint
#[async_trait]
pub trait BrainStateStore: Send + Sync {
    /// Newest saved state whose `as_of` is not after `not_after`, normally
    /// the checkpointed contest. `None` means "before the first contest".
    async fn load_state(&self, brain_id: &str, not_after: Option<u64>)
        -> Result<Option<BrainState>>;

    async fn save_state(&self, state: &BrainState) -> Result<()>;

    /// Default checkpoint when none was ever written
    async fn load_checkpoint(&self) -> Result<Checkpoint>;

    /// Fails with `Persistence` if `contest` is behind the stored checkpoint
    async fn advance_checkpoint(&self, contest: u64, stage: Stage) -> Result<()>;

    /// Upsert keyed by (brain_id, contest)
    async fn append_performance(&self, row: &BrainPerformance) -> Result<()>;

    /// Rows for contests strictly before `before`, limited to the latest
    /// `window` contests
    async fn load_performance(&self, before: u64, window: usize) -> Result<Vec<BrainPerformance>>;

    /// Returns false when an entry with the same identity already exists
    async fn append_strong_memory(&self, memory: &StrongGameMemory) -> Result<bool>;

    async fn strong_memories(&self) -> Result<Vec<StrongGameMemory>>;

    /// Drop states, performance rows and memories recorded after `last`
    /// (the checkpointed contest). These come from a round whose checkpoint
    /// never landed. Returns how many entries went.
    async fn discard_uncommitted(&self, last: Option<u64>) -> Result<usize>;

    /// Apply a round's writes, checkpoint last. Implementations that can
    /// write everything at once should override this. The default leaves
    /// partial writes behind on failure; `discard_uncommitted` clears them
    /// before the next run.
    async fn commit_round(&self, commit: &RoundCommit) -> Result<CommitReceipt> {
        let mut receipt = CommitReceipt::default();
        for state in &commit.states {
            self.save_state(state).await?;
            receipt.states_saved += 1;
        }
        for row in &commit.performance {
            self.append_performance(row).await?;
            receipt.performance_rows += 1;
        }
        for memory in &commit.memories {
            if self.append_strong_memory(memory).await? {
                receipt.memories_archived += 1;
            } else {
                receipt.memories_duplicate += 1;
            }
        }
        self.advance_checkpoint(commit.contest, Stage::CheckpointAdvance)
            .await?;
        Ok(receipt)
    }
}

/// Reject a draw of the wrong size or with numbers outside the universe
pub(crate) fn check_draw(draw: &Draw, rules: &GameRules) -> Result<()> {
    if draw.is_valid(rules) {
        return Ok(());
    }
    Err(EngineError::Persistence(format!(
        "draw {} has {} numbers {:?}, {} expects {} in 1..={}",
        draw.contest,
        draw.numbers.len(),
        draw.numbers,
        rules.name,
        rules.draw_size,
        rules.universe_max
    )))
}

/// Insert or replace the version with the same `as_of`, keep the newest few
pub(crate) fn push_version(versions: &mut Vec<BrainState>, state: BrainState) {
    versions.retain(|v| v.as_of != state.as_of);
    versions.push(state);
    versions.sort_by_key(|v| v.as_of);
    if versions.len() > STATE_VERSIONS {
        let excess = versions.len() - STATE_VERSIONS;
        versions.drain(..excess);
    }
}

/// `None` sorts before every contest, so it only matches never-learned states
pub(crate) fn pick_version(versions: &[BrainState], not_after: Option<u64>) -> Option<BrainState> {
    versions.iter().rev().find(|v| v.as_of <= not_after).cloned()
}

/// Rows before `before`, restricted to the latest `window` distinct contests
pub(crate) fn performance_window(
    rows: impl Iterator<Item = BrainPerformance>,
    before: u64,
    window: usize,
) -> Vec<BrainPerformance> {
    if window == 0 {
        return Vec::new();
    }
    let mut rows: Vec<BrainPerformance> = rows.filter(|r| r.contest < before).collect();
    let mut contests: Vec<u64> = rows.iter().map(|r| r.contest).collect();
    contests.sort_unstable();
    contests.dedup();
    let cutoff = contests
        .len()
        .checked_sub(window)
        .and_then(|i| contests.get(i).copied())
        .unwrap_or(0);
    rows.retain(|r| r.contest >= cutoff);
    rows.sort_by(|a, b| a.contest.cmp(&b.contest).then(a.brain_id.cmp(&b.brain_id)));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn state(as_of: Option<u64>) -> BrainState {
        BrainState {
            brain_id: "b".into(),
            as_of,
            data: serde_json::json!({ "as_of": as_of }),
        }
    }

    #[test]
    fn test_versions_step_back_over_unfinished_round() {
        let mut versions = Vec::new();
        push_version(&mut versions, state(Some(10)));
        push_version(&mut versions, state(Some(11)));
        push_version(&mut versions, state(Some(12)));
        assert_eq!(versions.len(), STATE_VERSIONS);

        // Checkpoint still at 11: the state written for 12 is not visible
        assert_eq!(pick_version(&versions, Some(11)).unwrap().as_of, Some(11));
        assert_eq!(pick_version(&versions, Some(40)).unwrap().as_of, Some(12));
        assert!(pick_version(&versions, Some(5)).is_none());
        assert!(pick_version(&versions, None).is_none());
    }

    #[test]
    fn test_replay_replaces_same_version() {
        let mut versions = vec![state(Some(3))];
        let mut replay = state(Some(3));
        replay.data = serde_json::json!({ "replayed": true });
        push_version(&mut versions, replay.clone());
        assert_eq!(versions, vec![replay]);
    }

    #[test]
    fn test_performance_window() {
        let row = |brain: &str, contest: u64| BrainPerformance {
            brain_id: brain.into(),
            contest,
            candidates_generated: 1,
            mean_hits: 0.0,
            mean_score: 0.0,
            max_hits: 0,
            top_hits: 0,
            strong_hits: 0,
            tier_counts: BTreeMap::new(),
            updated_at: Utc::now(),
        };
        let rows = vec![row("a", 1), row("b", 1), row("a", 2), row("a", 3), row("a", 4)];
        let picked = performance_window(rows.into_iter(), 4, 2);
        let contests: Vec<u64> = picked.iter().map(|r| r.contest).collect();
        assert_eq!(contests, vec![2, 3]);

        let rows = vec![row("a", 1), row("a", 2)];
        assert!(performance_window(rows.into_iter(), 6, 0).is_empty());
    }

    #[test]
    fn test_check_draw() {
        let rules = GameRules::default();
        check_draw(&Draw::new(1, (1..=15).collect()), &rules).unwrap();

        let short = Draw::new(2, (1..=14).collect());
        assert!(matches!(
            check_draw(&short, &rules),
            Err(EngineError::Persistence(_))
        ));
        let out_of_range = Draw::new(3, (12..=26).collect());
        assert!(check_draw(&out_of_range, &rules).is_err());
    }
}
