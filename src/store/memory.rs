//! In-memory stores for tests and backtests

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use super::{
    check_draw, performance_window, pick_version, push_version, BrainStateStore, CommitReceipt, DrawHistory,
    RoundCommit,
};
use crate::brain::BrainState;
use crate::config::GameRules;
use crate::error::{EngineError, Result};
use crate::types::{BrainPerformance, Checkpoint, Draw, Stage, StrongGameMemory};

/// Draw history backed by an ordered map
#[derive(Clone, Default)]
pub struct MemoryDrawHistory {
    rules: Arc<GameRules>,
    draws: Arc<RwLock<BTreeMap<u64, Draw>>>,
}

impl MemoryDrawHistory {
    /// Empty history for the default game
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with draws for the default game
    pub fn from_draws(draws: impl IntoIterator<Item = Draw>) -> Self {
        Self::with_rules(GameRules::default(), draws)
    }

    /// Seed with draws in any order; later duplicates of a contest win.
    /// Draws that do not fit `rules` are left out.
    pub fn with_rules(rules: GameRules, draws: impl IntoIterator<Item = Draw>) -> Self {
        let mut map = BTreeMap::new();
        for draw in draws {
            match check_draw(&draw, &rules) {
                Ok(()) => {
                    map.insert(draw.contest, draw);
                }
                Err(e) => warn!("Skipping seed draw: {}", e),
            }
        }
        Self {
            rules: Arc::new(rules),
            draws: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl DrawHistory for MemoryDrawHistory {
    async fn get_draw(&self, contest: u64) -> Result<Option<Draw>> {
        Ok(self.draws.read().await.get(&contest).cloned())
    }

    async fn latest_contest(&self) -> Result<Option<u64>> {
        Ok(self.draws.read().await.keys().next_back().copied())
    }

    async fn contests(&self) -> Result<Vec<u64>> {
        Ok(self.draws.read().await.keys().copied().collect())
    }

    async fn window(&self, up_to: u64, len: usize) -> Result<Vec<Draw>> {
        let draws = self.draws.read().await;
        let mut recent: Vec<Draw> = draws
            .range(..=up_to)
            .rev()
            .take(len)
            .map(|(_, d)| d.clone())
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn append(&self, draw: Draw) -> Result<()> {
        check_draw(&draw, &self.rules)?;
        let mut draws = self.draws.write().await;
        if let Some(&latest) = draws.keys().next_back() {
            if draw.contest <= latest {
                return Err(EngineError::Persistence(format!(
                    "draw {} is not newer than latest {}",
                    draw.contest, latest
                )));
            }
        }
        draws.insert(draw.contest, draw);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreData {
    pub states: BTreeMap<String, Vec<BrainState>>,
    pub checkpoint: Option<Checkpoint>,
    pub performance: BTreeMap<(String, u64), BrainPerformance>,
    pub memories: Vec<StrongGameMemory>,
    pub memory_keys: BTreeSet<(u64, u64, usize, Vec<u8>)>,
}

impl StoreData {
    pub fn save_state(&mut self, state: &BrainState) {
        let versions = self.states.entry(state.brain_id.clone()).or_default();
        push_version(versions, state.clone());
    }

    pub fn advance_checkpoint(&mut self, contest: u64, stage: Stage) -> Result<()> {
        if let Some(last) = self.checkpoint.as_ref().and_then(|c| c.last_contest) {
            if contest < last {
                return Err(EngineError::Persistence(format!(
                    "checkpoint cannot regress from {} to {}",
                    last, contest
                )));
            }
        }
        self.checkpoint = Some(Checkpoint {
            last_contest: Some(contest),
            stage,
            updated_at: Some(Utc::now()),
        });
        Ok(())
    }

    pub fn upsert_performance(&mut self, row: &BrainPerformance) {
        self.performance
            .insert((row.brain_id.clone(), row.contest), row.clone());
    }

    pub fn insert_memory(&mut self, memory: &StrongGameMemory) -> bool {
        if !self.memory_keys.insert(memory.key()) {
            return false;
        }
        self.memories.push(memory.clone());
        true
    }

    /// Drop everything recorded for contests after `last`
    pub fn discard_after(&mut self, last: Option<u64>) -> usize {
        let mut dropped = 0;
        for versions in self.states.values_mut() {
            let before = versions.len();
            versions.retain(|v| v.as_of <= last);
            dropped += before - versions.len();
        }
        self.states.retain(|_, versions| !versions.is_empty());

        let before = self.performance.len();
        self.performance.retain(|(_, contest), _| Some(*contest) <= last);
        dropped += before - self.performance.len();

        let before = self.memories.len();
        self.memories.retain(|m| Some(m.contest) <= last);
        dropped += before - self.memories.len();
        self.memory_keys = self.memories.iter().map(|m| m.key()).collect();
        dropped
    }

    /// Apply a commit to this copy; the caller swaps it in on success
    pub fn apply(&mut self, commit: &RoundCommit) -> Result<CommitReceipt> {
        let mut receipt = CommitReceipt::default();
        for state in &commit.states {
            self.save_state(state);
            receipt.states_saved += 1;
        }
        for row in &commit.performance {
            self.upsert_performance(row);
            receipt.performance_rows += 1;
        }
        for memory in &commit.memories {
            if self.insert_memory(memory) {
                receipt.memories_archived += 1;
            } else {
                receipt.memories_duplicate += 1;
            }
        }
        self.advance_checkpoint(commit.contest, Stage::CheckpointAdvance)?;
        Ok(receipt)
    }
}

/// Brain state store held in process memory
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    data: Arc<RwLock<StoreData>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent copy of everything stored so far
    pub async fn snapshot(&self) -> Self {
        let data = self.data.read().await.clone();
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub async fn performance_rows(&self) -> Vec<BrainPerformance> {
        self.data.read().await.performance.values().cloned().collect()
    }
}

#[async_trait]
impl BrainStateStore for MemoryStateStore {
    async fn load_state(
        &self,
        brain_id: &str,
        not_after: Option<u64>,
    ) -> Result<Option<BrainState>> {
        let data = self.data.read().await;
        Ok(data
            .states
            .get(brain_id)
            .and_then(|versions| pick_version(versions, not_after)))
    }

    async fn save_state(&self, state: &BrainState) -> Result<()> {
        self.data.write().await.save_state(state);
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Checkpoint> {
        Ok(self.data.read().await.checkpoint.clone().unwrap_or_default())
    }

    async fn advance_checkpoint(&self, contest: u64, stage: Stage) -> Result<()> {
        self.data.write().await.advance_checkpoint(contest, stage)
    }

    async fn append_performance(&self, row: &BrainPerformance) -> Result<()> {
        self.data.write().await.upsert_performance(row);
        Ok(())
    }

    async fn load_performance(&self, before: u64, window: usize) -> Result<Vec<BrainPerformance>> {
        let data = self.data.read().await;
        Ok(performance_window(
            data.performance.values().cloned(),
            before,
            window,
        ))
    }

    async fn append_strong_memory(&self, memory: &StrongGameMemory) -> Result<bool> {
        Ok(self.data.write().await.insert_memory(memory))
    }

    async fn strong_memories(&self) -> Result<Vec<StrongGameMemory>> {
        Ok(self.data.read().await.memories.clone())
    }

    async fn discard_uncommitted(&self, last: Option<u64>) -> Result<usize> {
        Ok(self.data.write().await.discard_after(last))
    }

    async fn commit_round(&self, commit: &RoundCommit) -> Result<CommitReceipt> {
        let mut data = self.data.write().await;
        let mut staged = data.clone();
        let receipt = staged.apply(commit)?;
        *data = staged;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(numbers: Vec<u8>) -> StrongGameMemory {
        StrongGameMemory {
            contest: 5,
            target_contest: 6,
            size: numbers.len(),
            numbers,
            hits: 13,
            weight: 1.0,
            origin: "trainer:b".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_draw_history_append_only() {
        let history = MemoryDrawHistory::from_draws(vec![
            Draw::new(2, (1..=15).collect()),
            Draw::new(1, (2..=16).collect()),
        ]);
        assert_eq!(history.latest_contest().await.unwrap(), Some(2));
        assert!(history.append(Draw::new(2, (1..=15).collect())).await.is_err());
        history.append(Draw::new(3, (3..=17).collect())).await.unwrap();

        let window = history.window(3, 2).await.unwrap();
        let contests: Vec<u64> = window.iter().map(|d| d.contest).collect();
        assert_eq!(contests, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_append_rejects_malformed_draw() {
        let history = MemoryDrawHistory::new();
        history.append(Draw::new(1, (1..=15).collect())).await.unwrap();

        // 17 numbers, one of them outside the 25-number wheel
        let err = history
            .append(Draw::new(2, (10..=26).collect()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(history.append(Draw::new(2, (1..=14).collect())).await.is_err());
        assert_eq!(history.latest_contest().await.unwrap(), Some(1));

        let board = MemoryDrawHistory::with_rules(
            GameRules::board_31(),
            vec![Draw::new(1, vec![1, 5, 9, 13, 17, 21, 31]), Draw::new(2, (1..=15).collect())],
        );
        assert_eq!(board.contests().await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_discard_uncommitted() {
        let store = MemoryStateStore::new();
        let mut committed = BrainState::new("b", serde_json::json!({ "n": 3 }));
        committed.as_of = Some(3);
        store
            .commit_round(&RoundCommit {
                contest: 3,
                states: vec![committed.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        // Written for contest 4, but the checkpoint never got there
        let mut leaked = BrainState::new("b", serde_json::json!({ "n": 4 }));
        leaked.as_of = Some(4);
        store.save_state(&leaked).await.unwrap();
        let mut leaked_memory = memory((1..=15).collect());
        leaked_memory.contest = 4;
        store.append_strong_memory(&leaked_memory).await.unwrap();

        assert_eq!(store.discard_uncommitted(Some(3)).await.unwrap(), 2);
        assert_eq!(store.load_state("b", Some(4)).await.unwrap(), Some(committed));
        assert!(store.strong_memories().await.unwrap().is_empty());
        assert_eq!(store.discard_uncommitted(Some(3)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_never_regresses() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load_checkpoint().await.unwrap().last_contest, None);
        store.advance_checkpoint(10, Stage::Idle).await.unwrap();
        store.advance_checkpoint(10, Stage::Idle).await.unwrap();
        let err = store.advance_checkpoint(9, Stage::Idle).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(store.load_checkpoint().await.unwrap().last_contest, Some(10));
    }

    #[tokio::test]
    async fn test_memory_uniqueness() {
        let store = MemoryStateStore::new();
        assert!(store.append_strong_memory(&memory((1..=15).collect())).await.unwrap());
        assert!(!store.append_strong_memory(&memory((1..=15).collect())).await.unwrap());
        assert!(store.append_strong_memory(&memory((2..=16).collect())).await.unwrap());
        assert_eq!(store.strong_memories().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_store_untouched() {
        let store = MemoryStateStore::new();
        store.advance_checkpoint(8, Stage::Idle).await.unwrap();

        let commit = RoundCommit {
            contest: 7,
            states: vec![BrainState::new("b", serde_json::json!({}))],
            performance: vec![],
            memories: vec![memory((1..=15).collect())],
        };
        assert!(store.commit_round(&commit).await.is_err());
        assert!(store.load_state("b", None).await.unwrap().is_none());
        assert!(store.strong_memories().await.unwrap().is_empty());
    }
}
