//! JSON file stores
//!
//! Every mutation rewrites one snapshot through a temp file and a rename, so
//! a crash leaves either the old snapshot or the new one on disk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::memory::StoreData;
use super::{
    check_draw, performance_window, pick_version, BrainStateStore, CommitReceipt, DrawHistory, RoundCommit,
};
use crate::brain::BrainState;
use crate::config::GameRules;
use crate::error::{EngineError, Result};
use crate::types::{BrainPerformance, Checkpoint, Draw, Stage, StrongGameMemory};

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            EngineError::Persistence(format!("{} is unreadable: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .await
        .map_err(|e| EngineError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| EngineError::Persistence(format!("rename to {}: {}", path.display(), e)))?;
    Ok(())
}

/// Draw history kept as one JSON array (`draws.json`)
pub struct FileDrawHistory {
    path: PathBuf,
    rules: GameRules,
    draws: RwLock<BTreeMap<u64, Draw>>,
}

impl FileDrawHistory {
    /// Load `path` (missing means empty). Fails if any stored draw does not
    /// fit `rules`.
    pub async fn open(path: impl Into<PathBuf>, rules: GameRules) -> Result<Self> {
        let path = path.into();
        let draws: Vec<Draw> = read_json(&path).await?.unwrap_or_default();
        for draw in &draws {
            check_draw(draw, &rules)
                .map_err(|e| EngineError::Persistence(format!("{}: {}", path.display(), e)))?;
        }
        info!("Loaded {} draws from {}", draws.len(), path.display());
        Ok(Self {
            path,
            rules,
            draws: RwLock::new(draws.into_iter().map(|d| (d.contest, d)).collect()),
        })
    }
}

#[async_trait]
impl DrawHistory for FileDrawHistory {
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
        let mut all: Vec<Draw> = draws.values().cloned().collect();
        all.push(draw.clone());
        write_json_atomic(&self.path, &all).await?;
        draws.insert(draw.contest, draw);
        Ok(())
    }
}

/// On-disk layout of the brain store
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    checkpoint: Option<Checkpoint>,
    #[serde(default)]
    states: BTreeMap<String, Vec<BrainState>>,
    #[serde(default)]
    performance: Vec<BrainPerformance>,
    #[serde(default)]
    memories: Vec<StrongGameMemory>,
}

impl From<&StoreData> for Snapshot {
    fn from(data: &StoreData) -> Self {
        Self {
            checkpoint: data.checkpoint.clone(),
            states: data.states.clone(),
            performance: data.performance.values().cloned().collect(),
            memories: data.memories.clone(),
        }
    }
}

impl From<Snapshot> for StoreData {
    fn from(snapshot: Snapshot) -> Self {
        let mut data = StoreData {
            checkpoint: snapshot.checkpoint,
            states: snapshot.states,
            ..Default::default()
        };
        for row in &snapshot.performance {
            data.upsert_performance(row);
        }
        for memory in &snapshot.memories {
            data.insert_memory(memory);
        }
        data
    }
}

/// Brain state store persisted as `brain_store.json` in a directory
pub struct FileStateStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl FileStateStore {
    pub const FILE_NAME: &'static str = "brain_store.json";

    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(Self::FILE_NAME);
        let snapshot: Snapshot = read_json(&path).await?.unwrap_or_default();
        let data = StoreData::from(snapshot);
        info!(
            "Opened brain store at {} (checkpoint {:?})",
            path.display(),
            data.checkpoint.as_ref().and_then(|c| c.last_contest)
        );
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage a change on a copy, persist it, then publish it in memory
    async fn mutate<T>(&self, change: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self.data.write().await;
        let mut staged = data.clone();
        let out = change(&mut staged)?;
        write_json_atomic(&self.path, &Snapshot::from(&staged)).await?;
        *data = staged;
        debug!("Persisted {}", self.path.display());
        Ok(out)
    }
}

#[async_trait]
impl BrainStateStore for FileStateStore {
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
        self.mutate(|data| {
            data.save_state(state);
            Ok(())
        })
        .await
    }

    async fn load_checkpoint(&self) -> Result<Checkpoint> {
        Ok(self.data.read().await.checkpoint.clone().unwrap_or_default())
    }

    async fn advance_checkpoint(&self, contest: u64, stage: Stage) -> Result<()> {
        self.mutate(|data| data.advance_checkpoint(contest, stage)).await
    }

    async fn append_performance(&self, row: &BrainPerformance) -> Result<()> {
        self.mutate(|data| {
            data.upsert_performance(row);
            Ok(())
        })
        .await
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
        self.mutate(|data| Ok(data.insert_memory(memory))).await
    }

    async fn strong_memories(&self) -> Result<Vec<StrongGameMemory>> {
        Ok(self.data.read().await.memories.clone())
    }

    async fn discard_uncommitted(&self, last: Option<u64>) -> Result<usize> {
        let mut data = self.data.write().await;
        let mut staged = data.clone();
        let dropped = staged.discard_after(last);
        if dropped > 0 {
            write_json_atomic(&self.path, &Snapshot::from(&staged)).await?;
            *data = staged;
            info!("Discarded {} entries recorded after {:?}", dropped, last);
        }
        Ok(dropped)
    }

    /// One snapshot write for the whole round
    async fn commit_round(&self, commit: &RoundCommit) -> Result<CommitReceipt> {
        self.mutate(|data| data.apply(commit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let mut state = BrainState::new("temporal_delay", serde_json::json!({ "latest_contest": 4 }));
        state.as_of = Some(4);

        store
            .commit_round(&RoundCommit {
                contest: 4,
                states: vec![state.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        drop(store);

        let reopened = FileStateStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load_checkpoint().await.unwrap().last_contest, Some(4));
        assert_eq!(
            reopened.load_state("temporal_delay", Some(4)).await.unwrap(),
            Some(state)
        );
        assert!(!dir.path().join("brain_store.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FileStateStore::FILE_NAME), b"{ not json").unwrap();
        let err = FileStateStore::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, EngineError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_draw_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draws.json");
        let history = FileDrawHistory::open(&path, GameRules::default())
            .await
            .unwrap();
        assert_eq!(history.latest_contest().await.unwrap(), None);
        history.append(Draw::new(1, (1..=15).collect())).await.unwrap();
        history.append(Draw::new(2, (5..=19).collect())).await.unwrap();

        let reopened = FileDrawHistory::open(&path, GameRules::default())
            .await
            .unwrap();
        assert_eq!(reopened.contests().await.unwrap(), vec![1, 2]);
        assert!(reopened.append(Draw::new(2, (1..=15).collect())).await.is_err());
    }

    #[tokio::test]
    async fn test_draw_file_rejects_malformed_draws() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draws.json");
        let history = FileDrawHistory::open(&path, GameRules::default())
            .await
            .unwrap();
        history.append(Draw::new(1, (1..=15).collect())).await.unwrap();
        let err = history
            .append(Draw::new(2, (10..=26).collect()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));

        // Nothing malformed reached the file
        let reopened = FileDrawHistory::open(&path, GameRules::default())
            .await
            .unwrap();
        assert_eq!(reopened.contests().await.unwrap(), vec![1]);

        // A hand-edited file with a short draw refuses to load
        let bad = vec![Draw::new(1, (1..=15).collect()), Draw::new(2, (1..=12).collect())];
        std::fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();
        let err = FileDrawHistory::open(&path, GameRules::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Persistence(_)));
    }
}
