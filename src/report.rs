//! Round reports and the sinks that consume them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::hub::{BrainFailure, LearningUpdate, RoundOutcome};
use crate::types::{ScoreTag, Stage};

/// One selected candidate as reported downstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedCandidate {
    pub size: usize,
    pub brain_id: String,
    pub numbers: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub raw_score: f64,
    pub normalized_score: f64,
    pub final_score: f64,
    /// Filled once the outcome is known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<ScoreTag>,
}

/// Per-round record: final selection with scores and provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    pub round_id: Uuid,
    pub run_tag: String,
    pub contest: u64,
    pub target_contest: u64,
    pub generated_at: DateTime<Utc>,
    pub relevance: BTreeMap<String, f64>,
    pub candidates_generated: usize,
    pub selected: Vec<ReportedCandidate>,
    pub failures: Vec<BrainFailure>,
    pub memories_archived: usize,
}

impl RoundReport {
    pub fn build(
        run_tag: &str,
        outcome: &RoundOutcome,
        learning: Option<&LearningUpdate>,
        memories_archived: usize,
    ) -> Self {
        let selected = match learning {
            Some(update) => update
                .selected
                .iter()
                .map(|s| ReportedCandidate {
                    size: s.ranked.candidate.size(),
                    brain_id: s.ranked.candidate.brain_id.clone(),
                    numbers: s.ranked.candidate.numbers.clone(),
                    pattern: s.ranked.candidate.pattern.clone(),
                    raw_score: s.ranked.raw_score,
                    normalized_score: s.ranked.normalized_score,
                    final_score: s.ranked.final_score,
                    hits: Some(s.score.hits),
                    tag: Some(s.score.tag),
                })
                .collect(),
            None => outcome
                .selections
                .iter()
                .flat_map(|sel| sel.selected.iter())
                .map(|r| ReportedCandidate {
                    size: r.candidate.size(),
                    brain_id: r.candidate.brain_id.clone(),
                    numbers: r.candidate.numbers.clone(),
                    pattern: r.candidate.pattern.clone(),
                    raw_score: r.raw_score,
                    normalized_score: r.normalized_score,
                    final_score: r.final_score,
                    hits: None,
                    tag: None,
                })
                .collect(),
        };

        Self {
            round_id: outcome.round_id,
            run_tag: run_tag.to_string(),
            contest: outcome.contest,
            target_contest: outcome.target_contest,
            generated_at: Utc::now(),
            relevance: outcome.relevance.clone(),
            candidates_generated: outcome.candidates_generated(),
            selected,
            failures: outcome.failures.clone(),
            memories_archived,
        }
    }

    pub fn best_hits(&self) -> Option<usize> {
        self.selected.iter().filter_map(|c| c.hits).max()
    }
}

/// Trainer status (state/now.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: DateTime<Utc>,
    pub run_tag: String,
    pub stage: Stage,
    pub checkpoint: Option<u64>,
    pub pending: usize,
    pub rounds_completed: u64,
    pub rounds_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_round_id: Option<Uuid>,
}

/// Consumer of round reports and trainer status
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn round(&self, report: &RoundReport) -> Result<()>;

    /// Selection for a contest whose draw is not known yet
    async fn prediction(&self, report: &RoundReport) -> Result<()> {
        self.round(report).await
    }

    async fn status(&self, _now: &NowState) -> Result<()> {
        Ok(())
    }
}

/// Logs each round as structured events
pub struct TracingSink;

#[async_trait]
impl ReportSink for TracingSink {
    async fn round(&self, report: &RoundReport) -> Result<()> {
        info!(
            contest = report.contest,
            target = report.target_contest,
            round_id = %report.round_id,
            selected = report.selected.len(),
            best_hits = ?report.best_hits(),
            "round_report"
        );
        for c in &report.selected {
            debug!(
                brain_id = %c.brain_id,
                size = c.size,
                score = c.final_score,
                hits = ?c.hits,
                "selected {:?}",
                c.numbers
            );
        }
        Ok(())
    }

    async fn status(&self, now: &NowState) -> Result<()> {
        debug!(stage = ?now.stage, checkpoint = ?now.checkpoint, "trainer_status");
        Ok(())
    }
}

/// Writes `state/now.json`, `journal/rounds/<contest>.json` and
/// `journal/predictions/<target_contest>.json` under a workspace
pub struct JournalSink {
    state_dir: PathBuf,
    journal_dir: PathBuf,
    predictions_dir: PathBuf,
}

impl JournalSink {
    pub fn new(workspace_dir: impl AsRef<Path>) -> Self {
        let base = workspace_dir.as_ref();
        Self {
            state_dir: base.join("state"),
            journal_dir: base.join("journal").join("rounds"),
            predictions_dir: base.join("journal").join("predictions"),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(&self.journal_dir).await?;
        fs::create_dir_all(&self.predictions_dir).await?;
        Ok(())
    }

    pub fn round_path(&self, contest: u64) -> PathBuf {
        self.journal_dir.join(format!("{}.json", contest))
    }

    pub fn prediction_path(&self, target_contest: u64) -> PathBuf {
        self.predictions_dir.join(format!("{}.json", target_contest))
    }
}

#[async_trait]
impl ReportSink for JournalSink {
    async fn round(&self, report: &RoundReport) -> Result<()> {
        let path = self.round_path(report.contest);
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&path, json).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn prediction(&self, report: &RoundReport) -> Result<()> {
        let path = self.prediction_path(report.target_contest);
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&path, json).await?;
        info!("Prediction for contest {} written to {}", report.target_contest, path.display());
        Ok(())
    }

    async fn status(&self, now: &NowState) -> Result<()> {
        let path = self.state_dir.join("now.json");
        let json = serde_json::to_string_pretty(now)?;
        fs::write(&path, json).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{RankedCandidate, SizeSelection};
    use crate::types::Candidate;

    fn outcome() -> RoundOutcome {
        RoundOutcome {
            round_id: Uuid::new_v4(),
            contest: 7,
            target_contest: 8,
            relevance: BTreeMap::from([("b".to_string(), 0.9)]),
            batches: vec![],
            selections: vec![SizeSelection {
                size: 15,
                pool_size: 1,
                selected: vec![RankedCandidate {
                    candidate: Candidate::new("b", 8, (1..=15).collect()),
                    raw_score: 0.4,
                    normalized_score: 0.5,
                    relevance: 0.9,
                    final_score: 0.6,
                    votes: 1,
                }],
            }],
            failures: vec![],
        }
    }

    #[test]
    fn test_report_without_outcome_has_no_hits() {
        let report = RoundReport::build("trainer", &outcome(), None, 0);
        assert_eq!(report.selected.len(), 1);
        assert_eq!(report.selected[0].hits, None);
        assert_eq!(report.best_hits(), None);
    }

    #[tokio::test]
    async fn test_journal_sink_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JournalSink::new(dir.path());
        sink.init().await.unwrap();

        let report = RoundReport::build("trainer", &outcome(), None, 0);
        sink.round(&report).await.unwrap();
        sink.status(&NowState {
            timestamp: Utc::now(),
            run_tag: "trainer".into(),
            stage: Stage::Idle,
            checkpoint: Some(7),
            pending: 0,
            rounds_completed: 1,
            rounds_failed: 0,
            last_round_id: Some(report.round_id),
        })
        .await
        .unwrap();

        let written = std::fs::read_to_string(sink.round_path(7)).unwrap();
        let parsed: RoundReport = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.round_id, report.round_id);
        assert!(dir.path().join("state").join("now.json").exists());

        // Predictions go to their own directory, keyed by target contest
        sink.prediction(&report).await.unwrap();
        assert!(sink.prediction_path(8).exists());
        assert!(!sink.round_path(8).exists());
    }
}
