//! Incremental trainer
//!
//! Walks the draw history one contest at a time, strictly after the stored
//! checkpoint. Each round generates against the state as of contest N, scores
//! against the real draw N+1 and commits states, performance rows, memories
//! and finally the checkpoint in one unit. Nothing a round learns becomes
//! visible before its checkpoint lands, so a crash anywhere replays exactly
//! one contest.
//!
//! `predict_next` runs the same round for the contest after the latest known
//! draw, where no outcome exists yet, and only reports it.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::brain::BrainRegistry;
use crate::error::{EngineError, Result};
use crate::hub::BrainHub;
use crate::metrics::{names, MetricsCollector, MetricsSnapshot};
use crate::report::{NowState, ReportSink, RoundReport};
use crate::store::{BrainStateStore, CommitReceipt, DrawHistory, RoundCommit};
use crate::types::{Checkpoint, DrawContext, Stage};

/// Result of one processed contest
#[derive(Debug, Clone, Serialize)]
pub struct ContestResult {
    pub round_id: Uuid,
    pub contest: u64,
    pub target_contest: u64,
    pub candidates_generated: usize,
    pub selected: usize,
    pub skipped_brains: usize,
    pub best_hits: Option<usize>,
    pub receipt: CommitReceipt,
}

/// What a trainer run did
#[derive(Debug, Clone, Serialize)]
pub struct TrainerSummary {
    pub processed: Vec<ContestResult>,
    pub checkpoint: Option<u64>,
    /// Pending contests left for a later run (cap or cancellation)
    pub remaining: usize,
    pub state_resets: usize,
    pub metrics: MetricsSnapshot,
}

pub struct IncrementalTrainer {
    hub: Arc<BrainHub>,
    registry: BrainRegistry,
    history: Arc<dyn DrawHistory>,
    store: Arc<dyn BrainStateStore>,
    sinks: Vec<Arc<dyn ReportSink>>,
    metrics: MetricsCollector,
    rounds_completed: u64,
    rounds_failed: u64,
    last_round_id: Option<Uuid>,
    /// Checkpoint and backlog as last seen, for status reports
    checkpoint: Option<u64>,
    pending: usize,
}

impl IncrementalTrainer {
    pub fn new(
        hub: Arc<BrainHub>,
        registry: BrainRegistry,
        history: Arc<dyn DrawHistory>,
        store: Arc<dyn BrainStateStore>,
    ) -> Self {
        Self {
            hub,
            registry,
            history,
            store,
            sinks: Vec::new(),
            metrics: MetricsCollector::new(),
            rounds_completed: 0,
            rounds_failed: 0,
            last_round_id: None,
            checkpoint: None,
            pending: 0,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn registry(&self) -> &BrainRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Reload every brain's state as of the checkpoint. Returns how many
    /// brains had to be reset because their blob was unreadable.
    pub async fn restore_states(&mut self, checkpoint: &Checkpoint) -> Result<usize> {
        let mut resets = 0;
        for id in self.registry.ids() {
            let persisted = self.store.load_state(&id, checkpoint.last_contest).await?;
            if !self.registry.restore(&id, persisted) {
                resets += 1;
            }
        }
        if resets > 0 {
            self.metrics
                .increment(names::STATE_RESETS, resets as u64)
                .await;
        }
        debug!(
            "Restored {} brain states as of {:?} ({} reset)",
            self.registry.len(),
            checkpoint.last_contest,
            resets
        );
        Ok(resets)
    }

    /// Contests after the checkpoint whose successor draw is already known,
    /// ascending
    pub async fn pending_contests(&self, checkpoint: &Checkpoint) -> Result<Vec<u64>> {
        let contests = self.history.contests().await?;
        let known: BTreeSet<u64> = contests.iter().copied().collect();
        Ok(contests
            .into_iter()
            .filter(|&n| checkpoint.is_pending(n) && known.contains(&(n + 1)))
            .collect())
    }

    /// Generate for N+1 from the state as of N, learn from draw N+1, commit
    pub async fn process_contest(&mut self, contest: u64) -> Result<ContestResult> {
        let config = self.hub.config();
        let run_tag = config.trainer.run_tag.clone();

        let window = self
            .history
            .window(contest, config.trainer.context_window)
            .await?;
        if window.last().map(|d| d.contest) != Some(contest) {
            return Err(EngineError::DrawNotFound(contest));
        }
        let ctx = Arc::new(DrawContext::build(contest, window, &config.rules));
        let performance = self
            .store
            .load_performance(contest, config.hub.relevance_window)
            .await?;

        let outcome = self
            .hub
            .run_round(Arc::clone(&ctx), &self.registry, &performance)
            .await?;

        let draw = self
            .history
            .get_draw(ctx.target_contest)
            .await?
            .ok_or(EngineError::DrawNotFound(ctx.target_contest))?;

        let update = self
            .hub
            .update_learning(&self.registry, &ctx, &outcome, &draw, &run_tag)?;

        self.status(Stage::UpdatingState).await;
        let commit = RoundCommit {
            contest,
            states: update.states.clone(),
            performance: update.performance.clone(),
            memories: update.memories.clone(),
        };
        let receipt = self.store.commit_round(&commit).await?;

        // Durable now; only then does the in-process registry move forward
        for state in update.states.iter().cloned() {
            self.registry.set_state(state);
        }
        self.checkpoint = Some(contest);
        self.pending = self.pending.saturating_sub(1);

        let report = RoundReport::build(&run_tag, &outcome, Some(&update), receipt.memories_archived);
        for sink in &self.sinks {
            if let Err(e) = sink.round(&report).await {
                warn!(contest, "Report sink failed: {}", e);
            }
        }

        let result = ContestResult {
            round_id: outcome.round_id,
            contest,
            target_contest: outcome.target_contest,
            candidates_generated: outcome.candidates_generated(),
            selected: update.selected.len(),
            skipped_brains: outcome.failures.len(),
            best_hits: report.best_hits(),
            receipt,
        };
        self.record(&result).await;
        Ok(result)
    }

    async fn record(&mut self, result: &ContestResult) {
        self.rounds_completed += 1;
        self.last_round_id = Some(result.round_id);

        let m = &self.metrics;
        m.increment(names::ROUNDS_COMPLETED, 1).await;
        m.increment(names::BRAINS_SKIPPED, result.skipped_brains as u64)
            .await;
        m.increment(
            names::CANDIDATES_GENERATED,
            result.candidates_generated as u64,
        )
        .await;
        m.increment(names::CANDIDATES_SELECTED, result.selected as u64)
            .await;
        m.increment(
            names::MEMORIES_ARCHIVED,
            result.receipt.memories_archived as u64,
        )
        .await;
        m.gauge(names::LAST_CONTEST, result.contest as f64).await;
        if let Some(best) = result.best_hits {
            m.gauge(names::BEST_HITS, best as f64).await;
        }

        info!(
            contest = result.contest,
            round_id = %result.round_id,
            best_hits = ?result.best_hits,
            "Contest processed: {} selected, {} memories archived",
            result.selected,
            result.receipt.memories_archived
        );
    }

    /// Generate the final selection for the contest after the latest known
    /// draw, from the states as of the checkpoint. Nothing is learned and
    /// the checkpoint stays where it is.
    pub async fn predict_next(&mut self) -> Result<RoundReport> {
        let checkpoint = self.store.load_checkpoint().await?;
        self.restore_states(&checkpoint).await?;
        self.checkpoint = checkpoint.last_contest;
        self.pending = self.pending_contests(&checkpoint).await?.len();
        if self.pending > 0 {
            warn!(
                checkpoint = ?checkpoint.last_contest,
                "{} contests not trained yet; predicting from older states",
                self.pending
            );
        }

        let latest = self
            .history
            .latest_contest()
            .await?
            .ok_or_else(|| EngineError::InsufficientHistory("no draws recorded".to_string()))?;

        let hub = Arc::clone(&self.hub);
        let config = hub.config();
        let window = self
            .history
            .window(latest, config.trainer.context_window)
            .await?;
        let ctx = Arc::new(DrawContext::build(latest, window, &config.rules));
        let performance = self
            .store
            .load_performance(latest, config.hub.relevance_window)
            .await?;

        self.status(Stage::Processing).await;
        let outcome = hub
            .run_round(Arc::clone(&ctx), &self.registry, &performance)
            .await?;
        let report = RoundReport::build(&config.trainer.run_tag, &outcome, None, 0);
        for sink in &self.sinks {
            if let Err(e) = sink.prediction(&report).await {
                warn!(target_contest = report.target_contest, "Report sink failed: {}", e);
            }
        }
        self.status(Stage::Idle).await;

        info!(
            target_contest = report.target_contest,
            round_id = %report.round_id,
            "Prediction ready: {} candidates selected",
            report.selected.len()
        );
        Ok(report)
    }

    async fn status(&self, stage: Stage) {
        if self.sinks.is_empty() {
            return;
        }
        let now = NowState {
            timestamp: Utc::now(),
            run_tag: self.hub.config().trainer.run_tag.clone(),
            stage,
            checkpoint: self.checkpoint,
            pending: self.pending,
            rounds_completed: self.rounds_completed,
            rounds_failed: self.rounds_failed,
            last_round_id: self.last_round_id,
        };
        for sink in &self.sinks {
            if let Err(e) = sink.status(&now).await {
                warn!("Status sink failed: {}", e);
            }
        }
    }

    /// Single-shot: process the pending backlog (up to the configured cap)
    /// and stop
    pub async fn run_once(&mut self) -> Result<TrainerSummary> {
        self.run_pending(None).await
    }

    async fn run_pending(
        &mut self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<TrainerSummary> {
        self.status(Stage::LoadingCheckpoint).await;
        let checkpoint = self.store.load_checkpoint().await?;
        let discarded = self
            .store
            .discard_uncommitted(checkpoint.last_contest)
            .await?;
        if discarded > 0 {
            warn!(
                checkpoint = ?checkpoint.last_contest,
                "Discarded {} entries from an unfinished round",
                discarded
            );
        }
        let state_resets = self.restore_states(&checkpoint).await?;

        let mut pending = self.pending_contests(&checkpoint).await?;
        if let Some(cap) = self.hub.config().trainer.max_contests_per_run {
            pending.truncate(cap);
        }
        self.checkpoint = checkpoint.last_contest;
        self.pending = pending.len();
        info!(
            checkpoint = ?checkpoint.last_contest,
            "{} contests pending",
            pending.len()
        );

        let mut processed = Vec::with_capacity(pending.len());
        for &contest in &pending {
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                info!(contest, "Stop requested, leaving remaining contests pending");
                break;
            }
            self.status(Stage::Processing).await;
            match self.process_contest(contest).await {
                Ok(result) => processed.push(result),
                Err(e) => {
                    self.rounds_failed += 1;
                    self.metrics.increment(names::ROUNDS_FAILED, 1).await;
                    self.status(Stage::Idle).await;
                    return Err(e);
                }
            }
        }

        let remaining = self
            .pending_contests(&self.store.load_checkpoint().await?)
            .await?
            .len();
        self.pending = remaining;
        let stage = if remaining == 0 {
            Stage::Terminal
        } else {
            Stage::Idle
        };
        self.status(stage).await;

        Ok(TrainerSummary {
            processed,
            checkpoint: self.checkpoint,
            remaining,
            state_resets,
            metrics: self.metrics.snapshot().await,
        })
    }

    /// Loop mode: drain the backlog, sleep `poll_interval_secs`, repeat.
    /// `shutdown` is only honoured between rounds.
    pub async fn run_loop(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll = Duration::from_secs(self.hub.config().trainer.poll_interval_secs.max(1));
        info!("Trainer loop started (poll every {:?})", poll);

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_pending(Some(&shutdown)).await {
                Ok(summary) if !summary.processed.is_empty() => {
                    info!(
                        checkpoint = ?summary.checkpoint,
                        "Processed {} contests",
                        summary.processed.len()
                    );
                }
                Ok(_) => debug!("No new contests"),
                Err(e) => error!("Training round failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Trainer loop stopped");
        Ok(())
    }
}
