//! Brain Hub
//!
//! Multi-brain candidate generation engine: independent brains propose
//! number combinations for the next draw, the hub ranks and diversifies
//! them, and the incremental trainer feeds real outcomes back into each
//! brain's learned state under a crash-safe checkpoint.

pub mod backtest;
pub mod brain;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod presets;
pub mod report;
pub mod scorer;
pub mod store;
pub mod trainer;
pub mod types;

// Re-export main types for convenience
pub use backtest::{BacktestConfig, BacktestEngine, BacktestSummary, StepBudget};
pub use brain::{
    Brain, BrainCategory, BrainRegistry, BrainState, GenerationBatch, GenerationRequest,
    TypedBrain,
};
pub use config::{
    BrainSettings, EngineConfig, GameRules, HubConfig, Profile, RoundConfig, StepSequenceConfig,
    TrainerConfig, WrapMode,
};
pub use error::{EngineError, Result};
pub use hub::{BrainFailure, BrainHub, FailureKind, LearningUpdate, RankedCandidate, RoundOutcome};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use report::{JournalSink, NowState, ReportSink, RoundReport, TracingSink};
pub use scorer::Scorer;
pub use store::{
    BrainStateStore, DrawHistory, FileDrawHistory, FileStateStore, MemoryDrawHistory,
    MemoryStateStore, RoundCommit,
};
pub use trainer::{IncrementalTrainer, TrainerSummary};
pub use types::{
    BrainPerformance, Candidate, Checkpoint, Draw, DrawContext, Score, ScoreTag, ScoredCandidate,
    Stage, StrongGameMemory,
};
