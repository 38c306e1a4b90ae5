//! Error taxonomy for the engine
//!
//! Brain-local failures are absorbed by the hub and never surface here as
//! hard errors; everything in this enum propagates to the trainer or
//! backtest caller, which decides whether to retry the contest or halt.

/// Error types for generation, learning and persistence
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Brain {brain_id} failed to generate: {reason}")]
    Generation { brain_id: String, reason: String },

    #[error("No brain produced a valid candidate for contest {contest}")]
    EmptyRound { contest: u64 },

    #[error("State of brain {brain_id} is unreadable: {reason}")]
    StateCorruption { brain_id: String, reason: String },

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Draw not found for contest {0}")]
    DrawNotFound(u64),

    #[error("Not enough history: {0}")]
    InsufficientHistory(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for configuration rejections
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    /// Whether retrying the same contest can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyRound { .. } | EngineError::Persistence(_) | EngineError::Io(_)
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
