//! Brains - independent candidate generators sharing one capability contract
//!
//! A brain never owns mutable state. The hub hands it a `BrainState` blob to
//! read during generation, and `learn` returns the next blob. Only the
//! owning brain ever decodes its blob.

pub mod delay;
pub mod frequency;
pub mod sampling;
pub mod step_sequence;

use rand::rngs::StdRng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::types::{Candidate, Draw, DrawContext, ScoredCandidate};

pub use delay::DelayBrain;
pub use frequency::{GlobalFrequencyBrain, RecentFrequencyBrain};
pub use step_sequence::StepSequenceBrain;

/// Ids of the brains this build knows how to construct
pub const KNOWN_BRAINS: [&str; 4] = [
    frequency::GLOBAL_BRAIN_ID,
    frequency::RECENT_BRAIN_ID,
    delay::BRAIN_ID,
    step_sequence::BRAIN_ID,
];

/// Brain family, for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrainCategory {
    Statistical,
    Temporal,
    Heuristic,
}

/// Opaque learned parameters of one brain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainState {
    pub brain_id: String,
    /// Last contest folded into this state; None for a fresh state
    pub as_of: Option<u64>,
    pub data: serde_json::Value,
}

impl BrainState {
    pub fn new(brain_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            brain_id: brain_id.into(),
            as_of: None,
            data,
        }
    }

    /// Decode the blob into a brain's typed state
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| EngineError::StateCorruption {
            brain_id: self.brain_id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn encode<T: Serialize>(brain_id: &str, as_of: Option<u64>, value: &T) -> Result<Self> {
        Ok(Self {
            brain_id: brain_id.to_string(),
            as_of,
            data: serde_json::to_value(value)?,
        })
    }
}

/// What the hub asks of a brain for one size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRequest {
    pub size: usize,
    pub count: usize,
}

/// Output of one generation call
#[derive(Debug, Clone, Default)]
pub struct GenerationBatch {
    pub candidates: Vec<Candidate>,
    /// Candidates abandoned after exhausting their attempt budget
    pub failed_attempts: u32,
}

/// Capability contract every brain implements
pub trait Brain: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn category(&self) -> BrainCategory;

    /// State for a brain that has never learned anything
    fn initial_state(&self) -> BrainState;

    /// Fails with `StateCorruption` if the blob cannot be decoded
    fn check_state(&self, state: &BrainState) -> Result<()>;

    /// Prior relevance (>= 0) before performance history is considered
    fn evaluate_context(&self, ctx: &DrawContext, state: &BrainState) -> f64;

    fn generate(
        &self,
        ctx: &DrawContext,
        state: &BrainState,
        request: GenerationRequest,
        rng: &mut StdRng,
    ) -> Result<GenerationBatch>;

    /// Pre-outcome heuristic score of each candidate, on the brain's own scale
    fn score_batch(&self, candidates: &[Candidate], ctx: &DrawContext, state: &BrainState)
        -> Vec<f64>;

    /// Fold one round of outcomes into the state and return the next state
    fn learn(
        &self,
        state: BrainState,
        ctx: &DrawContext,
        draw: &Draw,
        outcomes: &[ScoredCandidate],
    ) -> Result<BrainState>;

    /// Audit summary
    fn report(&self, state: &BrainState) -> serde_json::Value;
}

/// Brains with a concrete serde state type. The blanket `Brain` impl takes
/// care of decoding and re-encoding the blob.
pub trait TypedBrain: Send + Sync {
    type State: Serialize + DeserializeOwned + Default;

    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn category(&self) -> BrainCategory;

    fn evaluate_context(&self, ctx: &DrawContext, state: &Self::State) -> f64;

    fn generate(
        &self,
        ctx: &DrawContext,
        state: &Self::State,
        request: GenerationRequest,
        rng: &mut StdRng,
    ) -> Result<GenerationBatch>;

    fn score(&self, candidate: &Candidate, ctx: &DrawContext, state: &Self::State) -> f64;

    fn learn(
        &self,
        state: &mut Self::State,
        ctx: &DrawContext,
        draw: &Draw,
        outcomes: &[ScoredCandidate],
    );

    fn summary(&self, _state: &Self::State) -> serde_json::Value {
        serde_json::json!({})
    }
}

impl<T: TypedBrain> Brain for T {
    fn id(&self) -> &str {
        TypedBrain::id(self)
    }

    fn name(&self) -> &str {
        TypedBrain::name(self)
    }

    fn category(&self) -> BrainCategory {
        TypedBrain::category(self)
    }

    fn initial_state(&self) -> BrainState {
        let data = serde_json::to_value(T::State::default()).unwrap_or(serde_json::Value::Null);
        BrainState::new(TypedBrain::id(self), data)
    }

    fn check_state(&self, state: &BrainState) -> Result<()> {
        state.decode::<T::State>().map(|_| ())
    }

    fn evaluate_context(&self, ctx: &DrawContext, state: &BrainState) -> f64 {
        let typed = state.decode::<T::State>().unwrap_or_default();
        TypedBrain::evaluate_context(self, ctx, &typed).max(0.0)
    }

    fn generate(
        &self,
        ctx: &DrawContext,
        state: &BrainState,
        request: GenerationRequest,
        rng: &mut StdRng,
    ) -> Result<GenerationBatch> {
        let typed = state.decode::<T::State>()?;
        TypedBrain::generate(self, ctx, &typed, request, rng)
    }

    fn score_batch(
        &self,
        candidates: &[Candidate],
        ctx: &DrawContext,
        state: &BrainState,
    ) -> Vec<f64> {
        let typed = state.decode::<T::State>().unwrap_or_default();
        candidates
            .iter()
            .map(|c| TypedBrain::score(self, c, ctx, &typed))
            .collect()
    }

    fn learn(
        &self,
        state: BrainState,
        ctx: &DrawContext,
        draw: &Draw,
        outcomes: &[ScoredCandidate],
    ) -> Result<BrainState> {
        let mut typed = state.decode::<T::State>()?;
        TypedBrain::learn(self, &mut typed, ctx, draw, outcomes);
        BrainState::encode(TypedBrain::id(self), Some(ctx.contest), &typed)
    }

    fn report(&self, state: &BrainState) -> serde_json::Value {
        let summary = state
            .decode::<T::State>()
            .map(|typed| self.summary(&typed))
            .unwrap_or(serde_json::Value::Null);
        serde_json::json!({
            "id": TypedBrain::id(self),
            "name": TypedBrain::name(self),
            "category": TypedBrain::category(self),
            "as_of": state.as_of,
            "summary": summary,
        })
    }
}

/// Maps brain id to implementation, enabled flag and current state
pub struct BrainRegistry {
    brains: BTreeMap<String, Arc<dyn Brain>>,
    enabled: BTreeMap<String, bool>,
    states: BTreeMap<String, BrainState>,
}

impl BrainRegistry {
    pub fn new() -> Self {
        Self {
            brains: BTreeMap::new(),
            enabled: BTreeMap::new(),
            states: BTreeMap::new(),
        }
    }

    /// Build every configured brain. Unlisted brains are not registered.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (id, settings) in &config.brains {
            let brain: Arc<dyn Brain> = match id.as_str() {
                frequency::GLOBAL_BRAIN_ID => Arc::new(GlobalFrequencyBrain::new()),
                frequency::RECENT_BRAIN_ID => Arc::new(RecentFrequencyBrain::new()),
                delay::BRAIN_ID => Arc::new(DelayBrain::new()),
                step_sequence::BRAIN_ID => Arc::new(StepSequenceBrain::new(
                    settings.step_sequence.unwrap_or_default(),
                )?),
                other => {
                    return Err(EngineError::config(format!("unknown brain id '{}'", other)))
                }
            };
            registry.register(brain, settings.enabled);
        }
        info!(
            "Brain registry built: {} brains ({} enabled)",
            registry.len(),
            registry.enabled_ids().len()
        );
        Ok(registry)
    }

    /// Register a brain with a fresh state; replaces any brain with the same id
    pub fn register(&mut self, brain: Arc<dyn Brain>, enabled: bool) {
        let id = brain.id().to_string();
        self.states.insert(id.clone(), brain.initial_state());
        self.enabled.insert(id.clone(), enabled);
        self.brains.insert(id, brain);
    }

    /// Install a persisted state. An unreadable blob resets the brain to its
    /// initial state; returns false when that happened.
    pub fn restore(&mut self, id: &str, persisted: Option<BrainState>) -> bool {
        let Some(brain) = self.brains.get(id) else {
            return false;
        };
        match persisted {
            None => {
                self.states.insert(id.to_string(), brain.initial_state());
                true
            }
            Some(state) => match brain.check_state(&state) {
                Ok(()) => {
                    self.states.insert(id.to_string(), state);
                    true
                }
                Err(e) => {
                    warn!(brain_id = %id, "Resetting brain state: {}", e);
                    self.states.insert(id.to_string(), brain.initial_state());
                    false
                }
            },
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Brain>> {
        self.brains.get(id)
    }

    pub fn state(&self, id: &str) -> Option<&BrainState> {
        self.states.get(id)
    }

    pub fn set_state(&mut self, state: BrainState) {
        if self.brains.contains_key(&state.brain_id) {
            self.states.insert(state.brain_id.clone(), state);
        }
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.enabled.get(id).copied().unwrap_or(false)
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) {
        if let Some(flag) = self.enabled.get_mut(id) {
            *flag = enabled;
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.brains.keys().cloned().collect()
    }

    pub fn enabled_ids(&self) -> Vec<String> {
        self.brains
            .keys()
            .filter(|id| self.is_enabled(id))
            .cloned()
            .collect()
    }

    /// Enabled brains paired with a clone of their current state
    pub fn participants(&self) -> Vec<(Arc<dyn Brain>, BrainState)> {
        self.enabled_ids()
            .into_iter()
            .filter_map(|id| {
                let brain = self.brains.get(&id)?;
                let state = self
                    .states
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| brain.initial_state());
                Some((Arc::clone(brain), state))
            })
            .collect()
    }

    pub fn states(&self) -> &BTreeMap<String, BrainState> {
        &self.states
    }

    /// Independent copy sharing the (stateless) brain implementations
    pub fn fork(&self) -> Self {
        Self {
            brains: self.brains.clone(),
            enabled: self.enabled.clone(),
            states: self.states.clone(),
        }
    }

    pub fn reports(&self) -> Vec<serde_json::Value> {
        self.brains
            .iter()
            .filter_map(|(id, brain)| self.states.get(id).map(|s| brain.report(s)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.brains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brains.is_empty()
    }
}

impl Default for BrainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
