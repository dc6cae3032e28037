//! Error types for tandem.

use thiserror::Error;

/// Result type alias for tandem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tandem.
#[derive(Error, Debug)]
pub enum Error {
    /// Sampling options rejected at request construction.
    #[error("invalid sampling options: {0}")]
    Config(#[from] ConfigError),

    /// Model or tokenizer could not be loaded.
    #[error("failed to load model: {0}")]
    Load(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// The evaluator failed outside of a per-slot result.
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    /// Sampling invariant violated.
    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),

    /// The decode driver is gone; no further requests are accepted.
    #[error("engine has stopped")]
    EngineStopped,

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Invalid combination or value of sampling options.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("top_k must be non-negative, got {0}")]
    NegativeTopK(i32),

    #[error("{name} must be in (0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },

    #[error("repetition_penalty must be positive, got {0}")]
    NonPositivePenalty(f32),

    #[error("{0} must be a finite number")]
    NotFinite(&'static str),

    #[error("min_keep must be at least 1")]
    ZeroMinKeep,

    #[error("mirostat {name} must be positive, got {value}")]
    MirostatParameter { name: &'static str, value: f32 },

    #[error("mirostat selection cannot be combined with the greedy strategy")]
    MirostatWithGreedy,

    #[error("max_tokens must be at least 1")]
    ZeroMaxTokens,
}

/// Failure reported by an [`Evaluator`](crate::evaluator::Evaluator).
///
/// Returned either for the whole batch call or for a single slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The evaluator ran out of memory, KV space or another resource.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The requested position lies beyond the evaluator's context window.
    #[error("position {position} exceeds context length {context_length}")]
    ContextOverflow {
        position: usize,
        context_length: usize,
    },

    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

impl From<candle_core::Error> for EvalError {
    fn from(err: candle_core::Error) -> Self {
        EvalError::Backend(err.to_string())
    }
}

/// Contract violation inside the sampling pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    /// A stage left no candidates to choose from.
    #[error("candidate set is empty after {stage}")]
    EmptyCandidates { stage: &'static str },

    /// The weighted draw could not be built (all weights zero or NaN).
    #[error("invalid probability distribution: {0}")]
    InvalidDistribution(String),
}
