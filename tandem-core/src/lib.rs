//! Tandem Core - multi-sequence text generation engine
//!
//! This crate implements:
//! - A configurable token-sampling pipeline (penalties, top-k/top-p,
//!   tail-free, typical, temperature, mirostat)
//! - A slot scheduler that interleaves many requests over one evaluator
//! - Streaming UTF-8 reassembly of token fragments
//! - A candle-backed LLaMA evaluator loaded from disk or the HuggingFace Hub

pub mod candidates;
pub mod chat_template;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod filters;
pub mod generation;
pub mod model;
pub mod request;
pub mod sampler;
pub mod scheduler;
pub mod sequence;

pub use candidates::{CandidateSet, Token, TokenCandidate};
pub use chat_template::ChatTemplate;
pub use config::{EngineConfig, ModelOptions, WeightDtype};
pub use decoder::StreamingDecoder;
pub use engine::Engine;
pub use error::{ConfigError, Error, EvalError, Result, SamplingError};
pub use evaluator::{EvalRequest, Evaluator, ModelInfo, PromptTokenizer, SlotLogits};
pub use generation::{CancelHandle, Generation, TextStream};
pub use model::LlamaEvaluator;
pub use request::{
    GenerationEvent, GenerationMetrics, GenerationRequest, Message, RequestId, Role, StopReason,
};
pub use sampler::{
    MirostatMode, Sampled, SamplingOptions, SamplingPipeline, Selection, SelectionStrategy, Stage,
};
pub use scheduler::{AdmissionQueue, Scheduler, SchedulerStats};
pub use sequence::GenerationSequence;
