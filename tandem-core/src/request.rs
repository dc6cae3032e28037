use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::sampler::{SamplingOptions, SamplingPipeline};

/// Unique identifier for a request
pub type RequestId = u64;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Validated request for generation
///
/// Options are checked and turned into a [`SamplingPipeline`] here, so a
/// request that reaches the scheduler can always be sampled.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub options: SamplingOptions,
    pub max_tokens: Option<usize>,
    pub(crate) pipeline: SamplingPipeline,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>, options: &SamplingOptions) -> Result<Self> {
        let pipeline = SamplingPipeline::from_options(options)?;
        Ok(Self {
            messages,
            options: options.clone(),
            max_tokens: None,
            pipeline,
        })
    }

    /// Stop after `max_tokens` generated tokens.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Result<Self> {
        if max_tokens == 0 {
            return Err(ConfigError::ZeroMaxTokens.into());
        }
        self.max_tokens = Some(max_tokens);
        Ok(self)
    }

    pub fn pipeline(&self) -> &SamplingPipeline {
        &self.pipeline
    }
}

/// Why a sequence stopped producing tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced an end-of-sequence token.
    EndOfSequence,
    /// History reached the context length.
    ContextFull,
    /// The request's token limit was reached.
    MaxTokens,
    /// The caller cancelled or went away.
    Cancelled,
    /// Evaluation or sampling failed for this sequence.
    Failed(String),
}

impl StopReason {
    pub fn is_error(&self) -> bool {
        matches!(self, StopReason::Failed(_))
    }
}

/// Counters reported once a generation stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    /// Prompt tokens per second of the prompt evaluation call.
    pub prompting_speed: f64,
    /// Generated tokens per second of decode time.
    pub sampling_speed: f64,
    pub cancelled: bool,
    pub stop_reason: StopReason,
}

/// Item delivered from the decode driver to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Raw bytes of one sampled token, possibly a partial UTF-8 sequence.
    Token(Vec<u8>),
    /// Final event; nothing follows it.
    Finished(GenerationMetrics),
}
