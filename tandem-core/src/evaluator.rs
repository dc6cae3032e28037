//! Boundary between the scheduler and whatever computes logits.

use std::sync::Arc;

use serde::Serialize;

use crate::candidates::Token;
use crate::chat_template::ChatTemplate;
use crate::error::{EvalError, Error, Result};
use crate::request::Message;

/// One slot's contribution to a batched evaluate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalRequest<'a> {
    /// Engine slot the tokens belong to; stable for the sequence's lifetime.
    pub slot: usize,
    /// New tokens to commit after the `past` already committed ones.
    pub tokens: &'a [Token],
    /// Tokens previously committed for this slot.
    pub past: usize,
}

/// Per-slot outcome of a batched call: next-token logits or a slot failure.
pub type SlotLogits = std::result::Result<Vec<f32>, EvalError>;

/// Text-to-token half of a model, shared with caller threads.
pub trait PromptTokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>>;
}

impl PromptTokenizer for tokenizers::Tokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        self.encode(text, true)
            .map(|enc| enc.get_ids().to_vec())
            .map_err(|e| Error::Tokenization(e.to_string()))
    }
}

/// Model evaluation capability owned by the scheduler.
///
/// Implementations keep whatever per-slot state they need (typically a KV
/// cache) keyed by `slot`. A request with `past == 0` starts a fresh
/// sequence in that slot.
pub trait Evaluator: Send + 'static {
    /// Tokenizer handle that stays usable after the evaluator has moved
    /// into the decode thread.
    fn tokenizer(&self) -> Arc<dyn PromptTokenizer>;

    fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        self.tokenizer().tokenize(text)
    }

    /// Evaluate every entry and return one result per entry, in order.
    ///
    /// An `Err` fails the whole call; an `Err` inside the vector fails only
    /// that slot.
    fn evaluate(
        &mut self,
        batch: &[EvalRequest<'_>],
    ) -> std::result::Result<Vec<SlotLogits>, EvalError>;

    /// Raw bytes of a single token. May be a partial UTF-8 sequence.
    fn detokenize_one(&self, token: Token) -> Vec<u8>;

    fn context_length(&self) -> usize;

    /// Context the model was trained with; at least the runtime one.
    fn training_context_length(&self) -> usize {
        self.context_length()
    }

    fn layer_count(&self) -> usize {
        0
    }

    fn is_eos(&self, token: Token) -> bool;

    fn chat_template(&self) -> ChatTemplate {
        ChatTemplate::Raw
    }

    /// Seed for the engine's random source, when the model was loaded with one.
    fn seed(&self) -> Option<u64> {
        None
    }

    /// The sequence in `slot` has stopped; its state may be dropped.
    fn release_slot(&mut self, _slot: usize) {}
}

/// Model facts captured before the evaluator moves into the decode thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub context_length: usize,
    pub training_context_length: usize,
    pub layer_count: usize,
    pub chat_template: ChatTemplate,
}

impl ModelInfo {
    pub fn of<E: Evaluator + ?Sized>(evaluator: &E) -> Self {
        Self {
            context_length: evaluator.context_length(),
            training_context_length: evaluator.training_context_length(),
            layer_count: evaluator.layer_count(),
            chat_template: evaluator.chat_template(),
        }
    }

    /// Prompt text for `messages` under the model's template.
    pub fn render(&self, messages: &[Message]) -> String {
        self.chat_template.render(messages)
    }
}
