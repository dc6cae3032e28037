//! Per-request decode state owned by the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;

use crate::candidates::Token;
use crate::error::SamplingError;
use crate::request::{GenerationEvent, GenerationMetrics, RequestId, StopReason};
use crate::sampler::SamplingPipeline;

/// State of a request while it occupies an engine slot
///
/// `history` holds the prompt followed by every generated token and only
/// grows. `past` counts the tokens already committed to the evaluator, so
/// `history[past..]` is exactly what the next evaluate call must receive:
/// the whole prompt on admission, then the one token sampled last tick.
#[derive(Debug)]
pub struct GenerationSequence {
    id: RequestId,
    history: Vec<Token>,
    prompt_len: usize,
    past: usize,
    pipeline: SamplingPipeline,
    mu: f32,
    max_tokens: Option<usize>,
    cancelled: Arc<AtomicBool>,
    events: UnboundedSender<GenerationEvent>,
    prompt_elapsed: Duration,
    decode_started: Option<Instant>,
}

impl GenerationSequence {
    pub(crate) fn new(
        id: RequestId,
        prompt: Vec<Token>,
        pipeline: SamplingPipeline,
        max_tokens: Option<usize>,
        cancelled: Arc<AtomicBool>,
        events: UnboundedSender<GenerationEvent>,
    ) -> Self {
        let mu = pipeline.initial_mu();
        Self {
            id,
            prompt_len: prompt.len(),
            history: prompt,
            past: 0,
            pipeline,
            mu,
            max_tokens,
            cancelled,
            events,
            prompt_elapsed: Duration::ZERO,
            decode_started: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn history(&self) -> &[Token] {
        &self.history
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn generated_len(&self) -> usize {
        self.history.len() - self.prompt_len
    }

    pub fn past(&self) -> usize {
        self.past
    }

    pub fn mu(&self) -> f32 {
        self.mu
    }

    /// Still waiting for its prompt to be evaluated.
    pub fn is_prompting(&self) -> bool {
        self.past == 0
    }

    /// Tokens the next evaluate call must commit for this sequence.
    pub fn unevaluated(&self) -> &[Token] {
        &self.history[self.past..]
    }

    /// Caller asked to stop, or nobody is listening any more.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.events.is_closed()
    }

    pub(crate) fn max_tokens_reached(&self) -> bool {
        self.max_tokens
            .map_or(false, |limit| self.generated_len() >= limit)
    }

    /// Record that `count` tokens were committed by a successful evaluate call.
    pub(crate) fn commit(&mut self, count: usize, elapsed: Duration) {
        if self.past == 0 {
            self.prompt_elapsed = elapsed;
            self.decode_started = Some(Instant::now());
        }
        self.past += count;
    }

    /// Run the pipeline over one step's logits, carrying mirostat state.
    pub(crate) fn sample<R: Rng + ?Sized>(
        &mut self,
        logits: &[f32],
        rng: &mut R,
    ) -> Result<Token, SamplingError> {
        let sampled = self.pipeline.sample(logits, &self.history, self.mu, rng)?;
        self.mu = sampled.mu;
        Ok(sampled.token)
    }

    /// Append a sampled token and hand its bytes to the caller.
    pub(crate) fn accept(&mut self, token: Token, bytes: Vec<u8>) {
        self.history.push(token);
        // A closed receiver is picked up as cancellation next tick
        let _ = self.events.send(GenerationEvent::Token(bytes));
    }

    /// Build final metrics and deliver them as the last event.
    pub(crate) fn finish(self, reason: StopReason) -> GenerationMetrics {
        let generated = self.generated_len();
        let prompting_speed = if self.past > 0 {
            tokens_per_second(self.prompt_len, self.prompt_elapsed)
        } else {
            0.0
        };
        let sampling_speed = self
            .decode_started
            .map(|started| tokens_per_second(generated, started.elapsed()))
            .unwrap_or(0.0);

        let metrics = GenerationMetrics {
            prompt_tokens: self.prompt_len,
            generated_tokens: generated,
            prompting_speed,
            sampling_speed,
            cancelled: reason == StopReason::Cancelled,
            stop_reason: reason,
        };
        let _ = self.events.send(GenerationEvent::Finished(metrics.clone()));
        metrics
    }
}

fn tokens_per_second(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}
