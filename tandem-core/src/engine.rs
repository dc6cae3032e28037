//! Generation engine - runs the scheduler on a dedicated decode thread
//!
//! The evaluator moves into the driver thread at construction and never
//! leaves it. Callers on any thread or task talk to the driver only through
//! the admission queue and their per-request channel.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::candidates::Token;
use crate::evaluator::{Evaluator, ModelInfo, PromptTokenizer};
use crate::generation::Generation;
use crate::request::{GenerationRequest, Message};
use crate::sampler::SamplingOptions;
use crate::scheduler::{AdmissionQueue, Scheduler, SchedulerStats};

/// Handle to a running decode loop
pub struct Engine {
    queue: Arc<AdmissionQueue>,
    info: ModelInfo,
    tokenizer: Arc<dyn PromptTokenizer>,
    driver: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start the decode thread around `evaluator`.
    pub fn new<E: Evaluator>(evaluator: E, config: EngineConfig) -> Result<Self> {
        info!("Initializing engine with max_parallel={}", config.max_parallel);
        let model_info = ModelInfo::of(&evaluator);
        let tokenizer = evaluator.tokenizer();
        let mut scheduler = Scheduler::new(evaluator, &config);
        let queue = scheduler.queue();

        let driver = std::thread::Builder::new()
            .name("tandem-decode".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| scheduler.run()));
                if let Err(payload) = outcome {
                    let message = panic_message(payload.as_ref());
                    error!("Decode loop panicked: {}", message);
                    scheduler.abort(&message);
                }
            })?;

        Ok(Self {
            queue,
            info: model_info,
            tokenizer,
            driver: Some(driver),
        })
    }

    /// Queue a validated request.
    pub fn submit(&self, request: GenerationRequest) -> Result<Generation> {
        self.queue.submit(request)
    }

    /// Validate `options`, then queue the conversation.
    pub fn prompt(&self, messages: Vec<Message>, options: &SamplingOptions) -> Result<Generation> {
        self.submit(GenerationRequest::new(messages, options)?)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.queue.stats()
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn context_length(&self) -> usize {
        self.info.context_length
    }

    /// Tokens `messages` would occupy as a prompt, without queueing anything.
    pub fn tokenize(&self, messages: &[Message]) -> Result<Vec<Token>> {
        self.tokenizer.tokenize(&self.info.render(messages))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.queue.shutdown();
        if let Some(driver) = self.driver.take() {
            if driver.join().is_err() {
                warn!("Decode thread panicked during shutdown");
            }
        }
    }
}
