//! Slot scheduler: admission queue plus the batched decode loop.
//!
//! Callers push validated requests into a FIFO [`AdmissionQueue`]. The
//! [`Scheduler`], owned by a single driver thread, moves them into at most
//! `max_parallel` slots and advances every active slot by one evaluate call
//! per tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EvalError, Error, Result};
use crate::evaluator::{EvalRequest, Evaluator};
use crate::generation::{CancelHandle, Generation};
use crate::request::{GenerationEvent, GenerationMetrics, GenerationRequest, RequestId, StopReason};
use crate::sequence::GenerationSequence;

/// Request waiting for a free slot
struct Submission {
    id: RequestId,
    request: GenerationRequest,
    cancelled: Arc<AtomicBool>,
    events: UnboundedSender<GenerationEvent>,
}

impl Submission {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.events.is_closed()
    }

    /// Finish without ever touching the evaluator.
    fn reject(self, reason: StopReason) {
        let metrics = GenerationMetrics {
            prompt_tokens: 0,
            generated_tokens: 0,
            prompting_speed: 0.0,
            sampling_speed: 0.0,
            cancelled: reason == StopReason::Cancelled,
            stop_reason: reason,
        };
        let _ = self.events.send(GenerationEvent::Finished(metrics));
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Submission>,
    active: usize,
    completed: u64,
    tokens_generated: u64,
    shutdown: bool,
}

/// Shared admission state; the only mutable state callers touch
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
    next_id: AtomicU64,
    max_parallel: usize,
}

impl AdmissionQueue {
    fn new(max_parallel: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            next_id: AtomicU64::new(1),
            max_parallel,
        }
    }

    /// Enqueue a request and return the caller's handle.
    pub fn submit(&self, request: GenerationRequest) -> Result<Generation> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        let flag = Arc::new(AtomicBool::new(false));

        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(Error::EngineStopped);
            }
            state.pending.push_back(Submission {
                id,
                request,
                cancelled: flag.clone(),
                events: tx,
            });
            debug!("Request {} queued ({} waiting)", id, state.pending.len());
        }
        self.wake.notify_one();

        Ok(Generation::new(id, rx, CancelHandle::new(flag)))
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            active_slots: state.active,
            queued_requests: state.pending.len(),
            max_parallel: self.max_parallel,
            completed_requests: state.completed,
            tokens_generated: state.tokens_generated,
        }
    }

    /// Stop accepting work and wake the driver.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn pop(&self) -> Option<Submission> {
        self.state.lock().pending.pop_front()
    }

    fn mark_admitted(&self) {
        self.state.lock().active += 1;
    }

    /// Account for a finished request. Runs before its final event is sent
    /// so callers never observe stale counters.
    fn mark_finished(&self, was_active: bool, generated: usize) {
        let mut state = self.state.lock();
        if was_active {
            state.active -= 1;
        }
        state.completed += 1;
        state.tokens_generated += generated as u64;
    }

    /// Block until there is queued work or shutdown was requested.
    fn wait_for_work(&self) {
        let mut state = self.state.lock();
        while state.pending.is_empty() && !state.shutdown {
            self.wake.wait(&mut state);
        }
    }
}

/// Snapshot of scheduler occupancy and throughput counters
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub active_slots: usize,
    pub queued_requests: usize,
    pub max_parallel: usize,
    pub completed_requests: u64,
    pub tokens_generated: u64,
}

/// Owns the evaluator and every active sequence
pub struct Scheduler<E: Evaluator> {
    evaluator: E,
    slots: Vec<Option<GenerationSequence>>,
    queue: Arc<AdmissionQueue>,
    rng: StdRng,
}

impl<E: Evaluator> Scheduler<E> {
    pub fn new(evaluator: E, config: &EngineConfig) -> Self {
        let max_parallel = config.max_parallel.max(1);
        let rng = match evaluator.seed() {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            evaluator,
            slots: (0..max_parallel).map(|_| None).collect(),
            queue: Arc::new(AdmissionQueue::new(max_parallel)),
            rng,
        }
    }

    /// Shared queue handle for submitting from other threads.
    pub fn queue(&self) -> Arc<AdmissionQueue> {
        self.queue.clone()
    }

    pub fn submit(&self, request: GenerationRequest) -> Result<Generation> {
        self.queue.submit(request)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.queue.stats()
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn has_active(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// Slots currently bound to a sequence, by index.
    pub fn active_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    /// Advance the engine by one tick. Returns the number of slots evaluated.
    pub fn step(&mut self) -> usize {
        // 1. Drop cancelled sequences before they take a batch position
        for slot in 0..self.slots.len() {
            let cancelled = self.slots[slot]
                .as_ref()
                .map_or(false, GenerationSequence::is_cancelled);
            if cancelled {
                self.finish(slot, StopReason::Cancelled);
            }
        }

        // 2. Fill free slots from the queue, FIFO, lowest slot first
        self.admit();

        // 3. One batched evaluate call over every active slot
        let batch: Vec<EvalRequest<'_>> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, seq)| {
                seq.as_ref().map(|seq| EvalRequest {
                    slot,
                    tokens: seq.unevaluated(),
                    past: seq.past(),
                })
            })
            .collect();
        if batch.is_empty() {
            return 0;
        }

        let started = Instant::now();
        let outcome = self.evaluator.evaluate(&batch);
        let elapsed = started.elapsed();

        let evaluated: Vec<(usize, usize)> =
            batch.iter().map(|r| (r.slot, r.tokens.len())).collect();
        drop(batch);

        let results = match outcome {
            Ok(results) if results.len() == evaluated.len() => results,
            Ok(results) => {
                let err = EvalError::Backend(format!(
                    "evaluator returned {} results for {} slots",
                    results.len(),
                    evaluated.len()
                ));
                self.fail_batch(&evaluated, &err);
                return evaluated.len();
            }
            Err(err) => {
                self.fail_batch(&evaluated, &err);
                return evaluated.len();
            }
        };

        // 4. Commit, sample and emit per slot
        for ((slot, count), result) in evaluated.iter().copied().zip(results) {
            let logits = match result {
                Ok(logits) => logits,
                Err(err) => {
                    warn!("Evaluation failed for slot {}: {}", slot, err);
                    self.finish(slot, StopReason::Failed(err.to_string()));
                    continue;
                }
            };

            let Some(seq) = self.slots[slot].as_mut() else {
                continue;
            };
            seq.commit(count, elapsed);

            let token = match seq.sample(&logits, &mut self.rng) {
                Ok(token) => token,
                Err(err) => {
                    error!("Sampling failed for request {}: {}", seq.id(), err);
                    self.finish(slot, StopReason::Failed(err.to_string()));
                    continue;
                }
            };

            if self.evaluator.is_eos(token) {
                self.finish(slot, StopReason::EndOfSequence);
                continue;
            }

            let bytes = self.evaluator.detokenize_one(token);
            seq.accept(token, bytes);

            let stop = if seq.max_tokens_reached() {
                Some(StopReason::MaxTokens)
            } else if seq.history().len() >= self.evaluator.context_length() {
                Some(StopReason::ContextFull)
            } else {
                None
            };
            if let Some(reason) = stop {
                self.finish(slot, reason);
            }
        }

        evaluated.len()
    }

    /// Drive ticks until shutdown, sleeping while there is nothing to do.
    pub fn run(&mut self) {
        info!("Decode loop started with {} slots", self.slots.len());
        loop {
            if self.queue.is_shutdown() {
                self.drain();
                break;
            }
            let evaluated = self.step();
            if evaluated == 0 && !self.has_active() {
                self.queue.wait_for_work();
            }
        }
        info!("Decode loop stopped");
    }

    /// Finish every active and queued sequence as cancelled.
    pub fn drain(&mut self) {
        self.stop_all(StopReason::Cancelled);
    }

    /// The decode loop died. Refuse new work, then fail everything that
    /// was in flight so no caller waits forever.
    pub(crate) fn abort(&mut self, message: &str) {
        self.queue.shutdown();
        self.stop_all(StopReason::Failed(format!("decode loop stopped: {}", message)));
    }

    fn stop_all(&mut self, reason: StopReason) {
        // Queued first: finishing a slot calls back into the evaluator
        while let Some(submission) = self.queue.pop() {
            self.queue.mark_finished(false, 0);
            submission.reject(reason.clone());
        }
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_some() {
                self.finish(slot, reason.clone());
            }
        }
    }

    fn admit(&mut self) {
        let context_length = self.evaluator.context_length();
        while let Some(slot) = self.slots.iter().position(Option::is_none) {
            let Some(submission) = self.queue.pop() else {
                break;
            };
            let id = submission.id;

            if submission.is_cancelled() {
                debug!("Request {} cancelled before admission", id);
                self.queue.mark_finished(false, 0);
                submission.reject(StopReason::Cancelled);
                continue;
            }

            let template = self.evaluator.chat_template();
            let prompt = template.render(&submission.request.messages);
            let tokens = match self.evaluator.tokenize(&prompt) {
                Ok(tokens) if tokens.is_empty() => {
                    self.queue.mark_finished(false, 0);
                    submission.reject(StopReason::Failed("prompt is empty".to_string()));
                    continue;
                }
                Ok(tokens) => tokens,
                Err(err) => {
                    warn!("Request {} failed to tokenize: {}", id, err);
                    self.queue.mark_finished(false, 0);
                    submission.reject(StopReason::Failed(err.to_string()));
                    continue;
                }
            };
            if tokens.len() >= context_length {
                debug!(
                    "Request {} prompt of {} tokens does not fit context {}",
                    id,
                    tokens.len(),
                    context_length
                );
                self.queue.mark_finished(false, 0);
                submission.reject(StopReason::ContextFull);
                continue;
            }

            debug!("Request {} admitted to slot {} ({} prompt tokens)", id, slot, tokens.len());
            let Submission {
                request,
                cancelled,
                events,
                ..
            } = submission;
            self.slots[slot] = Some(GenerationSequence::new(
                id,
                tokens,
                request.pipeline,
                request.max_tokens,
                cancelled,
                events,
            ));
            self.queue.mark_admitted();
        }
    }

    fn fail_batch(&mut self, evaluated: &[(usize, usize)], err: &EvalError) {
        warn!("Batched evaluation failed for {} slots: {}", evaluated.len(), err);
        for &(slot, _) in evaluated {
            self.finish(slot, StopReason::Failed(err.to_string()));
        }
    }

    fn finish(&mut self, slot: usize, reason: StopReason) {
        let Some(seq) = self.slots[slot].take() else {
            return;
        };
        let id = seq.id();
        self.evaluator.release_slot(slot);
        self.queue.mark_finished(true, seq.generated_len());
        let metrics = seq.finish(reason);

        info!(
            "Request {} finished ({:?}): {} prompt tokens at {:.1} tok/s, \
             {} generated at {:.1} tok/s",
            id,
            metrics.stop_reason,
            metrics.prompt_tokens,
            metrics.prompting_speed,
            metrics.generated_tokens,
            metrics.sampling_speed,
        );
    }
}
