//! Shared helpers for scheduler and engine integration tests.
//!
//! [`ScriptedEvaluator`] stands in for a real model: every token has a fixed
//! successor, and the logits it returns peak sharply on that successor.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::{
    ChatTemplate, EvalError, EvalRequest, Evaluator, Generation, PromptTokenizer, Scheduler,
    SlotLogits, Token,
};

/// End-of-sequence id in every scripted vocabulary.
pub const EOS: Token = 0;

/// One entry of a recorded evaluate call: `(slot, token count, past)`.
pub type BatchEntry = (usize, usize, usize);

pub struct ScriptedEvaluator {
    vocab: Vec<Vec<u8>>,
    by_text: HashMap<Vec<u8>, Token>,
    next: HashMap<Token, Token>,
    context_length: usize,
    committed: HashMap<usize, usize>,
    batches: Arc<Mutex<Vec<Vec<BatchEntry>>>>,
    released: Arc<Mutex<Vec<usize>>>,
    fail_slots: HashSet<usize>,
    fail_all: bool,
    poison_after: HashSet<Token>,
    crash_after: HashSet<Token>,
    seed: Option<u64>,
}

impl ScriptedEvaluator {
    /// Vocabulary of EOS plus one token per character of `chars`.
    pub fn with_chars(chars: &str) -> Self {
        let mut evaluator = Self {
            vocab: vec![Vec::new()],
            by_text: HashMap::new(),
            next: HashMap::new(),
            context_length: 64,
            committed: HashMap::new(),
            batches: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(Mutex::new(Vec::new())),
            fail_slots: HashSet::new(),
            fail_all: false,
            poison_after: HashSet::new(),
            crash_after: HashSet::new(),
            seed: Some(7),
        };
        for c in chars.chars() {
            let mut buf = [0u8; 4];
            evaluator.add_piece(c.encode_utf8(&mut buf).as_bytes());
        }
        evaluator
    }

    /// Register a token with arbitrary bytes, e.g. half of a UTF-8 character.
    pub fn add_piece(&mut self, bytes: &[u8]) -> Token {
        if let Some(&id) = self.by_text.get(bytes) {
            return id;
        }
        let id = self.vocab.len() as Token;
        self.vocab.push(bytes.to_vec());
        self.by_text.insert(bytes.to_vec(), id);
        id
    }

    pub fn id(&self, text: &str) -> Token {
        self.id_bytes(text.as_bytes())
    }

    pub fn id_bytes(&self, bytes: &[u8]) -> Token {
        *self
            .by_text
            .get(bytes)
            .unwrap_or_else(|| panic!("{:?} is not in the scripted vocabulary", bytes))
    }

    /// After `after`, the model strongly prefers `next` (empty string: EOS).
    pub fn then(mut self, after: &str, next: &str) -> Self {
        let from = self.id(after);
        let to = if next.is_empty() { EOS } else { self.id(next) };
        self.next.insert(from, to);
        self
    }

    pub fn then_token(mut self, after: Token, next: Token) -> Self {
        self.next.insert(after, next);
        self
    }

    pub fn context(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn fail_slot(mut self, slot: usize) -> Self {
        self.fail_slots.insert(slot);
        self
    }

    pub fn fail_everything(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// After `after`, return logits containing a NaN, as an overflowing
    /// half-precision model would.
    pub fn nan_after(mut self, after: &str) -> Self {
        let token = self.id(after);
        self.poison_after.insert(token);
        self
    }

    /// Panic inside `evaluate` once a slot's last token is `after`.
    pub fn crash_after(mut self, after: &str) -> Self {
        let token = self.id(after);
        self.crash_after.insert(token);
        self
    }

    /// Every evaluate call made so far.
    pub fn batches(&self) -> Arc<Mutex<Vec<Vec<BatchEntry>>>> {
        self.batches.clone()
    }

    /// Slots the scheduler has released, in order.
    pub fn released(&self) -> Arc<Mutex<Vec<usize>>> {
        self.released.clone()
    }
}

fn logits_after(vocab_len: usize, next: &HashMap<Token, Token>, last: Token) -> Vec<f32> {
    let mut logits = vec![0.0; vocab_len];
    let target = next.get(&last).copied().unwrap_or(EOS);
    logits[target as usize] = 10.0;
    logits
}

/// One token per character, over a snapshot of the scripted vocabulary.
pub struct CharTokenizer {
    by_text: HashMap<Vec<u8>, Token>,
}

impl PromptTokenizer for CharTokenizer {
    fn tokenize(&self, text: &str) -> tandem_core::Result<Vec<Token>> {
        text.chars()
            .map(|c| {
                let mut buf = [0u8; 4];
                let bytes = c.encode_utf8(&mut buf).as_bytes();
                self.by_text.get(bytes).copied().ok_or_else(|| {
                    tandem_core::Error::Tokenization(format!("unknown char {:?}", c))
                })
            })
            .collect()
    }
}

impl Evaluator for ScriptedEvaluator {
    fn tokenizer(&self) -> Arc<dyn PromptTokenizer> {
        Arc::new(CharTokenizer {
            by_text: self.by_text.clone(),
        })
    }

    fn evaluate(&mut self, batch: &[EvalRequest<'_>]) -> Result<Vec<SlotLogits>, EvalError> {
        self.batches
            .lock()
            .push(batch.iter().map(|r| (r.slot, r.tokens.len(), r.past)).collect());

        if self.fail_all {
            return Err(EvalError::ResourceExhausted("scripted outage".to_string()));
        }

        if let Some(request) = batch
            .iter()
            .find(|r| r.tokens.last().map_or(false, |t| self.crash_after.contains(t)))
        {
            panic!("scripted crash in slot {}", request.slot);
        }

        let vocab_len = self.vocab.len();
        let next = &self.next;
        let poison_after = &self.poison_after;
        let fail_slots = &self.fail_slots;
        let committed_by_slot = &mut self.committed;
        Ok(batch
            .iter()
            .map(|request| {
                if fail_slots.contains(&request.slot) {
                    return Err(EvalError::Backend(format!("slot {} broke", request.slot)));
                }
                let committed = committed_by_slot.entry(request.slot).or_insert(0);
                if request.past == 0 {
                    *committed = 0;
                }
                if *committed != request.past {
                    return Err(EvalError::Backend(format!(
                        "slot {} past {} but {} committed",
                        request.slot, request.past, committed
                    )));
                }
                *committed += request.tokens.len();
                let last = request.tokens.last().copied().unwrap_or(EOS);
                let mut logits = logits_after(vocab_len, next, last);
                if poison_after.contains(&last) {
                    logits[last as usize] = f32::NAN;
                }
                Ok(logits)
            })
            .collect())
    }

    fn detokenize_one(&self, token: Token) -> Vec<u8> {
        self.vocab.get(token as usize).cloned().unwrap_or_default()
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn layer_count(&self) -> usize {
        2
    }

    fn is_eos(&self, token: Token) -> bool {
        token == EOS
    }

    fn chat_template(&self) -> ChatTemplate {
        ChatTemplate::Raw
    }

    fn seed(&self) -> Option<u64> {
        self.seed
    }

    fn release_slot(&mut self, slot: usize) {
        self.committed.remove(&slot);
        self.released.lock().push(slot);
    }
}

/// Drain every fragment already delivered; true once the final event arrived.
pub fn drain(generation: &mut Generation, out: &mut Vec<u8>) -> bool {
    while let Some(bytes) = generation.try_next_fragment() {
        out.extend_from_slice(&bytes);
    }
    generation.is_finished()
}

/// Tick until nothing is active or `max_ticks` is exhausted.
pub fn run_until_idle<E: Evaluator>(scheduler: &mut Scheduler<E>, max_ticks: usize) -> usize {
    let mut ticks = 0;
    while ticks < max_ticks {
        let evaluated = scheduler.step();
        ticks += 1;
        if evaluated == 0 && !scheduler.has_active() && scheduler.stats().queued_requests == 0 {
            break;
        }
    }
    ticks
}
