//! Per-step probability distribution over the vocabulary.
//!
//! Every sampling filter consumes and produces a [`CandidateSet`]. The set
//! carries a `sorted` flag: when it is set, candidates are in non-increasing
//! order of the field last normalized (logit before [`CandidateSet::softmax`],
//! probability after it). Filters that reorder or rescale clear the flag;
//! filters that need order call `softmax` instead of assuming it.

/// Identifier into the model vocabulary.
pub type Token = u32;

/// One vocabulary entry under consideration for the next position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenCandidate {
    pub id: Token,
    pub logit: f32,
    /// Only meaningful after the set has been normalized.
    pub probability: f32,
}

/// Ordered candidates plus the sortedness flag.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    candidates: Vec<TokenCandidate>,
    sorted: bool,
}

impl CandidateSet {
    /// Build a set from raw logits, one candidate per vocabulary id.
    pub fn from_logits(logits: &[f32]) -> Self {
        let candidates = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenCandidate {
                id: id as Token,
                logit,
                probability: 0.0,
            })
            .collect();
        Self {
            candidates,
            sorted: false,
        }
    }

    /// Build a set from explicit candidates; order is taken as unsorted.
    pub fn from_candidates(candidates: Vec<TokenCandidate>) -> Self {
        Self {
            candidates,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn as_slice(&self) -> &[TokenCandidate] {
        &self.candidates
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TokenCandidate> {
        self.candidates.iter()
    }

    /// Look up a candidate by token id.
    pub fn find(&self, id: Token) -> Option<&TokenCandidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// First logit that no distribution can be built from: NaN or `+inf`.
    /// `-inf` is a mask and is accepted.
    pub fn first_invalid_logit(&self) -> Option<&TokenCandidate> {
        self.candidates
            .iter()
            .find(|c| c.logit.is_nan() || c.logit == f32::INFINITY)
    }

    /// Sum of the probabilities currently held.
    pub fn probability_mass(&self) -> f32 {
        self.candidates.iter().map(|c| c.probability).sum()
    }

    /// Mutable access to logits. Any edit may break ordering, so the set is
    /// marked unsorted.
    pub(crate) fn logits_mut(&mut self) -> impl Iterator<Item = &mut TokenCandidate> {
        self.sorted = false;
        self.candidates.iter_mut()
    }

    /// Sort descending by logit (ties: lower id first) and normalize
    /// probabilities with a max-shifted softmax.
    pub fn softmax(&mut self) {
        if self.candidates.is_empty() {
            return;
        }

        if !self.sorted {
            self.candidates
                .sort_by(|a, b| b.logit.total_cmp(&a.logit).then(a.id.cmp(&b.id)));
        }

        let max_logit = self.candidates[0].logit;
        if max_logit == f32::INFINITY {
            // The limit of softmax: +inf candidates share all the mass
            let top = self
                .candidates
                .iter()
                .take_while(|c| c.logit == f32::INFINITY)
                .count();
            for (i, c) in self.candidates.iter_mut().enumerate() {
                c.probability = if i < top { 1.0 / top as f32 } else { 0.0 };
            }
            self.sorted = true;
            return;
        }
        if !max_logit.is_finite() {
            // Every logit masked to -inf, or NaN; fall back to uniform
            let uniform = 1.0 / self.candidates.len() as f32;
            for c in &mut self.candidates {
                c.probability = uniform;
            }
            self.sorted = true;
            return;
        }

        let mut sum = 0.0f32;
        for c in &mut self.candidates {
            let p = (c.logit - max_logit).exp();
            c.probability = p;
            sum += p;
        }
        for c in &mut self.candidates {
            c.probability /= sum;
        }
        self.sorted = true;
    }

    /// Keep the first `len` candidates in the current order.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.candidates.truncate(len);
    }

    /// Replace the candidates with a reordered subset. The new order is not
    /// by probability, so the set becomes unsorted.
    pub(crate) fn replace_unsorted(&mut self, candidates: Vec<TokenCandidate>) {
        self.candidates = candidates;
        self.sorted = false;
    }
}
