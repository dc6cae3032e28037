//! Individual probability-shaping stages and selection rules.
//!
//! Each function mutates a [`CandidateSet`] in place. Truncating filters
//! renormalize through [`CandidateSet::softmax`] first, so they always see
//! a sorted distribution over the candidates that survived earlier stages.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::candidates::{CandidateSet, Token};
use crate::error::SamplingError;

/// Penalize every candidate that occurs in `window`, once per candidate.
pub fn repetition_penalty(set: &mut CandidateSet, window: &[Token], penalty: f32) {
    if window.is_empty() || penalty == 1.0 {
        return;
    }
    let seen: HashSet<Token> = window.iter().copied().collect();
    for c in set.logits_mut() {
        if !seen.contains(&c.id) {
            continue;
        }
        if c.logit > 0.0 {
            c.logit /= penalty;
        } else {
            c.logit *= penalty;
        }
    }
}

/// Subtract `frequency * count + presence * (count > 0)` from each logit.
pub fn frequency_presence_penalty(
    set: &mut CandidateSet,
    window: &[Token],
    frequency: f32,
    presence: f32,
) {
    if window.is_empty() || (frequency == 0.0 && presence == 0.0) {
        return;
    }
    let mut counts: HashMap<Token, usize> = HashMap::new();
    for &token in window {
        *counts.entry(token).or_default() += 1;
    }
    for c in set.logits_mut() {
        if let Some(&count) = counts.get(&c.id) {
            c.logit -= frequency * count as f32 + presence;
        }
    }
}

/// Keep the `max(k, min_keep)` most likely candidates.
pub fn top_k(set: &mut CandidateSet, k: i32, min_keep: usize) {
    if k <= 0 {
        return;
    }
    let keep = (k as usize).max(min_keep);
    if keep >= set.len() {
        return;
    }
    if !set.is_sorted() {
        set.softmax();
    }
    set.truncate(keep);
}

/// Nucleus filter: smallest prefix whose cumulative probability reaches `p`.
pub fn top_p(set: &mut CandidateSet, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    set.softmax();

    let mut cumulative = 0.0f32;
    let mut last = set.len();
    for (i, c) in set.iter().enumerate() {
        cumulative += c.probability;
        if cumulative >= p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }
    set.truncate(last);
}

/// Tail-free filter over the second derivative of the sorted probabilities.
pub fn tail_free(set: &mut CandidateSet, z: f32, min_keep: usize) {
    if z >= 1.0 || set.len() <= 2 {
        return;
    }
    set.softmax();

    let probs: Vec<f32> = set.iter().map(|c| c.probability).collect();
    let first: Vec<f32> = probs.windows(2).map(|w| w[0] - w[1]).collect();
    let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();

    let total: f32 = second.iter().sum();
    if total <= f32::EPSILON {
        // Flat curve, no tail to cut
        return;
    }
    for v in &mut second {
        *v /= total;
    }

    let mut cumulative = 0.0f32;
    let mut last = set.len();
    for (i, v) in second.iter().enumerate() {
        cumulative += v;
        if cumulative > z && i >= min_keep {
            last = i;
            break;
        }
    }
    set.truncate(last);
}

/// Locally typical filter: prefer candidates whose surprise is close to the
/// distribution's entropy.
pub fn typical(set: &mut CandidateSet, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    set.softmax();

    let entropy: f32 = set
        .iter()
        .filter(|c| c.probability > 0.0)
        .map(|c| -c.probability * c.probability.ln())
        .sum();

    let mut scored: Vec<(f32, usize)> = set
        .iter()
        .enumerate()
        .map(|(i, c)| ((-c.probability.ln() - entropy).abs(), i))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let candidates = set.as_slice();
    let mut cumulative = 0.0f32;
    let mut last = scored.len();
    for (i, &(_, idx)) in scored.iter().enumerate() {
        cumulative += candidates[idx].probability;
        if cumulative >= p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }

    let kept = scored[..last].iter().map(|&(_, idx)| candidates[idx]).collect();
    set.replace_unsorted(kept);
}

/// Divide logits by `temperature` and renormalize.
pub fn temperature(set: &mut CandidateSet, temperature: f32) {
    for c in set.logits_mut() {
        c.logit /= temperature;
    }
    set.softmax();
}

/// Highest probability, ties by lowest id.
pub fn greedy(set: &CandidateSet) -> Result<Token, SamplingError> {
    let mut best = set
        .as_slice()
        .first()
        .ok_or(SamplingError::EmptyCandidates { stage: "greedy" })?;
    for c in set.iter().skip(1) {
        if c.probability > best.probability
            || (c.probability == best.probability && c.id < best.id)
        {
            best = c;
        }
    }
    Ok(best.id)
}

/// Draw one candidate proportionally to its probability.
pub fn weighted_draw<R: Rng + ?Sized>(
    set: &CandidateSet,
    rng: &mut R,
) -> Result<Token, SamplingError> {
    if set.is_empty() {
        return Err(SamplingError::EmptyCandidates { stage: "selection" });
    }
    let total = set.probability_mass();
    if !total.is_finite() || total <= 0.0 {
        return Err(SamplingError::InvalidDistribution(format!(
            "probability mass {total}"
        )));
    }

    let r: f32 = rng.gen::<f32>() * total;
    let mut cumulative = 0.0f32;
    for c in set.iter() {
        cumulative += c.probability;
        if cumulative > r {
            return Ok(c.id);
        }
    }
    // Rounding left r past the last bucket
    let last = set
        .iter()
        .rev()
        .find(|c| c.probability > 0.0)
        .ok_or_else(|| SamplingError::InvalidDistribution("no positive probability".into()))?;
    Ok(last.id)
}

/// Surprise of `token` in bits under the current probabilities.
fn surprise(set: &CandidateSet, token: Token) -> f32 {
    set.find(token)
        .map(|c| -c.probability.log2())
        .unwrap_or(0.0)
}

/// Mirostat v1: estimate the Zipf exponent over the top `m` candidates,
/// derive `k` from it, then draw. Returns the token and the updated `mu`.
pub fn mirostat_v1<R: Rng + ?Sized>(
    set: &mut CandidateSet,
    tau: f32,
    eta: f32,
    m: usize,
    mu: f32,
    vocab_size: usize,
    rng: &mut R,
) -> Result<(Token, f32), SamplingError> {
    if set.is_empty() {
        return Err(SamplingError::EmptyCandidates { stage: "mirostat" });
    }
    set.softmax();

    let mut sum_ti_bi = 0.0f32;
    let mut sum_ti_sq = 0.0f32;
    let window = m.min(set.len()).saturating_sub(1);
    let candidates = set.as_slice();
    for i in 0..window {
        let next = candidates[i + 1].probability;
        if next <= 0.0 {
            break;
        }
        let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
        let b_i = (candidates[i].probability / next).ln();
        sum_ti_bi += t_i * b_i;
        sum_ti_sq += t_i * t_i;
    }

    let k = if sum_ti_sq > 0.0 {
        let s_hat = sum_ti_bi / sum_ti_sq;
        let epsilon = s_hat - 1.0;
        let n = vocab_size.max(1) as f32;
        ((epsilon * 2f32.powf(mu)) / (1.0 - n.powf(-epsilon))).powf(1.0 / s_hat)
    } else {
        f32::NAN
    };
    let k = if k.is_finite() {
        (k as usize).clamp(1, set.len())
    } else {
        set.len()
    };

    set.truncate(k);
    set.softmax();

    let token = weighted_draw(set, rng)?;
    let observed = surprise(set, token);
    Ok((token, mu - eta * (observed - tau)))
}

/// Mirostat v2: drop candidates whose surprise exceeds `mu`, then draw.
/// Returns the token and the updated `mu`.
pub fn mirostat_v2<R: Rng + ?Sized>(
    set: &mut CandidateSet,
    tau: f32,
    eta: f32,
    mu: f32,
    rng: &mut R,
) -> Result<(Token, f32), SamplingError> {
    if set.is_empty() {
        return Err(SamplingError::EmptyCandidates { stage: "mirostat" });
    }
    set.softmax();

    let keep = set
        .iter()
        .position(|c| -c.probability.log2() > mu)
        .unwrap_or(set.len())
        .max(1);
    set.truncate(keep);
    set.softmax();

    let token = weighted_draw(set, rng)?;
    let observed = surprise(set, token);
    Ok((token, mu - eta * (observed - tau)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ids(set: &CandidateSet) -> Vec<Token> {
        set.iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_repetition_penalty_divides_and_multiplies() {
        let mut set = CandidateSet::from_logits(&[2.0, -2.0, 4.0]);
        repetition_penalty(&mut set, &[0, 1], 2.0);

        assert_eq!(set.find(0).map(|c| c.logit), Some(1.0));
        assert_eq!(set.find(1).map(|c| c.logit), Some(-4.0));
        assert_eq!(set.find(2).map(|c| c.logit), Some(4.0));
    }

    #[test]
    fn test_repetition_penalty_applies_once_per_token() {
        let mut set = CandidateSet::from_logits(&[8.0]);
        repetition_penalty(&mut set, &[0, 0, 0], 2.0);
        assert_eq!(set.find(0).map(|c| c.logit), Some(4.0));
    }

    #[test]
    fn test_frequency_presence_penalty() {
        let mut set = CandidateSet::from_logits(&[1.0, 1.0, 1.0]);
        frequency_presence_penalty(&mut set, &[0, 0, 1], 0.5, 0.25);

        assert_eq!(set.find(0).map(|c| c.logit), Some(1.0 - 1.0 - 0.25));
        assert_eq!(set.find(1).map(|c| c.logit), Some(1.0 - 0.5 - 0.25));
        assert_eq!(set.find(2).map(|c| c.logit), Some(1.0));
    }

    #[test]
    fn test_top_k_one_keeps_best() {
        let mut set = CandidateSet::from_logits(&[1.0, 5.0, 5.0, 3.0]);
        set.softmax();
        top_k(&mut set, 1, 1);
        assert_eq!(ids(&set), vec![1]);
    }

    #[test]
    fn test_top_k_noop_bounds() {
        let mut set = CandidateSet::from_logits(&[1.0, 2.0, 3.0]);
        top_k(&mut set, 0, 1);
        assert_eq!(set.len(), 3);
        top_k(&mut set, 10, 1);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_top_k_respects_min_keep() {
        let mut set = CandidateSet::from_logits(&[1.0, 2.0, 3.0, 4.0]);
        top_k(&mut set, 1, 3);
        assert_eq!(ids(&set), vec![3, 2, 1]);
    }

    #[test]
    fn test_top_p_one_is_noop() {
        let mut set = CandidateSet::from_logits(&[1.0, 2.0, 3.0]);
        set.softmax();
        let before = set.as_slice().to_vec();
        top_p(&mut set, 1.0, 1);
        assert_eq!(set.as_slice(), before.as_slice());
    }

    #[test]
    fn test_top_p_tiny_keeps_min_keep() {
        let mut set = CandidateSet::from_logits(&[1.0, 2.0, 3.0, 4.0]);
        top_p(&mut set, 0.001, 1);
        assert_eq!(ids(&set), vec![3]);

        let mut set = CandidateSet::from_logits(&[1.0, 2.0, 3.0, 4.0]);
        top_p(&mut set, 0.001, 2);
        assert_eq!(ids(&set), vec![3, 2]);
    }

    #[test]
    fn test_top_p_cuts_at_cumulative_mass() {
        // probabilities 0.5, 0.3, 0.2 after softmax of ln values
        let mut set = CandidateSet::from_logits(&[0.5f32.ln(), 0.3f32.ln(), 0.2f32.ln()]);
        top_p(&mut set, 0.75, 1);
        assert_eq!(ids(&set), vec![0, 1]);
    }

    #[test]
    fn test_tail_free_drops_flat_tail() {
        let logits: Vec<f32> = [0.6f32, 0.3, 0.04, 0.03, 0.02, 0.01]
            .iter()
            .map(|p| p.ln())
            .collect();
        let mut set = CandidateSet::from_logits(&logits);
        tail_free(&mut set, 0.5, 1);
        assert!(set.len() < 6);
        assert_eq!(set.as_slice()[0].id, 0);
    }

    #[test]
    fn test_tail_free_small_set_is_noop() {
        let mut set = CandidateSet::from_logits(&[1.0, 2.0]);
        tail_free(&mut set, 0.1, 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_typical_clears_sorted_and_keeps_min() {
        let logits: Vec<f32> = [0.4f32, 0.3, 0.2, 0.1].iter().map(|p| p.ln()).collect();
        let mut set = CandidateSet::from_logits(&logits);
        typical(&mut set, 0.01, 1);
        assert!(!set.is_sorted());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_typical_prefers_entropy_matching_tokens() {
        // Token 0 holds 0.3 of the mass; its surprise sits far below the
        // entropy while the 100 small tokens sit close to it
        let mut logits = vec![0.007f32.ln(); 100];
        logits.insert(0, 0.3f32.ln());
        let mut set = CandidateSet::from_logits(&logits);
        typical(&mut set, 0.2, 1);
        assert!(set.find(0).is_none());
    }

    #[test]
    fn test_temperature_sharpens() {
        let mut cold = CandidateSet::from_logits(&[1.0, 2.0]);
        temperature(&mut cold, 0.5);
        let mut warm = CandidateSet::from_logits(&[1.0, 2.0]);
        temperature(&mut warm, 2.0);

        assert!(cold.as_slice()[0].probability > warm.as_slice()[0].probability);
    }

    #[test]
    fn test_greedy_tie_breaks_by_id() {
        let set = CandidateSet::from_candidates(vec![
            crate::candidates::TokenCandidate { id: 7, logit: 0.0, probability: 0.4 },
            crate::candidates::TokenCandidate { id: 3, logit: 0.0, probability: 0.4 },
            crate::candidates::TokenCandidate { id: 5, logit: 0.0, probability: 0.2 },
        ]);
        assert_eq!(greedy(&set), Ok(3));
    }

    #[test]
    fn test_greedy_empty_is_error() {
        let set = CandidateSet::default();
        assert!(matches!(greedy(&set), Err(SamplingError::EmptyCandidates { .. })));
    }

    #[test]
    fn test_weighted_draw_only_hits_positive_mass() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut set = CandidateSet::from_logits(&[0.0, f32::NEG_INFINITY, 0.0]);
        set.softmax();
        for _ in 0..200 {
            let token = weighted_draw(&set, &mut rng).expect("draw");
            assert_ne!(token, 1);
        }
    }

    #[test]
    fn test_mirostat_v2_mu_moves_against_surprise() {
        let mut rng = StdRng::seed_from_u64(1);

        // Two equal tokens: one bit of surprise, above tau
        let mut set = CandidateSet::from_logits(&[0.0, 0.0]);
        let (_, mu) = mirostat_v2(&mut set, 0.5, 0.1, 10.0, &mut rng).expect("sample");
        assert!(mu < 10.0);

        // One dominant token: near-zero surprise, below tau
        let mut set = CandidateSet::from_logits(&[20.0, 0.0]);
        let (token, mu) = mirostat_v2(&mut set, 3.0, 0.1, 0.5, &mut rng).expect("sample");
        assert_eq!(token, 0);
        assert!(mu > 0.5);
    }

    #[test]
    fn test_mirostat_v2_converges_to_tau() {
        let mut rng = StdRng::seed_from_u64(42);
        let tau = 5.0;
        let eta = 0.1;
        let mut mu = 2.0 * tau;
        let mut tail = Vec::new();

        for step in 0..2000 {
            let mut set = CandidateSet::from_logits(&[0.0; 256]);
            let (token, next_mu) = mirostat_v2(&mut set, tau, eta, mu, &mut rng).expect("sample");
            let p = set.find(token).map(|c| c.probability).unwrap_or(1.0);
            if step >= 1000 {
                tail.push(-p.log2());
            }
            mu = next_mu;
        }

        let mean = tail.iter().sum::<f32>() / tail.len() as f32;
        assert!((mean - tau).abs() < 0.25, "mean surprise {mean}");
    }

    #[test]
    fn test_mirostat_v1_converges_to_tau() {
        let mut rng = StdRng::seed_from_u64(9);
        let tau = 3.0;
        let eta = 0.1;
        let mut mu = 2.0 * tau;
        let mut tail = Vec::new();

        // Zipf distribution with exponent 1.5
        let logits: Vec<f32> = (1..=512).map(|r| -1.5 * (r as f32).ln()).collect();
        for step in 0..3000 {
            let mut set = CandidateSet::from_logits(&logits);
            let (token, next_mu) =
                mirostat_v1(&mut set, tau, eta, 100, mu, logits.len(), &mut rng).expect("sample");
            let p = set.find(token).map(|c| c.probability).unwrap_or(1.0);
            if step >= 1500 {
                tail.push(-p.log2());
            }
            mu = next_mu;
        }

        let mean = tail.iter().sum::<f32>() / tail.len() as f32;
        assert!((mean - tau).abs() < 0.5, "mean surprise {mean}");
    }

    proptest! {
        #[test]
        fn prop_repetition_penalty_moves_toward_zero_or_down(
            logits in prop::collection::vec(-20.0f32..20.0, 1..64),
            penalty in 1.0f32..4.0,
        ) {
            let window: Vec<Token> = (0..logits.len() as Token).collect();
            let mut set = CandidateSet::from_logits(&logits);
            repetition_penalty(&mut set, &window, penalty);

            for c in set.iter() {
                let before = logits[c.id as usize];
                if before > 0.0 {
                    prop_assert!((c.logit - before / penalty).abs() < 1e-5);
                } else {
                    prop_assert!((c.logit - before * penalty).abs() < 1e-4);
                }
            }
        }
    }
}
