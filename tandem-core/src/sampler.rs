//! Sampling options and the fixed-order pipeline built from them.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::candidates::{CandidateSet, Token};
use crate::error::{ConfigError, SamplingError};
use crate::filters;

/// Mirostat adaptive selection mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirostatMode {
    #[default]
    Off,
    V1,
    V2,
}

/// Final selection rule when mirostat is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    Greedy,
    Stochastic,
}

/// Per-request sampling configuration.
///
/// Every filter is optional; an absent value skips that stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOptions {
    pub repetition_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    /// Trailing history window the penalty stages look at.
    pub penalty_last_n: usize,
    pub top_k: Option<i32>,
    pub top_p: Option<f32>,
    pub tail_free_z: Option<f32>,
    pub typical_p: Option<f32>,
    /// `<= 0` forces greedy selection.
    pub temperature: Option<f32>,
    pub mirostat: MirostatMode,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub strategy: Option<SelectionStrategy>,
    /// Lower bound on candidates kept by the truncating filters.
    pub min_keep: usize,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            repetition_penalty: None,
            frequency_penalty: None,
            presence_penalty: None,
            penalty_last_n: 64,
            top_k: None,
            top_p: None,
            tail_free_z: None,
            typical_p: None,
            temperature: None,
            mirostat: MirostatMode::Off,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            strategy: None,
            min_keep: 1,
        }
    }
}

impl SamplingOptions {
    /// Deterministic highest-probability decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: Some(0.0),
            ..Default::default()
        }
    }

    /// Check value ranges and option combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = |name: &'static str, value: Option<f32>| match value {
            Some(v) if !v.is_finite() => Err(ConfigError::NotFinite(name)),
            _ => Ok(()),
        };
        finite("repetition_penalty", self.repetition_penalty)?;
        finite("frequency_penalty", self.frequency_penalty)?;
        finite("presence_penalty", self.presence_penalty)?;
        finite("top_p", self.top_p)?;
        finite("tail_free_z", self.tail_free_z)?;
        finite("typical_p", self.typical_p)?;
        finite("temperature", self.temperature)?;
        finite("mirostat_tau", Some(self.mirostat_tau))?;
        finite("mirostat_eta", Some(self.mirostat_eta))?;

        if let Some(k) = self.top_k {
            if k < 0 {
                return Err(ConfigError::NegativeTopK(k));
            }
        }
        for (name, value) in [
            ("top_p", self.top_p),
            ("tail_free_z", self.tail_free_z),
            ("typical_p", self.typical_p),
        ] {
            if let Some(v) = value {
                if v <= 0.0 || v > 1.0 {
                    return Err(ConfigError::OutOfUnitRange { name, value: v });
                }
            }
        }
        if let Some(penalty) = self.repetition_penalty {
            if penalty <= 0.0 {
                return Err(ConfigError::NonPositivePenalty(penalty));
            }
        }
        if self.min_keep == 0 {
            return Err(ConfigError::ZeroMinKeep);
        }
        if self.mirostat != MirostatMode::Off {
            if self.mirostat_tau <= 0.0 {
                return Err(ConfigError::MirostatParameter {
                    name: "tau",
                    value: self.mirostat_tau,
                });
            }
            if self.mirostat_eta <= 0.0 {
                return Err(ConfigError::MirostatParameter {
                    name: "eta",
                    value: self.mirostat_eta,
                });
            }
            if self.strategy == Some(SelectionStrategy::Greedy) {
                return Err(ConfigError::MirostatWithGreedy);
            }
        }
        Ok(())
    }
}

/// One configured probability-shaping step.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    RepetitionPenalty(f32),
    FrequencyPresence { frequency: f32, presence: f32 },
    Softmax,
    TopK(i32),
    TopP(f32),
    TailFree(f32),
    Typical(f32),
    Temperature(f32),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::RepetitionPenalty(_) => "repetition penalty",
            Stage::FrequencyPresence { .. } => "frequency/presence penalty",
            Stage::Softmax => "softmax",
            Stage::TopK(_) => "top-k",
            Stage::TopP(_) => "top-p",
            Stage::TailFree(_) => "tail-free",
            Stage::Typical(_) => "typical",
            Stage::Temperature(_) => "temperature",
        }
    }
}

/// How the final token is chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Greedy,
    Stochastic,
    MirostatV1 { tau: f32, eta: f32, m: usize },
    MirostatV2 { tau: f32, eta: f32 },
}

/// Result of one sampling call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampled {
    pub token: Token,
    /// Updated mirostat state; unchanged for non-mirostat selection.
    pub mu: f32,
}

/// Candidates inspected by the mirostat v1 Zipf estimate.
const MIROSTAT_M: usize = 100;

/// Immutable stage list plus selection rule, built once per request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPipeline {
    stages: Vec<Stage>,
    selection: Selection,
    penalty_last_n: usize,
    min_keep: usize,
}

impl SamplingPipeline {
    pub fn from_options(options: &SamplingOptions) -> Result<Self, ConfigError> {
        options.validate()?;

        let greedy_override = matches!(options.temperature, Some(t) if t <= 0.0);

        let mut stages = Vec::new();
        if let Some(penalty) = options.repetition_penalty {
            stages.push(Stage::RepetitionPenalty(penalty));
        }
        if options.frequency_penalty.is_some() || options.presence_penalty.is_some() {
            stages.push(Stage::FrequencyPresence {
                frequency: options.frequency_penalty.unwrap_or(0.0),
                presence: options.presence_penalty.unwrap_or(0.0),
            });
        }
        stages.push(Stage::Softmax);
        if let Some(k) = options.top_k {
            stages.push(Stage::TopK(k));
        }
        if let Some(p) = options.top_p {
            stages.push(Stage::TopP(p));
        }
        if let Some(z) = options.tail_free_z {
            stages.push(Stage::TailFree(z));
        }
        if let Some(p) = options.typical_p {
            stages.push(Stage::Typical(p));
        }
        if let Some(t) = options.temperature.filter(|_| !greedy_override) {
            stages.push(Stage::Temperature(t));
        }

        let selection = if greedy_override {
            Selection::Greedy
        } else {
            match options.mirostat {
                MirostatMode::V1 => Selection::MirostatV1 {
                    tau: options.mirostat_tau,
                    eta: options.mirostat_eta,
                    m: MIROSTAT_M,
                },
                MirostatMode::V2 => Selection::MirostatV2 {
                    tau: options.mirostat_tau,
                    eta: options.mirostat_eta,
                },
                MirostatMode::Off => match options.strategy {
                    Some(SelectionStrategy::Greedy) => Selection::Greedy,
                    _ => Selection::Stochastic,
                },
            }
        };

        Ok(Self {
            stages,
            selection,
            penalty_last_n: options.penalty_last_n,
            min_keep: options.min_keep,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Starting mirostat state: `2 * tau`, or zero when mirostat is off.
    pub fn initial_mu(&self) -> f32 {
        match self.selection {
            Selection::MirostatV1 { tau, .. } | Selection::MirostatV2 { tau, .. } => 2.0 * tau,
            _ => 0.0,
        }
    }

    /// Choose the next token from one step's logits.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        logits: &[f32],
        history: &[Token],
        mu: f32,
        rng: &mut R,
    ) -> Result<Sampled, SamplingError> {
        self.sample_candidates(CandidateSet::from_logits(logits), history, mu, rng)
    }

    /// Run every stage over `set`, then select.
    pub fn sample_candidates<R: Rng + ?Sized>(
        &self,
        mut set: CandidateSet,
        history: &[Token],
        mu: f32,
        rng: &mut R,
    ) -> Result<Sampled, SamplingError> {
        if let Some(bad) = set.first_invalid_logit() {
            return Err(SamplingError::InvalidDistribution(format!(
                "logit {} for token {}",
                bad.logit, bad.id
            )));
        }
        let vocab_size = set.len();
        let window = &history[history.len().saturating_sub(self.penalty_last_n)..];

        for stage in &self.stages {
            match *stage {
                Stage::RepetitionPenalty(penalty) => {
                    filters::repetition_penalty(&mut set, window, penalty)
                }
                Stage::FrequencyPresence {
                    frequency,
                    presence,
                } => filters::frequency_presence_penalty(&mut set, window, frequency, presence),
                Stage::Softmax => set.softmax(),
                Stage::TopK(k) => filters::top_k(&mut set, k, self.min_keep),
                Stage::TopP(p) => filters::top_p(&mut set, p, self.min_keep),
                Stage::TailFree(z) => filters::tail_free(&mut set, z, self.min_keep),
                Stage::Typical(p) => filters::typical(&mut set, p, self.min_keep),
                Stage::Temperature(t) => filters::temperature(&mut set, t),
            }
            if set.is_empty() {
                return Err(SamplingError::EmptyCandidates {
                    stage: stage.name(),
                });
            }
        }

        match self.selection {
            Selection::Greedy => Ok(Sampled {
                token: filters::greedy(&set)?,
                mu,
            }),
            Selection::Stochastic => {
                // Truncation may have left stale mass behind
                set.softmax();
                Ok(Sampled {
                    token: filters::weighted_draw(&set, rng)?,
                    mu,
                })
            }
            Selection::MirostatV1 { tau, eta, m } => {
                let (token, mu) = filters::mirostat_v1(&mut set, tau, eta, m, mu, vocab_size, rng)?;
                Ok(Sampled { token, mu })
            }
            Selection::MirostatV2 { tau, eta } => {
                let (token, mu) = filters::mirostat_v2(&mut set, tau, eta, mu, rng)?;
                Ok(Sampled { token, mu })
            }
        }
    }
}
