//! Engine and model configuration.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::chat_template::ChatTemplate;

/// Configuration for the generation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sequences decoded concurrently; further requests wait in the queue.
    pub max_parallel: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }
}

/// Data type for model weights
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDtype {
    #[default]
    F32,
    F16,
    Bf16,
}

impl WeightDtype {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f32" => Some(WeightDtype::F32),
            "f16" => Some(WeightDtype::F16),
            "bf16" => Some(WeightDtype::Bf16),
            _ => None,
        }
    }

    pub fn to_candle(self) -> DType {
        match self {
            WeightDtype::F32 => DType::F32,
            WeightDtype::F16 => DType::F16,
            WeightDtype::Bf16 => DType::BF16,
        }
    }
}

/// Configuration for model loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Context window in tokens; 0 uses the model's maximum.
    pub context_length: usize,
    /// Layers to offload; any positive value selects an accelerator when one is available.
    pub gpu_layers: usize,
    /// Threads for single-token decode steps; 0 lets rayon decide.
    pub thread_count: usize,
    /// Threads for prompt evaluation; 0 lets rayon decide.
    pub batch_thread_count: usize,
    pub use_flash_attention: bool,
    /// Seed for the engine's random source.
    pub seed: Option<u64>,
    /// Hub revision/branch, ignored for local directories.
    pub revision: String,
    pub dtype: WeightDtype,
    /// Prompt format; `None` guesses from the tokenizer vocabulary.
    pub chat_template: Option<ChatTemplate>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            context_length: 0,
            gpu_layers: 0,
            thread_count: 0,
            batch_thread_count: 0,
            use_flash_attention: false,
            seed: None,
            revision: "main".to_string(),
            dtype: WeightDtype::F32,
            chat_template: None,
        }
    }
}
