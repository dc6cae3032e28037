//! Model loading and evaluation
//!
//! [`LlamaEvaluator`] loads a LLaMA-family checkpoint from a local directory
//! or the HuggingFace Hub and evaluates each slot against its own KV cache.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokenizers::decoders::DecoderWrapper;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::candidates::Token;
use crate::chat_template::ChatTemplate;
use crate::config::ModelOptions;
use crate::error::{Error, EvalError, Result};
use crate::evaluator::{EvalRequest, Evaluator, PromptTokenizer, SlotLogits};

/// Where checkpoint files come from
enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    fn open(path: &str, revision: &str) -> Result<Self> {
        let local = Path::new(path);
        if local.is_dir() {
            return Ok(ModelSource::Local(local.to_path_buf()));
        }
        let api = Api::new().map_err(|e| Error::Load(e.to_string()))?;
        Ok(ModelSource::Hub(api.repo(Repo::with_revision(
            path.to_string(),
            RepoType::Model,
            revision.to_string(),
        ))))
    }

    fn get(&self, name: &str) -> Result<PathBuf> {
        match self {
            ModelSource::Local(dir) => {
                let file = dir.join(name);
                if file.is_file() {
                    Ok(file)
                } else {
                    Err(Error::Load(format!("{} not found in {}", name, dir.display())))
                }
            }
            ModelSource::Hub(repo) => repo
                .get(name)
                .map_err(|e| Error::Load(format!("{}: {}", name, e))),
        }
    }

    /// Resolve weight files, sharded or single.
    fn safetensors(&self) -> Result<Vec<PathBuf>> {
        let Ok(index) = self.get("model.safetensors.index.json") else {
            return Ok(vec![self.get("model.safetensors")?]);
        };

        let json: serde_json::Value = serde_json::from_reader(std::fs::File::open(&index)?)?;
        let weight_map = match json.get("weight_map") {
            Some(serde_json::Value::Object(map)) => map,
            _ => return Err(Error::Load(format!("no weight map in {:?}", index))),
        };

        let files: HashSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
        let mut files: Vec<&str> = files.into_iter().collect();
        files.sort_unstable();
        files.into_iter().map(|f| self.get(f)).collect()
    }
}

/// Pick an accelerator when layers are to be offloaded
fn select_device(gpu_layers: usize) -> Result<Device> {
    if gpu_layers == 0 {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    warn!("gpu_layers={} requested but no accelerator is available; using CPU", gpu_layers);
    Ok(Device::Cpu)
}

fn build_pool(threads: usize, name: &'static str) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{}-{}", name, i))
        .build()
        .map_err(|e| Error::Load(format!("thread pool: {}", e)))
}

/// Inverse of the GPT-2 byte-to-unicode table used by byte-level BPE.
fn byte_level_table() -> HashMap<char, u8> {
    let mut table = HashMap::with_capacity(256);
    let mut shifted = 0u32;
    for b in 0u32..=255 {
        let direct =
            (33..=126).contains(&b) || (161..=172).contains(&b) || (174..=255).contains(&b);
        let code = if direct {
            b
        } else {
            shifted += 1;
            255 + shifted
        };
        if let Some(c) = char::from_u32(code) {
            table.insert(c, b as u8);
        }
    }
    table
}

/// `<0x0A>` style byte-fallback piece.
fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Raw bytes for every vocabulary id
fn build_piece_table(tokenizer: &Tokenizer) -> Vec<Vec<u8>> {
    let vocab_size = tokenizer.get_vocab_size(true);
    let special: HashSet<u32> = tokenizer
        .get_added_tokens_decoder()
        .into_iter()
        .filter(|(_, token)| token.special)
        .map(|(id, _)| id)
        .collect();
    let byte_level = matches!(tokenizer.get_decoder(), Some(DecoderWrapper::ByteLevel(_)));
    let table = byte_level.then(byte_level_table);

    (0..vocab_size as u32)
        .map(|id| {
            if special.contains(&id) {
                return Vec::new();
            }
            let Some(piece) = tokenizer.id_to_token(id) else {
                return Vec::new();
            };
            match &table {
                Some(table) => piece.chars().filter_map(|c| table.get(&c).copied()).collect(),
                None => match parse_byte_piece(&piece) {
                    Some(byte) => vec![byte],
                    None => piece.replace('\u{2581}', " ").into_bytes(),
                },
            }
        })
        .collect()
}

/// End-of-sequence ids from the model config, falling back to well-known tokens
fn eos_tokens(config: &Config, tokenizer: &Tokenizer) -> HashSet<Token> {
    let mut eos = HashSet::new();
    match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => {
            eos.insert(*id);
        }
        Some(LlamaEosToks::Multiple(ids)) => eos.extend(ids.iter().copied()),
        None => {}
    }
    if eos.is_empty() {
        for name in ["</s>", "<|im_end|>", "<|endoftext|>", "<|eot_id|>"] {
            if let Some(id) = tokenizer.token_to_id(name) {
                eos.insert(id);
            }
        }
    }
    eos
}

/// LLaMA-family model with one KV cache per engine slot
pub struct LlamaEvaluator {
    model: Llama,
    tokenizer: Arc<Tokenizer>,
    config: Config,
    device: Device,
    dtype: DType,
    caches: HashMap<usize, Cache>,
    pieces: Vec<Vec<u8>>,
    eos: HashSet<Token>,
    context_length: usize,
    chat_template: ChatTemplate,
    seed: Option<u64>,
    decode_pool: ThreadPool,
    prompt_pool: ThreadPool,
}

impl LlamaEvaluator {
    /// Load from a local directory or a HuggingFace model id.
    pub fn load(path: &str, options: ModelOptions) -> Result<Self> {
        info!("Loading model: {}", path);
        let source = ModelSource::open(path, &options.revision)?;
        let device = select_device(options.gpu_layers)?;
        let dtype = options.dtype.to_candle();

        info!("Loading tokenizer...");
        let tokenizer_file = source.get("tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| Error::Load(format!("failed to load tokenizer: {}", e)))?;

        info!("Loading model config...");
        let config_file = source.get("config.json")?;
        let llama_config: LlamaConfig = serde_json::from_slice(&std::fs::read(&config_file)?)?;
        let use_flash_attn = options.use_flash_attention && cfg!(feature = "flash-attn");
        if options.use_flash_attention && !use_flash_attn {
            warn!("Flash attention requested but the flash-attn feature is not enabled");
        }
        let config = llama_config.into_config(use_flash_attn);

        info!("Loading model weights...");
        let filenames = source.safetensors()?;
        info!("Loading {} safetensor file(s)", filenames.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        let max_positions = config.max_position_embeddings;
        let context_length = match options.context_length {
            0 => max_positions,
            n => n.min(max_positions),
        };
        let chat_template = options.chat_template.unwrap_or_else(|| {
            if tokenizer.token_to_id("<|im_start|>").is_some() {
                ChatTemplate::ChatMl
            } else {
                ChatTemplate::Raw
            }
        });
        let eos = eos_tokens(&config, &tokenizer);
        let pieces = build_piece_table(&tokenizer);

        info!("Model loaded successfully!");
        info!("  - Device: {:?}", device);
        info!("  - Vocab size: {}", config.vocab_size);
        info!("  - Layers: {}", config.num_hidden_layers);
        info!("  - Context length: {}", context_length);
        info!("  - Chat template: {:?}", chat_template);

        Ok(Self {
            model,
            tokenizer: Arc::new(tokenizer),
            config,
            device,
            dtype,
            caches: HashMap::new(),
            pieces,
            eos,
            context_length,
            chat_template,
            seed: options.seed,
            decode_pool: build_pool(options.thread_count, "tandem-decode-pool")?,
            prompt_pool: build_pool(options.batch_thread_count, "tandem-prompt-pool")?,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn evaluate_one(&mut self, request: &EvalRequest<'_>) -> SlotLogits {
        let end = request.past + request.tokens.len();
        if end > self.context_length {
            return Err(EvalError::ContextOverflow {
                position: end,
                context_length: self.context_length,
            });
        }

        if request.past == 0 {
            let cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
            self.caches.insert(request.slot, cache);
        }
        let cache = self
            .caches
            .get_mut(&request.slot)
            .ok_or_else(|| EvalError::Backend(format!("no KV cache for slot {}", request.slot)))?;

        let input = Tensor::new(request.tokens, &self.device)?.unsqueeze(0)?;
        let pool = if request.tokens.len() > 1 {
            &self.prompt_pool
        } else {
            &self.decode_pool
        };
        let model = &self.model;
        let logits = pool.install(|| model.forward(&input, request.past, cache))?;

        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

impl Evaluator for LlamaEvaluator {
    fn tokenizer(&self) -> Arc<dyn PromptTokenizer> {
        self.tokenizer.clone()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        PromptTokenizer::tokenize(self.tokenizer.as_ref(), text)
    }

    fn evaluate(
        &mut self,
        batch: &[EvalRequest<'_>],
    ) -> std::result::Result<Vec<SlotLogits>, EvalError> {
        Ok(batch.iter().map(|request| self.evaluate_one(request)).collect())
    }

    fn detokenize_one(&self, token: Token) -> Vec<u8> {
        self.pieces.get(token as usize).cloned().unwrap_or_default()
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn training_context_length(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn layer_count(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn is_eos(&self, token: Token) -> bool {
        self.eos.contains(&token)
    }

    fn chat_template(&self) -> ChatTemplate {
        self.chat_template
    }

    fn seed(&self) -> Option<u64> {
        self.seed
    }

    fn release_slot(&mut self, slot: usize) {
        self.caches.remove(&slot);
    }
}
