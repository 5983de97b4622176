//! llama.cpp-shaped engine.
//!
//! Model and context handles mirror `llama_model` / `llama_context`. The
//! compute path is a stub that simulates llama.cpp behaviour (tokenize,
//! decode into the KV cache, sample, detokenize) so the chat layer can be
//! exercised end to end without linking the C library.

use std::path::Path;

use tracing::{debug, info};

use crate::inference::backend::{InferenceBackend, InferenceError, LoadError, ModelParams};
use crate::inference::model_loader;

/// Token ID type.
pub type TokenId = i32;

const BOS: TokenId = 1;
const EOS: TokenId = 2;

/// Stub vocabulary. Real detokenization comes from the GGUF tokenizer tables.
const PIECES: &[&str] = &[
    "I", " hear", " you", ".", " That", " sounds", " like", " a", " lot", " to", " carry", ",",
    " and", " it", " makes", " sense", " to", " feel", " this", " way", ".",
];

/// Stub model handle.
///
/// In a real implementation, this would wrap `*mut llama_model`.
pub struct LlamaModel {
    /// Model file path.
    pub path: String,

    /// Vocabulary size.
    pub n_vocab: usize,

    /// Training context length.
    pub n_ctx_train: u32,
}

/// Stub context handle.
///
/// In a real implementation, this would wrap `*mut llama_context`.
pub struct LlamaContext {
    /// Context size.
    pub n_ctx: u32,

    /// Current token position.
    pub pos: usize,

    /// Tokens sampled since the last prompt.
    sampled: usize,
}

impl LlamaModel {
    /// Load a model from a GGUF file (stub).
    pub fn load(path: &Path, params: &ModelParams) -> Result<Self, LoadError> {
        let asset = model_loader::require_gguf(path)?;

        info!(
            path = %asset.path.display(),
            size = asset.file_size,
            use_gpu = params.use_gpu,
            threads = params.n_threads,
            "Loading llama model"
        );

        Ok(Self {
            path: path.display().to_string(),
            n_vocab: 32000,
            n_ctx_train: 2048,
        })
    }

    /// Create a new context for this model (stub).
    pub fn new_context(&self, params: &ModelParams) -> Result<LlamaContext, LoadError> {
        if params.n_ctx == 0 {
            return Err(LoadError::Engine("context size must be non-zero".to_string()));
        }
        Ok(LlamaContext {
            n_ctx: params.n_ctx.min(self.n_ctx_train),
            pos: 0,
            sampled: 0,
        })
    }

    /// Tokenize a string into token IDs (stub).
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, InferenceError> {
        // Stub: approximately 1 token per 4 characters.
        let n_tokens = (text.len() / 4).max(1);
        let mut tokens: Vec<TokenId> = (0..n_tokens as TokenId).map(|t| t + 3).collect();
        if add_bos {
            tokens.insert(0, BOS);
        }
        Ok(tokens)
    }

    /// Text for a single token (stub).
    pub fn token_to_piece(&self, token: TokenId) -> String {
        let idx = (token as usize).saturating_sub(3) % PIECES.len();
        PIECES[idx].to_string()
    }
}

impl LlamaContext {
    /// Process a batch of tokens (stub).
    pub fn decode(&mut self, tokens: &[TokenId]) -> Result<(), InferenceError> {
        if self.pos + tokens.len() > self.n_ctx as usize {
            return Err(InferenceError::Decode(format!(
                "context full: {} + {} > {}",
                self.pos,
                tokens.len(),
                self.n_ctx
            )));
        }
        self.pos += tokens.len();
        Ok(())
    }

    /// Sample the next token (stub: walks the stub vocabulary, then EOS).
    pub fn sample(&mut self) -> Result<TokenId, InferenceError> {
        let token = if self.sampled < PIECES.len() {
            self.sampled as TokenId + 3
        } else {
            EOS
        };
        self.sampled += 1;
        Ok(token)
    }

    /// Get the current KV cache usage in tokens.
    pub fn kv_cache_used(&self) -> usize {
        self.pos
    }

    /// Clear the KV cache.
    pub fn kv_cache_clear(&mut self) {
        self.pos = 0;
        self.sampled = 0;
    }
}

/// [`InferenceBackend`] over the llama handles.
#[derive(Default)]
pub struct LlamaBackend {
    model: Option<LlamaModel>,
    ctx: Option<LlamaContext>,
}

impl LlamaBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InferenceBackend for LlamaBackend {
    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<(), LoadError> {
        let model = LlamaModel::load(path, params)?;
        let ctx = model.new_context(params)?;
        self.model = Some(model);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn predict(
        &mut self,
        prompt: &str,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), InferenceError> {
        let (Some(model), Some(ctx)) = (self.model.as_ref(), self.ctx.as_mut()) else {
            return Err(InferenceError::NotReady("no model loaded".to_string()));
        };

        let tokens = model.tokenize(prompt, ctx.pos == 0)?;
        ctx.decode(&tokens)?;
        ctx.sampled = 0;
        debug!(prompt_tokens = tokens.len(), kv_used = ctx.kv_cache_used(), "Prompt decoded");

        while ctx.kv_cache_used() < ctx.n_ctx as usize {
            let token = ctx.sample()?;
            if token == EOS {
                break;
            }
            ctx.decode(&[token])?;
            if on_token(&model.token_to_piece(token)) {
                break;
            }
        }

        Ok(())
    }

    fn reset(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.kv_cache_clear();
        }
    }
}
