//! The engine boundary.
//!
//! Everything the chat layer needs from an inference engine: load weights,
//! stream a completion chunk by chunk, forget conversational context. Engines
//! are blocking; the session drives them from a blocking worker thread.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{ModelConfig, SamplingConfig};
use crate::inference::model_loader::ModelLoaderError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The weight file is absent or unreadable.
    #[error("Model asset missing: {}", .0.display())]
    ModelAssetMissing(PathBuf),

    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    /// The engine refused to initialize.
    #[error("Failed to load model: {0}")]
    Engine(String),

    /// Load requested while a generation holds the engine.
    #[error("Model is busy generating")]
    Busy,

    /// The blocking load worker panicked or was cancelled.
    #[error("Model load worker failed: {0}")]
    Worker(String),
}

impl From<ModelLoaderError> for LoadError {
    fn from(e: ModelLoaderError) -> Self {
        match e {
            ModelLoaderError::AssetMissing(path) => LoadError::ModelAssetMissing(path),
            other => LoadError::InvalidModel(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// Another generation is in flight.
    #[error("A generation is already in progress")]
    Busy,

    #[error("Model is not ready (state: {0})")]
    NotReady(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    /// The generation worker went away without reporting a result.
    #[error("Generation worker exited unexpectedly")]
    WorkerLost,
}

/// Parameters handed to the engine at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,

    /// Offload layers to the GPU.
    pub use_gpu: bool,

    /// Sampling configuration, passed through untouched.
    pub sampling: SamplingConfig,
}

impl From<&ModelConfig> for ModelParams {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            n_ctx: cfg.n_ctx,
            n_batch: cfg.n_batch,
            n_threads: cfg.n_threads,
            use_gpu: cfg.use_gpu,
            sampling: cfg.sampling.clone(),
        }
    }
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

/// An inference engine.
///
/// `predict` calls `on_token` once per produced chunk, in order. A `true`
/// return asks the engine to stop; engines must honour it before producing
/// the next chunk.
pub trait InferenceBackend: Send + 'static {
    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<(), LoadError>;

    fn predict(
        &mut self,
        prompt: &str,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), InferenceError>;

    /// Drop conversational context (KV cache), keep the weights.
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_missing_maps_to_load_error() {
        let err: LoadError = ModelLoaderError::AssetMissing(PathBuf::from("/x.gguf")).into();
        assert_eq!(err, LoadError::ModelAssetMissing(PathBuf::from("/x.gguf")));
        assert!(err.to_string().contains("/x.gguf"));
    }

    #[test]
    fn test_params_from_config() {
        let mut cfg = ModelConfig::default();
        cfg.n_ctx = 1024;
        let params = ModelParams::from(&cfg);
        assert_eq!(params.n_ctx, 1024);
        assert_eq!(params.sampling.mirostat, 2);
    }
}
