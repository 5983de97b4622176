//! Runtime configuration for safespace.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Download source, engine parameters and the chat prompt template all live here.

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::inference::template::{fill_placeholders, PromptTemplate};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "safespace", about = "Chat with a locally hosted language model")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Do not fetch the model weights, fail if they are not already on disk.
    #[arg(long)]
    pub skip_download: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the model weights come from and where they are stored.
    pub download: DownloadConfig,

    /// Engine parameters handed to the backend at load time.
    pub model: ModelConfig,

    /// Conversation behaviour.
    pub chat: ChatConfig,
}

/// Model weight download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Remote URL of the GGUF weight file.
    pub url: String,

    /// File name inside `models_dir`.
    pub filename: String,

    /// Directory holding downloaded models.
    pub models_dir: PathBuf,

    /// Expected size in bytes. When set, a local file of any other size is
    /// treated as invalid and fetched again.
    pub expected_size: Option<u64>,

    /// Write buffer size in bytes.
    pub chunk_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            url: "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q6_K.gguf".to_string(),
            filename: "tinyllama-1.1b-chat-v1.0.Q6_K.gguf".to_string(),
            models_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("safespace")
                .join("models"),
            expected_size: None,
            chunk_size: 4096,
        }
    }
}

impl DownloadConfig {
    /// Full path of the local weight file.
    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join(&self.filename)
    }
}

/// Engine settings (mirrors the llama.cpp model/context params).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,

    /// Offload layers to the GPU (Metal on Apple hardware).
    pub use_gpu: bool,

    /// Sampling parameters. Opaque to everything except the backend.
    pub sampling: SamplingConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_threads: 4,
            use_gpu: true,
            sampling: SamplingConfig::default(),
        }
    }
}

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,

    /// Mirostat version (0 = disabled).
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            mirostat: 2,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
        }
    }
}

/// Conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Prompt format wrapped around every request.
    pub template: PromptTemplate,

    /// System preamble for ordinary questions.
    pub system_prompt: String,

    /// System preamble for "continue generating". `{prompt}` is replaced by
    /// the original question and `{response}` by the answer so far.
    pub continue_instructions: String,

    /// Hard ceiling on generated characters per request.
    pub max_output_chars: usize,

    /// Capacity of the chunk channel between the engine worker and the chat loop.
    pub channel_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            template: PromptTemplate::ChatMl,
            system_prompt: "You are SafeSpace, a caring AI companion. Be empathetic, supportive, \
                and non-judgmental. Listen carefully and provide thoughtful guidance while \
                acknowledging your limitations. Prioritize emotional support and suggest \
                professional help when needed."
                .to_string(),
            continue_instructions: "Previously, the user asked: \"{prompt}\"\n\n\
                You responded with: \"{response}\"\n\n\
                Continue generating from where you left off, maintaining the same tone, style, \
                and context. Make sure your continuation flows naturally from the previous text."
                .to_string(),
            max_output_chars: 512,
            channel_capacity: 64,
        }
    }
}

impl ChatConfig {
    /// Render the continuation preamble for a question and the answer so far.
    pub fn continuation_prompt(&self, prompt: &str, response: &str) -> String {
        fill_placeholders(
            &self.continue_instructions,
            &[("{prompt}", prompt), ("{response}", response)],
        )
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the chat loop cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chat.max_output_chars == 0 {
            bail!("chat.max_output_chars must be greater than zero");
        }
        if self.chat.channel_capacity == 0 {
            bail!("chat.channel_capacity must be greater than zero");
        }
        if self.download.chunk_size == 0 {
            bail!("download.chunk_size must be greater than zero");
        }
        if let PromptTemplate::Custom { format } = &self.chat.template {
            if !format.contains("{prompt}") {
                bail!("custom prompt template has no {{prompt}} placeholder");
            }
        }
        Ok(())
    }
}
