//! Model session: the single owner of the inference engine.
//!
//! The session:
//! 1. Loads weights on a blocking worker, never on the caller's task
//! 2. Wraps prompts in the configured template
//! 3. Runs one generation at a time on a blocking worker
//! 4. Enforces the output-length ceiling while the engine streams
//! 5. Hands chunks back over a channel so the consumer mutates its state on
//!    its own task

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::inference::backend::{InferenceBackend, InferenceError, LoadError, ModelParams};
use crate::inference::model_loader;
use crate::inference::template::PromptTemplate;

/// Lifecycle of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
    Failed(String),
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Weights are in memory.
    pub fn is_loaded(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Generating)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The engine finished on its own.
    Finished,
    /// The output ceiling was reached.
    Ceiling,
    /// The consumer asked to stop.
    Cancelled,
}

/// Totals for one finished generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSummary {
    pub request_id: String,
    pub chunks: usize,
    pub chars: usize,
    pub reason: StopReason,
}

/// Events produced by a generation worker.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A chunk of generated text.
    Token(String),
    /// Generation is complete.
    Done(GenerationSummary),
    /// The engine reported an error.
    Error(InferenceError),
}

/// Handle to an in-flight generation.
///
/// Events arrive in generation order. Dropping the handle stops the engine at
/// its next chunk.
pub struct Generation {
    request_id: String,
    rx: mpsc::Receiver<GenerationEvent>,
    stop: Arc<AtomicBool>,
}

impl Generation {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Ask the engine to stop before its next chunk.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Next event, or `None` once the worker has gone away.
    pub async fn next(&mut self) -> Option<GenerationEvent> {
        self.rx.recv().await
    }

    /// Feed every chunk to `on_token` until it returns `true` or the engine
    /// finishes. `on_token` is never called again after returning `true`.
    pub async fn drive<F>(&mut self, mut on_token: F) -> Result<GenerationSummary, InferenceError>
    where
        F: FnMut(&str) -> bool,
    {
        let mut stopped = false;
        while let Some(event) = self.next().await {
            match event {
                GenerationEvent::Token(chunk) => {
                    if !stopped && on_token(&chunk) {
                        stopped = true;
                        self.stop();
                    }
                }
                GenerationEvent::Done(mut summary) => {
                    if stopped {
                        summary.reason = StopReason::Cancelled;
                    }
                    return Ok(summary);
                }
                GenerationEvent::Error(e) => return Err(e),
            }
        }
        Err(InferenceError::WorkerLost)
    }
}

/// Owner of the engine handle.
pub struct ModelSession {
    backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
    state: SessionState,
    params: ModelParams,
    template: PromptTemplate,
    system_prompt: String,
    max_output_chars: usize,
    channel_capacity: usize,
    model_path: Option<PathBuf>,
}

impl ModelSession {
    pub fn new(backend: Box<dyn InferenceBackend>, config: &Config) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            state: SessionState::Unloaded,
            params: ModelParams::from(&config.model),
            template: config.chat.template.clone(),
            system_prompt: config.chat.system_prompt.clone(),
            max_output_chars: config.chat.max_output_chars,
            channel_capacity: config.chat.channel_capacity.max(1),
            model_path: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    pub fn max_output_chars(&self) -> usize {
        self.max_output_chars
    }

    /// Load weights from `path` on a blocking worker.
    ///
    /// On failure the state becomes `Failed(reason)` and the error is returned.
    pub async fn load(&mut self, path: &Path) -> Result<(), LoadError> {
        if self.state == SessionState::Generating {
            return Err(LoadError::Busy);
        }

        self.state = SessionState::Loading;
        info!(path = %path.display(), "Loading model");

        let result = self.load_inner(path).await;
        match &result {
            Ok(()) => {
                self.state = SessionState::Ready;
                self.model_path = Some(path.to_path_buf());
                info!(path = %path.display(), "Model ready");
            }
            Err(e) => {
                self.state = SessionState::Failed(e.to_string());
                warn!(path = %path.display(), "Model load failed: {e}");
            }
        }
        result
    }

    async fn load_inner(&self, path: &Path) -> Result<(), LoadError> {
        let backend = self.backend.clone();
        let params = self.params.clone();
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            model_loader::inspect(&path)?;
            backend.blocking_lock().load_model(&path, &params)
        })
        .await
        .map_err(|e| LoadError::Worker(e.to_string()))?
    }

    /// Start a generation for `prompt`.
    ///
    /// `system_prompt` overrides the configured preamble for this request.
    /// Fails with [`InferenceError::Busy`] while another generation is in
    /// flight; the engine is not entered in that case.
    pub fn begin_predict(
        &mut self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<Generation, InferenceError> {
        match &self.state {
            SessionState::Ready => {}
            SessionState::Generating => return Err(InferenceError::Busy),
            other => return Err(InferenceError::NotReady(other.to_string())),
        }

        let formatted = self
            .template
            .render(system_prompt.unwrap_or(&self.system_prompt), prompt);
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = GenerationWorker {
            request_id: request_id.clone(),
            backend: self.backend.clone(),
            stop: stop.clone(),
            ceiling: self.max_output_chars,
            tx,
        };

        self.state = SessionState::Generating;
        info!(
            request_id = request_id.as_str(),
            prompt_chars = prompt.chars().count(),
            ceiling = self.max_output_chars,
            "Starting generation"
        );

        tokio::task::spawn_blocking(move || worker.run(&formatted));

        Ok(Generation {
            request_id,
            rx,
            stop,
        })
    }

    /// Return to `Ready` after a generation's terminal event.
    pub fn end_predict(&mut self) {
        if self.state == SessionState::Generating {
            self.state = SessionState::Ready;
        }
    }

    /// Run one generation to completion, calling `on_token` on this task for
    /// every chunk. Returning `true` from `on_token` stops the generation.
    ///
    /// Dropping the returned future stops the engine at its next chunk and
    /// returns the session to `Ready`.
    pub async fn predict<F>(
        &mut self,
        prompt: &str,
        on_token: F,
    ) -> Result<GenerationSummary, InferenceError>
    where
        F: FnMut(&str) -> bool,
    {
        let generation = self.begin_predict(prompt, None)?;
        let mut guard = PredictGuard {
            session: self,
            generation,
        };
        let result = guard.generation.drive(on_token).await;
        drop(guard);
        result
    }

    /// Discard the engine's conversational context, keeping the weights.
    ///
    /// No-op unless the model is loaded and idle.
    pub async fn reset(&mut self) -> Result<(), InferenceError> {
        match self.state {
            SessionState::Ready => {
                self.backend.lock().await.reset();
                debug!("Engine context reset");
                Ok(())
            }
            SessionState::Generating => Err(InferenceError::Busy),
            _ => Ok(()),
        }
    }
}

/// Ends a [`ModelSession::predict`] call, whether it finished or was dropped.
///
/// The engine lock serializes a still-running worker with the next request.
struct PredictGuard<'a> {
    session: &'a mut ModelSession,
    generation: Generation,
}

impl Drop for PredictGuard<'_> {
    fn drop(&mut self) {
        self.generation.stop();
        self.session.end_predict();
    }
}

/// The blocking half of a generation.
struct GenerationWorker {
    request_id: String,
    backend: Arc<Mutex<Box<dyn InferenceBackend>>>,
    stop: Arc<AtomicBool>,
    ceiling: usize,
    tx: mpsc::Sender<GenerationEvent>,
}

impl GenerationWorker {
    fn run(self, prompt: &str) {
        let mut engine = self.backend.blocking_lock();

        let mut chars = 0usize;
        let mut chunks = 0usize;
        let mut reason = StopReason::Finished;

        let result = engine.predict(prompt, &mut |chunk: &str| {
            if self.stop.load(Ordering::Acquire) {
                reason = StopReason::Cancelled;
                return true;
            }

            let remaining = self.ceiling.saturating_sub(chars);
            if remaining == 0 {
                reason = StopReason::Ceiling;
                return true;
            }

            let piece = truncate_chars(chunk, remaining);
            chars += piece.chars().count();
            chunks += 1;

            if self
                .tx
                .blocking_send(GenerationEvent::Token(piece.to_string()))
                .is_err()
            {
                // Receiver dropped, stop generating.
                reason = StopReason::Cancelled;
                return true;
            }

            if chars >= self.ceiling {
                reason = StopReason::Ceiling;
                return true;
            }
            false
        });
        drop(engine);

        let event = match result {
            Ok(()) => {
                info!(
                    request_id = self.request_id.as_str(),
                    chunks,
                    chars,
                    reason = ?reason,
                    "Generation complete"
                );
                GenerationEvent::Done(GenerationSummary {
                    request_id: self.request_id.clone(),
                    chunks,
                    chars,
                    reason,
                })
            }
            Err(e) => {
                warn!(request_id = self.request_id.as_str(), "Generation failed: {e}");
                GenerationEvent::Error(e)
            }
        };
        let _ = self.tx.blocking_send(event);
    }
}

/// Longest prefix of `s` with at most `max` characters.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
