//! Chat service: the surface the presentation layer talks to.
//!
//! The service runs as a single task that owns the transcript and the model
//! session. Verbs arrive over a command channel, generated chunks over the
//! session's event channel; both are handled on this one task, so it is the
//! only writer of the transcript and of the published status. Observers read
//! snapshots through `watch` channels.

use std::ops::Range;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::chat::transcript::Transcript;
use crate::config::{ChatConfig, Config};
use crate::inference::backend::InferenceError;
use crate::inference::session::{Generation, GenerationEvent, ModelSession, SessionState};

const COMMAND_CAPACITY: usize = 32;

/// The service task has exited.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Chat service is not running")]
pub struct ServiceStopped;

/// Published status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStatus {
    pub is_model_loaded: bool,
    pub is_processing: bool,
    pub show_error: bool,

    /// User-facing description of the most recent failure.
    pub last_error: Option<String>,

    pub session: SessionState,
}

impl Default for ChatStatus {
    fn default() -> Self {
        Self {
            is_model_loaded: false,
            is_processing: false,
            show_error: false,
            last_error: None,
            session: SessionState::Unloaded,
        }
    }
}

/// What the service did with a verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbOutcome {
    Accepted,
    /// Dropped: busy, not ready, empty input or an index that does not apply.
    Ignored,
}

enum Command {
    Load {
        path: PathBuf,
        reply: oneshot::Sender<VerbOutcome>,
    },
    Ask {
        text: String,
        reply: oneshot::Sender<VerbOutcome>,
    },
    Continue {
        index: usize,
        reply: oneshot::Sender<VerbOutcome>,
    },
    Regenerate {
        index: usize,
        reply: oneshot::Sender<VerbOutcome>,
    },
    Clear {
        reply: oneshot::Sender<VerbOutcome>,
    },
    Stop {
        reply: oneshot::Sender<VerbOutcome>,
    },
    DismissError {
        reply: oneshot::Sender<VerbOutcome>,
    },
}

/// Where the chunks of the current generation go.
#[derive(Debug, Clone, Copy)]
enum MergeTarget {
    /// Trailing assistant turn, created on the first non-blank chunk.
    Last,
    /// A fixed turn (continue / regenerate).
    Index(usize),
}

struct ActiveGeneration {
    generation: Generation,
    target: MergeTarget,
}

/// Cloneable handle to a running [`ChatService`].
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ChatStatus>,
    transcript: watch::Receiver<Transcript>,
}

impl ChatHandle {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<VerbOutcome>) -> Command,
    ) -> Result<VerbOutcome, ServiceStopped> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| ServiceStopped)?;
        rx.await.map_err(|_| ServiceStopped)
    }

    /// Load the model weights at `path`.
    pub async fn load_model(&self, path: impl Into<PathBuf>) -> Result<VerbOutcome, ServiceStopped> {
        let path = path.into();
        self.request(|reply| Command::Load { path, reply }).await
    }

    /// Send a question and stream the answer into a new assistant turn.
    pub async fn ask(&self, text: impl Into<String>) -> Result<VerbOutcome, ServiceStopped> {
        let text = text.into();
        self.request(|reply| Command::Ask { text, reply }).await
    }

    /// Extend the assistant turn at `index`.
    pub async fn continue_generating(&self, index: usize) -> Result<VerbOutcome, ServiceStopped> {
        self.request(|reply| Command::Continue { index, reply }).await
    }

    /// Rewrite the assistant turn at `index`, dropping everything after it.
    pub async fn regenerate(&self, index: usize) -> Result<VerbOutcome, ServiceStopped> {
        self.request(|reply| Command::Regenerate { index, reply }).await
    }

    /// Empty the transcript and reset the engine context.
    pub async fn clear(&self) -> Result<VerbOutcome, ServiceStopped> {
        self.request(|reply| Command::Clear { reply }).await
    }

    /// Ask the in-flight generation to stop at its next chunk.
    pub async fn stop_generating(&self) -> Result<VerbOutcome, ServiceStopped> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn dismiss_error(&self) -> Result<VerbOutcome, ServiceStopped> {
        self.request(|reply| Command::DismissError { reply }).await
    }

    /// Current status snapshot.
    pub fn status(&self) -> ChatStatus {
        self.status.borrow().clone()
    }

    /// Current transcript snapshot.
    pub fn transcript(&self) -> Transcript {
        self.transcript.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChatStatus> {
        self.status.clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Transcript> {
        self.transcript.clone()
    }

    /// Export turns in `range`, see [`Transcript::copy_text`].
    pub fn copy_text(&self, range: Range<usize>) -> String {
        self.transcript.borrow().copy_text(range)
    }

    /// Content of one turn.
    pub fn copy_turn(&self, index: usize) -> Option<String> {
        self.transcript.borrow().copy_turn(index).map(str::to_string)
    }

    /// Wait until no generation is in flight.
    pub async fn wait_idle(&self) -> Result<ChatStatus, ServiceStopped> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| !s.is_processing)
            .await
            .map_err(|_| ServiceStopped)?;
        Ok(status.clone())
    }
}

/// The task behind a [`ChatHandle`].
pub struct ChatService {
    session: ModelSession,
    transcript: Transcript,
    chat: ChatConfig,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ChatStatus>,
    transcript_tx: watch::Sender<Transcript>,
    active: Option<ActiveGeneration>,
    last_error: Option<String>,
}

impl ChatService {
    /// Start the service on the current tokio runtime.
    pub fn spawn(session: ModelSession, config: &Config) -> ChatHandle {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status) = watch::channel(ChatStatus {
            is_model_loaded: session.state().is_loaded(),
            session: session.state().clone(),
            ..ChatStatus::default()
        });
        let (transcript_tx, transcript) = watch::channel(Transcript::new());

        let service = ChatService {
            session,
            transcript: Transcript::new(),
            chat: config.chat.clone(),
            commands,
            status_tx,
            transcript_tx,
            active: None,
            last_error: None,
        };
        tokio::spawn(service.run());

        ChatHandle {
            commands: commands_tx,
            status,
            transcript,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                event = next_event(&mut self.active) => self.on_generation_event(event),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
            }
        }

        if let Some(active) = self.active.take() {
            active.generation.stop();
        }
        debug!("Chat service stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Load { path, reply } => {
                let outcome = self.load(path).await;
                let _ = reply.send(outcome);
            }
            Command::Ask { text, reply } => {
                let _ = reply.send(self.ask(text));
            }
            Command::Continue { index, reply } => {
                let _ = reply.send(self.continue_generating(index));
            }
            Command::Regenerate { index, reply } => {
                let _ = reply.send(self.regenerate(index));
            }
            Command::Clear { reply } => {
                let outcome = self.clear().await;
                let _ = reply.send(outcome);
            }
            Command::Stop { reply } => {
                let outcome = match &self.active {
                    Some(active) => {
                        info!(request_id = active.generation.request_id(), "Stop requested");
                        active.generation.stop();
                        VerbOutcome::Accepted
                    }
                    None => VerbOutcome::Ignored,
                };
                let _ = reply.send(outcome);
            }
            Command::DismissError { reply } => {
                self.last_error = None;
                self.publish_status();
                let _ = reply.send(VerbOutcome::Accepted);
            }
        }
    }

    fn busy(&self, verb: &str) -> bool {
        if self.active.is_some() {
            debug!(verb, "Ignoring verb while a generation is in flight");
            return true;
        }
        false
    }

    fn ready(&self, verb: &str) -> bool {
        if *self.session.state() != SessionState::Ready {
            debug!(verb, state = %self.session.state(), "Ignoring verb, model not ready");
            return false;
        }
        true
    }

    async fn load(&mut self, path: PathBuf) -> VerbOutcome {
        if self.busy("load") {
            return VerbOutcome::Ignored;
        }

        self.status_tx.send_modify(|s| s.session = SessionState::Loading);
        match self.session.load(&path).await {
            Ok(()) => self.last_error = None,
            Err(e) => {
                error!(path = %path.display(), "Model load failed: {e}");
                self.last_error = Some(e.to_string());
            }
        }
        self.publish_status();
        VerbOutcome::Accepted
    }

    fn ask(&mut self, text: String) -> VerbOutcome {
        if self.busy("ask") || !self.ready("ask") {
            return VerbOutcome::Ignored;
        }
        if text.trim().is_empty() {
            return VerbOutcome::Ignored;
        }

        self.transcript.append_user(text.as_str());
        self.publish_transcript();
        self.start(&text, None, MergeTarget::Last)
    }

    fn continue_generating(&mut self, index: usize) -> VerbOutcome {
        if self.busy("continue") || !self.ready("continue") {
            return VerbOutcome::Ignored;
        }
        let Some(plan) = self.transcript.continue_from(index) else {
            debug!(index, "Nothing to continue at index");
            return VerbOutcome::Ignored;
        };

        let system_prompt = self.chat.continuation_prompt(&plan.prompt, &plan.response);
        self.start(&plan.prompt, Some(&system_prompt), MergeTarget::Index(plan.index))
    }

    fn regenerate(&mut self, index: usize) -> VerbOutcome {
        if self.busy("regenerate") || !self.ready("regenerate") {
            return VerbOutcome::Ignored;
        }
        let Some(plan) = self.transcript.regenerate_at(index) else {
            debug!(index, "Nothing to regenerate at index");
            return VerbOutcome::Ignored;
        };

        self.publish_transcript();
        self.start(&plan.prompt, None, MergeTarget::Index(plan.index))
    }

    async fn clear(&mut self) -> VerbOutcome {
        if self.busy("clear") {
            return VerbOutcome::Ignored;
        }

        let removed = self.transcript.len();
        self.transcript.clear();
        if let Err(e) = self.session.reset().await {
            warn!("Engine reset failed: {e}");
        }
        info!(removed, "Conversation cleared");

        self.publish_transcript();
        self.publish_status();
        VerbOutcome::Accepted
    }

    fn start(&mut self, prompt: &str, system_prompt: Option<&str>, target: MergeTarget) -> VerbOutcome {
        match self.session.begin_predict(prompt, system_prompt) {
            Ok(generation) => {
                self.active = Some(ActiveGeneration { generation, target });
                self.publish_status();
                VerbOutcome::Accepted
            }
            Err(e) => {
                self.fail_generation(e);
                VerbOutcome::Ignored
            }
        }
    }

    fn on_generation_event(&mut self, event: Option<GenerationEvent>) {
        match event {
            Some(GenerationEvent::Token(chunk)) => {
                let Some(active) = &self.active else {
                    return;
                };
                match active.target {
                    MergeTarget::Last => {
                        self.transcript.append_or_merge_assistant(&chunk);
                    }
                    MergeTarget::Index(index) => {
                        self.transcript.merge_at(index, &chunk);
                    }
                }
                self.publish_transcript();
            }
            Some(GenerationEvent::Done(summary)) => {
                debug!(
                    request_id = summary.request_id.as_str(),
                    chunks = summary.chunks,
                    "Generation finished"
                );
                self.finish();
            }
            Some(GenerationEvent::Error(e)) => {
                self.finish();
                self.fail_generation(e);
            }
            None => {
                self.finish();
                self.fail_generation(InferenceError::WorkerLost);
            }
        }
    }

    fn finish(&mut self) {
        self.active = None;
        self.session.end_predict();
        self.publish_status();
    }

    fn fail_generation(&mut self, e: InferenceError) {
        error!("Prediction failed: {e}");
        self.last_error = Some(format!("Prediction failed: {e}"));
        self.publish_status();
    }

    fn publish_status(&self) {
        let state = self.session.state();
        self.status_tx.send_replace(ChatStatus {
            is_model_loaded: state.is_loaded(),
            is_processing: self.active.is_some(),
            show_error: self.last_error.is_some(),
            last_error: self.last_error.clone(),
            session: state.clone(),
        });
    }

    fn publish_transcript(&self) {
        self.transcript_tx.send_replace(self.transcript.clone());
    }
}

async fn next_event(active: &mut Option<ActiveGeneration>) -> Option<GenerationEvent> {
    match active {
        Some(active) => active.generation.next().await,
        None => std::future::pending().await,
    }
}
