//! Deterministic backend that replays a fixed list of chunks.
//!
//! Used by tests and demos: counts engine entries, can fail on demand, and can
//! be held open by a gate so a generation stays in flight until released.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use crate::inference::backend::{InferenceBackend, InferenceError, LoadError, ModelParams};

/// Shared counters, readable while the backend is owned by a session.
#[derive(Debug, Default)]
pub struct ScriptedStats {
    pub loads: AtomicUsize,
    pub predicts: AtomicUsize,
    pub resets: AtomicUsize,

    /// Chunks handed to the callback across all predictions.
    pub chunks_emitted: AtomicUsize,

    /// Prompts exactly as the engine received them.
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn predicts(&self) -> usize {
        self.predicts.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks_emitted.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().ok().and_then(|p| p.last().cloned())
    }
}

pub struct ScriptedBackend {
    chunks: Vec<String>,
    stats: Arc<ScriptedStats>,
    load_error: Option<LoadError>,
    predict_error: Option<InferenceError>,
    gate: Option<std_mpsc::Receiver<()>>,
}

impl ScriptedBackend {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            stats: Arc::new(ScriptedStats::default()),
            load_error: None,
            predict_error: None,
            gate: None,
        }
    }

    /// Fail every load with `err`.
    pub fn failing_load(mut self, err: LoadError) -> Self {
        self.load_error = Some(err);
        self
    }

    /// Emit the script, then fail with `err`.
    pub fn failing_predict(mut self, err: InferenceError) -> Self {
        self.predict_error = Some(err);
        self
    }

    /// Block each prediction until a message arrives on the returned sender.
    pub fn gated(mut self) -> (Self, std_mpsc::Sender<()>) {
        let (tx, rx) = std_mpsc::channel();
        self.gate = Some(rx);
        (self, tx)
    }

    pub fn stats(&self) -> Arc<ScriptedStats> {
        self.stats.clone()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load_model(&mut self, _path: &Path, _params: &ModelParams) -> Result<(), LoadError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        match &self.load_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn predict(
        &mut self,
        prompt: &str,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), InferenceError> {
        self.stats.predicts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.stats.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        if let Some(gate) = &self.gate {
            // A dropped sender releases the gate as well.
            let _ = gate.recv();
        }

        for chunk in &self.chunks {
            self.stats.chunks_emitted.fetch_add(1, Ordering::SeqCst);
            if on_token(chunk) {
                return Ok(());
            }
        }

        match &self.predict_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_chunks_in_order() {
        let mut backend = ScriptedBackend::new(["a", "b", "c"]);
        let stats = backend.stats();
        let mut seen = Vec::new();
        backend
            .predict("p", &mut |c| {
                seen.push(c.to_string());
                false
            })
            .unwrap();
        assert_eq!(seen, ["a", "b", "c"]);
        assert_eq!(stats.predicts(), 1);
        assert_eq!(stats.last_prompt().as_deref(), Some("p"));
    }

    #[test]
    fn test_stops_when_asked() {
        let mut backend = ScriptedBackend::new(["a", "b", "c"]);
        let stats = backend.stats();
        backend.predict("p", &mut |c| c == "a").unwrap();
        assert_eq!(stats.chunks_emitted(), 1);
    }
}
