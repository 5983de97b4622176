//! Model session tests with a scripted engine.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use safespace::config::Config;
use safespace::inference::backend::InferenceError;
use safespace::inference::scripted::ScriptedBackend;
use safespace::inference::session::{ModelSession, SessionState, StopReason};

fn model_file(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("model.gguf");
    std::fs::write(&path, b"GGUF\x03\x00\x00\x00weights").unwrap();
    path
}

async fn ready_session(backend: ScriptedBackend, config: &Config, dir: &TempDir) -> ModelSession {
    let mut session = ModelSession::new(Box::new(backend), config);
    session.load(&model_file(dir)).await.unwrap();
    assert_eq!(session.state(), &SessionState::Ready);
    session
}

#[tokio::test]
async fn test_output_ceiling_truncates_stream() {
    let tmp = TempDir::new().unwrap();
    let chunks: Vec<String> = (0..10).map(|_| "x".repeat(100)).collect();
    let backend = ScriptedBackend::new(chunks);
    let stats = backend.stats();
    let mut session = ready_session(backend, &Config::default(), &tmp).await;

    let mut calls = 0;
    let mut total = 0;
    let summary = session
        .predict("Write a lot", |chunk| {
            calls += 1;
            total += chunk.chars().count();
            assert!(total <= 512);
            false
        })
        .await
        .unwrap();

    assert_eq!(total, 512);
    assert_eq!(calls, 6);
    assert_eq!(summary.chars, 512);
    assert_eq!(summary.reason, StopReason::Ceiling);
    // The engine was told to stop instead of running to the end.
    assert!(stats.chunks_emitted() < 10);
}

#[tokio::test]
async fn test_ceiling_counts_characters_not_bytes() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.chat.max_output_chars = 3;
    let mut session = ready_session(ScriptedBackend::new(["héllo"]), &config, &tmp).await;

    let mut out = String::new();
    session
        .predict("hi", |c| {
            out.push_str(c);
            false
        })
        .await
        .unwrap();

    assert_eq!(out, "hél");
}

#[tokio::test]
async fn test_callback_can_stop_generation() {
    let tmp = TempDir::new().unwrap();
    let mut session =
        ready_session(ScriptedBackend::new(["a", "b", "c", "d"]), &Config::default(), &tmp).await;

    let mut seen = Vec::new();
    let summary = session
        .predict("hi", |c| {
            seen.push(c.to_string());
            c == "b"
        })
        .await
        .unwrap();

    assert_eq!(seen, ["a", "b"]);
    assert_eq!(summary.reason, StopReason::Cancelled);
    assert_eq!(session.state(), &SessionState::Ready);
}

#[tokio::test]
async fn test_second_predict_is_rejected_while_generating() {
    let tmp = TempDir::new().unwrap();
    let (backend, gate) = ScriptedBackend::new(["one", "two"]).gated();
    let stats = backend.stats();
    let mut session = ready_session(backend, &Config::default(), &tmp).await;

    let mut first = session.begin_predict("first", None).unwrap();
    assert_eq!(session.state(), &SessionState::Generating);

    let err = session.begin_predict("second", None).err().unwrap();
    assert_eq!(err, InferenceError::Busy);

    let mut second_calls = 0;
    let err = session
        .predict("third", |_| {
            second_calls += 1;
            false
        })
        .await
        .unwrap_err();
    assert_eq!(err, InferenceError::Busy);
    assert_eq!(second_calls, 0);
    assert_eq!(session.reset().await, Err(InferenceError::Busy));

    gate.send(()).unwrap();
    let mut out = String::new();
    first
        .drive(|c| {
            out.push_str(c);
            false
        })
        .await
        .unwrap();
    session.end_predict();

    assert_eq!(out, "onetwo");
    assert_eq!(stats.predicts(), 1);
    assert_eq!(stats.resets(), 0);
    assert!(stats.last_prompt().unwrap().contains("first"));
    assert_eq!(session.state(), &SessionState::Ready);
}

#[tokio::test]
async fn test_engine_error_returns_to_ready() {
    let tmp = TempDir::new().unwrap();
    let backend =
        ScriptedBackend::new(["partial"]).failing_predict(InferenceError::Decode("boom".into()));
    let mut session = ready_session(backend, &Config::default(), &tmp).await;

    let mut out = String::new();
    let err = session
        .predict("hi", |c| {
            out.push_str(c);
            false
        })
        .await
        .unwrap_err();

    assert_eq!(err, InferenceError::Decode("boom".into()));
    assert_eq!(out, "partial");
    assert_eq!(session.state(), &SessionState::Ready);

    // Still usable.
    let err = session.predict("again", |_| false).await.unwrap_err();
    assert_eq!(err, InferenceError::Decode("boom".into()));
}

#[tokio::test]
async fn test_prompt_is_wrapped_in_template() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.chat.system_prompt = "Be brief.".to_string();
    let backend = ScriptedBackend::new(["ok"]);
    let stats = backend.stats();
    let mut session = ready_session(backend, &config, &tmp).await;

    session.predict("What is Rust?", |_| false).await.unwrap();

    let prompt = stats.last_prompt().unwrap();
    assert!(prompt.starts_with("<|im_start|>system\nBe brief."));
    assert!(prompt.contains("<|im_start|>user\nWhat is Rust?"));
    assert!(prompt.ends_with("<|im_start|>assistant\n"));
}

#[tokio::test]
async fn test_reset_keeps_model_loaded() {
    let tmp = TempDir::new().unwrap();
    let backend = ScriptedBackend::new(["ok"]);
    let stats = backend.stats();
    let mut session = ready_session(backend, &Config::default(), &tmp).await;

    session.reset().await.unwrap();

    assert_eq!(stats.resets(), 1);
    assert_eq!(stats.loads(), 1);
    assert_eq!(session.state(), &SessionState::Ready);
}

#[tokio::test]
async fn test_abandoned_predict_returns_to_ready() {
    let tmp = TempDir::new().unwrap();
    let (backend, gate) = ScriptedBackend::new(["one", "two"]).gated();
    let mut session = ready_session(backend, &Config::default(), &tmp).await;

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        session.predict("stuck", |_| false),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(session.state(), &SessionState::Ready);

    // Release the abandoned worker and every later prediction.
    drop(gate);

    let mut out = String::new();
    let summary = session
        .predict("again", |c| {
            out.push_str(c);
            false
        })
        .await
        .unwrap();

    assert_eq!(out, "onetwo");
    assert_eq!(summary.reason, StopReason::Finished);
    assert_eq!(session.state(), &SessionState::Ready);
}
