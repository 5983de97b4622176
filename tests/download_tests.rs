//! Download manager tests against in-memory sources.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio_stream::StreamExt;

use safespace::download::manager::{partial_path, DownloadManager, DownloadState};
use safespace::download::source::{MemorySource, TransferSource};

/// Run a download to its end, returning every state and how often the
/// completion callback ran.
async fn run(
    manager: &DownloadManager,
    source: Arc<MemorySource>,
    dest: &Path,
) -> (Vec<DownloadState>, usize) {
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    let source: Arc<dyn TransferSource> = source;

    let states: Vec<DownloadState> = manager
        .acquire(source, dest.to_path_buf(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .collect()
        .await;

    (states, completions.load(Ordering::SeqCst))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn dest_in(dir: &TempDir) -> PathBuf {
    dir.path().join("models").join("model.gguf")
}

fn assert_clean_failure(states: &[DownloadState], completions: usize, dest: &Path) {
    assert!(matches!(states.last(), Some(DownloadState::Failed(_))));
    assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);
    assert_eq!(completions, 0);
    assert!(!dest.exists());
    assert!(!partial_path(dest).exists());
}

#[tokio::test]
async fn test_arbitrary_chunk_boundaries() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);

    let data = payload(20_000);
    let sizes = [1, 4095, 4097, 3, 8192, 3612];
    assert_eq!(sizes.iter().sum::<usize>(), data.len());

    let mut chunks = Vec::new();
    let mut offset = 0;
    for size in sizes {
        chunks.push(data[offset..offset + size].to_vec());
        offset += size;
    }

    let manager = DownloadManager::new(4096);
    let (states, completions) = run(&manager, Arc::new(MemorySource::new(chunks)), &dest).await;

    assert_eq!(states.last(), Some(&DownloadState::Complete { path: dest.clone() }));
    assert_eq!(
        states
            .iter()
            .filter(|s| matches!(s, DownloadState::Complete { .. }))
            .count(),
        1
    );
    assert_eq!(completions, 1);

    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len(), data.len());
    assert_eq!(written, data);
    assert!(!partial_path(&dest).exists());
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);
    let chunks: Vec<Vec<u8>> = (0..50).map(|_| payload(100)).collect();

    let manager = DownloadManager::new(64);
    let (states, _) = run(&manager, Arc::new(MemorySource::new(chunks)), &dest).await;

    let mut last = 0u64;
    for state in &states {
        if let DownloadState::InProgress {
            bytes_received,
            total_bytes,
        } = state
        {
            assert_eq!(*total_bytes, 5000);
            assert!(*bytes_received >= last);
            last = *bytes_received;
        }
    }
    assert_eq!(last, 5000);
}

#[tokio::test]
async fn test_existing_file_short_circuits() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(&dest, b"already here").unwrap();

    let source = Arc::new(MemorySource::new([payload(10)]));
    let manager = DownloadManager::new(4096);
    let (states, completions) = run(&manager, source.clone(), &dest).await;

    assert_eq!(states, vec![DownloadState::Complete { path: dest.clone() }]);
    assert_eq!(completions, 1);
    assert_eq!(source.opens(), 0);
    assert_eq!(std::fs::read(&dest).unwrap(), b"already here");
}

#[tokio::test]
async fn test_wrong_size_file_is_fetched_again() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(&dest, b"short").unwrap();

    let data = payload(300);
    let source = Arc::new(MemorySource::new([data.clone()]));
    let manager = DownloadManager::new(128).with_expected_size(Some(300));

    assert_eq!(manager.status(&dest).await, DownloadState::Absent);
    let (states, completions) = run(&manager, source.clone(), &dest).await;

    assert!(matches!(states.last(), Some(DownloadState::Complete { .. })));
    assert_eq!(completions, 1);
    assert_eq!(source.opens(), 1);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_stale_partial_is_discarded() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(partial_path(&dest), b"garbage from an earlier run").unwrap();

    let data = payload(1000);
    let manager = DownloadManager::new(256);
    let (states, _) = run(&manager, Arc::new(MemorySource::new([data.clone()])), &dest).await;

    assert!(matches!(states.last(), Some(DownloadState::Complete { .. })));
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!partial_path(&dest).exists());
}

#[tokio::test]
async fn test_error_status_leaves_nothing_behind() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);

    let source = MemorySource::new([payload(10)]).with_status(404);
    let (states, completions) = run(&DownloadManager::new(4096), Arc::new(source), &dest).await;

    assert_clean_failure(&states, completions, &dest);
    assert!(matches!(&states[0], DownloadState::Failed(reason) if reason.contains("404")));
}

#[tokio::test]
async fn test_unknown_length_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);

    let source = MemorySource::new([payload(10)]).with_content_length(None);
    let (states, completions) = run(&DownloadManager::new(4096), Arc::new(source), &dest).await;

    assert_clean_failure(&states, completions, &dest);
}

#[tokio::test]
async fn test_declared_size_must_match_expected() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);

    let manager = DownloadManager::new(4096).with_expected_size(Some(99));
    let (states, completions) = run(&manager, Arc::new(MemorySource::new([payload(10)])), &dest).await;

    assert_clean_failure(&states, completions, &dest);
}

#[tokio::test]
async fn test_empty_body_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);
    let manager = DownloadManager::new(4096);

    let source = MemorySource::new(Vec::<Vec<u8>>::new());
    let (states, completions) = run(&manager, Arc::new(source), &dest).await;

    assert_clean_failure(&states, completions, &dest);
    assert_eq!(manager.status(&dest).await, DownloadState::Absent);
}

#[tokio::test]
async fn test_mid_stream_error_removes_partial() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);

    let source = MemorySource::new([payload(5000), payload(5000), payload(5000)]).with_error_after(2);
    let (states, completions) = run(&DownloadManager::new(4096), Arc::new(source), &dest).await;

    assert!(states
        .iter()
        .any(|s| matches!(s, DownloadState::InProgress { bytes_received, .. } if *bytes_received > 0)));
    assert_clean_failure(&states, completions, &dest);
}

#[tokio::test]
async fn test_short_body_is_incomplete() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);

    let source = MemorySource::new([payload(100)]).with_content_length(Some(150));
    let (states, completions) = run(&DownloadManager::new(4096), Arc::new(source), &dest).await;

    assert_clean_failure(&states, completions, &dest);
}

#[tokio::test]
async fn test_status_without_network() {
    let tmp = TempDir::new().unwrap();
    let dest = dest_in(&tmp);
    let manager = DownloadManager::new(4096);

    assert_eq!(manager.status(&dest).await, DownloadState::Absent);

    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(&dest, b"").unwrap();
    assert_eq!(manager.status(&dest).await, DownloadState::Absent);

    std::fs::write(&dest, b"weights").unwrap();
    assert_eq!(
        manager.status(&dest).await,
        DownloadState::Complete { path: dest.clone() }
    );
}
