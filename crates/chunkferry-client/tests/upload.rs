mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chunkferry_client::{UploadOptions, Uploader};
use chunkferry_core::{Rejection, RetryPolicy, TransferError};
use chunkferry_types::ConflictReason;
use common::{Fault, FaultyRemote, MIB, Server, pattern};
use tempfile::TempDir;

fn local_file(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn quick(chunk_size: usize) -> UploadOptions {
    UploadOptions {
        chunk_size,
        retry: RetryPolicy::immediate(3),
        ..UploadOptions::default()
    }
}

#[tokio::test]
async fn twelve_mib_upload_sends_three_chunks() {
    let server = Server::start(MIB).await;
    let remote = server.remote();
    let local = TempDir::new().unwrap();
    let data = pattern(12 * MIB);
    let path = local_file(&local, "big.bin", &data);

    let uploader = Uploader::new(remote.clone(), quick(5 * MIB));
    let stored = uploader.upload(&path, "big.bin").await.unwrap();

    assert_eq!(remote.sorted_chunk_sizes(), vec![5 * MIB, 5 * MIB, 2 * MIB]);
    assert_eq!(stored.size, data.len() as u64);
    assert_eq!(server.store.read("alice", "big.bin").await.unwrap(), data);

    let progress = uploader.progress();
    assert_eq!(progress.chunks_total(), 3);
    assert_eq!(progress.chunks_done(), 3);
    assert_eq!(progress.bytes_done(), data.len() as u64);
    assert_eq!(server.staged_areas(), 0);
}

#[tokio::test]
async fn empty_file_uploads_as_one_empty_chunk() {
    let server = Server::start(MIB).await;
    let remote = server.remote();
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "empty", b"");

    let stored = Uploader::new(remote.clone(), quick(1024))
        .upload(&path, "empty")
        .await
        .unwrap();

    assert_eq!(stored.size, 0);
    assert_eq!(remote.sorted_chunk_sizes(), vec![0]);
    assert!(server.store.read("alice", "empty").await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(
        server.remote(),
        [(1, Fault::Drop(2)), (2, Fault::Corrupt(1))],
    ));
    let local = TempDir::new().unwrap();
    let data = pattern(3500);
    let path = local_file(&local, "flaky.bin", &data);

    Uploader::new(remote.clone(), quick(1000))
        .upload(&path, "flaky.bin")
        .await
        .unwrap();

    assert_eq!(remote.sends(0), 1);
    assert_eq!(remote.sends(1), 3);
    assert_eq!(remote.sends(2), 2);
    assert_eq!(server.store.read("alice", "flaky.bin").await.unwrap(), data);
}

#[tokio::test]
async fn exhausted_retries_abort_and_name_every_chunk() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(
        server.remote(),
        [(0, Fault::Drop(100)), (2, Fault::CorruptAlways)],
    ));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "doomed.bin", &pattern(4000));

    let options = UploadOptions {
        retry: RetryPolicy::immediate(2),
        ..quick(1000)
    };
    let err = Uploader::new(remote.clone(), options)
        .upload(&path, "doomed.bin")
        .await
        .unwrap_err();

    let TransferError::TransferFailed(report) = err else {
        panic!("expected TransferFailed, got {err:?}");
    };
    let indices: Vec<u64> = report.chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert!(report.chunks.iter().all(|c| c.attempts == 3));
    assert!(report.finalize.is_none());

    assert_eq!(remote.inner.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(server.staged_areas(), 0);
    assert!(!server.store.exists("alice", "doomed.bin").await.unwrap());
}

#[tokio::test]
async fn existing_output_needs_overwrite() {
    let server = Server::start(MIB).await;
    server.put_file("report.pdf", b"old");
    let remote = Arc::new(FaultyRemote::new(server.remote(), []));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "report.pdf", b"new contents");

    let err = Uploader::new(remote.clone(), quick(4))
        .upload(&path, "report.pdf")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::TokenConflict { reason: ConflictReason::FileExists, .. }
    ));
    assert_eq!(remote.reserves.load(Ordering::SeqCst), 1);

    let options = UploadOptions {
        overwrite: true,
        ..quick(4)
    };
    Uploader::new(remote.clone(), options)
        .upload(&path, "report.pdf")
        .await
        .unwrap();
    assert_eq!(
        server.store.read("alice", "report.pdf").await.unwrap(),
        b"new contents"
    );
}

#[tokio::test]
async fn token_collisions_regenerate() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(server.remote(), []).with_collisions(3));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "a", b"abc");

    Uploader::new(remote.clone(), quick(2))
        .upload(&path, "a")
        .await
        .unwrap();
    assert_eq!(remote.reserves.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn token_attempts_are_bounded() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(server.remote(), []).with_collisions(1000));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "a", b"abc");

    let options = UploadOptions {
        token_attempts: 5,
        ..quick(2)
    };
    let err = Uploader::new(remote.clone(), options)
        .upload(&path, "a")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::TokenSpaceExhausted { attempts: 5 }));
    assert_eq!(remote.reserves.load(Ordering::SeqCst), 5);
    assert_eq!(server.staged_areas(), 0);
}

#[tokio::test]
async fn finalize_rejection_leaves_staging_for_retry() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(server.remote(), [(1, Fault::CorruptAlways)]));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "f", &pattern(300));

    let options = UploadOptions {
        verify_chunks: false,
        ..quick(100)
    };
    let err = Uploader::new(remote.clone(), options)
        .upload(&path, "f")
        .await
        .unwrap_err();

    let TransferError::TransferFailed(report) = err else {
        panic!("expected TransferFailed, got {err:?}");
    };
    assert!(report.chunks.is_empty());
    match report.finalize {
        Some(Rejection::Digest(m)) => {
            assert_eq!(m.index, None);
            assert_ne!(m.expected, m.actual);
        }
        other => panic!("expected a digest rejection, got {other:?}"),
    }
    assert_eq!(server.staged_areas(), 1);
    assert!(!server.store.exists("alice", "f").await.unwrap());
}

#[tokio::test]
async fn hung_chunk_times_out_and_is_reported() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(server.remote(), [(0, Fault::Hang)]));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "stalled", &pattern(10));

    let options = UploadOptions {
        retry: RetryPolicy::immediate(2),
        chunk_timeout: Duration::from_millis(50),
        ..quick(4)
    };
    let upload = Uploader::new(remote.clone(), options);
    let err = tokio::time::timeout(Duration::from_secs(5), upload.upload(&path, "stalled"))
        .await
        .expect("upload must settle on its own")
        .unwrap_err();

    let TransferError::TransferFailed(report) = err else {
        panic!("expected TransferFailed, got {err:?}");
    };
    assert_eq!(report.chunks.len(), 1);
    assert_eq!(report.chunks[0].index, 0);
    assert_eq!(report.chunks[0].attempts, 3);
    assert!(matches!(&report.chunks[0].cause, Rejection::Other(text) if text.contains("timed out")));
    assert_eq!(remote.sends(0), 3);
    assert_eq!(remote.inner.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(server.staged_areas(), 0);
}

#[tokio::test]
async fn chunk_that_hangs_once_succeeds_on_retry() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(server.remote(), [(1, Fault::HangFirst(1))]));
    let local = TempDir::new().unwrap();
    let data = pattern(10);
    let path = local_file(&local, "slow", &data);

    let options = UploadOptions {
        chunk_timeout: Duration::from_millis(50),
        ..quick(4)
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        Uploader::new(remote.clone(), options).upload(&path, "slow"),
    )
    .await
    .expect("upload must settle on its own")
    .unwrap();

    assert_eq!(remote.sends(1), 2);
    assert_eq!(server.store.read("alice", "slow").await.unwrap(), data);
}

#[tokio::test]
async fn dropped_upload_aborts_its_transfer() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(server.remote(), [(0, Fault::Hang)]));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "stuck", &pattern(10));

    let uploader = Uploader::new(remote.clone(), quick(4));
    let result = tokio::time::timeout(Duration::from_millis(300), uploader.upload(&path, "stuck")).await;
    assert!(result.is_err());

    for _ in 0..200 {
        if remote.inner.aborts.load(Ordering::SeqCst) > 0 && server.staged_areas() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remote.inner.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(server.staged_areas(), 0);
}

#[tokio::test]
async fn zero_chunk_size_is_rejected_up_front() {
    let server = Server::start(MIB).await;
    let remote = Arc::new(FaultyRemote::new(server.remote(), []));
    let local = TempDir::new().unwrap();
    let path = local_file(&local, "a", b"abc");

    let err = Uploader::new(remote.clone(), quick(0))
        .upload(&path, "a")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidChunkSize));
    assert_eq!(remote.reserves.load(Ordering::SeqCst), 0);
}
