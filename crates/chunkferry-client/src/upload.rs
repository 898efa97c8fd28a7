use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chunkferry_core::codec::{self, DEFAULT_CHUNK_SIZE};
use chunkferry_core::naming::validate_component;
use chunkferry_core::{
    ChunkFailure, FailureReport, Rejection, RetryPolicy, TransferError, TransferToken,
};
use chunkferry_types::{ConflictReason, DigestSet, StoredFile};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::transport::Remote;

/// Per-upload knobs.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    /// Send a whole-file digest for the server to check at finalize.
    pub verify_whole: bool,
    /// Send a digest with every chunk.
    pub verify_chunks: bool,
    /// Per-chunk retry budget and backoff.
    pub retry: RetryPolicy,
    /// Longest a single chunk send may take before it counts as a failed
    /// attempt.
    pub chunk_timeout: Duration,
    /// Chunks in flight at once.
    pub concurrency: usize,
    /// Fresh tokens to try before giving up on reservation.
    pub token_attempts: u32,
    /// Replace an existing file with the same name.
    pub overwrite: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_whole: true,
            verify_chunks: true,
            retry: RetryPolicy::default(),
            chunk_timeout: Duration::from_secs(60),
            concurrency: 8,
            token_attempts: 16,
            overwrite: false,
        }
    }
}

/// Shared progress state, readable from any thread while an upload runs.
#[derive(Debug, Default)]
pub struct UploadProgress {
    chunks_total: AtomicU64,
    chunks_done: AtomicU64,
    bytes_done: AtomicU64,
}

impl UploadProgress {
    pub fn chunks_total(&self) -> u64 {
        self.chunks_total.load(Ordering::Relaxed)
    }

    /// Chunks the server has acknowledged. Never decreases during an upload.
    pub fn chunks_done(&self) -> u64 {
        self.chunks_done.load(Ordering::Relaxed)
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    fn start(&self, chunks: u64) {
        self.chunks_total.store(chunks, Ordering::Relaxed);
        self.chunks_done.store(0, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
    }

    fn record(&self, bytes: usize) {
        self.bytes_done.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
    }
}

/// Aborts the reserved transfer if the upload is dropped before it settles.
struct AbortGuard<R: Remote + ?Sized + 'static> {
    remote: Arc<R>,
    token: Option<String>,
}

impl<R: Remote + ?Sized + 'static> AbortGuard<R> {
    fn disarm(&mut self) {
        self.token = None;
    }
}

impl<R: Remote + ?Sized + 'static> Drop for AbortGuard<R> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(token = %token, "No runtime to abort abandoned transfer");
            return;
        };
        let remote = self.remote.clone();
        handle.spawn(async move {
            match remote.abort(&token).await {
                Ok(_) => info!(token = %token, "Aborted abandoned transfer"),
                Err(e) => warn!(token = %token, "Failed to abort abandoned transfer: {}", e),
            }
        });
    }
}

/// Drives chunked uploads through a [`Remote`].
pub struct Uploader<R: Remote + ?Sized + 'static> {
    remote: Arc<R>,
    options: UploadOptions,
    progress: Arc<UploadProgress>,
}

impl<R: Remote + ?Sized + 'static> Uploader<R> {
    pub fn new(remote: Arc<R>, options: UploadOptions) -> Self {
        Self {
            remote,
            options,
            progress: Arc::new(UploadProgress::default()),
        }
    }

    pub fn progress(&self) -> Arc<UploadProgress> {
        self.progress.clone()
    }

    /// Uploads the file at `local` as `output_name`.
    ///
    /// 1. Hash the file (whole and/or per chunk, as configured).
    /// 2. Reserve a fresh token, regenerating it on collision.
    /// 3. Send every chunk through a bounded worker pool, each with its
    ///    own retry budget.
    /// 4. Abort if any chunk failed for good, otherwise finalize.
    pub async fn upload(&self, local: &Path, output_name: &str) -> Result<StoredFile, TransferError> {
        let opts = &self.options;
        codec::check_chunk_size(opts.chunk_size)?;
        validate_component(output_name)?;

        let len = tokio::fs::metadata(local).await?.len();
        let count = codec::chunk_count(len, opts.chunk_size);
        let digests =
            codec::digest_file(local, opts.chunk_size, opts.verify_whole, opts.verify_chunks).await?;
        self.progress.start(count);

        let token = self.reserve_token(output_name).await?;
        let mut guard = AbortGuard {
            remote: self.remote.clone(),
            token: Some(token.to_string()),
        };
        info!(token = %token, name = output_name, size = len, chunks = count, "Upload started");

        if !digests.is_empty() {
            self.remote.stage_digests(token.as_str(), &digests).await?;
        }

        let failures = self.send_chunks(local, &token, count, &digests).await;
        guard.disarm();

        if !failures.is_empty() {
            warn!(token = %token, failed = failures.len(), "Upload failed, aborting transfer");
            if let Err(e) = self.remote.abort(token.as_str()).await {
                warn!(token = %token, "Abort failed: {}", e);
            }
            return Err(TransferError::TransferFailed(FailureReport {
                token: token.to_string(),
                chunks: failures,
                finalize: None,
            }));
        }

        let finalize_digests = (!digests.is_empty()).then_some(&digests);
        match self
            .remote
            .finalize(token.as_str(), output_name, finalize_digests)
            .await
        {
            Ok(stored) => {
                info!(token = %token, name = %stored.name, size = stored.size, "Upload complete");
                Ok(stored)
            }
            Err(e) => {
                warn!(token = %token, "Finalize rejected: {}", e);
                Err(TransferError::TransferFailed(FailureReport {
                    token: token.to_string(),
                    chunks: Vec::new(),
                    finalize: Some(Rejection::from(&e)),
                }))
            }
        }
    }

    async fn reserve_token(&self, output_name: &str) -> Result<TransferToken, TransferError> {
        let attempts = self.options.token_attempts;
        for attempt in 1..=attempts {
            let token = TransferToken::generate();
            match self
                .remote
                .reserve(token.as_str(), Some(output_name), self.options.overwrite)
                .await
            {
                Ok(()) => return Ok(token),
                Err(TransferError::TokenConflict {
                    reason: ConflictReason::StagingExists,
                    ..
                }) => {
                    debug!(token = %token, attempt, "Token taken, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(TransferError::TokenSpaceExhausted { attempts })
    }

    /// Sends chunks `0..count` and returns every chunk that failed for good,
    /// ordered by index. Returns only once every chunk task has finished.
    async fn send_chunks(
        &self,
        local: &Path,
        token: &TransferToken,
        count: u64,
        digests: &DigestSet,
    ) -> Vec<ChunkFailure> {
        let pool = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_index = HashMap::new();

        for index in 0..count {
            let Ok(permit) = pool.clone().acquire_owned().await else {
                break;
            };
            let job = ChunkJob {
                remote: self.remote.clone(),
                path: local.to_path_buf(),
                token: token.to_string(),
                index,
                chunk_size: self.options.chunk_size,
                digest: digests
                    .chunk_sha256
                    .as_ref()
                    .and_then(|d| d.get(index as usize).cloned()),
                retry: self.options.retry.clone(),
                timeout: self.options.chunk_timeout,
                progress: self.progress.clone(),
            };
            let handle = tasks.spawn(async move {
                let result = job.run().await;
                drop(permit);
                result
            });
            task_index.insert(handle.id(), index);
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((_, Err(failure))) => failures.push(failure),
                Err(e) => failures.push(ChunkFailure {
                    index: task_index.get(&e.id()).copied().unwrap_or_default(),
                    attempts: 0,
                    cause: Rejection::Other(e.to_string()),
                }),
            }
        }
        failures.sort_by_key(|f| f.index);
        failures
    }
}

/// One chunk's unit of work.
struct ChunkJob<R: Remote + ?Sized + 'static> {
    remote: Arc<R>,
    path: PathBuf,
    token: String,
    index: u64,
    chunk_size: usize,
    digest: Option<String>,
    retry: RetryPolicy,
    timeout: Duration,
    progress: Arc<UploadProgress>,
}

impl<R: Remote + ?Sized + 'static> ChunkJob<R> {
    async fn run(self) -> Result<(), ChunkFailure> {
        let index = self.index;
        let chunk = codec::read_chunk_at(&self.path, index, self.chunk_size)
            .await
            .map_err(|e| ChunkFailure {
                index,
                attempts: 0,
                cause: Rejection::from(&e),
            })?;
        let len = chunk.data.len();

        let outcome = self
            .retry
            .run(|_| {
                let remote = self.remote.clone();
                let token = self.token.clone();
                let data = chunk.data.clone();
                let digest = self.digest.clone();
                let timeout = self.timeout;
                async move {
                    let send = remote.send_chunk(&token, index, data, digest.as_deref());
                    match tokio::time::timeout(timeout, send).await {
                        Ok(result) => result,
                        Err(_) => Err(TransferError::Transport(format!("chunk {index} timed out"))),
                    }
                }
            })
            .await;

        match outcome.result {
            Ok(receipt) => {
                self.progress.record(len);
                debug!(
                    token = %self.token,
                    index,
                    attempts = outcome.attempts,
                    received = receipt.chunks_received,
                    "Chunk sent"
                );
                Ok(())
            }
            Err(e) => {
                warn!(token = %self.token, index, attempts = outcome.attempts, "Chunk failed: {}", e);
                Err(ChunkFailure {
                    index,
                    attempts: outcome.attempts,
                    cause: Rejection::from(&e),
                })
            }
        }
    }
}
