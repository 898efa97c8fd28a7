#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chunkferry_client::{Remote, RemoteFile};
use chunkferry_core::{Catalog, CredentialGate, Credentials, FileStore, Ledger, StaticGate, TransferError};
use chunkferry_types::{ChunkReceipt, ConflictReason, DigestSet, StagingStatus, StoredFile, TokenCheck};
use futures_util::StreamExt;
use tempfile::TempDir;

pub const MIB: usize = 1024 * 1024;

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// Server pieces wired together in a temp dir, plus the credentials of
/// its only user.
pub struct Server {
    pub dir: TempDir,
    pub store: Arc<FileStore>,
    pub ledger: Arc<Ledger>,
    pub catalog: Arc<Catalog>,
}

impl Server {
    pub async fn start(download_chunk_size: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let gate: Arc<dyn CredentialGate> = Arc::new(StaticGate::new(HashMap::from([(
            "alice".to_string(),
            "pw".to_string(),
        )])));
        let store = Arc::new(FileStore::new(dir.path().join("files")).await.unwrap());
        let ledger = Arc::new(
            Ledger::new(dir.path().join("staging"), store.clone(), gate.clone())
                .await
                .unwrap(),
        );
        let catalog = Arc::new(
            Catalog::new(dir.path().join("outbound"), store.clone(), gate, download_chunk_size)
                .await
                .unwrap(),
        );
        Self {
            dir,
            store,
            ledger,
            catalog,
        }
    }

    pub fn remote(&self) -> Arc<LocalRemote> {
        self.local_remote(true)
    }

    /// A remote whose downloads carry no digest, so the client has to ask
    /// for one separately.
    pub fn remote_without_stream_digests(&self) -> Arc<LocalRemote> {
        self.local_remote(false)
    }

    fn local_remote(&self, stream_digests: bool) -> Arc<LocalRemote> {
        Arc::new(LocalRemote {
            ledger: self.ledger.clone(),
            catalog: self.catalog.clone(),
            creds: Credentials::new("alice", "pw"),
            chunk_sizes: Mutex::new(Vec::new()),
            frame_sizes: Arc::new(Mutex::new(Vec::new())),
            aborts: AtomicU32::new(0),
            stream_digests,
        })
    }

    /// Staging areas currently on disk for alice.
    pub fn staged_areas(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("staging/alice"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    /// Download spools currently on disk for alice.
    pub fn spools(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("outbound/alice"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    pub fn put_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let owner = self.dir.path().join("files/alice");
        std::fs::create_dir_all(&owner).unwrap();
        let path = owner.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }
}

/// In-process [`Remote`] that calls the ledger and catalog directly.
pub struct LocalRemote {
    ledger: Arc<Ledger>,
    catalog: Arc<Catalog>,
    creds: Credentials,
    /// (index, len) of every chunk accepted.
    pub chunk_sizes: Mutex<Vec<(u64, usize)>>,
    /// Sizes of the frames handed out by the last downloads.
    pub frame_sizes: Arc<Mutex<Vec<usize>>>,
    pub aborts: AtomicU32,
    /// Hand out the snapshot digest with each download, as the HTTP server
    /// does.
    pub stream_digests: bool,
}

impl LocalRemote {
    pub fn sorted_chunk_sizes(&self) -> Vec<usize> {
        let mut sizes = self.chunk_sizes.lock().unwrap().clone();
        sizes.sort();
        sizes.into_iter().map(|(_, len)| len).collect()
    }
}

#[async_trait]
impl Remote for LocalRemote {
    async fn check_token(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<TokenCheck, TransferError> {
        self.ledger
            .check_token(&self.creds, token, output_name, overwrite)
            .await
    }

    async fn reserve(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<(), TransferError> {
        self.ledger
            .reserve(&self.creds, token, output_name, overwrite)
            .await
            .map(|_| ())
    }

    async fn send_chunk(
        &self,
        token: &str,
        index: u64,
        data: Bytes,
        chunk_sha256: Option<&str>,
    ) -> Result<ChunkReceipt, TransferError> {
        let len = data.len();
        let receipt = self
            .ledger
            .accept_chunk(&self.creds, token, index, data, chunk_sha256)
            .await?;
        self.chunk_sizes.lock().unwrap().push((index, len));
        Ok(receipt)
    }

    async fn stage_digests(&self, token: &str, digests: &DigestSet) -> Result<(), TransferError> {
        self.ledger.stage_digests(&self.creds, token, digests).await
    }

    async fn status(&self, token: &str) -> Result<StagingStatus, TransferError> {
        self.ledger.status(&self.creds, token).await
    }

    async fn finalize(
        &self,
        token: &str,
        output_name: &str,
        digests: Option<&DigestSet>,
    ) -> Result<StoredFile, TransferError> {
        self.ledger
            .finalize(&self.creds, token, output_name, digests)
            .await
    }

    async fn abort(&self, token: &str) -> Result<bool, TransferError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.ledger.abort(&self.creds, token).await
    }

    async fn download(&self, name: &str) -> Result<RemoteFile, TransferError> {
        let file = self.catalog.stream_file(&self.creds, name).await?;
        let sha256 = self.stream_digests.then(|| file.sha256.clone());
        let sizes = self.frame_sizes.clone();
        sizes.lock().unwrap().clear();
        let frames = file
            .into_stream()
            .inspect(move |frame| {
                if let Ok(frame) = frame {
                    sizes.lock().unwrap().push(frame.len());
                }
            })
            .boxed();
        Ok(RemoteFile { sha256, frames })
    }

    async fn file_digest(&self, name: &str) -> Result<String, TransferError> {
        Ok(self.catalog.file_digest(&self.creds, name).await?.sha256)
    }

    async fn list_files(&self) -> Result<Vec<String>, TransferError> {
        self.catalog.list(&self.creds).await
    }

    async fn delete_file(&self, name: &str) -> Result<(), TransferError> {
        self.catalog.delete(&self.creds, name).await
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<(), TransferError> {
        self.catalog.rename(&self.creds, from, to).await
    }
}

/// How [`FaultyRemote`] misbehaves for one chunk index.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Fail the first `n` sends with a transport error.
    Drop(u32),
    /// Flip a byte in the first `n` sends, keeping the digest.
    Corrupt(u32),
    /// Flip a byte in every send.
    CorruptAlways,
    /// Never complete the send.
    Hang,
    /// Never complete the first `n` sends.
    HangFirst(u32),
}

/// Wraps a [`LocalRemote`] and injects faults on the way in.
pub struct FaultyRemote {
    pub inner: Arc<LocalRemote>,
    faults: HashMap<u64, Fault>,
    sends: Mutex<HashMap<u64, u32>>,
    /// Reservations to refuse with a token collision before accepting.
    collisions: AtomicU32,
    pub reserves: AtomicU32,
    pub wrong_digest: bool,
    /// Bytes to overwrite the stored file with once a download has opened.
    overwrite_on_download: Option<(PathBuf, Vec<u8>)>,
}

impl FaultyRemote {
    pub fn new(inner: Arc<LocalRemote>, faults: impl IntoIterator<Item = (u64, Fault)>) -> Self {
        Self {
            inner,
            faults: faults.into_iter().collect(),
            sends: Mutex::new(HashMap::new()),
            collisions: AtomicU32::new(0),
            reserves: AtomicU32::new(0),
            wrong_digest: false,
            overwrite_on_download: None,
        }
    }

    pub fn with_overwrite_on_download(mut self, path: PathBuf, data: &[u8]) -> Self {
        self.overwrite_on_download = Some((path, data.to_vec()));
        self
    }

    pub fn with_collisions(mut self, n: u32) -> Self {
        self.collisions = AtomicU32::new(n);
        self
    }

    pub fn with_wrong_digest(mut self) -> Self {
        self.wrong_digest = true;
        self
    }

    /// Sends attempted for `index`, including faulted ones.
    pub fn sends(&self, index: u64) -> u32 {
        self.sends.lock().unwrap().get(&index).copied().unwrap_or(0)
    }
}

fn flip(data: &Bytes) -> Bytes {
    let mut bytes = data.to_vec();
    match bytes.first_mut() {
        Some(b) => *b ^= 0xff,
        None => bytes.push(0),
    }
    Bytes::from(bytes)
}

#[async_trait]
impl Remote for FaultyRemote {
    async fn check_token(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<TokenCheck, TransferError> {
        self.inner.check_token(token, output_name, overwrite).await
    }

    async fn reserve(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<(), TransferError> {
        self.reserves.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(TransferError::TokenConflict {
                token: token.to_string(),
                reason: ConflictReason::StagingExists,
            });
        }
        self.inner.reserve(token, output_name, overwrite).await
    }

    async fn send_chunk(
        &self,
        token: &str,
        index: u64,
        data: Bytes,
        chunk_sha256: Option<&str>,
    ) -> Result<ChunkReceipt, TransferError> {
        let attempt = {
            let mut sends = self.sends.lock().unwrap();
            let n = sends.entry(index).or_default();
            *n += 1;
            *n
        };
        match self.faults.get(&index) {
            Some(Fault::Drop(n)) if attempt <= *n => {
                Err(TransferError::Transport(format!("connection reset (chunk {index})")))
            }
            Some(Fault::Corrupt(n)) if attempt <= *n => {
                self.inner.send_chunk(token, index, flip(&data), chunk_sha256).await
            }
            Some(Fault::CorruptAlways) => {
                self.inner.send_chunk(token, index, flip(&data), chunk_sha256).await
            }
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::HangFirst(n)) if attempt <= *n => std::future::pending().await,
            _ => self.inner.send_chunk(token, index, data, chunk_sha256).await,
        }
    }

    async fn stage_digests(&self, token: &str, digests: &DigestSet) -> Result<(), TransferError> {
        self.inner.stage_digests(token, digests).await
    }

    async fn status(&self, token: &str) -> Result<StagingStatus, TransferError> {
        self.inner.status(token).await
    }

    async fn finalize(
        &self,
        token: &str,
        output_name: &str,
        digests: Option<&DigestSet>,
    ) -> Result<StoredFile, TransferError> {
        self.inner.finalize(token, output_name, digests).await
    }

    async fn abort(&self, token: &str) -> Result<bool, TransferError> {
        self.inner.abort(token).await
    }

    async fn download(&self, name: &str) -> Result<RemoteFile, TransferError> {
        let mut file = self.inner.download(name).await?;
        if let Some((path, data)) = &self.overwrite_on_download {
            std::fs::write(path, data).unwrap();
        }
        if self.wrong_digest && file.sha256.is_some() {
            file.sha256 = Some("0".repeat(64));
        }
        Ok(file)
    }

    async fn file_digest(&self, name: &str) -> Result<String, TransferError> {
        if self.wrong_digest {
            return Ok("0".repeat(64));
        }
        self.inner.file_digest(name).await
    }

    async fn list_files(&self) -> Result<Vec<String>, TransferError> {
        self.inner.list_files().await
    }

    async fn delete_file(&self, name: &str) -> Result<(), TransferError> {
        self.inner.delete_file(name).await
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<(), TransferError> {
        self.inner.rename_file(from, to).await
    }
}
