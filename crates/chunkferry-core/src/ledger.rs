//! Server-side staging of in-flight uploads.
//!
//! Every (owner, token) pair owns one staging directory under
//! `{root}/staging/{owner}/{token}` holding `chunk-N` payloads plus the
//! optional staged digest records. All work on one area runs under that
//! area's async lock; different areas never contend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chunkferry_types::{
    ChunkReceipt, ConflictReason, DigestSet, StagingStatus, StoredFile, TokenCheck,
};
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::codec::{self, Chunk};
use crate::error::{OrderingError, TransferError};
use crate::gate::{CredentialGate, Credentials, admit};
use crate::naming::{TransferToken, validate_component};
use crate::store::FileStore;

const FILE_DIGEST_RECORD: &str = "file.sha256";
const CHUNK_DIGEST_RECORD: &str = "chunks.sha256";
const CANDIDATE: &str = ".candidate";

type AreaKey = (String, String);
type AreaSlot = Arc<AsyncMutex<AreaState>>;

#[derive(Debug, Default)]
struct AreaState {
    /// Disk state has been read into this slot.
    loaded: bool,
    /// The staging directory exists.
    live: bool,
    received: BTreeSet<u64>,
    /// Index -> digest the chunk was checked against when accepted.
    verified: BTreeMap<u64, String>,
}

pub struct Ledger {
    staging: PathBuf,
    store: Arc<FileStore>,
    gate: Arc<dyn CredentialGate>,
    areas: Mutex<HashMap<AreaKey, AreaSlot>>,
}

impl Ledger {
    pub async fn new(
        staging: PathBuf,
        store: Arc<FileStore>,
        gate: Arc<dyn CredentialGate>,
    ) -> Result<Self, TransferError> {
        fs::create_dir_all(&staging).await?;
        info!("Staging directory: {}", staging.display());
        Ok(Self {
            staging,
            store,
            gate,
            areas: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    fn area_dir(&self, owner: &str, token: &TransferToken) -> PathBuf {
        self.staging.join(owner).join(token.as_str())
    }

    fn slot(&self, key: &AreaKey) -> AreaSlot {
        let mut areas = self.areas.lock().unwrap_or_else(|e| e.into_inner());
        areas.entry(key.clone()).or_default().clone()
    }

    fn is_current(&self, key: &AreaKey, slot: &AreaSlot) -> bool {
        let areas = self.areas.lock().unwrap_or_else(|e| e.into_inner());
        areas.get(key).is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    fn forget(&self, key: &AreaKey, slot: &AreaSlot) {
        let mut areas = self.areas.lock().unwrap_or_else(|e| e.into_inner());
        if areas.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            areas.remove(key);
        }
    }

    /// Locks the area for (owner, token), loading its state from disk the
    /// first time it is seen since startup.
    async fn lock_area(
        &self,
        owner: &str,
        token: &TransferToken,
    ) -> Result<(AreaKey, AreaSlot, OwnedMutexGuard<AreaState>), TransferError> {
        validate_component(owner)?;
        let key = (owner.to_string(), token.as_str().to_string());
        loop {
            let slot = self.slot(&key);
            let mut state = slot.clone().lock_owned().await;
            // Forgotten while we waited; take the fresh slot instead.
            if !self.is_current(&key, &slot) {
                continue;
            }
            if !state.loaded {
                let dir = self.area_dir(owner, token);
                state.loaded = true;
                state.live = fs::metadata(&dir).await.is_ok_and(|m| m.is_dir());
                if state.live {
                    state.received = codec::scan_chunk_dir(&dir).await?;
                    debug!(owner, token = %token, chunks = state.received.len(), "Recovered staging area");
                }
            }
            return Ok((key, slot, state));
        }
    }

    /// Locks a live area or fails with `UnknownTransfer`.
    async fn lock_live(
        &self,
        owner: &str,
        token: &TransferToken,
    ) -> Result<(AreaKey, AreaSlot, OwnedMutexGuard<AreaState>), TransferError> {
        let (key, slot, state) = self.lock_area(owner, token).await?;
        if !state.live {
            self.forget(&key, &slot);
            return Err(TransferError::UnknownTransfer(token.to_string()));
        }
        Ok((key, slot, state))
    }

    async fn output_conflict(
        &self,
        owner: &str,
        token: &TransferToken,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<bool, TransferError> {
        let Some(name) = output_name else {
            return Ok(false);
        };
        let exists = self.store.exists(owner, name).await?;
        if exists && !overwrite {
            return Err(TransferError::TokenConflict {
                token: token.to_string(),
                reason: ConflictReason::FileExists,
            });
        }
        Ok(exists)
    }

    // ── Operations ──

    /// Pre-flight for [`Ledger::reserve`]; changes nothing.
    pub async fn check_token(
        &self,
        creds: &Credentials,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<TokenCheck, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let token = TransferToken::parse(token)?;
        let (key, slot, state) = self.lock_area(&creds.owner, &token).await?;
        if state.live {
            return Err(TransferError::TokenConflict {
                token: token.to_string(),
                reason: ConflictReason::StagingExists,
            });
        }
        self.forget(&key, &slot);
        drop(state);

        let replaces = self
            .output_conflict(&creds.owner, &token, output_name, overwrite)
            .await?;
        Ok(if replaces {
            TokenCheck::WillOverwrite
        } else {
            TokenCheck::Unique
        })
    }

    /// Creates the staging area for (owner, token).
    ///
    /// Fails with `TokenConflict` if the area already exists, or if
    /// `output_name` already holds a durable file and `overwrite` is off.
    pub async fn reserve(
        &self,
        creds: &Credentials,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<TransferToken, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let token = TransferToken::parse(token)?;
        let owner = creds.owner.as_str();
        let (key, slot, mut state) = self.lock_area(owner, &token).await?;

        let conflict = || TransferError::TokenConflict {
            token: token.to_string(),
            reason: ConflictReason::StagingExists,
        };
        if state.live {
            return Err(conflict());
        }
        if let Err(e) = self
            .output_conflict(owner, &token, output_name, overwrite)
            .await
        {
            self.forget(&key, &slot);
            return Err(e);
        }

        let dir = self.area_dir(owner, &token);
        fs::create_dir_all(self.staging.join(owner)).await?;
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                state.live = true;
                state.received = codec::scan_chunk_dir(&dir).await?;
                return Err(conflict());
            }
            Err(e) => return Err(e.into()),
        }

        state.live = true;
        state.received.clear();
        state.verified.clear();
        info!(owner, token = %token, "Reserved transfer");
        Ok(token)
    }

    /// Stores one chunk, replacing any earlier payload at the same index.
    ///
    /// With a digest, the payload is checked first and a mismatch leaves
    /// the staging area untouched.
    pub async fn accept_chunk(
        &self,
        creds: &Credentials,
        token: &str,
        index: u64,
        data: Bytes,
        chunk_sha256: Option<&str>,
    ) -> Result<ChunkReceipt, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let token = TransferToken::parse(token)?;
        let owner = creds.owner.as_str();
        let (_, _, mut state) = self.lock_live(owner, &token).await?;

        if let Some(expected) = chunk_sha256 {
            if let Err(mismatch) = codec::verify_chunk(&data, expected, index) {
                warn!(owner, token = %token, index, "Rejected corrupt chunk");
                return Err(TransferError::ChunkCorrupt(mismatch));
            }
        }

        let len = data.len();
        let chunk = Chunk { index, data };
        codec::write_chunk_file(&self.area_dir(owner, &token), &chunk).await?;

        state.received.insert(index);
        match chunk_sha256 {
            Some(expected) => {
                state
                    .verified
                    .insert(index, expected.trim().to_ascii_lowercase());
            }
            None => {
                state.verified.remove(&index);
            }
        }
        debug!(owner, token = %token, index, len, "Accepted chunk");

        Ok(ChunkReceipt {
            index,
            chunks_received: state.received.len() as u64,
        })
    }

    /// Records the sender's digests in the staging area for use at finalize.
    pub async fn stage_digests(
        &self,
        creds: &Credentials,
        token: &str,
        digests: &DigestSet,
    ) -> Result<(), TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let token = TransferToken::parse(token)?;
        let owner = creds.owner.as_str();
        let (_, _, _state) = self.lock_live(owner, &token).await?;
        let dir = self.area_dir(owner, &token);

        if let Some(file) = &digests.file_sha256 {
            fs::write(dir.join(FILE_DIGEST_RECORD), format!("{}\n", file.trim())).await?;
        }
        if let Some(chunks) = &digests.chunk_sha256 {
            let mut body = String::with_capacity(chunks.len() * 65);
            for digest in chunks {
                body.push_str(digest.trim());
                body.push('\n');
            }
            fs::write(dir.join(CHUNK_DIGEST_RECORD), body).await?;
        }
        debug!(
            owner,
            token = %token,
            whole = digests.file_sha256.is_some(),
            chunks = digests.chunk_sha256.as_ref().map_or(0, Vec::len),
            "Staged digests"
        );
        Ok(())
    }

    pub async fn status(
        &self,
        creds: &Credentials,
        token: &str,
    ) -> Result<StagingStatus, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let token = TransferToken::parse(token)?;
        let owner = creds.owner.as_str();
        let (_, _, state) = self.lock_live(owner, &token).await?;
        let staged = read_staged_digests(&self.area_dir(owner, &token)).await?;

        Ok(StagingStatus {
            token: token.to_string(),
            chunks: state.received.iter().copied().collect(),
            has_file_digest: staged.file_sha256.is_some(),
            chunk_digest_count: staged.chunk_sha256.map(|c| c.len()),
        })
    }

    /// Reassembles the staged chunks in index order, verifies them, and
    /// commits the result to (owner, `output_name`).
    ///
    /// `digests` take precedence over digests staged earlier. On any
    /// failure no durable file is touched and the staging area stays as it
    /// was, so the caller can resend chunks and finalize again.
    pub async fn finalize(
        &self,
        creds: &Credentials,
        token: &str,
        output_name: &str,
        digests: Option<&DigestSet>,
    ) -> Result<StoredFile, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let token = TransferToken::parse(token)?;
        validate_component(output_name)?;
        let owner = creds.owner.as_str();
        let (key, slot, mut state) = self.lock_live(owner, &token).await?;
        let dir = self.area_dir(owner, &token);

        let staged = read_staged_digests(&dir).await?;
        let explicit = digests.cloned().unwrap_or_default();
        let whole = explicit.file_sha256.or(staged.file_sha256);
        let per_chunk = explicit.chunk_sha256.or(staged.chunk_sha256);
        let expected_count = per_chunk.as_ref().map(|c| c.len() as u64);

        let candidate = dir.join(CANDIDATE);
        let verified = &state.verified;
        let assembled = codec::reassemble_dir(
            &dir,
            &state.received,
            expected_count,
            &candidate,
            |index, data| {
                let Some(list) = &per_chunk else {
                    return Ok(());
                };
                let Some(expected) = list.get(index as usize) else {
                    return Err(OrderingError::Unexpected(index).into());
                };
                let expected = expected.trim().to_ascii_lowercase();
                if verified.get(&index) == Some(&expected) {
                    return Ok(());
                }
                codec::verify_chunk(data, &expected, index)
                    .map_err(TransferError::IntegrityMismatch)
            },
        )
        .await;
        let assembled = match assembled {
            Ok(a) => a,
            Err(e) => {
                warn!(owner, token = %token, error = %e, "Finalize rejected");
                return Err(e);
            }
        };

        if let Some(expected) = &whole {
            if let Err(mismatch) = codec::verify_whole(&assembled.sha256, expected) {
                let _ = fs::remove_file(&candidate).await;
                warn!(owner, token = %token, %mismatch, "Finalize rejected");
                return Err(TransferError::IntegrityMismatch(mismatch));
            }
        }

        if let Err(e) = self.store.commit(owner, output_name, &candidate).await {
            let _ = fs::remove_file(&candidate).await;
            return Err(e);
        }

        if let Err(e) = fs::remove_dir_all(&dir).await {
            warn!(owner, token = %token, "Failed to remove staging area: {}", e);
        }
        state.live = false;
        self.forget(&key, &slot);

        info!(
            owner,
            token = %token,
            name = output_name,
            size = assembled.size,
            "Finalized transfer"
        );
        Ok(StoredFile {
            name: output_name.to_string(),
            size: assembled.size,
            sha256: assembled.sha256,
        })
    }

    /// Deletes the staging area. Returns false if there was none.
    pub async fn abort(&self, creds: &Credentials, token: &str) -> Result<bool, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let token = TransferToken::parse(token)?;
        let owner = creds.owner.as_str();
        let (key, slot, mut state) = self.lock_area(owner, &token).await?;

        let removed = match fs::remove_dir_all(self.area_dir(owner, &token)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        state.live = false;
        self.forget(&key, &slot);

        if removed {
            info!(owner, token = %token, "Aborted transfer");
        }
        Ok(removed)
    }

    // ── Housekeeping ──

    /// Deletes staging areas untouched for at least `max_idle`. Areas with
    /// an operation in progress are skipped. Returns how many were removed.
    pub async fn prune_idle(&self, max_idle: Duration) -> Result<usize, TransferError> {
        let mut pruned = 0;
        for (owner, token_dir) in list_subdirs(&self.staging).await? {
            for (token, dir) in list_subdirs(&token_dir).await? {
                let Ok(token) = TransferToken::parse(&token) else {
                    continue;
                };
                if !idle_at_least(&dir, max_idle).await? {
                    continue;
                }
                if self.prune_area(&owner, &token, max_idle).await? {
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    /// Removes one staging area if it is still idle once its lock is held.
    /// Busy areas are skipped.
    async fn prune_area(
        &self,
        owner: &str,
        token: &TransferToken,
        max_idle: Duration,
    ) -> Result<bool, TransferError> {
        let key = (owner.to_string(), token.to_string());
        let slot = self.slot(&key);
        let Ok(mut state) = slot.clone().try_lock_owned() else {
            debug!(owner, token = %token, "Skipping busy staging area");
            return Ok(false);
        };

        // A chunk may have landed between the scan and the lock.
        let dir = self.area_dir(owner, token);
        if !idle_at_least(&dir, max_idle).await? {
            if !state.loaded {
                self.forget(&key, &slot);
            }
            return Ok(false);
        }

        let removed = match fs::remove_dir_all(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(owner, token = %token, "Failed to prune staging area: {}", e);
                false
            }
        };
        state.loaded = true;
        state.live = false;
        self.forget(&key, &slot);
        Ok(removed)
    }
}

/// Whether `dir` has gone unmodified for at least `max_idle`. A missing
/// directory is never idle.
async fn idle_at_least(dir: &Path, max_idle: Duration) -> Result<bool, TransferError> {
    let modified = match fs::metadata(dir).await {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(modified.elapsed().unwrap_or_default() >= max_idle)
}

/// (name, path) of every subdirectory of `dir`. A missing `dir` is empty.
async fn list_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, TransferError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            dirs.push((name.to_string(), entry.path()));
        }
    }
    Ok(dirs)
}

async fn read_staged_digests(dir: &Path) -> Result<DigestSet, TransferError> {
    let file_sha256 = read_record(&dir.join(FILE_DIGEST_RECORD))
        .await?
        .map(|s| s.trim().to_string());
    let chunk_sha256 = read_record(&dir.join(CHUNK_DIGEST_RECORD))
        .await?
        .map(|s| {
            s.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        });
    Ok(DigestSet {
        file_sha256,
        chunk_sha256,
    })
}

async fn read_record(path: &Path) -> Result<Option<String>, TransferError> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
