//! Read side of the durable store: chunked downloads and file management.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chunkferry_types::StoredFile;
use futures_util::stream::BoxStream;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::codec::{self, ChunkReader};
use crate::error::TransferError;
use crate::gate::{CredentialGate, Credentials, admit};
use crate::naming::validate_component;
use crate::store::FileStore;

/// Default server streaming chunk size: 100 MiB.
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 100 * 1024 * 1024;

pub struct Catalog {
    outbound: PathBuf,
    store: Arc<FileStore>,
    gate: Arc<dyn CredentialGate>,
    chunk_size: usize,
}

/// A download in progress. Frames come out in ascending index order.
pub struct FileStream {
    pub name: String,
    pub size: u64,
    pub frames: u64,
    /// SHA-256 of the snapshot being streamed.
    pub sha256: String,
    stream: BoxStream<'static, Result<Bytes, TransferError>>,
}

impl FileStream {
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, TransferError>> {
        self.stream
    }
}

/// Removes a spool directory when the stream holding it goes away,
/// whether it finished or was dropped mid-flight.
struct SpoolGuard(PathBuf);

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.0) {
            Ok(()) => debug!("Removed spool {}", self.0.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove spool {}: {}", self.0.display(), e),
        }
    }
}

impl Catalog {
    pub async fn new(
        outbound: PathBuf,
        store: Arc<FileStore>,
        gate: Arc<dyn CredentialGate>,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        codec::check_chunk_size(chunk_size)?;
        fs::create_dir_all(&outbound).await?;
        Ok(Self {
            outbound,
            store,
            gate,
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Snapshots (owner, `name`) into a private spool as chunk files and
    /// returns a stream over them. Each chunk file is deleted once it has
    /// been yielded; the spool itself goes when the stream is dropped.
    pub async fn stream_file(
        &self,
        creds: &Credentials,
        name: &str,
    ) -> Result<FileStream, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let owner = creds.owner.as_str();
        let source = self.store.existing_path(owner, name).await?;

        let spool = self
            .outbound
            .join(owner)
            .join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&spool).await?;
        let guard = SpoolGuard(spool.clone());

        let mut reader = ChunkReader::open(&source, self.chunk_size).await?;
        let size = reader.len();
        let frames = reader.chunk_count();
        let mut hasher = Sha256::new();
        while let Some(chunk) = reader.next_chunk().await? {
            hasher.update(&chunk.data);
            codec::write_chunk_file(&spool, &chunk).await?;
        }
        let sha256 = hex::encode(hasher.finalize());
        info!(owner, name, size, frames, "Streaming file");

        let label = name.to_string();
        let stream = async_stream::stream! {
            let _guard = guard;
            for index in 0..frames {
                let path = spool.join(codec::chunk_file_name(index));
                let data = match fs::read(&path).await {
                    Ok(d) => d,
                    Err(e) => {
                        yield Err(TransferError::Io(e));
                        return;
                    }
                };
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("Failed to discard spooled chunk {}: {}", index, e);
                }
                yield Ok(Bytes::from(data));
            }
            debug!(name = %label, "Stream complete");
        };

        Ok(FileStream {
            name: name.to_string(),
            size,
            frames,
            sha256,
            stream: Box::pin(stream),
        })
    }

    /// SHA-256 of a stored file, computed from its current bytes.
    pub async fn file_digest(&self, creds: &Credentials, name: &str) -> Result<StoredFile, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        let path = self.store.existing_path(&creds.owner, name).await?;
        let size = fs::metadata(&path).await?.len();
        let sha256 = codec::file_digest(&path).await?;
        Ok(StoredFile {
            name: name.to_string(),
            size,
            sha256,
        })
    }

    pub async fn list(&self, creds: &Credentials) -> Result<Vec<String>, TransferError> {
        admit(self.gate.as_ref(), creds)?;
        self.store.list(&creds.owner).await
    }

    pub async fn delete(&self, creds: &Credentials, name: &str) -> Result<(), TransferError> {
        admit(self.gate.as_ref(), creds)?;
        self.store.delete(&creds.owner, name).await
    }

    pub async fn rename(&self, creds: &Credentials, from: &str, to: &str) -> Result<(), TransferError> {
        admit(self.gate.as_ref(), creds)?;
        validate_component(to)?;
        self.store.rename(&creds.owner, from, to).await
    }
}
