use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use chunkferry_core::codec::{self, Chunk};
use chunkferry_core::TransferError;
use futures_util::StreamExt;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::transport::{Remote, RemoteFile};

/// Default local frame size: 1 MiB.
pub const DEFAULT_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Size of the local chunk files the stream is cut into.
    pub frame_size: usize,
    /// Compare the result against the digest of the streamed snapshot, or
    /// the server's current digest of the file if the stream carried none.
    pub verify: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub frames: u64,
}

/// Local chunk directory, removed on drop unless kept.
struct LocalStaging {
    dir: PathBuf,
    keep: bool,
}

impl Drop for LocalStaging {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.dir.display(), e);
            }
        }
    }
}

pub struct Downloader<R: Remote + ?Sized> {
    remote: Arc<R>,
    options: DownloadOptions,
}

impl<R: Remote + ?Sized> Downloader<R> {
    pub fn new(remote: Arc<R>, options: DownloadOptions) -> Self {
        Self { remote, options }
    }

    /// Downloads `name` to `dest`.
    ///
    /// The stream is cut into `frame_size` chunk files beside `dest`, which
    /// are then reassembled by index. On a digest mismatch the output and
    /// its chunk files are left in place for inspection.
    pub async fn download(&self, name: &str, dest: &Path) -> Result<Downloaded, TransferError> {
        let frame_size = self.options.frame_size;
        codec::check_chunk_size(frame_size)?;

        let RemoteFile {
            sha256: streamed_digest,
            frames: mut stream,
        } = self.remote.download(name).await?;

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidName(dest.display().to_string()))?;
        let mut staging = LocalStaging {
            dir: parent.join(format!(".{}.{}.chunks", file_name, uuid::Uuid::new_v4())),
            keep: false,
        };
        fs::create_dir_all(&staging.dir).await?;

        let mut buf = BytesMut::with_capacity(frame_size);
        let mut index = 0u64;
        while let Some(piece) = stream.next().await {
            buf.extend_from_slice(&piece?);
            while buf.len() >= frame_size {
                let data = buf.split_to(frame_size).freeze();
                codec::write_chunk_file(&staging.dir, &Chunk { index, data }).await?;
                index += 1;
            }
        }
        if !buf.is_empty() || index == 0 {
            let data = buf.freeze();
            codec::write_chunk_file(&staging.dir, &Chunk { index, data }).await?;
            index += 1;
        }
        debug!(name, frames = index, "Download stream finished");

        let indices = codec::scan_chunk_dir(&staging.dir).await?;
        let assembled =
            codec::reassemble_dir(&staging.dir, &indices, Some(index), dest, |_, _| Ok(())).await?;

        if self.options.verify {
            let expected = match streamed_digest {
                Some(digest) => digest,
                None => self.remote.file_digest(name).await?,
            };
            if let Err(mismatch) = codec::verify_whole(&assembled.sha256, &expected) {
                staging.keep = true;
                warn!(name, path = %dest.display(), "Downloaded file failed verification");
                return Err(TransferError::IntegrityMismatch(mismatch));
            }
        }

        info!(name, size = assembled.size, frames = index, "Download complete");
        Ok(Downloaded {
            path: dest.to_path_buf(),
            size: assembled.size,
            sha256: assembled.sha256,
            frames: index,
        })
    }
}
