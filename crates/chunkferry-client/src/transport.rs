use async_trait::async_trait;
use bytes::Bytes;
use chunkferry_core::TransferError;
use chunkferry_types::{ChunkReceipt, DigestSet, StagingStatus, StoredFile, TokenCheck};
use futures_util::stream::BoxStream;

/// Byte frames of a download, in the order the server sent them.
pub type FrameStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// An open download.
pub struct RemoteFile {
    /// Digest of the exact bytes being streamed, when the server sends one.
    pub sha256: Option<String>,
    pub frames: FrameStream,
}

/// One authenticated connection to a transfer server.
///
/// Every call is made on behalf of the owner the remote was built for.
/// Transmission failures come back as [`TransferError::Transport`];
/// server-side rejections keep their original variant.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn check_token(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<TokenCheck, TransferError>;

    async fn reserve(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<(), TransferError>;

    async fn send_chunk(
        &self,
        token: &str,
        index: u64,
        data: Bytes,
        chunk_sha256: Option<&str>,
    ) -> Result<ChunkReceipt, TransferError>;

    async fn stage_digests(&self, token: &str, digests: &DigestSet) -> Result<(), TransferError>;

    async fn status(&self, token: &str) -> Result<StagingStatus, TransferError>;

    async fn finalize(
        &self,
        token: &str,
        output_name: &str,
        digests: Option<&DigestSet>,
    ) -> Result<StoredFile, TransferError>;

    /// Returns false if nothing was staged.
    async fn abort(&self, token: &str) -> Result<bool, TransferError>;

    async fn download(&self, name: &str) -> Result<RemoteFile, TransferError>;

    async fn file_digest(&self, name: &str) -> Result<String, TransferError>;

    async fn list_files(&self) -> Result<Vec<String>, TransferError>;

    async fn delete_file(&self, name: &str) -> Result<(), TransferError>;

    async fn rename_file(&self, from: &str, to: &str) -> Result<(), TransferError>;
}
