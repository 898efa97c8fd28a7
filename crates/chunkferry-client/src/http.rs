use async_trait::async_trait;
use bytes::Bytes;
use chunkferry_core::TransferError;
use chunkferry_types::{
    AbortResponse, CHUNK_SHA256_HEADER, ChunkReceipt, DigestSet, ErrorBody, FILE_SHA256_HEADER,
    FileDigest, FileList, FinalizeRequest, OWNER_HEADER, RenameRequest, StagingStatus, StoredFile, TokenCheck,
    TokenCheckResponse, TokenRequest,
};
use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::transport::{Remote, RemoteFile};

/// [`Remote`] over the server's HTTP API.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base: Url,
    owner: String,
    credential: String,
}

fn transport(e: reqwest::Error) -> TransferError {
    TransferError::Transport(e.to_string())
}

impl HttpRemote {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &ClientConfig) -> Self {
        Self {
            client,
            base: config.server_url.clone(),
            owner: config.username.clone(),
            credential: config.auth_token.clone(),
        }
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, TransferError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransferError::Transport(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, TransferError> {
        Ok(self
            .client
            .request(method, self.url(segments)?)
            .header(OWNER_HEADER, &self.owner)
            .bearer_auth(&self.credential))
    }

    /// Sends the request and returns the response if it succeeded, or the
    /// server's error rebuilt as a [`TransferError`]. `subject` names the
    /// token or file the request concerns.
    async fn execute(rb: RequestBuilder, subject: &str) -> Result<Response, TransferError> {
        let resp = rb.send().await.map_err(transport)?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(err) => Err(TransferError::from_body(err, subject)),
            Err(_) => Err(TransferError::Transport(format!(
                "{} ({}): {}",
                subject,
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    async fn json<T: DeserializeOwned>(rb: RequestBuilder, subject: &str) -> Result<T, TransferError> {
        Self::execute(rb, subject)
            .await?
            .json()
            .await
            .map_err(transport)
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn check_token(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<TokenCheck, TransferError> {
        let rb = self.request(Method::POST, &["transfers", "check"])?.json(&TokenRequest {
            token: token.to_string(),
            output_name: output_name.map(str::to_string),
            overwrite,
        });
        let resp: TokenCheckResponse = Self::json(rb, token).await?;
        Ok(resp.status)
    }

    async fn reserve(
        &self,
        token: &str,
        output_name: Option<&str>,
        overwrite: bool,
    ) -> Result<(), TransferError> {
        let rb = self.request(Method::POST, &["transfers"])?.json(&TokenRequest {
            token: token.to_string(),
            output_name: output_name.map(str::to_string),
            overwrite,
        });
        Self::execute(rb, token).await?;
        Ok(())
    }

    async fn send_chunk(
        &self,
        token: &str,
        index: u64,
        data: Bytes,
        chunk_sha256: Option<&str>,
    ) -> Result<ChunkReceipt, TransferError> {
        let index_segment = index.to_string();
        let mut rb = self
            .request(Method::PUT, &["transfers", token, "chunks", &index_segment])?
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        if let Some(digest) = chunk_sha256 {
            rb = rb.header(CHUNK_SHA256_HEADER, digest);
        }
        Self::json(rb, token).await
    }

    async fn stage_digests(&self, token: &str, digests: &DigestSet) -> Result<(), TransferError> {
        let rb = self
            .request(Method::PUT, &["transfers", token, "digests"])?
            .json(digests);
        Self::execute(rb, token).await?;
        Ok(())
    }

    async fn status(&self, token: &str) -> Result<StagingStatus, TransferError> {
        let rb = self.request(Method::GET, &["transfers", token])?;
        Self::json(rb, token).await
    }

    async fn finalize(
        &self,
        token: &str,
        output_name: &str,
        digests: Option<&DigestSet>,
    ) -> Result<StoredFile, TransferError> {
        let rb = self
            .request(Method::POST, &["transfers", token, "finalize"])?
            .json(&FinalizeRequest {
                output_name: output_name.to_string(),
                digests: digests.cloned(),
            });
        Self::json(rb, token).await
    }

    async fn abort(&self, token: &str) -> Result<bool, TransferError> {
        let rb = self.request(Method::DELETE, &["transfers", token])?;
        let resp: AbortResponse = Self::json(rb, token).await?;
        Ok(resp.removed)
    }

    async fn download(&self, name: &str) -> Result<RemoteFile, TransferError> {
        let rb = self.request(Method::GET, &["files", name, "data"])?;
        let resp = Self::execute(rb, name).await?;
        let sha256 = resp
            .headers()
            .get(FILE_SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(RemoteFile {
            sha256,
            frames: resp.bytes_stream().map(|r| r.map_err(transport)).boxed(),
        })
    }

    async fn file_digest(&self, name: &str) -> Result<String, TransferError> {
        let rb = self.request(Method::GET, &["files", name, "digest"])?;
        let resp: FileDigest = Self::json(rb, name).await?;
        Ok(resp.sha256)
    }

    async fn list_files(&self) -> Result<Vec<String>, TransferError> {
        let rb = self.request(Method::GET, &["files"])?;
        let resp: FileList = Self::json(rb, "files").await?;
        Ok(resp.files)
    }

    async fn delete_file(&self, name: &str) -> Result<(), TransferError> {
        let rb = self.request(Method::DELETE, &["files", name])?;
        Self::execute(rb, name).await?;
        Ok(())
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<(), TransferError> {
        let rb = self
            .request(Method::POST, &["files", from, "rename"])?
            .json(&RenameRequest {
                new_name: to.to_string(),
            });
        Self::execute(rb, from).await?;
        Ok(())
    }
}
