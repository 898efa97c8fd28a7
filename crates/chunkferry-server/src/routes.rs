use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use chunkferry_core::{Catalog, Credentials, Ledger, TransferError};
use chunkferry_types::{
    AbortResponse, CHUNK_SHA256_HEADER, ChunkReceipt, DigestSet, FILE_SHA256_HEADER, FileDigest,
    FileList, FinalizeRequest, OWNER_HEADER, RenameRequest, ReserveResponse, StagingStatus, StatusResponse,
    StoredFile, TokenCheckResponse, TokenRequest,
};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub catalog: Arc<Catalog>,
}

pub fn router(state: AppState, max_chunk_bytes: usize) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/transfers/check", post(check_token))
        .route("/transfers", post(reserve))
        .route("/transfers/{token}", get(staging_status).delete(abort))
        .route("/transfers/{token}/chunks/{index}", put(upload_chunk))
        .route("/transfers/{token}/digests", put(stage_digests))
        .route("/transfers/{token}/finalize", post(finalize))
        .route("/files", get(list_files))
        .route("/files/{name}", delete(delete_file))
        .route("/files/{name}/data", get(download))
        .route("/files/{name}/digest", get(file_digest))
        .route("/files/{name}/rename", post(rename_file))
        .layer(DefaultBodyLimit::max(max_chunk_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// A [`TransferError`] rendered as a status code plus JSON `ErrorBody`.
pub struct ApiError(TransferError);

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        Self(err)
    }
}

fn status_for(err: &TransferError) -> StatusCode {
    match err {
        TransferError::Unauthorized => StatusCode::UNAUTHORIZED,
        TransferError::TokenConflict { .. } => StatusCode::CONFLICT,
        TransferError::NotFound(_) | TransferError::UnknownTransfer(_) => StatusCode::NOT_FOUND,
        TransferError::ChunkCorrupt(_)
        | TransferError::IntegrityMismatch(_)
        | TransferError::Ordering(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TransferError::InvalidName(_) | TransferError::InvalidChunkSize => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

// ── Auth helper ─────────────────────────────────────────────────────────

fn extract_credentials(headers: &HeaderMap) -> Result<Credentials, ApiError> {
    let owner = headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(TransferError::Unauthorized)?;
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(TransferError::Unauthorized)?;
    Ok(Credentials::new(owner, credential))
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /status: liveness, no credentials.
pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".into(),
    })
}

/// POST /transfers/check: token pre-flight.
pub async fn check_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenCheckResponse>, ApiError> {
    let creds = extract_credentials(&headers)?;
    let status = state
        .ledger
        .check_token(&creds, &req.token, req.output_name.as_deref(), req.overwrite)
        .await?;
    Ok(Json(TokenCheckResponse {
        token: req.token,
        status,
    }))
}

/// POST /transfers: reserve a staging area.
pub async fn reserve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenRequest>,
) -> Result<(StatusCode, Json<ReserveResponse>), ApiError> {
    let creds = extract_credentials(&headers)?;
    let token = state
        .ledger
        .reserve(&creds, &req.token, req.output_name.as_deref(), req.overwrite)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ReserveResponse {
            token: token.to_string(),
        }),
    ))
}

/// GET /transfers/{token}
pub async fn staging_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StagingStatus>, ApiError> {
    let creds = extract_credentials(&headers)?;
    Ok(Json(state.ledger.status(&creds, &token).await?))
}

/// PUT /transfers/{token}/chunks/{index}: raw chunk body, optional
/// `x-chunk-sha256` header.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((token, index)): Path<(String, u64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkReceipt>, ApiError> {
    let creds = extract_credentials(&headers)?;
    let digest = headers
        .get(CHUNK_SHA256_HEADER)
        .and_then(|v| v.to_str().ok());
    let receipt = state
        .ledger
        .accept_chunk(&creds, &token, index, body, digest)
        .await?;
    Ok(Json(receipt))
}

/// PUT /transfers/{token}/digests
pub async fn stage_digests(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(digests): Json<DigestSet>,
) -> Result<StatusCode, ApiError> {
    let creds = extract_credentials(&headers)?;
    state.ledger.stage_digests(&creds, &token, &digests).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /transfers/{token}/finalize
pub async fn finalize(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<StoredFile>, ApiError> {
    let creds = extract_credentials(&headers)?;
    let stored = state
        .ledger
        .finalize(&creds, &token, &req.output_name, req.digests.as_ref())
        .await?;
    Ok(Json(stored))
}

/// DELETE /transfers/{token}: idempotent abort.
pub async fn abort(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AbortResponse>, ApiError> {
    let creds = extract_credentials(&headers)?;
    let removed = state.ledger.abort(&creds, &token).await?;
    Ok(Json(AbortResponse { token, removed }))
}

/// GET /files
pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FileList>, ApiError> {
    let creds = extract_credentials(&headers)?;
    let files = state.catalog.list(&creds).await?;
    Ok(Json(FileList { files }))
}

/// GET /files/{name}/data: chunked streaming download.
pub async fn download(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let creds = extract_credentials(&headers)?;
    let file = state.catalog.stream_file(&creds, &name).await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size));
    if let Ok(digest) = HeaderValue::from_str(&file.sha256) {
        response_headers.insert(FILE_SHA256_HEADER, digest);
    }

    let body = Body::from_stream(file.into_stream());
    Ok((StatusCode::OK, response_headers, body))
}

/// GET /files/{name}/digest
pub async fn file_digest(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<FileDigest>, ApiError> {
    let creds = extract_credentials(&headers)?;
    let stored = state.catalog.file_digest(&creds, &name).await?;
    Ok(Json(FileDigest {
        name: stored.name,
        sha256: stored.sha256,
    }))
}

/// POST /files/{name}/rename
pub async fn rename_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    let creds = extract_credentials(&headers)?;
    state.catalog.rename(&creds, &name, &req.new_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /files/{name}
pub async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let creds = extract_credentials(&headers)?;
    state.catalog.delete(&creds, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}
