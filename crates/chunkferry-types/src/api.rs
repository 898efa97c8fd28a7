use serde::{Deserialize, Serialize};

// -- Headers --

/// Header carrying the owning identity of a request.
pub const OWNER_HEADER: &str = "x-chunkferry-owner";

/// Optional header carrying the SHA-256 of a chunk body.
pub const CHUNK_SHA256_HEADER: &str = "x-chunk-sha256";

/// Header on a download carrying the SHA-256 of the bytes being streamed.
pub const FILE_SHA256_HEADER: &str = "x-file-sha256";

// -- Digests --

/// Whole-file digest plus the optional ordered per-chunk digests.
///
/// Produced once by the sender and consumed once by the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_sha256: Option<Vec<String>>,
}

impl DigestSet {
    pub fn is_empty(&self) -> bool {
        self.file_sha256.is_none() && self.chunk_sha256.is_none()
    }
}

// -- Reservation --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRequest {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

/// Outcome of a successful token pre-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenCheck {
    Unique,
    /// The token is free but the output name already holds a file that
    /// will be replaced.
    WillOverwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCheckResponse {
    pub token: String,
    pub status: TokenCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveResponse {
    pub token: String,
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    StagingExists,
    FileExists,
}

// -- Staging --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub index: u64,
    pub chunks_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingStatus {
    pub token: String,
    pub chunks: Vec<u64>,
    pub has_file_digest: bool,
    pub chunk_digest_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalizeRequest {
    pub output_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digests: Option<DigestSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub token: String,
    /// False when no staging area existed.
    pub removed: bool,
}

// -- Files --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDigest {
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameRequest {
    pub new_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

// -- Errors --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    TokenConflict,
    NotFound,
    UnknownTransfer,
    ChunkCorrupt,
    IntegrityMismatch,
    OrderingError,
    InvalidRequest,
    Internal,
}

/// Structured error payload returned by every failing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConflictReason>,
    /// Kind of ordering failure (`missing`, `duplicate`, `unexpected`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            index: None,
            expected: None,
            actual: None,
            reason: None,
            detail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_set_omits_absent_fields() {
        let json = serde_json::to_string(&DigestSet::default()).unwrap();
        assert_eq!(json, "{}");

        let parsed: DigestSet = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn error_body_uses_snake_case_codes() {
        let mut body = ErrorBody::new(ErrorCode::TokenConflict, "taken");
        body.reason = Some(ConflictReason::FileExists);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "token_conflict");
        assert_eq!(json["reason"], "file_exists");
        assert!(json.get("index").is_none());
    }

    #[test]
    fn token_request_defaults_overwrite_off() {
        let req: TokenRequest = serde_json::from_str(r#"{"token":"ABC123"}"#).unwrap();
        assert!(!req.overwrite);
        assert!(req.output_name.is_none());
    }
}
