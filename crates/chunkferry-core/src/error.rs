use chunkferry_types::{ConflictReason, ErrorBody, ErrorCode};

/// A digest comparison that failed. `index` is set for per-chunk digests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} digest mismatch: expected {expected}, got {actual}", subject(.index))]
pub struct DigestMismatch {
    pub index: Option<u64>,
    pub expected: String,
    pub actual: String,
}

fn subject(index: &Option<u64>) -> String {
    match index {
        Some(index) => format!("chunk {index}"),
        None => "file".to_string(),
    }
}

/// Reassembly found the chunk index sequence broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OrderingError {
    #[error("chunk {0} is missing from the sequence")]
    Missing(u64),
    #[error("chunk {0} appears more than once")]
    Duplicate(u64),
    #[error("chunk {0} lies beyond the expected chunk count")]
    Unexpected(u64),
}

impl OrderingError {
    pub fn index(&self) -> u64 {
        match *self {
            Self::Missing(i) | Self::Duplicate(i) | Self::Unexpected(i) => i,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Missing(_) => "missing",
            Self::Duplicate(_) => "duplicate",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

/// Why a chunk or a finalize was turned down, kept structured so callers
/// can tell which chunks need sending again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    Digest(DigestMismatch),
    #[error(transparent)]
    Ordering(OrderingError),
    #[error("{0}")]
    Other(String),
}

impl Rejection {
    /// Chunk index the rejection points at, if any.
    pub fn index(&self) -> Option<u64> {
        match self {
            Self::Digest(m) => m.index,
            Self::Ordering(e) => Some(e.index()),
            Self::Other(_) => None,
        }
    }
}

impl From<&TransferError> for Rejection {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::ChunkCorrupt(m) | TransferError::IntegrityMismatch(m) => {
                Self::Digest(m.clone())
            }
            TransferError::Ordering(e) => Self::Ordering(*e),
            other => Self::Other(other.to_string()),
        }
    }
}

/// One chunk that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: u64,
    pub attempts: u32,
    pub cause: Rejection,
}

/// Aggregate outcome of a failed upload: every failing chunk, plus the
/// finalize rejection if the transfer got that far.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("transfer {token} failed{}", details(.chunks, .finalize))]
pub struct FailureReport {
    pub token: String,
    pub chunks: Vec<ChunkFailure>,
    pub finalize: Option<Rejection>,
}

fn details(chunks: &[ChunkFailure], finalize: &Option<Rejection>) -> String {
    let mut text = String::new();
    if !chunks.is_empty() {
        text.push_str(&format!("; {} chunk(s) exhausted retries:", chunks.len()));
        for c in chunks {
            text.push_str(&format!(
                " [chunk {} after {} attempt(s): {}]",
                c.index, c.attempts, c.cause
            ));
        }
    }
    if let Some(cause) = finalize {
        text.push_str(&format!("; finalize rejected: {cause}"));
    }
    text
}

/// Errors produced anywhere in the transfer core.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("token {token} conflicts: {}", conflict_text(.reason))]
    TokenConflict {
        token: String,
        reason: ConflictReason,
    },

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("no staging area for transfer {0}")]
    UnknownTransfer(String),

    #[error("chunk rejected: {0}")]
    ChunkCorrupt(DigestMismatch),

    #[error("integrity check failed: {0}")]
    IntegrityMismatch(DigestMismatch),

    #[error("ordering error: {0}")]
    Ordering(#[from] OrderingError),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("chunk size must be positive")]
    InvalidChunkSize,

    #[error("no unique token found after {attempts} attempts")]
    TokenSpaceExhausted { attempts: u32 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    TransferFailed(FailureReport),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn conflict_text(reason: &ConflictReason) -> &'static str {
    match reason {
        ConflictReason::StagingExists => "a transfer with this token is already staged",
        ConflictReason::FileExists => "the output file already exists",
    }
}

impl TransferError {
    /// Failures the per-chunk retry loop is allowed to absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ChunkCorrupt(_) | Self::Io(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::TokenConflict { .. } => ErrorCode::TokenConflict,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::UnknownTransfer(_) => ErrorCode::UnknownTransfer,
            Self::ChunkCorrupt(_) => ErrorCode::ChunkCorrupt,
            Self::IntegrityMismatch(_) => ErrorCode::IntegrityMismatch,
            Self::Ordering(_) => ErrorCode::OrderingError,
            Self::InvalidName(_) | Self::InvalidChunkSize => ErrorCode::InvalidRequest,
            Self::TokenSpaceExhausted { .. }
            | Self::Transport(_)
            | Self::TransferFailed(_)
            | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Wire form of this error.
    pub fn to_body(&self) -> ErrorBody {
        let mut body = ErrorBody::new(self.code(), self.to_string());
        match self {
            Self::TokenConflict { reason, .. } => body.reason = Some(*reason),
            Self::ChunkCorrupt(m) | Self::IntegrityMismatch(m) => {
                body.index = m.index;
                body.expected = Some(m.expected.clone());
                body.actual = Some(m.actual.clone());
            }
            Self::Ordering(e) => {
                body.index = Some(e.index());
                body.detail = Some(e.kind().to_string());
            }
            _ => {}
        }
        body
    }

    /// Rebuilds an error from its wire form. `subject` names the token or
    /// file the request was about, for variants that carry one.
    pub fn from_body(body: ErrorBody, subject: &str) -> Self {
        let mismatch = || DigestMismatch {
            index: body.index,
            expected: body.expected.clone().unwrap_or_default(),
            actual: body.actual.clone().unwrap_or_default(),
        };
        match body.code {
            ErrorCode::Unauthorized => Self::Unauthorized,
            ErrorCode::TokenConflict => Self::TokenConflict {
                token: subject.to_string(),
                reason: body.reason.unwrap_or(ConflictReason::StagingExists),
            },
            ErrorCode::NotFound => Self::NotFound(subject.to_string()),
            ErrorCode::UnknownTransfer => Self::UnknownTransfer(subject.to_string()),
            ErrorCode::ChunkCorrupt => Self::ChunkCorrupt(mismatch()),
            ErrorCode::IntegrityMismatch => Self::IntegrityMismatch(mismatch()),
            ErrorCode::OrderingError => {
                let index = body.index.unwrap_or_default();
                Self::Ordering(match body.detail.as_deref() {
                    Some("duplicate") => OrderingError::Duplicate(index),
                    Some("unexpected") => OrderingError::Unexpected(index),
                    _ => OrderingError::Missing(index),
                })
            }
            ErrorCode::InvalidRequest => Self::InvalidName(body.message),
            ErrorCode::Internal => Self::Transport(body.message),
        }
    }
}
