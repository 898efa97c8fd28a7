pub mod catalog;
pub mod codec;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod naming;
pub mod retry;
pub mod store;

pub use catalog::{Catalog, FileStream};
pub use codec::{Chunk, DEFAULT_CHUNK_SIZE};
pub use error::{ChunkFailure, DigestMismatch, FailureReport, OrderingError, Rejection, TransferError};
pub use gate::{CredentialGate, Credentials, StaticGate};
pub use ledger::Ledger;
pub use naming::TransferToken;
pub use retry::{RetryDecision, RetryOutcome, RetryPolicy};
pub use store::FileStore;
