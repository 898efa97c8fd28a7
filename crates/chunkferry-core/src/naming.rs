use std::fmt;
use std::path::{Component, Path};

use rand::Rng;

use crate::error::TransferError;

/// Length of generated transfer tokens.
pub const TOKEN_LEN: usize = 10;

/// Longest token a caller may choose.
pub const MAX_TOKEN_LEN: usize = 64;

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Caller-chosen identifier scoping one in-flight transfer for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferToken(String);

impl TransferToken {
    /// Generates a random token of [`TOKEN_LEN`] uppercase alphanumerics.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let token = (0..TOKEN_LEN)
            .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
            .collect();
        Self(token)
    }

    /// Accepts 1..=64 ASCII alphanumerics.
    pub fn parse(raw: &str) -> Result<Self, TransferError> {
        if raw.is_empty() || raw.len() > MAX_TOKEN_LEN {
            return Err(TransferError::InvalidName(format!(
                "token must be 1-{MAX_TOKEN_LEN} characters: {raw:?}"
            )));
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(TransferError::InvalidName(format!(
                "token must be ASCII alphanumeric: {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates that `name` is exactly one normal path component, so it can
/// be joined under a storage directory without escaping it.
///
/// Used for owners and stored file names.
pub fn validate_component(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidName(format!(
            "separators not allowed: {name:?}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidName(format!(
            "not a plain file name: {name:?}"
        ))),
    }
}
