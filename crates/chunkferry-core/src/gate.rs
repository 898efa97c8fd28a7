use std::collections::HashMap;

use subtle::ConstantTimeEq;

use crate::error::TransferError;

/// Opaque accept/reject decision made before any state change or disk read.
pub trait CredentialGate: Send + Sync {
    fn authorize(&self, owner: &str, credential: &str) -> bool;
}

/// Owner and credential presented with a request.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub owner: String,
    pub credential: String,
}

impl Credentials {
    pub fn new(owner: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            credential: credential.into(),
        }
    }
}

/// Fixed owner → credential table, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticGate {
    users: HashMap<String, String>,
}

impl StaticGate {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl CredentialGate for StaticGate {
    fn authorize(&self, owner: &str, credential: &str) -> bool {
        self.users
            .get(owner)
            .is_some_and(|expected| constant_time_eq(expected.as_bytes(), credential.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Runs the gate and maps a rejection to [`TransferError::Unauthorized`].
pub(crate) fn admit(gate: &dyn CredentialGate, creds: &Credentials) -> Result<(), TransferError> {
    if gate.authorize(&creds.owner, &creds.credential) {
        Ok(())
    } else {
        tracing::warn!(owner = %creds.owner, "credential rejected");
        Err(TransferError::Unauthorized)
    }
}
