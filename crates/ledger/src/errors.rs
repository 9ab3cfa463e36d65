//! Error types for ledger connections and registries

use crate::types::RegistryKind;
use thiserror::Error;

/// Failure to open an identity-scoped connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("identity must not be empty")]
    EmptyIdentity,

    #[error("identity {identity} is not a registered ledger participant")]
    Unauthorized { identity: String },

    #[error("ledger unreachable: {0}")]
    Unreachable(String),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{kind} {id} not found")]
    NotFound { kind: RegistryKind, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: RegistryKind, id: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unresolved reference: {reference}")]
    UnresolvedReference { reference: String },

    #[error("connection already disconnected")]
    Disconnected,

    #[error("ledger backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// True when this error reports that `id` is absent from the `kind` registry.
    pub fn is_not_found(&self, kind: RegistryKind, id: &str) -> bool {
        matches!(self, LedgerError::NotFound { kind: k, id: i } if *k == kind && i == id)
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
