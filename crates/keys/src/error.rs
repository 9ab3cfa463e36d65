use keyledger_ledger::{ConnectionError, LedgerError};
use thiserror::Error;

/// Outcome of a key operation other than success.
///
/// `Conflict`, `NotFound` and `InvalidRequest` are decided by the
/// orchestration itself and are the caller's to fix. `Connection` and
/// `Internal` carry the underlying ledger failure.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("{0}")]
    Conflict(String),

    #[error("key {id} not found")]
    NotFound { id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("ledger connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("ledger operation failed: {0}")]
    Internal(LedgerError),
}

impl From<LedgerError> for KeyError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidPayload(message) => KeyError::InvalidRequest(message),
            other => KeyError::Internal(other),
        }
    }
}

impl KeyError {
    pub fn not_found(id: impl Into<String>) -> Self {
        KeyError::NotFound { id: id.into() }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            KeyError::Conflict(_) | KeyError::NotFound { .. } | KeyError::InvalidRequest(_)
        )
    }

    /// Metric label for this outcome.
    pub fn outcome(&self) -> &'static str {
        match self {
            KeyError::Conflict(_) => "conflict",
            KeyError::NotFound { .. } => "not_found",
            KeyError::InvalidRequest(_) => "invalid_request",
            KeyError::Connection(_) => "connection_error",
            KeyError::Internal(_) => "internal_error",
        }
    }
}

pub type KeyResult<T> = std::result::Result<T, KeyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use keyledger_ledger::RegistryKind;

    #[test]
    fn test_ledger_errors_are_internal_except_invalid_payload() {
        let err = KeyError::from(LedgerError::Backend("boom".into()));
        assert!(matches!(err, KeyError::Internal(_)));
        assert!(!err.is_client_error());

        let err = KeyError::from(LedgerError::NotFound {
            kind: RegistryKind::Keys,
            id: "k1".into(),
        });
        assert!(matches!(err, KeyError::Internal(_)));

        let err = KeyError::from(LedgerError::InvalidPayload("bad".into()));
        assert!(matches!(err, KeyError::InvalidRequest(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_connection_errors_are_not_client_errors() {
        let err = KeyError::from(ConnectionError::Unreachable("down".into()));
        assert_eq!(err.outcome(), "connection_error");
        assert!(!err.is_client_error());
    }
}
