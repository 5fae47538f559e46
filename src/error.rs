//! Error types for the evidence capture engine.
//!
//! One variant per row of the error-kind table in the component design:
//! callers branch on the kind, never on an embedded string.

use thiserror::Error;

/// Engine error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// AES-GCM tag mismatch on unwrap/decrypt. Never split into
    /// sub-reasons — that would give an attacker an oracle.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Non-monotone segment insert into the Merkle tree or manifest.
    #[error("invalid sequence: {0}")]
    InvalidSequence(String),

    /// Operation attempted on a session that is not `active`.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Retryable upload or ledger failure.
    #[error("transient network error: {0}")]
    NetworkTransient(String),

    /// Non-retryable network failure (e.g. 4xx).
    #[error("fatal network error: {0}")]
    NetworkFatal(String),

    /// Underlying store write failed.
    #[error("store persistence error: {0}")]
    StorePersistence(String),

    /// Ledger returned a revert.
    #[error("ledger rejected update: {0}")]
    LedgerRejected(String),

    /// Manifest or session state failed to serialize.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored bytes failed to deserialize back into a known type.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Input supplied by the caller is structurally invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Anything else; never part of the stable contract callers match on.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::StorePersistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for EngineError {
    fn from(err: redb::Error) -> Self {
        Self::StorePersistence(err.to_string())
    }
}

impl From<redb::DatabaseError> for EngineError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::StorePersistence(err.to_string())
    }
}

impl From<redb::TableError> for EngineError {
    fn from(err: redb::TableError) -> Self {
        Self::StorePersistence(err.to_string())
    }
}

impl From<redb::TransactionError> for EngineError {
    fn from(err: redb::TransactionError) -> Self {
        Self::StorePersistence(err.to_string())
    }
}

impl From<redb::CommitError> for EngineError {
    fn from(err: redb::CommitError) -> Self {
        Self::StorePersistence(err.to_string())
    }
}

impl From<redb::StorageError> for EngineError {
    fn from(err: redb::StorageError) -> Self {
        Self::StorePersistence(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::NetworkTransient(err.to_string())
        } else if err.status().is_some_and(|status| status.is_client_error()) {
            Self::NetworkFatal(err.to_string())
        } else {
            Self::NetworkTransient(err.to_string())
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
