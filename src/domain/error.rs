//! Error types for the crank service.
//!
//! Retryability is decided by [`ErrorKind`], computed once where errors enter
//! the system (the RPC boundary), never by re-parsing message text at call
//! sites.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from the embedded operation store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(e.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(e.to_string())
            }
            _ => StoreError::Query(e.to_string()),
        }
    }
}

/// Errors from the chain collaborator (RPC endpoints, transaction submission)
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected by program: {0}")]
    Rejected(String),

    #[error("Malformed account data at {address}: {reason}")]
    MalformedAccount { address: String, reason: String },

    #[error("RPC error: {0}")]
    Rpc(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Closed classification of failures, decided at the collaborator boundary.
///
/// Only the connectivity kinds count toward endpoint failover; a program
/// validly rejecting an instruction says nothing about endpoint health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NetworkTimeout,
    ConnectionReset,
    ServiceUnavailable,
    Rejected,
    Unknown,
}

impl ErrorKind {
    /// True for kinds that count toward consecutive-failure failover
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout | ErrorKind::ConnectionReset | ErrorKind::ServiceUnavailable
        )
    }

    /// True for failures worth another submission attempt
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_connectivity() || matches!(self, ErrorKind::Unknown)
    }
}

impl AppError {
    /// Classify this error into the closed [`ErrorKind`] set.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Chain(ChainError::Timeout(_)) => ErrorKind::NetworkTimeout,
            AppError::Chain(ChainError::Connection(_)) => ErrorKind::ConnectionReset,
            AppError::Chain(ChainError::Unavailable(_)) => ErrorKind::ServiceUnavailable,
            AppError::Chain(ChainError::Rejected(_))
            | AppError::Chain(ChainError::MalformedAccount { .. }) => ErrorKind::Rejected,
            _ => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_kinds_count_toward_failover() {
        assert!(ErrorKind::NetworkTimeout.is_connectivity());
        assert!(ErrorKind::ConnectionReset.is_connectivity());
        assert!(ErrorKind::ServiceUnavailable.is_connectivity());
        assert!(!ErrorKind::Rejected.is_connectivity());
        assert!(!ErrorKind::Unknown.is_connectivity());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        assert!(!ErrorKind::Rejected.is_retryable());
        assert!(ErrorKind::NetworkTimeout.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_classification_from_chain_errors() {
        let timeout = AppError::Chain(ChainError::Timeout("deadline".into()));
        assert_eq!(timeout.kind(), ErrorKind::NetworkTimeout);

        let rejected = AppError::Chain(ChainError::Rejected("stale state".into()));
        assert_eq!(rejected.kind(), ErrorKind::Rejected);

        let store = AppError::Store(StoreError::Query("locked".into()));
        assert_eq!(store.kind(), ErrorKind::Unknown);
    }
}
