//! Storage Error Types
//!
//! Infrastructure failures raised by the storage backends. Business-rule
//! failures never appear here; they belong to the transfer layer.

use thiserror::Error;

use crate::models::AccountId;

/// PostgreSQL SQLSTATE codes with a dedicated variant
pub(crate) mod sqlstate {
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("Lock wait timed out")]
    LockTimeout,

    #[error("Deadlock detected")]
    Deadlock,

    #[error("Serialization failure")]
    SerializationFailure,

    #[error("Statement timed out")]
    StatementTimeout,

    #[error("Account not found: {0}")]
    RowNotFound(AccountId),

    #[error("Row lock requested outside a transaction")]
    LockOutsideTransaction,

    #[error("Balance overflow on account {0}")]
    Overflow(AccountId),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// True for failures that may succeed when the whole unit of work is retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_)
                | StoreError::PoolTimeout
                | StoreError::LockTimeout
                | StoreError::Deadlock
                | StoreError::SerializationFailure
                | StoreError::StatementTimeout
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => StoreError::PoolTimeout,
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
                StoreError::Connection(e.to_string())
            }
            sqlx::Error::Database(ref db) => match db.code().as_deref() {
                Some(sqlstate::DEADLOCK_DETECTED) => StoreError::Deadlock,
                Some(sqlstate::SERIALIZATION_FAILURE) => StoreError::SerializationFailure,
                Some(sqlstate::LOCK_NOT_AVAILABLE) => StoreError::LockTimeout,
                Some(sqlstate::QUERY_CANCELED) => StoreError::StatementTimeout,
                _ => StoreError::Database(e.to_string()),
            },
            other => StoreError::Database(other.to_string()),
        }
    }
}
