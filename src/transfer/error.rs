//! Transfer Error Types
//!
//! One closed enum for every way a transfer can fail, plus the
//! classification callers use to pick a policy (retry only infrastructure
//! failures, never business-rule failures).

use thiserror::Error;

use crate::store::StoreError;
use crate::uow::UnitOfWorkError;

/// Error taxonomy category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rejected before any transaction was opened
    Validation,
    NotFound,
    BusinessRule,
    Infrastructure,
    /// Caller scope cancelled or timed out
    Cancellation,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Source and destination account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    // === Account Errors ===
    #[error("Source account not found")]
    SourceNotFound,

    #[error("Destination account not found")]
    DestNotFound,

    #[error("Account not found")]
    AccountNotFound,

    #[error("Insufficient funds")]
    InsufficientFunds,

    // === Infrastructure Errors ===
    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Failed to begin transaction: {0}")]
    BeginFailed(StoreError),

    #[error("Failed to commit transaction: {0}")]
    CommitFailed(StoreError),

    #[error("Transaction handle escaped its unit of work")]
    HandleEscaped,

    #[error("Amount would cause overflow")]
    Overflow,

    // === Cancellation ===
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    TimedOut,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::SameAccount | TransferError::InvalidAmount => ErrorKind::Validation,
            TransferError::SourceNotFound
            | TransferError::DestNotFound
            | TransferError::AccountNotFound => ErrorKind::NotFound,
            TransferError::InsufficientFunds => ErrorKind::BusinessRule,
            TransferError::Store(_)
            | TransferError::BeginFailed(_)
            | TransferError::CommitFailed(_)
            | TransferError::HandleEscaped
            | TransferError::Overflow => ErrorKind::Infrastructure,
            TransferError::Cancelled | TransferError::TimedOut => ErrorKind::Cancellation,
        }
    }

    /// True if re-running the whole transfer may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Store(e) | TransferError::BeginFailed(e) => e.is_transient(),
            // The commit outcome is unknown for a lost connection; only a
            // reported serialization/deadlock abort is known to be rolled back.
            TransferError::CommitFailed(e) => matches!(
                e,
                StoreError::Deadlock | StoreError::SerializationFailure
            ),
            _ => false,
        }
    }

    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::SourceNotFound => "SOURCE_ACCOUNT_NOT_FOUND",
            TransferError::DestNotFound => "DEST_ACCOUNT_NOT_FOUND",
            TransferError::AccountNotFound => "ACCOUNT_NOT_FOUND",
            TransferError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            TransferError::Store(_) => "STORAGE_ERROR",
            TransferError::BeginFailed(_) => "BEGIN_FAILED",
            TransferError::CommitFailed(_) => "COMMIT_FAILED",
            TransferError::HandleEscaped => "HANDLE_ESCAPED",
            TransferError::Overflow => "OVERFLOW",
            TransferError::Cancelled => "CANCELLED",
            TransferError::TimedOut => "TIMED_OUT",
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overflow(_) => TransferError::Overflow,
            other => TransferError::Store(other),
        }
    }
}

impl From<UnitOfWorkError> for TransferError {
    fn from(e: UnitOfWorkError) -> Self {
        match e {
            UnitOfWorkError::Begin(e) => TransferError::BeginFailed(e),
            UnitOfWorkError::Commit(e) => TransferError::CommitFailed(e),
            UnitOfWorkError::Cancelled => TransferError::Cancelled,
            UnitOfWorkError::TimedOut => TransferError::TimedOut,
            UnitOfWorkError::HandleEscaped => TransferError::HandleEscaped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(TransferError::SameAccount.kind(), ErrorKind::Validation);
        assert_eq!(TransferError::InvalidAmount.kind(), ErrorKind::Validation);
        assert_eq!(TransferError::SourceNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(TransferError::DestNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            TransferError::InsufficientFunds.kind(),
            ErrorKind::BusinessRule
        );
        assert_eq!(
            TransferError::CommitFailed(StoreError::Connection("reset".into())).kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(TransferError::TimedOut.kind(), ErrorKind::Cancellation);
    }

    #[test]
    fn test_only_transient_infrastructure_is_retryable() {
        assert!(TransferError::Store(StoreError::LockTimeout).is_retryable());
        assert!(TransferError::BeginFailed(StoreError::PoolTimeout).is_retryable());
        assert!(TransferError::CommitFailed(StoreError::SerializationFailure).is_retryable());
        assert!(!TransferError::CommitFailed(StoreError::Connection("eof".into())).is_retryable());
        assert!(!TransferError::Store(StoreError::Database("syntax".into())).is_retryable());
        assert!(!TransferError::InsufficientFunds.is_retryable());
        assert!(!TransferError::SameAccount.is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            TransferError::from(StoreError::Overflow(crate::models::AccountId(1))),
            TransferError::Overflow
        );
        assert_eq!(
            TransferError::from(UnitOfWorkError::Commit(StoreError::Deadlock)),
            TransferError::CommitFailed(StoreError::Deadlock)
        );
        assert_eq!(
            TransferError::from(UnitOfWorkError::Cancelled),
            TransferError::Cancelled
        );
    }

    #[test]
    fn test_codes_and_display() {
        assert_eq!(TransferError::SameAccount.code(), "SAME_ACCOUNT");
        assert_eq!(TransferError::InsufficientFunds.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(
            TransferError::InsufficientFunds.to_string(),
            "Insufficient funds"
        );
    }
}
