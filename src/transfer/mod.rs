//! Account-to-account transfers
//!
//! # Architecture
//!
//! ```text
//! TransferEngine ──▶ TxCoordinator::run_in_transaction ──▶ AccountStore
//!                                                      └─▶ LedgerLog
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Validate first**: same-account and non-positive amounts are rejected
//!    before a transaction is opened
//! 2. **Lock before decide**: the source balance is read `FOR UPDATE`
//! 3. **All or nothing**: balances and the ledger entry commit together
//! 4. **No hidden retries**: retry is a caller policy ([`RetryPolicy`])

pub mod engine;
pub mod error;
pub mod retry;

pub use engine::{LockOrdering, TransferEngine};
pub use error::{ErrorKind, TransferError};
pub use retry::RetryPolicy;
