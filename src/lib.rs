//! Account Ledger - transactional account-to-account transfers
//!
//! Balances live in an accounts table; every committed transfer appends one
//! row to an append-only ledger. A transfer's balance changes and its ledger
//! entry commit together or not at all.
//!
//! # Modules
//!
//! - [`money`] - Minor-unit amounts and decimal parsing
//! - [`models`] - Accounts, ledger entries, transfer requests
//! - [`uow`] - Call scope and unit-of-work coordinator
//! - [`store`] - Account store and ledger log backends
//! - [`transfer`] - Transfer engine, error taxonomy, retry policy
//! - [`config`] - YAML configuration with environment overrides
//! - [`db`] - PostgreSQL pool bootstrap and migrations
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod money;
pub mod store;
pub mod transfer;
pub mod uow;

// Convenient re-exports at crate root
pub use models::{Account, AccountId, LedgerEntry, LedgerEntryId, NewLedgerEntry, TransferRequest};
pub use money::{Amount, MoneyError};
pub use store::{AccountStore, LedgerLog, MemoryStore, PgStore, StoreError, Transactional};
pub use transfer::{ErrorKind, LockOrdering, RetryPolicy, TransferEngine, TransferError};
pub use uow::{Handle, Scope, TxCoordinator, UnitOfWorkError};
