//! Storage layer
//!
//! Leaf data-access operations over the `accounts` and `ledger_entries`
//! tables. Every operation takes the caller's [`Scope`]: when the scope
//! carries a transaction the statement runs inside it, otherwise it runs on
//! the backend's autocommit pool.
//!
//! Two backends implement the traits:
//! - [`postgres::PgStore`] - PostgreSQL via sqlx
//! - [`memory::MemoryStore`] - in-process, same locking and visibility rules

pub mod error;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::{Account, AccountId, LedgerEntry, NewLedgerEntry};
use crate::money::Amount;
use crate::uow::Scope;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Begin/commit/rollback of a backend transaction
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Open transaction handle. Dropping it without commit rolls it back.
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;
}

/// Account table operations
#[async_trait]
pub trait AccountStore: Transactional {
    /// Read an account balance.
    ///
    /// With `for_update` the row is locked exclusively until the scope's
    /// transaction ends. Requesting a lock on a scope without a transaction
    /// fails with [`StoreError::LockOutsideTransaction`].
    async fn get_balance(
        &self,
        scope: &Scope<Self::Tx>,
        id: AccountId,
        for_update: bool,
    ) -> Result<Option<Amount>, StoreError>;

    /// Apply a signed adjustment and refresh `updated_at`.
    ///
    /// Does not check that the result stays non-negative.
    async fn adjust_balance(
        &self,
        scope: &Scope<Self::Tx>,
        id: AccountId,
        delta: Amount,
    ) -> Result<(), StoreError>;

    async fn exists(&self, scope: &Scope<Self::Tx>, id: AccountId) -> Result<bool, StoreError>;

    async fn open_account(
        &self,
        scope: &Scope<Self::Tx>,
        initial_balance: Amount,
    ) -> Result<AccountId, StoreError>;

    async fn get_account(
        &self,
        scope: &Scope<Self::Tx>,
        id: AccountId,
    ) -> Result<Option<Account>, StoreError>;
}

/// Append-only transfer log
#[async_trait]
pub trait LedgerLog: Transactional {
    async fn append(
        &self,
        scope: &Scope<Self::Tx>,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, StoreError>;

    /// Entries debiting or crediting `account`, oldest first
    async fn entries_for(
        &self,
        scope: &Scope<Self::Tx>,
        account: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;
}
