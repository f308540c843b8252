//! Shared test doubles

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Barrier;

use account_ledger::store::memory::MemoryTx;
use account_ledger::{
    Account, AccountId, AccountStore, Amount, LedgerEntry, LedgerLog, MemoryStore, NewLedgerEntry,
    Scope, StoreError, Transactional, TransferEngine,
};

pub type MemScope = Scope<MemoryTx>;

/// MemoryStore wrapper that counts calls and injects begin/commit/rollback
/// failures
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    /// Every `for_update` read waits here once its row lock is held
    pub after_row_lock: Option<Arc<Barrier>>,
    pub begins: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn begin_count(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transactional for FailingStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected begin failure".to_string()));
        }
        self.inner.begin().await
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), StoreError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            // The server aborted the transaction; nothing becomes visible
            self.inner.rollback(tx).await?;
            return Err(StoreError::Connection("injected commit failure".to_string()));
        }
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), StoreError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.fail_rollback.load(Ordering::SeqCst) {
            // The connection dropped; the server discards the transaction
            self.inner.rollback(tx).await?;
            return Err(StoreError::Connection("injected rollback failure".to_string()));
        }
        self.inner.rollback(tx).await
    }
}

#[async_trait]
impl AccountStore for FailingStore {
    async fn get_balance(
        &self,
        scope: &MemScope,
        id: AccountId,
        for_update: bool,
    ) -> Result<Option<Amount>, StoreError> {
        self.touch();
        let balance = self.inner.get_balance(scope, id, for_update).await?;
        if let (true, Some(barrier)) = (for_update, &self.after_row_lock) {
            barrier.wait().await;
        }
        Ok(balance)
    }

    async fn adjust_balance(
        &self,
        scope: &MemScope,
        id: AccountId,
        delta: Amount,
    ) -> Result<(), StoreError> {
        self.touch();
        self.inner.adjust_balance(scope, id, delta).await
    }

    async fn exists(&self, scope: &MemScope, id: AccountId) -> Result<bool, StoreError> {
        self.touch();
        self.inner.exists(scope, id).await
    }

    async fn open_account(
        &self,
        scope: &MemScope,
        initial_balance: Amount,
    ) -> Result<AccountId, StoreError> {
        self.inner.open_account(scope, initial_balance).await
    }

    async fn get_account(
        &self,
        scope: &MemScope,
        id: AccountId,
    ) -> Result<Option<Account>, StoreError> {
        self.touch();
        self.inner.get_account(scope, id).await
    }
}

#[async_trait]
impl LedgerLog for FailingStore {
    async fn append(
        &self,
        scope: &MemScope,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, StoreError> {
        self.touch();
        self.inner.append(scope, entry).await
    }

    async fn entries_for(
        &self,
        scope: &MemScope,
        account: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.touch();
        self.inner.entries_for(scope, account).await
    }
}

pub fn amount(units: i64) -> Amount {
    Amount::from_minor(units)
}

/// Engine over a fresh store with one account per entry in `balances`
pub async fn engine_with_accounts<S>(
    store: S,
    balances: &[i64],
) -> (TransferEngine<S>, Vec<AccountId>)
where
    S: AccountStore + LedgerLog + 'static,
{
    let engine = TransferEngine::new(Arc::new(store));
    let mut ids = Vec::with_capacity(balances.len());
    for &balance in balances {
        let id = engine
            .open_account(&Scope::new(), amount(balance))
            .await
            .expect("open account");
        ids.push(id);
    }
    (engine, ids)
}

pub async fn balance_of<S>(engine: &TransferEngine<S>, id: AccountId) -> i64
where
    S: AccountStore + LedgerLog + 'static,
{
    engine
        .balance(&Scope::new(), id)
        .await
        .expect("balance")
        .minor_units()
}

pub async fn entries_of<S>(engine: &TransferEngine<S>, id: AccountId) -> Vec<LedgerEntry>
where
    S: AccountStore + LedgerLog + 'static,
{
    engine
        .history(&Scope::new(), id)
        .await
        .expect("history")
}
