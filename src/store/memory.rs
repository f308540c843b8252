//! In-process store
//!
//! Mirrors the PostgreSQL behaviour the transfer engine relies on:
//! - read committed: other transactions only see committed row versions,
//!   a transaction sees its own pending writes
//! - `for_update` reads and updates take an exclusive row lock held until
//!   commit or rollback; plain reads never block
//! - a lock wait that would close a wait-for cycle fails at once with
//!   [`StoreError::Deadlock`]; the other waiters keep waiting
//! - lock waits are bounded by an optional lock timeout
//! - ledger ids come from a sequence, so rolled back inserts leave gaps
//!
//! Dropping an unfinished [`MemoryTx`] rolls it back, as with sqlx.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{debug, trace};

use super::{AccountStore, LedgerLog, StoreError, Transactional};
use crate::models::{Account, AccountId, LedgerEntry, LedgerEntryId, NewLedgerEntry};
use crate::money::Amount;
use crate::uow::{Handle, Scope};

#[derive(Debug, Clone, Copy)]
struct RowVersion {
    balance: Amount,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RowState {
    committed: Option<RowVersion>,
    /// Uncommitted version and the id of the transaction that wrote it
    pending: Option<(u64, RowVersion)>,
}

struct AccountSlot {
    lock: Arc<RowLock<()>>,
    state: Mutex<RowState>,
}

impl AccountSlot {
    fn new(state: RowState) -> Arc<Self> {
        Arc::new(Self {
            lock: Arc::new(RowLock::new(())),
            state: Mutex::new(state),
        })
    }

    fn committed(&self) -> Option<RowVersion> {
        self.state.lock().committed
    }

    fn visible_to(&self, tx_id: u64) -> Option<RowVersion> {
        let state = self.state.lock();
        match state.pending {
            Some((owner, version)) if owner == tx_id => Some(version),
            _ => state.committed,
        }
    }
}

/// Row lock holders and the row each blocked transaction waits for
#[derive(Default)]
struct WaitGraph {
    holders: HashMap<AccountId, u64>,
    waiting: HashMap<u64, AccountId>,
}

impl WaitGraph {
    /// Whether `tx` waiting for `row` would close a cycle
    fn closes_cycle(&self, tx: u64, mut row: AccountId) -> bool {
        // Each hop follows a distinct waiter
        for _ in 0..=self.waiting.len() {
            let Some(&holder) = self.holders.get(&row) else {
                return false;
            };
            if holder == tx {
                return true;
            }
            match self.waiting.get(&holder) {
                Some(&next) => row = next,
                None => return false,
            }
        }
        false
    }
}

/// Removes a wait edge when the wait ends, including when it is dropped
struct WaitEdge {
    tables: Arc<Tables>,
    tx: u64,
}

impl Drop for WaitEdge {
    fn drop(&mut self) {
        self.tables.wait_graph.lock().waiting.remove(&self.tx);
    }
}

#[derive(Default)]
struct Tables {
    accounts: Mutex<BTreeMap<AccountId, Arc<AccountSlot>>>,
    ledger: Mutex<Vec<LedgerEntry>>,
    wait_graph: Mutex<WaitGraph>,
    account_seq: AtomicI64,
    ledger_seq: AtomicI64,
    tx_seq: AtomicU64,
}

impl Tables {
    fn slot(&self, id: AccountId) -> Option<Arc<AccountSlot>> {
        self.accounts.lock().get(&id).cloned()
    }
}

/// Open transaction on a [`MemoryStore`]
pub struct MemoryTx {
    id: u64,
    tables: Arc<Tables>,
    locks: HashMap<AccountId, OwnedMutexGuard<()>>,
    written: Vec<Arc<AccountSlot>>,
    /// Accounts opened by this transaction
    created: Vec<AccountId>,
    inserted: Vec<LedgerEntry>,
    finished: bool,
}

impl MemoryTx {
    async fn lock_row(
        &mut self,
        id: AccountId,
        slot: &AccountSlot,
        timeout: Option<Duration>,
    ) -> Result<(), StoreError> {
        if self.locks.contains_key(&id) {
            return Ok(());
        }

        let edge = {
            let mut graph = self.tables.wait_graph.lock();
            if let Ok(guard) = slot.lock.clone().try_lock_owned() {
                graph.holders.insert(id, self.id);
                drop(graph);
                trace!(tx = self.id, account = %id, "Row lock acquired");
                self.locks.insert(id, guard);
                return Ok(());
            }
            if graph.closes_cycle(self.id, id) {
                debug!(tx = self.id, account = %id, "Deadlock detected");
                return Err(StoreError::Deadlock);
            }
            graph.waiting.insert(self.id, id);
            WaitEdge {
                tables: self.tables.clone(),
                tx: self.id,
            }
        };

        let acquired = acquire(slot, timeout).await;
        {
            let mut graph = self.tables.wait_graph.lock();
            graph.waiting.remove(&self.id);
            if acquired.is_ok() {
                graph.holders.insert(id, self.id);
            }
        }
        drop(edge);

        let guard = acquired?;
        trace!(tx = self.id, account = %id, "Row lock acquired after wait");
        self.locks.insert(id, guard);
        Ok(())
    }

    fn write(&mut self, slot: &Arc<AccountSlot>, version: RowVersion) {
        slot.state.lock().pending = Some((self.id, version));
        if !self.written.iter().any(|s| Arc::ptr_eq(s, slot)) {
            self.written.push(slot.clone());
        }
    }

    fn finish(&mut self, commit: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        for slot in self.written.drain(..) {
            let mut state = slot.state.lock();
            match state.pending {
                Some((owner, version)) if owner == self.id => {
                    state.pending = None;
                    if commit {
                        state.committed = Some(version);
                    }
                }
                _ => {}
            }
        }
        if commit {
            self.tables.ledger.lock().append(&mut self.inserted);
            self.created.clear();
        } else {
            self.inserted.clear();
            let mut accounts = self.tables.accounts.lock();
            for id in self.created.drain(..) {
                accounts.remove(&id);
            }
        }

        {
            let mut graph = self.tables.wait_graph.lock();
            for id in self.locks.keys() {
                if graph.holders.get(id) == Some(&self.id) {
                    graph.holders.remove(id);
                }
            }
        }
        // Row locks go last so waiters observe the final committed versions
        self.locks.clear();
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            debug!(tx = self.id, "Dropping unfinished transaction, rolling back");
            self.finish(false);
        }
    }
}

async fn acquire(
    slot: &AccountSlot,
    timeout: Option<Duration>,
) -> Result<OwnedMutexGuard<()>, StoreError> {
    let lock = slot.lock.clone();
    match timeout {
        Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout),
        None => Ok(lock.lock_owned().await),
    }
}

/// Thread-safe in-memory accounts and ledger tables
#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
    lock_timeout: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every row-lock wait; an expired wait fails with
    /// [`StoreError::LockTimeout`]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Number of committed ledger entries
    pub fn ledger_len(&self) -> usize {
        self.tables.ledger.lock().len()
    }

    /// Sum of all committed balances
    pub fn total_balance(&self) -> i128 {
        self.tables
            .accounts
            .lock()
            .values()
            .filter_map(|slot| slot.committed())
            .map(|v| v.balance.minor_units() as i128)
            .sum()
    }
}

#[async_trait]
impl Transactional for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let id = self.tables.tx_seq.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(tx = id, "Begin");
        Ok(MemoryTx {
            id,
            tables: self.tables.clone(),
            locks: HashMap::new(),
            written: Vec::new(),
            created: Vec::new(),
            inserted: Vec::new(),
            finished: false,
        })
    }

    async fn commit(&self, mut tx: MemoryTx) -> Result<(), StoreError> {
        trace!(tx = tx.id, "Commit");
        tx.finish(true);
        Ok(())
    }

    async fn rollback(&self, mut tx: MemoryTx) -> Result<(), StoreError> {
        trace!(tx = tx.id, "Rollback");
        tx.finish(false);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_balance(
        &self,
        scope: &Scope<MemoryTx>,
        id: AccountId,
        for_update: bool,
    ) -> Result<Option<Amount>, StoreError> {
        let slot = self.tables.slot(id);
        match scope.handle().await {
            Handle::Tx(mut tx) => {
                let Some(slot) = slot else {
                    return Ok(None);
                };
                if for_update {
                    tx.lock_row(id, &slot, self.lock_timeout).await?;
                }
                Ok(slot.visible_to(tx.id).map(|v| v.balance))
            }
            Handle::Default => {
                if for_update {
                    return Err(StoreError::LockOutsideTransaction);
                }
                Ok(slot.and_then(|s| s.committed()).map(|v| v.balance))
            }
        }
    }

    async fn adjust_balance(
        &self,
        scope: &Scope<MemoryTx>,
        id: AccountId,
        delta: Amount,
    ) -> Result<(), StoreError> {
        let slot = self.tables.slot(id).ok_or(StoreError::RowNotFound(id))?;
        let adjust = |current: RowVersion| -> Result<RowVersion, StoreError> {
            let balance = current
                .balance
                .checked_add(delta)
                .ok_or(StoreError::Overflow(id))?;
            Ok(RowVersion {
                balance,
                updated_at: Utc::now(),
            })
        };

        match scope.handle().await {
            Handle::Tx(mut tx) => {
                tx.lock_row(id, &slot, self.lock_timeout).await?;
                let current = slot.visible_to(tx.id).ok_or(StoreError::RowNotFound(id))?;
                let next = adjust(current)?;
                tx.write(&slot, next);
            }
            Handle::Default => {
                let _row = acquire(&slot, self.lock_timeout).await?;
                let mut state = slot.state.lock();
                let current = state.committed.ok_or(StoreError::RowNotFound(id))?;
                state.committed = Some(adjust(current)?);
            }
        }
        Ok(())
    }

    async fn exists(&self, scope: &Scope<MemoryTx>, id: AccountId) -> Result<bool, StoreError> {
        let Some(slot) = self.tables.slot(id) else {
            return Ok(false);
        };
        Ok(match scope.handle().await {
            Handle::Tx(tx) => slot.visible_to(tx.id).is_some(),
            Handle::Default => slot.committed().is_some(),
        })
    }

    async fn open_account(
        &self,
        scope: &Scope<MemoryTx>,
        initial_balance: Amount,
    ) -> Result<AccountId, StoreError> {
        let id = AccountId(self.tables.account_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let version = RowVersion {
            balance: initial_balance,
            updated_at: Utc::now(),
        };

        match scope.handle().await {
            Handle::Tx(mut tx) => {
                let slot = AccountSlot::new(RowState::default());
                self.tables.accounts.lock().insert(id, slot.clone());
                tx.created.push(id);
                tx.lock_row(id, &slot, self.lock_timeout).await?;
                tx.write(&slot, version);
            }
            Handle::Default => {
                let slot = AccountSlot::new(RowState {
                    committed: Some(version),
                    pending: None,
                });
                self.tables.accounts.lock().insert(id, slot);
            }
        }
        Ok(id)
    }

    async fn get_account(
        &self,
        scope: &Scope<MemoryTx>,
        id: AccountId,
    ) -> Result<Option<Account>, StoreError> {
        let Some(slot) = self.tables.slot(id) else {
            return Ok(None);
        };
        let version = match scope.handle().await {
            Handle::Tx(tx) => slot.visible_to(tx.id),
            Handle::Default => slot.committed(),
        };
        Ok(version.map(|v| Account {
            id,
            balance: v.balance,
            updated_at: v.updated_at,
        }))
    }
}

#[async_trait]
impl LedgerLog for MemoryStore {
    async fn append(
        &self,
        scope: &Scope<MemoryTx>,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, StoreError> {
        let record = LedgerEntry {
            id: LedgerEntryId(self.tables.ledger_seq.fetch_add(1, Ordering::Relaxed) + 1),
            from: entry.from,
            to: entry.to,
            amount: entry.amount,
            created_at: Utc::now(),
        };
        match scope.handle().await {
            Handle::Tx(mut tx) => tx.inserted.push(record.clone()),
            Handle::Default => self.tables.ledger.lock().push(record.clone()),
        }
        Ok(record)
    }

    async fn entries_for(
        &self,
        scope: &Scope<MemoryTx>,
        account: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries: Vec<LedgerEntry> = self
            .tables
            .ledger
            .lock()
            .iter()
            .filter(|e| e.touches(account))
            .cloned()
            .collect();
        if let Handle::Tx(tx) = scope.handle().await {
            entries.extend(tx.inserted.iter().filter(|e| e.touches(account)).cloned());
        }
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }
}
