//! Transfer Engine
//!
//! Moves an amount between two accounts as one unit of work:
//!
//! ```text
//! validate ─▶ begin ─▶ lock+read source ─▶ check funds ─▶ check destination
//!                      ─▶ debit ─▶ credit ─▶ append ledger entry ─▶ commit
//! ```
//!
//! Any failure after `begin` rolls back every write.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{ErrorKind, TransferError};
use crate::models::{AccountId, LedgerEntry, LedgerEntryId, NewLedgerEntry, TransferRequest};
use crate::money::Amount;
use crate::store::{AccountStore, LedgerLog};
use crate::uow::{Scope, TxCoordinator};

/// Which rows a transfer locks before deciding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOrdering {
    /// Lock the source row only. The destination is write-locked by its
    /// update, so opposite transfers over the same pair can deadlock; the
    /// store aborts one of them with a transient error.
    #[default]
    SourceOnly,
    /// Lock both rows in ascending id order before reading either balance
    Canonical,
}

pub struct TransferEngine<S> {
    coordinator: TxCoordinator<S>,
    lock_ordering: LockOrdering,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            lock_ordering: self.lock_ordering,
        }
    }
}

impl<S> TransferEngine<S>
where
    S: AccountStore + LedgerLog + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            coordinator: TxCoordinator::new(store),
            lock_ordering: LockOrdering::default(),
        }
    }

    pub fn with_lock_ordering(mut self, lock_ordering: LockOrdering) -> Self {
        self.lock_ordering = lock_ordering;
        self
    }

    pub fn coordinator(&self) -> &TxCoordinator<S> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<S> {
        self.coordinator.store()
    }

    /// Fresh root scope for this engine's backend
    pub fn scope(&self) -> Scope<S::Tx> {
        Scope::new()
    }

    /// Move `amount` from `from` to `to`, returning the new ledger entry id
    pub async fn transfer(
        &self,
        scope: &Scope<S::Tx>,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> Result<LedgerEntryId, TransferError> {
        let req = TransferRequest::new(from, to, amount);
        validate(&req)?;

        let store = self.store();
        let ordering = self.lock_ordering;
        let result = self
            .coordinator
            .run_in_transaction(scope, |scope| async move {
                execute(store.as_ref(), &scope, req, ordering).await
            })
            .await;

        match &result {
            Ok(entry_id) => info!(
                from = %from,
                to = %to,
                amount = %amount,
                entry_id = %entry_id,
                "Transfer committed"
            ),
            Err(e) if e.kind() == ErrorKind::Infrastructure => warn!(
                from = %from,
                to = %to,
                amount = %amount,
                error = %e,
                "Transfer failed"
            ),
            Err(e) => debug!(
                from = %from,
                to = %to,
                amount = %amount,
                code = e.code(),
                "Transfer rejected"
            ),
        }
        result
    }

    /// Current balance. Reads through the scope's transaction if it has one.
    pub async fn balance(
        &self,
        scope: &Scope<S::Tx>,
        id: AccountId,
    ) -> Result<Amount, TransferError> {
        self.store()
            .get_balance(scope, id, false)
            .await?
            .ok_or(TransferError::AccountNotFound)
    }

    /// Ledger entries touching `id`, oldest first
    pub async fn history(
        &self,
        scope: &Scope<S::Tx>,
        id: AccountId,
    ) -> Result<Vec<LedgerEntry>, TransferError> {
        if !self.store().exists(scope, id).await? {
            return Err(TransferError::AccountNotFound);
        }
        Ok(self.store().entries_for(scope, id).await?)
    }

    /// Create an account holding `initial_balance`
    pub async fn open_account(
        &self,
        scope: &Scope<S::Tx>,
        initial_balance: Amount,
    ) -> Result<AccountId, TransferError> {
        if initial_balance < Amount::ZERO {
            return Err(TransferError::InvalidAmount);
        }
        let id = self.store().open_account(scope, initial_balance).await?;
        info!(account = %id, balance = %initial_balance, "Account opened");
        Ok(id)
    }
}

fn validate(req: &TransferRequest) -> Result<(), TransferError> {
    if req.from == req.to {
        return Err(TransferError::SameAccount);
    }
    if !req.amount.is_positive() {
        return Err(TransferError::InvalidAmount);
    }
    Ok(())
}

/// Transfer body; runs inside the unit of work bound to `scope`
async fn execute<S>(
    store: &S,
    scope: &Scope<S::Tx>,
    req: TransferRequest,
    ordering: LockOrdering,
) -> Result<LedgerEntryId, TransferError>
where
    S: AccountStore + LedgerLog,
{
    let (source_balance, dest_exists) = match ordering {
        LockOrdering::SourceOnly => {
            let source = store.get_balance(scope, req.from, true).await?;
            let source = source.ok_or(TransferError::SourceNotFound)?;
            (source, store.exists(scope, req.to).await?)
        }
        LockOrdering::Canonical => {
            let (first, second) = if req.from < req.to {
                (req.from, req.to)
            } else {
                (req.to, req.from)
            };
            let first_balance = store.get_balance(scope, first, true).await?;
            let second_balance = store.get_balance(scope, second, true).await?;
            let (source, dest) = if first == req.from {
                (first_balance, second_balance)
            } else {
                (second_balance, first_balance)
            };
            (source.ok_or(TransferError::SourceNotFound)?, dest.is_some())
        }
    };

    if source_balance < req.amount {
        return Err(TransferError::InsufficientFunds);
    }
    if !dest_exists {
        return Err(TransferError::DestNotFound);
    }

    let debit = req.amount.checked_neg().ok_or(TransferError::Overflow)?;
    store.adjust_balance(scope, req.from, debit).await?;
    store.adjust_balance(scope, req.to, req.amount).await?;

    let entry = store.append(scope, NewLedgerEntry::from(req)).await?;
    debug!(entry_id = %entry.id, "Ledger entry appended");
    Ok(entry.id)
}
