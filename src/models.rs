//! Account and ledger records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::money::Amount;

/// Store-assigned account identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned ledger entry identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerEntryId(pub i64);

impl fmt::Display for LedgerEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row of the accounts table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Amount,
    pub updated_at: DateTime<Utc>,
}

/// Transfer parameters as received from the caller. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Amount) -> Self {
        Self { from, to, amount }
    }
}

/// Ledger row to be appended; the store assigns `id` and `created_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
}

impl From<TransferRequest> for NewLedgerEntry {
    fn from(req: TransferRequest) -> Self {
        Self {
            from: req.from,
            to: req.to,
            amount: req.amount,
        }
    }
}

/// Immutable audit record of a committed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// True if the entry debits or credits `account`
    pub fn touches(&self, account: AccountId) -> bool {
        self.from == account || self.to == account
    }
}
