//! PostgreSQL store
//!
//! Every transaction runs at READ COMMITTED. Row locks come from
//! `SELECT ... FOR UPDATE` and from `UPDATE` itself; both are held until the
//! transaction ends. An optional `lock_timeout` bounds each lock wait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use super::error::sqlstate;
use super::{AccountStore, LedgerLog, StoreError, Transactional};
use crate::models::{Account, AccountId, LedgerEntry, LedgerEntryId, NewLedgerEntry};
use crate::money::Amount;
use crate::uow::{Handle, Scope};

#[derive(Debug, FromRow)]
struct AccountRow {
    id: i64,
    balance: i64,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: AccountId(row.id),
            balance: Amount::from_minor(row.balance),
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    id: i64,
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            id: LedgerEntryId(row.id),
            from: AccountId(row.from_account_id),
            to: AccountId(row.to_account_id),
            amount: Amount::from_minor(row.amount),
            created_at: row.created_at,
        }
    }
}

/// Accounts and ledger backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Applied with `SET LOCAL lock_timeout` at the start of every transaction
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_out_of_range(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE),
        _ => false,
    }
}

#[async_trait]
impl Transactional for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;
        if let Some(timeout) = self.lock_timeout {
            // SET does not take bind parameters
            sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get_balance(
        &self,
        scope: &Scope<Self::Tx>,
        id: AccountId,
        for_update: bool,
    ) -> Result<Option<Amount>, StoreError> {
        let sql = if for_update {
            "SELECT balance FROM accounts WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT balance FROM accounts WHERE id = $1"
        };
        let query = sqlx::query_scalar::<_, i64>(sql).bind(id.0);

        let balance = match scope.handle().await {
            Handle::Tx(mut tx) => query.fetch_optional(&mut **tx).await?,
            Handle::Default if for_update => return Err(StoreError::LockOutsideTransaction),
            Handle::Default => query.fetch_optional(&self.pool).await?,
        };
        Ok(balance.map(Amount::from_minor))
    }

    async fn adjust_balance(
        &self,
        scope: &Scope<Self::Tx>,
        id: AccountId,
        delta: Amount,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"UPDATE accounts SET balance = balance + $1, updated_at = NOW()
               WHERE id = $2"#,
        )
        .bind(delta.minor_units())
        .bind(id.0);

        let result = match scope.handle().await {
            Handle::Tx(mut tx) => query.execute(&mut **tx).await,
            Handle::Default => query.execute(&self.pool).await,
        };
        let result = match result {
            Ok(result) => result,
            Err(e) if is_out_of_range(&e) => return Err(StoreError::Overflow(id)),
            Err(e) => return Err(e.into()),
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound(id));
        }
        Ok(())
    }

    async fn exists(&self, scope: &Scope<Self::Tx>, id: AccountId) -> Result<bool, StoreError> {
        let query =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
                .bind(id.0);

        let found = match scope.handle().await {
            Handle::Tx(mut tx) => query.fetch_one(&mut **tx).await?,
            Handle::Default => query.fetch_one(&self.pool).await?,
        };
        Ok(found)
    }

    async fn open_account(
        &self,
        scope: &Scope<Self::Tx>,
        initial_balance: Amount,
    ) -> Result<AccountId, StoreError> {
        let query = sqlx::query_scalar::<_, i64>(
            "INSERT INTO accounts (balance) VALUES ($1) RETURNING id",
        )
        .bind(initial_balance.minor_units());

        let id = match scope.handle().await {
            Handle::Tx(mut tx) => query.fetch_one(&mut **tx).await?,
            Handle::Default => query.fetch_one(&self.pool).await?,
        };
        tracing::debug!(account = id, "Account opened");
        Ok(AccountId(id))
    }

    async fn get_account(
        &self,
        scope: &Scope<Self::Tx>,
        id: AccountId,
    ) -> Result<Option<Account>, StoreError> {
        let query = sqlx::query_as::<_, AccountRow>(
            "SELECT id, balance, updated_at FROM accounts WHERE id = $1",
        )
        .bind(id.0);

        let row = match scope.handle().await {
            Handle::Tx(mut tx) => query.fetch_optional(&mut **tx).await?,
            Handle::Default => query.fetch_optional(&self.pool).await?,
        };
        Ok(row.map(Account::from))
    }
}

#[async_trait]
impl LedgerLog for PgStore {
    async fn append(
        &self,
        scope: &Scope<Self::Tx>,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, StoreError> {
        let query = sqlx::query_as::<_, LedgerRow>(
            r#"INSERT INTO ledger_entries (from_account_id, to_account_id, amount)
               VALUES ($1, $2, $3)
               RETURNING id, from_account_id, to_account_id, amount, created_at"#,
        )
        .bind(entry.from.0)
        .bind(entry.to.0)
        .bind(entry.amount.minor_units());

        let row = match scope.handle().await {
            Handle::Tx(mut tx) => query.fetch_one(&mut **tx).await?,
            Handle::Default => query.fetch_one(&self.pool).await?,
        };
        Ok(row.into())
    }

    async fn entries_for(
        &self,
        scope: &Scope<Self::Tx>,
        account: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let query = sqlx::query_as::<_, LedgerRow>(
            r#"SELECT id, from_account_id, to_account_id, amount, created_at
               FROM ledger_entries
               WHERE from_account_id = $1 OR to_account_id = $1
               ORDER BY id"#,
        )
        .bind(account.0);

        let rows = match scope.handle().await {
            Handle::Tx(mut tx) => query.fetch_all(&mut **tx).await?,
            Handle::Default => query.fetch_all(&self.pool).await?,
        };
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferError;
    use crate::uow::TxCoordinator;
    use std::sync::Arc;

    // Run with: DATABASE_URL=postgres://... cargo test -- --ignored

    async fn connect() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("Failed to connect");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to migrate");
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_open_read_adjust() {
        let store = connect().await;
        let scope = Scope::new();
        let id = store
            .open_account(&scope, Amount::from_minor(100))
            .await
            .unwrap();

        store
            .adjust_balance(&scope, id, Amount::from_minor(-25))
            .await
            .unwrap();
        assert_eq!(
            store.get_balance(&scope, id, false).await.unwrap(),
            Some(Amount::from_minor(75))
        );
        assert!(store.exists(&scope, id).await.unwrap());
        assert_eq!(
            store.get_balance(&scope, id, true).await,
            Err(StoreError::LockOutsideTransaction)
        );
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_adjust_missing_row() {
        let store = connect().await;
        let missing = AccountId(i64::MAX);
        assert_eq!(
            store
                .adjust_balance(&Scope::new(), missing, Amount::from_minor(1))
                .await,
            Err(StoreError::RowNotFound(missing))
        );
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_rollback_discards_writes() {
        let store = Arc::new(connect().await);
        let root = Scope::new();
        let id = store
            .open_account(&root, Amount::from_minor(50))
            .await
            .unwrap();
        let other = store
            .open_account(&root, Amount::ZERO)
            .await
            .unwrap();
        let coordinator = TxCoordinator::new(store.clone());

        let writer = store.clone();
        let result: Result<(), TransferError> = coordinator
            .run_in_transaction(&root, |scope| async move {
                writer
                    .adjust_balance(&scope, id, Amount::from_minor(-50))
                    .await?;
                writer
                    .append(
                        &scope,
                        NewLedgerEntry {
                            from: id,
                            to: other,
                            amount: Amount::from_minor(50),
                        },
                    )
                    .await?;
                Err(TransferError::InsufficientFunds)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(
            store.get_balance(&root, id, false).await.unwrap(),
            Some(Amount::from_minor(50))
        );
        assert!(store.entries_for(&root, id).await.unwrap().is_empty());
    }
}
