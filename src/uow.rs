//! Unit of Work
//!
//! A [`Scope`] is the explicit call-scope value threaded through every
//! store and engine call. It carries the caller's cancellation signal and,
//! inside a unit of work, the open transaction.
//!
//! ```text
//! caller ── Scope (root) ──▶ TxCoordinator::run_in_transaction
//!                               │ begin
//!                               ▼
//!                          Scope (bound) ──▶ body ──▶ store calls
//!                               │ Ok  → commit
//!                               │ Err → rollback
//!                               │ cancelled → drop body, rollback
//! ```
//!
//! Nested `run_in_transaction` calls on a bound scope join the outer
//! transaction; only the outermost call commits or rolls back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::store::{StoreError, Transactional};

/// Unit-of-work failures that are not produced by the body itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitOfWorkError {
    #[error("Failed to begin transaction: {0}")]
    Begin(StoreError),

    #[error("Failed to commit transaction: {0}")]
    Commit(StoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    TimedOut,

    #[error("Transaction handle still in use after the unit of work finished")]
    HandleEscaped,
}

// ============================================================
// SCOPE
// ============================================================

/// Logical call scope: cancellation signal, optional deadline, and the
/// transaction bound by the enclosing unit of work (if any).
pub struct Scope<T> {
    tx: Option<Arc<Mutex<T>>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<T> Clone for Scope<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scope<T> {
    /// Root scope that is never cancelled
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Root scope cancelled together with `token`
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            tx: None,
            cancel: token,
            deadline: None,
        }
    }

    /// Same scope with a deadline `timeout` from now. An earlier existing
    /// deadline is kept.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True if a unit of work has bound a transaction to this scope
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Fail fast if the scope is already cancelled or past its deadline
    pub fn check(&self) -> Result<(), UnitOfWorkError> {
        if self.cancel.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(UnitOfWorkError::TimedOut),
            _ => Ok(()),
        }
    }

    /// Resolves once the scope is cancelled or its deadline passes
    pub async fn cancelled(&self) -> UnitOfWorkError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => UnitOfWorkError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => UnitOfWorkError::TimedOut,
            },
            None => {
                self.cancel.cancelled().await;
                UnitOfWorkError::Cancelled
            }
        }
    }

    /// Resolve the handle statements should run on: the bound transaction
    /// if there is one, otherwise the backend's default connection.
    ///
    /// The returned guard gives exclusive use of the transaction; hold it
    /// only for the duration of one statement.
    pub async fn handle(&self) -> Handle<'_, T> {
        match &self.tx {
            Some(tx) => Handle::Tx(tx.lock().await),
            None => Handle::Default,
        }
    }

    fn bind(&self, tx: T) -> Scope<T> {
        Scope {
            tx: Some(Arc::new(Mutex::new(tx))),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }

    /// Take the transaction back out of a bound scope. `None` if another
    /// clone of the scope is still alive.
    fn unbind(self) -> Option<T> {
        let tx = self.tx?;
        Arc::try_unwrap(tx).ok().map(Mutex::into_inner)
    }
}

/// Statement target resolved from a [`Scope`]
pub enum Handle<'a, T> {
    /// Autocommit connection from the pool
    Default,
    /// The scope's open transaction
    Tx(MutexGuard<'a, T>),
}

// ============================================================
// COORDINATOR
// ============================================================

/// Runs closures as atomic units of work against one backend
pub struct TxCoordinator<S> {
    store: Arc<S>,
}

impl<S> Clone for TxCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Transactional> TxCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// See [`Scope::handle`]
    pub async fn resolve_handle<'a>(&self, scope: &'a Scope<S::Tx>) -> Handle<'a, S::Tx> {
        scope.handle().await
    }

    /// Run `body` inside one transaction.
    ///
    /// Commits if `body` returns `Ok`, rolls back if it returns `Err` or the
    /// scope is cancelled first. If `scope` already carries a transaction,
    /// `body` joins it and the outermost call decides the outcome.
    pub async fn run_in_transaction<R, E, F, Fut>(&self, scope: &Scope<S::Tx>, body: F) -> Result<R, E>
    where
        F: FnOnce(Scope<S::Tx>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<UnitOfWorkError> + std::fmt::Display,
    {
        scope.check()?;

        if scope.in_transaction() {
            debug!("Joining active unit of work");
            return tokio::select! {
                biased;
                reason = scope.cancelled() => Err(reason.into()),
                result = body(scope.clone()) => result,
            };
        }

        let tx = self.store.begin().await.map_err(|e| {
            warn!(error = %e, "Failed to begin transaction");
            UnitOfWorkError::Begin(e)
        })?;
        let bound = scope.bind(tx);

        let outcome = tokio::select! {
            biased;
            reason = bound.cancelled() => {
                warn!(reason = %reason, "Unit of work interrupted, rolling back");
                Err(E::from(reason))
            }
            result = body(bound.clone()) => result,
        };

        let Some(tx) = bound.unbind() else {
            // The last clone rolls the transaction back when it drops.
            error!("Transaction handle escaped its unit of work; not committing");
            return Err(match outcome {
                Ok(_) => UnitOfWorkError::HandleEscaped.into(),
                Err(e) => e,
            });
        };

        match outcome {
            Ok(value) => {
                if let Err(reason) = scope.check() {
                    self.rollback_quietly(tx).await;
                    return Err(reason.into());
                }
                self.store.commit(tx).await.map_err(|e| {
                    error!(error = %e, "Failed to commit transaction");
                    UnitOfWorkError::Commit(e)
                })?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Unit of work failed, rolling back");
                self.rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn rollback_quietly(&self, tx: S::Tx) {
        if let Err(e) = self.store.rollback(tx).await {
            error!(error = %e, "Rollback failed");
        }
    }
}
