//! Transaction boundary and commit-synchronization hooks.
//!
//! [`TransactionManager`] and [`Transaction`] are the minimal surface a relational
//! driver has to provide. [`ManagedTransaction`] wraps any such transaction and adds
//! the two extension points the outbox relies on:
//!
//! - **before commit**: hooks that run, in registration order, on the
//!   transaction's own connection right before the driver commit. The first
//!   failing hook rolls the transaction back and the commit returns
//!   [`OutboxError::CommitAborted`].
//! - **after completion**: hooks that run once the transaction is committed or
//!   rolled back, whatever the outcome.
//!
//! Hooks are registered through a [`TransactionHandle`], a cheap cloneable token
//! passed explicitly to whoever needs to hook into the transaction.
//!
//! ```text
//! begin ──► Active ──commit──► Completing ──hooks ok──► driver commit ──► Completed(Committed)
//!              │                    └──hook failed──► driver rollback ──► Completed(RolledBack)
//!              └──rollback / drop──────────────────────────────────────► Completed(RolledBack)
//! ```

use crate::error::{OutboxError, StoreError};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// An open transaction on one connection.
pub trait Transaction: Send {
    /// Connection type statements run on.
    type Connection: Send + 'static;

    /// The transaction's connection.
    fn connection(&mut self) -> &mut Self::Connection;

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the driver commit fails.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the driver rollback fails.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Opens transactions against one store.
pub trait TransactionManager: Send + Sync {
    /// Transaction type this manager opens.
    type Transaction: Transaction;

    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if no connection or transaction can be obtained.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;
}

/// Connection type of the transactions opened by `M`.
pub type ConnectionOf<M> = <<M as TransactionManager>::Transaction as Transaction>::Connection;

/// How a transaction ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Changes are durable.
    Committed,
    /// Changes were discarded.
    RolledBack,
}

/// Process-unique identifier of one managed transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-shot hook run on the transaction's connection just before commit.
pub trait BeforeCommit<C>: Send {
    /// Run the hook; an error aborts the commit.
    ///
    /// # Errors
    ///
    /// Any error rolls the transaction back.
    fn run<'c>(self: Box<Self>, conn: &'c mut C) -> BoxFuture<'c, Result<(), OutboxError>>;
}

struct FnBeforeCommit<F>(F);

impl<C, F> BeforeCommit<C> for FnBeforeCommit<F>
where
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<(), OutboxError>> + Send,
{
    fn run<'c>(self: Box<Self>, conn: &'c mut C) -> BoxFuture<'c, Result<(), OutboxError>> {
        (self.0)(conn)
    }
}

/// Box a closure as a [`BeforeCommit`] hook.
pub fn before_commit_fn<C, F>(f: F) -> Box<dyn BeforeCommit<C>>
where
    C: 'static,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<(), OutboxError>> + Send + 'static,
{
    Box::new(FnBeforeCommit(f))
}

/// Hook run once the transaction has completed.
pub type AfterCompletion = Box<dyn FnOnce(Completion) + Send>;

/// Registration surface for commit hooks of one transaction.
pub trait TransactionSynchronization<C>: Send + Sync {
    /// The transaction these hooks belong to.
    fn transaction_id(&self) -> TransactionId;

    /// Whether the transaction still accepts before-commit hooks.
    fn is_active(&self) -> bool;

    /// Register a hook to run right before commit.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NoActiveTransaction`] once the transaction started
    /// completing.
    fn register_before_commit(&self, hook: Box<dyn BeforeCommit<C>>) -> Result<(), OutboxError>;

    /// Register a hook to run after commit or rollback.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NoActiveTransaction`] once the transaction completed.
    fn register_after_completion(&self, hook: AfterCompletion) -> Result<(), OutboxError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Active,
    Completing,
    Completed,
}

struct SyncState<C> {
    phase: Phase,
    before_commit: Vec<Box<dyn BeforeCommit<C>>>,
    after_completion: Vec<AfterCompletion>,
}

/// Cloneable hook registry bound to one [`ManagedTransaction`].
pub struct TransactionHandle<C> {
    id: TransactionId,
    state: Arc<Mutex<SyncState<C>>>,
}

impl<C> Clone for TransactionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }
}

impl<C> fmt::Debug for TransactionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("phase", &self.lock().phase)
            .finish()
    }
}

impl<C> TransactionHandle<C> {
    fn new() -> Self {
        Self {
            id: TransactionId::new(),
            state: Arc::new(Mutex::new(SyncState {
                phase: Phase::Active,
                before_commit: Vec::new(),
                after_completion: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch to completing and hand out the before-commit hooks in order.
    fn start_completion(&self) -> Vec<Box<dyn BeforeCommit<C>>> {
        let mut state = self.lock();
        if state.phase != Phase::Active {
            return Vec::new();
        }
        state.phase = Phase::Completing;
        std::mem::take(&mut state.before_commit)
    }

    /// Mark completed and run after-completion hooks outside the lock.
    fn complete(&self, completion: Completion) {
        let hooks = {
            let mut state = self.lock();
            if state.phase == Phase::Completed {
                return;
            }
            state.phase = Phase::Completed;
            state.before_commit.clear();
            std::mem::take(&mut state.after_completion)
        };
        for hook in hooks {
            hook(completion);
        }
    }
}

impl<C> TransactionSynchronization<C> for TransactionHandle<C> {
    fn transaction_id(&self) -> TransactionId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.lock().phase == Phase::Active
    }

    fn register_before_commit(&self, hook: Box<dyn BeforeCommit<C>>) -> Result<(), OutboxError> {
        let mut state = self.lock();
        if state.phase != Phase::Active {
            return Err(OutboxError::NoActiveTransaction);
        }
        state.before_commit.push(hook);
        Ok(())
    }

    fn register_after_completion(&self, hook: AfterCompletion) -> Result<(), OutboxError> {
        let mut state = self.lock();
        if state.phase == Phase::Completed {
            return Err(OutboxError::NoActiveTransaction);
        }
        state.after_completion.push(hook);
        Ok(())
    }
}

/// A driver transaction with before-commit and after-completion hooks.
///
/// Dropping it without calling [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) discards the driver transaction and runs the
/// after-completion hooks with [`Completion::RolledBack`].
pub struct ManagedTransaction<T: Transaction> {
    inner: Option<T>,
    handle: TransactionHandle<T::Connection>,
}

impl<T: Transaction> ManagedTransaction<T> {
    /// Wrap an already open driver transaction.
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner: Some(inner),
            handle: TransactionHandle::new(),
        }
    }

    /// Open a transaction through `manager`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the manager cannot open one.
    pub async fn begin<M>(manager: &M) -> Result<Self, StoreError>
    where
        M: TransactionManager<Transaction = T>,
    {
        let inner = manager.begin().await?;
        Ok(Self::new(inner))
    }

    /// Id of this transaction.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.handle.id
    }

    /// Hook registration token for this transaction.
    #[must_use]
    pub fn handle(&self) -> TransactionHandle<T::Connection> {
        self.handle.clone()
    }

    /// The transaction's connection.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NoActiveTransaction`] if the driver transaction is
    /// gone.
    pub fn connection(&mut self) -> Result<&mut T::Connection, OutboxError> {
        self.inner
            .as_mut()
            .map(Transaction::connection)
            .ok_or(OutboxError::NoActiveTransaction)
    }

    /// Run before-commit hooks, then commit.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::CommitAborted`] if a hook failed; the transaction was
    ///   rolled back.
    /// - [`OutboxError::Store`] if the driver commit failed.
    pub async fn commit(mut self) -> Result<(), OutboxError> {
        let Some(mut inner) = self.inner.take() else {
            return Err(OutboxError::NoActiveTransaction);
        };
        let transaction_id = self.handle.id;

        for hook in self.handle.start_completion() {
            if let Err(error) = hook.run(inner.connection()).await {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    error = %error,
                    "Before-commit hook failed, rolling back"
                );
                if let Err(rollback_error) = inner.rollback().await {
                    tracing::error!(
                        transaction_id = %transaction_id,
                        error = %rollback_error,
                        "Rollback after failed before-commit hook also failed"
                    );
                }
                self.handle.complete(Completion::RolledBack);
                return Err(OutboxError::commit_aborted(error));
            }
        }

        match inner.commit().await {
            Ok(()) => {
                self.handle.complete(Completion::Committed);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(transaction_id = %transaction_id, error = %error, "Commit failed");
                self.handle.complete(Completion::RolledBack);
                Err(error.into())
            }
        }
    }

    /// Roll back and run after-completion hooks.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Store`] if the driver rollback failed. The hooks run
    /// either way.
    pub async fn rollback(mut self) -> Result<(), OutboxError> {
        let Some(inner) = self.inner.take() else {
            return Err(OutboxError::NoActiveTransaction);
        };
        let outcome = inner.rollback().await;
        self.handle.complete(Completion::RolledBack);
        outcome.map_err(Into::into)
    }
}

impl<T: Transaction> Drop for ManagedTransaction<T> {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!(
                transaction_id = %self.handle.id,
                "Transaction dropped without completion"
            );
            self.handle.complete(Completion::RolledBack);
        }
    }
}

impl<T: Transaction> fmt::Debug for ManagedTransaction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTransaction")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
