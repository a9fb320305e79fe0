//! Transactional send buffer.
//!
//! Business code runs its statements directly on a transactional connection and
//! records envelopes as it goes. Nothing is sent while the transaction runs; the
//! buffer is flushed by a before-commit hook, on the same connection, so the
//! business mutations and the outbox rows commit or roll back together.
//!
//! Buffers are keyed by `(transaction, target)`. The first [`record`] for a key
//! registers two hooks on that transaction:
//!
//! - before commit: drain the buffer and send every envelope in FIFO order;
//!   the first failure stops the flush and aborts the commit
//! - after completion: drop whatever is left of the buffer
//!
//! [`record`]: TransactionalOutbox::record

use crate::metrics::OutboxMetrics;
use crate::sender::EnvelopeSender;
use futures::future::BoxFuture;
use replay_outbox_core::transaction::{BeforeCommit, TransactionSynchronization};
use replay_outbox_core::{Envelope, OutboxError, TransactionId};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Name of the target used by [`TransactionalOutbox::record`].
pub const DEFAULT_TARGET: &str = "primary";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BufferKey {
    transaction: TransactionId,
    target: String,
}

type Buffers = Arc<Mutex<HashMap<BufferKey, Vec<Envelope>>>>;

fn lock(buffers: &Buffers) -> MutexGuard<'_, HashMap<BufferKey, Vec<Envelope>>> {
    buffers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records envelopes per transaction and sends them right before commit.
///
/// # Example
///
/// ```ignore
/// let mut tx = ManagedTransaction::begin(&manager).await?;
/// insert_order(tx.connection()?, &order).await?;
/// outbox.record(&tx.handle(), envelope)?;
/// tx.commit().await?; // envelope is sent here, on the same connection
/// ```
pub struct TransactionalOutbox<C> {
    targets: HashMap<String, Arc<EnvelopeSender<C>>>,
    buffers: Buffers,
}

impl<C> Clone for TransactionalOutbox<C> {
    fn clone(&self) -> Self {
        Self {
            targets: self.targets.clone(),
            buffers: Arc::clone(&self.buffers),
        }
    }
}

impl<C: Send + 'static> TransactionalOutbox<C> {
    /// Outbox whose default target sends through `sender`.
    #[must_use]
    pub fn new(sender: EnvelopeSender<C>) -> Self {
        Self {
            targets: HashMap::new(),
            buffers: Arc::default(),
        }
        .with_target(DEFAULT_TARGET, sender)
    }

    /// Add (or replace) a named target.
    #[must_use]
    pub fn with_target(mut self, name: impl Into<String>, sender: EnvelopeSender<C>) -> Self {
        self.targets.insert(name.into(), Arc::new(sender));
        self
    }

    /// Record `envelope` for the default target of `transaction`.
    ///
    /// # Errors
    ///
    /// Same as [`record_to`](Self::record_to).
    pub fn record<H>(&self, transaction: &H, envelope: Envelope) -> Result<(), OutboxError>
    where
        H: TransactionSynchronization<C> + ?Sized,
    {
        self.record_to(transaction, DEFAULT_TARGET, envelope)
    }

    /// Record `envelope` for `target` of `transaction`.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::NoActiveTransaction`] if `transaction` no longer accepts
    ///   hooks; recording outside a transaction has no commit to attach to.
    /// - [`OutboxError::UnknownSendTarget`] if `target` was never configured.
    pub fn record_to<H>(
        &self,
        transaction: &H,
        target: &str,
        envelope: Envelope,
    ) -> Result<(), OutboxError>
    where
        H: TransactionSynchronization<C> + ?Sized,
    {
        if !transaction.is_active() {
            return Err(OutboxError::NoActiveTransaction);
        }
        let sender = self
            .targets
            .get(target)
            .cloned()
            .ok_or_else(|| OutboxError::UnknownSendTarget(target.to_string()))?;

        let key = BufferKey {
            transaction: transaction.transaction_id(),
            target: target.to_string(),
        };
        tracing::debug!(
            transaction_id = %key.transaction,
            send_target = target,
            message_id = %envelope.message_id(),
            operation_class = envelope.operation_class(),
            operation_name = envelope.operation_name(),
            "Envelope recorded"
        );

        let first_for_key = match lock(&self.buffers).entry(key.clone()) {
            Entry::Occupied(mut buffer) => {
                buffer.get_mut().push(envelope);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![envelope]);
                true
            }
        };
        OutboxMetrics::record_recorded();

        if first_for_key {
            if let Err(error) = self.register_hooks(transaction, key.clone(), sender) {
                lock(&self.buffers).remove(&key);
                return Err(error);
            }
        }
        Ok(())
    }

    /// Number of envelopes waiting for `target` of `transaction`.
    #[must_use]
    pub fn pending(&self, transaction: TransactionId, target: &str) -> usize {
        lock(&self.buffers)
            .get(&BufferKey {
                transaction,
                target: target.to_string(),
            })
            .map_or(0, Vec::len)
    }

    /// Configured target names, sorted.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn register_hooks<H>(
        &self,
        transaction: &H,
        key: BufferKey,
        sender: Arc<EnvelopeSender<C>>,
    ) -> Result<(), OutboxError>
    where
        H: TransactionSynchronization<C> + ?Sized,
    {
        // Clear first so a failed flush registration still leaves no residue.
        let buffers = Arc::clone(&self.buffers);
        let clear_key = key.clone();
        transaction.register_after_completion(Box::new(move |completion| {
            if let Some(left) = lock(&buffers).remove(&clear_key) {
                tracing::debug!(
                    transaction_id = %clear_key.transaction,
                    send_target = %clear_key.target,
                    discarded = left.len(),
                    ?completion,
                    "Send buffer cleared"
                );
            }
        }))?;

        transaction.register_before_commit(Box::new(FlushBuffer {
            key,
            buffers: Arc::clone(&self.buffers),
            sender,
        }))
    }
}

impl<C> fmt::Debug for TransactionalOutbox<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalOutbox")
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .field("open_buffers", &lock(&self.buffers).len())
            .finish()
    }
}

struct FlushBuffer<C> {
    key: BufferKey,
    buffers: Buffers,
    sender: Arc<EnvelopeSender<C>>,
}

impl<C: Send + 'static> BeforeCommit<C> for FlushBuffer<C> {
    fn run<'c>(self: Box<Self>, conn: &'c mut C) -> BoxFuture<'c, Result<(), OutboxError>> {
        Box::pin(async move {
            let envelopes = lock(&self.buffers).remove(&self.key).unwrap_or_default();
            tracing::debug!(
                transaction_id = %self.key.transaction,
                send_target = %self.key.target,
                count = envelopes.len(),
                "Flushing send buffer before commit"
            );
            for envelope in &envelopes {
                self.sender.send(conn, envelope).await?;
            }
            Ok(())
        })
    }
}
