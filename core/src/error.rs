//! Error taxonomy for the replay outbox.
//!
//! Three layers of errors exist:
//!
//! - [`StoreError`]: what a relational driver reports (connection loss, constraint
//!   violations, serialization conflicts). Ports return it unchanged.
//! - [`AdapterError`]: what an adapter reports while executing one operation.
//! - [`OutboxError`]: what the orchestrator, the send buffer and the poller surface
//!   to their callers. It wraps the two layers above.
//!
//! All three are `Clone` so a failure can be both logged in a hook and handed back
//! to the caller that triggered the commit.

use thiserror::Error;

/// Errors reported by a relational store or its driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection, statement or driver failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A concurrent transaction committed conflicting changes first.
    #[error("Serialization conflict: {0}")]
    Conflict(String),

    /// A value could not be converted to or from its stored representation.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors reported by an adapter while executing an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The parameters do not have the shape the adapter expects.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The operation itself failed.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The underlying store failed while the operation ran.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by envelope creation, dispatch, sending and replay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// Params could not be written in canonical form, so no identity exists.
    #[error("Params are not canonically serializable: {0}")]
    IdentitySerialization(String),

    /// No adapter is registered for the dispatch key.
    #[error("No adapter registered for {operation_class}#{operation_name}")]
    NoAdapterRegistered {
        /// Operation class of the dispatch key.
        operation_class: String,
        /// Operation name of the dispatch key.
        operation_name: String,
    },

    /// A different adapter already holds the dispatch key.
    #[error("A different adapter is already registered for {operation_class}#{operation_name}")]
    DuplicateAdapterRegistration {
        /// Operation class of the dispatch key.
        operation_class: String,
        /// Operation name of the dispatch key.
        operation_name: String,
    },

    /// The registry was sealed and accepts no further registrations.
    #[error("Adapter registry is sealed")]
    RegistrySealed,

    /// The send call rejected the envelope or could not be reached.
    #[error("Send to outbox failed (status={status}): {message}")]
    SendFailure {
        /// Status returned by the send call, `-1` for transport errors.
        status: i32,
        /// Error message returned by the send call.
        message: String,
    },

    /// The read-batch call reported a non-zero status.
    #[error("Batch read failed (status={status}): {message}")]
    BatchReadFailure {
        /// Status returned by the read-batch call, `-1` for transport errors.
        status: i32,
        /// Error message returned by the read-batch call.
        message: String,
    },

    /// One replayed envelope could not be applied.
    #[error("Failed to apply envelope {message_id}: {reason}")]
    ItemApplyFailure {
        /// Identity of the envelope that failed.
        message_id: String,
        /// Why it failed.
        reason: String,
    },

    /// A transactional operation was attempted with no active transaction.
    #[error("No active transaction")]
    NoActiveTransaction,

    /// The send buffer has no target with this name.
    #[error("Unknown send target: {0}")]
    UnknownSendTarget(String),

    /// A before-commit hook failed, so the transaction was rolled back.
    #[error("Commit aborted: {source}")]
    CommitAborted {
        /// The failure raised by the hook.
        #[source]
        source: Box<OutboxError>,
    },

    /// A batch payload or envelope could not be parsed.
    #[error("Envelope parse error: {0}")]
    EnvelopeParse(String),

    /// An adapter failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OutboxError {
    /// Build a [`OutboxError::NoAdapterRegistered`] for a dispatch key.
    #[must_use]
    pub fn no_adapter(operation_class: &str, operation_name: &str) -> Self {
        Self::NoAdapterRegistered {
            operation_class: operation_class.to_string(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Wrap a hook failure into [`OutboxError::CommitAborted`].
    ///
    /// An error that already is a `CommitAborted` is returned as is.
    #[must_use]
    pub fn commit_aborted(source: Self) -> Self {
        match source {
            aborted @ Self::CommitAborted { .. } => aborted,
            other => Self::CommitAborted {
                source: Box::new(other),
            },
        }
    }

    /// The innermost cause of a [`OutboxError::CommitAborted`], or `self`.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::CommitAborted { source } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_aborted_does_not_nest() {
        let send = OutboxError::SendFailure {
            status: 2,
            message: "queue full".to_string(),
        };
        let aborted = OutboxError::commit_aborted(send.clone());
        let again = OutboxError::commit_aborted(aborted.clone());

        assert_eq!(aborted, again);
        assert_eq!(again.root_cause(), &send);
    }

    #[test]
    fn adapter_errors_convert() {
        let err: OutboxError = AdapterError::Execution("boom".to_string()).into();
        assert_eq!(err.to_string(), "Execution failed: boom");

        let err: AdapterError = StoreError::Database("gone".to_string()).into();
        assert!(matches!(err, AdapterError::Store(StoreError::Database(_))));
    }

    #[test]
    fn display_names_the_dispatch_key() {
        let err = OutboxError::no_adapter("OrderSqlj", "insertOrder");
        assert_eq!(
            err.to_string(),
            "No adapter registered for OrderSqlj#insertOrder"
        );
    }
}
