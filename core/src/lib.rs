//! # Replay Outbox Core
//!
//! Core types for replaying side effects from a primary relational store onto an
//! independent secondary store through a transactional outbox.
//!
//! Every primary-side mutation that must be replayed is captured as an immutable
//! [`Envelope`](envelope::Envelope) inside the same primary transaction that
//! performed it. A poller later applies pending envelopes on the secondary store;
//! the envelope's content-derived [`MessageId`](envelope::MessageId) is the
//! idempotency key that keeps redelivery from causing repeated effects.
//!
//! ## Modules
//!
//! - [`envelope`]: the envelope, its builder and JSON shape
//! - [`canonical`]: canonical serialization and SHA-256 identity
//! - [`adapter`]: adapter trait and the `(class, name)` registry
//! - [`ports`]: send, read-batch and idempotency-ledger ports
//! - [`transaction`]: transaction boundary with before-commit and
//!   after-completion hooks
//! - [`environment`]: injected clock
//! - [`error`]: error taxonomy
//!
//! ## Example
//!
//! ```
//! use replay_outbox_core::envelope::Envelope;
//! use replay_outbox_core::params;
//!
//! let first = Envelope::builder("InventorySqlj", "updateStock")
//!     .params(params! { "productId": 77, "quantityDelta": -1 })
//!     .correlation_id("order-1001")
//!     .build()
//!     .unwrap();
//! let redelivered = Envelope::builder("InventorySqlj", "updateStock")
//!     .params(params! { "quantityDelta": -1, "productId": 77 })
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(first.message_id(), redelivered.message_id());
//! ```

pub mod adapter;
pub mod canonical;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod ports;
pub mod transaction;

// Re-export commonly used types
pub use adapter::{Adapter, AdapterKey, AdapterRegistry, adapter_fn};
pub use envelope::{DEFAULT_VERSION, Envelope, EnvelopeBuilder, MessageId, Params};
pub use error::{AdapterError, OutboxError, StoreError};
pub use futures::future::BoxFuture;
pub use transaction::{
    Completion, ConnectionOf, ManagedTransaction, Transaction, TransactionHandle, TransactionId,
    TransactionManager, TransactionSynchronization,
};

#[doc(hidden)]
pub use serde_json;
