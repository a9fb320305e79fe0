//! # Replay Outbox Testing
//!
//! Test doubles for the replay outbox.
//!
//! This crate provides:
//! - [`store`]: an in-memory database with snapshot transactions
//! - [`ports`]: in-memory outbox, inbox and ledger ports, plus a transport that
//!   relays committed outbox rows to a secondary inbox
//! - [`adapters`]: recording and failing adapters
//! - [`mocks`]: a fixed clock
//! - [`fixtures`]: the sample operations used across tests and the demo
//!
//! ## Example
//!
//! ```ignore
//! use replay_outbox_testing::ports::{InMemoryOutbox, OUTBOX_TABLE};
//! use replay_outbox_testing::store::InMemoryDatabase;
//!
//! #[tokio::test]
//! async fn order_lands_in_outbox() {
//!     let db = InMemoryDatabase::new();
//!     let orchestrator = Orchestrator::new(
//!         db.transaction_manager(),
//!         registry,
//!         EnvelopeSender::new(Arc::new(InMemoryOutbox::new())),
//!     );
//!     // ...
//!     assert_eq!(db.count(OUTBOX_TABLE), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use replay_outbox_core::environment::Clock;

pub mod adapters;
pub mod ports;
pub mod store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use replay_outbox_testing::mocks::FixedClock;
    /// use replay_outbox_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Sample operations: two per scenario, as `(class, name, params)`.
///
/// Purchase writes an order then adjusts stock, Installment creates a plan then
/// applies the first payment, AccountSetup opens an account then assigns limits.
pub mod fixtures {
    use replay_outbox_core::{Params, params};

    /// Table each sample operation writes to, keyed by operation class.
    pub const TABLES: [(&str, &str); 6] = [
        ("OrderSqlj", "ORDERS"),
        ("InventorySqlj", "INVENTORY"),
        ("InstallmentSqlj", "INSTALLMENTS"),
        ("PaymentSqlj", "PAYMENTS"),
        ("AccountSqlj", "ACCOUNTS"),
        ("LimitSqlj", "LIMITS"),
    ];

    /// One sample operation.
    #[derive(Debug, Clone)]
    pub struct Operation {
        /// Operation class.
        pub class: &'static str,
        /// Operation name.
        pub name: &'static str,
        /// Params passed to the adapter.
        pub params: Params,
    }

    /// Table written by operations of `class`.
    #[must_use]
    pub fn table_for(class: &str) -> Option<&'static str> {
        TABLES
            .iter()
            .find(|(candidate, _)| *candidate == class)
            .map(|(_, table)| *table)
    }

    /// `OrderSqlj.insertOrder`
    #[must_use]
    pub fn insert_order() -> Operation {
        Operation {
            class: "OrderSqlj",
            name: "insertOrder",
            params: params! { "orderId": 1001, "customerId": 9001, "amount": "42.50" },
        }
    }

    /// `InventorySqlj.updateStock`
    #[must_use]
    pub fn update_stock() -> Operation {
        Operation {
            class: "InventorySqlj",
            name: "updateStock",
            params: params! { "productId": 77, "quantityDelta": -1 },
        }
    }

    /// `InstallmentSqlj.createInstallment`
    #[must_use]
    pub fn create_installment() -> Operation {
        Operation {
            class: "InstallmentSqlj",
            name: "createInstallment",
            params: params! { "contractId": 5001, "months": 12, "amountPerMonth": 300 },
        }
    }

    /// `PaymentSqlj.applyPayment`
    #[must_use]
    pub fn apply_payment() -> Operation {
        Operation {
            class: "PaymentSqlj",
            name: "applyPayment",
            params: params! { "contractId": 5001, "paymentAmount": 300 },
        }
    }

    /// `AccountSqlj.createAccount`
    #[must_use]
    pub fn create_account() -> Operation {
        Operation {
            class: "AccountSqlj",
            name: "createAccount",
            params: params! { "customerId": 7001, "currency": "EUR" },
        }
    }

    /// `LimitSqlj.assignLimits`
    #[must_use]
    pub fn assign_limits() -> Operation {
        Operation {
            class: "LimitSqlj",
            name: "assignLimits",
            params: params! { "accountId": 222, "dailyLimit": 1000 },
        }
    }

    /// The three sample scenarios, each with its two steps.
    #[must_use]
    pub fn scenarios() -> Vec<(&'static str, [Operation; 2])> {
        vec![
            ("Purchase", [insert_order(), update_stock()]),
            ("Installment", [create_installment(), apply_payment()]),
            ("AccountSetup", [create_account(), assign_limits()]),
        ]
    }
}

/// Install a `tracing` subscriber writing through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use adapters::{FailingAdapter, RecordingAdapter};
pub use mocks::{FixedClock, test_clock};
pub use ports::{InMemoryInbox, InMemoryLedger, InMemoryOutbox, InMemoryTransport};
pub use store::{InMemoryConnection, InMemoryDatabase, InMemoryTransactionManager};
