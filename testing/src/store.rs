//! In-memory relational store with snapshot transactions.
//!
//! Tables are named lists of JSON rows. A transaction works on a private copy of
//! all tables taken at `begin`; `commit` publishes the copy, `rollback` (or drop)
//! discards it. A commit whose snapshot is older than the latest committed
//! write fails with [`StoreError::Conflict`], so lost updates are reported
//! instead of silently happening.

use replay_outbox_core::{StoreError, Transaction, TransactionManager};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Tables = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Default)]
struct DatabaseState {
    tables: Tables,
    version: u64,
    next_connection: u64,
    commits: usize,
    rollbacks: usize,
    fail_next_commit: Option<String>,
}

/// Shared handle to one in-memory database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl InMemoryDatabase {
    /// Empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transaction manager over this database.
    #[must_use]
    pub fn transaction_manager(&self) -> InMemoryTransactionManager {
        InMemoryTransactionManager { db: self.clone() }
    }

    /// Committed row count of `table`.
    #[must_use]
    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Committed rows of `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Insert a row outside any transaction.
    pub fn insert(&self, table: &str, row: Value) {
        let mut state = self.lock();
        state.tables.entry(table.to_string()).or_default().push(row);
        state.version += 1;
    }

    /// Remove and return all committed rows of `table`, outside any transaction.
    pub fn drain(&self, table: &str) -> Vec<Value> {
        let mut state = self.lock();
        let rows = state.tables.remove(table).unwrap_or_default();
        if !rows.is_empty() {
            state.version += 1;
        }
        rows
    }

    /// Make the next commit fail with [`StoreError::Database`].
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.lock().fail_next_commit = Some(message.into());
    }

    /// Number of successful commits that changed data.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    /// Number of explicit rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    fn snapshot(&self) -> (Tables, u64, u64) {
        let mut state = self.lock();
        state.next_connection += 1;
        (state.tables.clone(), state.version, state.next_connection)
    }

    fn publish(&self, tables: Tables, base_version: u64, dirty: bool) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next_commit.take() {
            return Err(StoreError::Database(message));
        }
        if !dirty {
            return Ok(());
        }
        if state.version != base_version {
            return Err(StoreError::Conflict(format!(
                "snapshot version {base_version} is behind committed version {}",
                state.version
            )));
        }
        state.tables = tables;
        state.version += 1;
        state.commits += 1;
        Ok(())
    }
}

/// Private working copy of the tables, owned by one transaction.
#[derive(Debug)]
pub struct InMemoryConnection {
    id: u64,
    tables: Tables,
    dirty: bool,
}

impl InMemoryConnection {
    /// Identifier unique to this transaction's connection.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Append a row to `table`.
    pub fn insert(&mut self, table: &str, row: Value) {
        self.tables.entry(table.to_string()).or_default().push(row);
        self.dirty = true;
    }

    /// Rows of `table` as seen by this transaction.
    #[must_use]
    pub fn rows(&self, table: &str) -> &[Value] {
        self.tables.get(table).map_or(&[][..], Vec::as_slice)
    }

    /// Row count of `table` as seen by this transaction.
    #[must_use]
    pub fn count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    /// Whether any row of `table` satisfies `predicate`.
    pub fn contains(&self, table: &str, predicate: impl Fn(&Value) -> bool) -> bool {
        self.rows(table).iter().any(predicate)
    }

    /// Remove and return up to `limit` rows from the front of `table`.
    pub fn take_front(&mut self, table: &str, limit: usize) -> Vec<Value> {
        let Some(rows) = self.tables.get_mut(table) else {
            return Vec::new();
        };
        let taken: Vec<Value> = rows.drain(..limit.min(rows.len())).collect();
        if !taken.is_empty() {
            self.dirty = true;
        }
        taken
    }

    /// Apply `update` to every row of `table` matching `predicate`; returns the
    /// number of rows changed.
    pub fn update(
        &mut self,
        table: &str,
        predicate: impl Fn(&Value) -> bool,
        mut update: impl FnMut(&mut Value),
    ) -> usize {
        let Some(rows) = self.tables.get_mut(table) else {
            return 0;
        };
        let mut changed = 0;
        for row in rows.iter_mut().filter(|row| predicate(row)) {
            update(row);
            changed += 1;
        }
        if changed > 0 {
            self.dirty = true;
        }
        changed
    }
}

/// Opens snapshot transactions on an [`InMemoryDatabase`].
#[derive(Debug, Clone)]
pub struct InMemoryTransactionManager {
    db: InMemoryDatabase,
}

impl InMemoryTransactionManager {
    /// The database this manager opens transactions on.
    #[must_use]
    pub const fn database(&self) -> &InMemoryDatabase {
        &self.db
    }
}

impl TransactionManager for InMemoryTransactionManager {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, StoreError> {
        let (tables, base_version, id) = self.db.snapshot();
        Ok(InMemoryTransaction {
            db: self.db.clone(),
            base_version,
            conn: InMemoryConnection {
                id,
                tables,
                dirty: false,
            },
        })
    }
}

/// One open snapshot transaction.
#[derive(Debug)]
pub struct InMemoryTransaction {
    db: InMemoryDatabase,
    base_version: u64,
    conn: InMemoryConnection,
}

impl Transaction for InMemoryTransaction {
    type Connection = InMemoryConnection;

    fn connection(&mut self) -> &mut InMemoryConnection {
        &mut self.conn
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.db
            .publish(self.conn.tables, self.base_version, self.conn.dirty)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.db.lock().rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let db = InMemoryDatabase::new();
        let manager = db.transaction_manager();

        let mut tx = manager.begin().await.unwrap();
        tx.connection().insert("ORDERS", json!({ "orderId": 1 }));
        assert_eq!(db.count("ORDERS"), 0);
        tx.commit().await.unwrap();

        assert_eq!(db.rows("ORDERS"), vec![json!({ "orderId": 1 })]);
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn rolled_back_writes_vanish() {
        let db = InMemoryDatabase::new();
        let mut tx = db.transaction_manager().begin().await.unwrap();
        tx.connection().insert("ORDERS", json!({ "orderId": 1 }));
        tx.rollback().await.unwrap();

        assert_eq!(db.count("ORDERS"), 0);
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn stale_snapshot_conflicts() {
        let db = InMemoryDatabase::new();
        let manager = db.transaction_manager();
        let mut first = manager.begin().await.unwrap();
        let mut second = manager.begin().await.unwrap();
        assert_ne!(first.connection().id(), second.connection().id());

        first.connection().insert("T", json!(1));
        second.connection().insert("T", json!(2));
        first.commit().await.unwrap();

        assert!(matches!(second.commit().await, Err(StoreError::Conflict(_))));
        assert_eq!(db.rows("T"), vec![json!(1)]);
    }

    #[tokio::test]
    async fn injected_commit_failure_fires_once() {
        let db = InMemoryDatabase::new();
        db.fail_next_commit("disk full");

        let mut tx = db.transaction_manager().begin().await.unwrap();
        tx.connection().insert("T", json!(1));
        assert_eq!(
            tx.commit().await,
            Err(StoreError::Database("disk full".to_string()))
        );

        let mut retry = db.transaction_manager().begin().await.unwrap();
        retry.connection().insert("T", json!(1));
        retry.commit().await.unwrap();
        assert_eq!(db.count("T"), 1);
    }

    #[tokio::test]
    async fn take_front_dequeues_in_order() {
        let db = InMemoryDatabase::new();
        for n in 0..3 {
            db.insert("Q", json!(n));
        }
        let mut tx = db.transaction_manager().begin().await.unwrap();
        assert_eq!(tx.connection().take_front("Q", 2), vec![json!(0), json!(1)]);
        tx.commit().await.unwrap();

        assert_eq!(db.rows("Q"), vec![json!(2)]);
    }
}
