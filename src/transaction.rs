//! Transaction handles.
//!
//! A [`Transaction`] is one level of a (possibly nested) transaction on a
//! [`Connection`](crate::Connection). Depth 1 is a real transaction; deeper
//! levels are savepoints named `sp_1`, `sp_2`, ... counted from the start of
//! the enclosing top-level transaction.
//!
//! Levels must be closed innermost first. A handle dropped without `commit`
//! rolls its level back: the rollback is queued on the connection and sent
//! ahead of the next operation.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::connection::{Finish, Scope, Shared};
use crate::copy::{TableReader, TableWriter};
use crate::error::{Error, Result};
use crate::result::QueryResult;
use crate::types::ToParams;

/// Isolation level of a top-level transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Whatever the session default is.
    #[default]
    Default,
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
}

impl IsolationLevel {
    pub(crate) fn as_sql(self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::Serializable => Some("ISOLATION LEVEL SERIALIZABLE"),
            IsolationLevel::RepeatableRead => Some("ISOLATION LEVEL REPEATABLE READ"),
            IsolationLevel::ReadCommitted => Some("ISOLATION LEVEL READ COMMITTED"),
            IsolationLevel::ReadUncommitted => Some("ISOLATION LEVEL READ UNCOMMITTED"),
        }
    }
}

/// Access mode of a top-level transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Default,
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub(crate) fn as_sql(self) -> Option<&'static str> {
        match self {
            AccessMode::Default => None,
            AccessMode::ReadWrite => Some("READ WRITE"),
            AccessMode::ReadOnly => Some("READ ONLY"),
        }
    }
}

/// Where a handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// One open transaction level.
pub struct Transaction {
    shared: Weak<Shared>,
    id: u64,
    depth: usize,
    savepoint: Option<String>,
    state: TransactionState,
}

impl Transaction {
    pub(crate) fn new(
        shared: Weak<Shared>,
        id: u64,
        depth: usize,
        savepoint: Option<String>,
    ) -> Self {
        Self {
            shared,
            id,
            depth,
            savepoint,
            state: TransactionState::Open,
        }
    }

    /// 1 for a top-level transaction, N+1 for a savepoint below depth N.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Savepoint name, `None` at depth 1.
    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    /// Open handles whose connection has been closed or dropped report
    /// `RolledBack`.
    pub fn state(&self) -> TransactionState {
        match self.state {
            TransactionState::Open => match self.shared.upgrade() {
                Some(shared) if !shared.is_closed() => TransactionState::Open,
                _ => TransactionState::RolledBack,
            },
            closed => closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    /// Execute a statement in this transaction. Must be the innermost open
    /// level.
    pub async fn execute<P: ToParams>(&self, statement: &str, params: P) -> Result<QueryResult> {
        let shared = self.connection()?;
        shared
            .execute(Some(self.id), statement, &params.to_params())
            .await
    }

    /// Start `COPY ... FROM STDIN` in this transaction.
    pub async fn table_writer(&self, statement: &str) -> Result<TableWriter> {
        let shared = self.connection()?;
        shared.table_writer(Some(self.id), statement).await
    }

    /// Start `COPY ... TO STDOUT` in this transaction.
    pub async fn table_reader(&self, statement: &str) -> Result<TableReader> {
        let shared = self.connection()?;
        shared.table_reader(Some(self.id), statement).await
    }

    /// Open a savepoint below this transaction.
    pub async fn begin(&self) -> Result<Transaction> {
        let shared = self.connection()?;
        shared.begin(Scope::Transaction(self.id), None).await
    }

    /// Commit: `COMMIT` at depth 1, `RELEASE SAVEPOINT` below.
    ///
    /// The handle is closed afterwards even if the server rejects the
    /// statement.
    pub async fn commit(&mut self) -> Result<()> {
        self.finish(Finish::Commit).await
    }

    /// Roll back: `ROLLBACK` at depth 1, `ROLLBACK TO SAVEPOINT` below,
    /// which leaves the enclosing levels usable.
    pub async fn rollback(&mut self) -> Result<()> {
        self.finish(Finish::Rollback).await
    }

    async fn finish(&mut self, action: Finish) -> Result<()> {
        let shared = self.connection()?;
        match shared.finish(self.id, action).await {
            Ok(outcome) => {
                // A failed COMMIT ends the transaction on the server anyway
                self.state = match (action, &outcome) {
                    (Finish::Commit, Ok(())) => TransactionState::Committed,
                    _ => TransactionState::RolledBack,
                };
                outcome
            }
            // An enclosing level was dropped and took this one with it
            Err(Error::AlreadyClosed) => {
                self.state = TransactionState::RolledBack;
                Err(Error::AlreadyClosed)
            }
            Err(e) => Err(e),
        }
    }

    fn connection(&self) -> Result<Arc<Shared>> {
        if self.state != TransactionState::Open {
            return Err(Error::AlreadyClosed);
        }
        self.shared.upgrade().ok_or(Error::UseAfterClose)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Open {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.abandon(self.id);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.depth)
            .field("savepoint", &self.savepoint)
            .field("state", &self.state)
            .finish()
    }
}
