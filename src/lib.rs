//! pgbind: an async PostgreSQL client with typed parameter binding.
//!
//! - [`Connection`]: startup, authentication and parameterized statements
//!   over the v3 wire protocol
//! - [`Transaction`]: nested transactions backed by savepoints
//! - [`TableWriter`] / [`TableReader`]: bulk `COPY` in and out
//! - [`LargeObject`]: server-side large objects, read and written in a
//!   transaction
//! - [`QueryResult`] / [`Row`]: typed access to result columns
//! - [`Pool`]: a bounded pool of reusable connections
//!
//! ```ignore
//! use pgbind::{Connection, NULL};
//!
//! let conn = Connection::connect("postgresql://app@localhost/app").await?;
//! let mut tx = conn.begin().await?;
//! tx.execute("INSERT INTO notes (id, body, tag) VALUES ($1, $2, $3)", (42, "hello", NULL))
//!     .await?;
//! let (id, body): (i32, String) = tx
//!     .execute("SELECT id, body FROM notes WHERE id = $1", 42)
//!     .await?
//!     .one()?;
//! tx.commit().await?;
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod copy;
pub mod error;
pub mod large_object;
pub mod poll;
pub mod pool;
pub mod protocol;
pub mod result;
mod scram;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod tests;

pub use channel::{Channel, Direction};
pub use config::{Config, Endpoint};
pub use connection::{
    escape_identifier, escape_literal, Connection, ConnectionStatus, Handshake, Notification,
};
pub use copy::{TableReader, TableRow, TableWriter};
pub use error::{Error, Result, ServerError};
pub use large_object::{LargeObject, OpenMode};
pub use poll::{wait_ready, PollStatus};
pub use pool::{Pool, PoolConfig, PooledConnection};
pub use protocol::TransactionStatus;
pub use result::{Column, ColumnIndex, Field, QueryResult, Row, RowContainer, Rows};
pub use transaction::{AccessMode, IsolationLevel, Transaction, TransactionState};
pub use types::{
    ArrayElement, Encode, FieldValue, Format, FromField, FromRow, IsNull, Null, Oid, Parameter,
    Params, ToParams, TypeFamily, NULL,
};
