//! Error types for pgbind.
//!
//! Every failure surfaces as a distinct [`Error`] variant so callers can tell
//! channel problems, server-reported failures, decode failures and lifecycle
//! misuse apart.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::types::Oid;

/// Result type for pgbind operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A structured error reported by the server for a submitted statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerError {
    pub severity: String,
    /// SQLSTATE code, e.g. `42P01`.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character position in the statement text.
    pub position: Option<u32>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(position) = self.position {
            write!(f, " at position {}", position)?;
        }
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Channel-level failure, including handshake and authentication failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The readiness poller hit its deadline during connect or receive.
    #[error("timed out waiting for the server")]
    Timeout,

    /// The server rejected a statement.
    #[error("server error: {0}")]
    Server(ServerError),

    /// The column type cannot be coerced into the requested Rust type.
    #[error("type mismatch: cannot decode {oid:?} into {target}")]
    TypeMismatch { oid: Oid, target: &'static str },

    /// A NULL was read into a non-optional Rust type.
    #[error("unexpected NULL value for {target}")]
    NullValue { target: &'static str },

    /// Malformed wire data for the requested type.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("ambiguous column name: {0}")]
    AmbiguousColumn(String),

    #[error("index {index} out of range (size {size})")]
    Range { index: usize, size: usize },

    #[error("expected {expected} row(s), got {actual}")]
    UnexpectedRowCount { expected: &'static str, actual: usize },

    /// A transaction was used or closed while a deeper one is still open.
    #[error("transaction nesting violation: {0}")]
    NestingViolation(String),

    /// Commit or rollback on a handle that is already closed.
    #[error("transaction already closed")]
    AlreadyClosed,

    /// The owning connection was closed or dropped.
    #[error("connection was closed")]
    UseAfterClose,

    /// Another operation is in flight on this connection.
    #[error("connection is busy with another operation")]
    Busy,

    /// A COPY is streaming; only its reader or writer may use the session.
    #[error("a COPY is in progress on this connection")]
    CopyInProgress,

    /// The statement given to a table reader or writer did not start the
    /// expected kind of COPY.
    #[error("copy error: {0}")]
    Copy(String),

    /// A large object argument is out of range, or a file transfer failed.
    #[error("large object error: {0}")]
    LargeObject(String),

    /// Unexpected or malformed protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// True for failures that leave the connection unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Timeout | Error::Io(_) | Error::Protocol(_)
        )
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    /// SQLSTATE of a server error.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(&e.code),
            _ => None,
        }
    }

    /// Details of a server error.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }
}
