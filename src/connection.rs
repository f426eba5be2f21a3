//! PostgreSQL connection implementation.
//!
//! This module provides the connection type that handles:
//! - Channel establishment (TCP or Unix socket) and the startup handshake
//! - Cleartext, MD5 and SCRAM-SHA-256 authentication
//! - Parameterized statements over the extended query protocol
//! - Named prepared statements, LISTEN/NOTIFY
//! - Transaction and savepoint bookkeeping for [`Transaction`] handles
//!
//! Every operation takes `&self`. The session sits behind a non-waiting lock:
//! a second operation started while one is in flight fails with
//! [`Error::Busy`] instead of queueing behind it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, Direction};
use crate::config::{Config, Endpoint};
use crate::error::{Error, Result};
use crate::poll::{wait_ready, PollStatus};
use crate::protocol::*;
use crate::copy::{TableReader, TableWriter};
use crate::result::{parse_rows_affected, Column, QueryResult};
use crate::scram::{self, ScramClient};
use crate::transaction::{AccessMode, IsolationLevel, Transaction};
use crate::types::{Format, Parameter, ToParams};

/// Maximum identifier length accepted by the server (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LEN: usize = 63;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// Startup handshake in progress.
    Connecting(Handshake),
    Idle,
    /// An operation is in flight.
    Sending,
    /// A COPY is streaming; only its table reader or writer may use the
    /// session until it ends.
    Copying,
    /// The response stream is no longer aligned (timeout, I/O failure or an
    /// abandoned operation). Only closing and reconnecting recovers.
    Broken,
    Closed,
}

/// Direction the handshake is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    AwaitingWritable,
    AwaitingReadable,
}

/// An asynchronous notification delivered by `NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

// ============================================================================
// Shared state
// ============================================================================

/// One open transaction level.
#[derive(Debug, Clone)]
struct Level {
    id: u64,
    savepoint: Option<String>,
}

/// Transaction bookkeeping, guarded by a short-lived lock.
#[derive(Debug)]
pub(crate) struct State {
    status: ConnectionStatus,
    /// Open levels, outermost first. The depth is the length.
    open: Vec<Level>,
    next_id: u64,
    /// Reset when a top-level transaction starts.
    savepoints: u32,
    /// Cleanup queued by dropped handles.
    pending: Vec<Pending>,
    /// Id of the table reader or writer owning an active COPY.
    copy: Option<u64>,
    timeout: Option<Duration>,
}

/// Work a dropped handle could not do itself, sent ahead of the next
/// operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    /// Abort an unfinished COPY FROM STDIN.
    CopyFail,
    /// Discard the rest of a COPY TO STDOUT.
    CopyDrain,
    Rollback(String),
}

impl State {
    /// Statements outside any transaction need depth 0; inside one they go
    /// through the innermost level.
    fn require_scope(&self, scope: Option<u64>) -> Result<()> {
        match scope {
            None if !self.open.is_empty() => Err(Error::NestingViolation(format!(
                "{} transaction(s) open; execute through the innermost transaction",
                self.open.len()
            ))),
            None => Ok(()),
            Some(id) => self.require_innermost(id).map(drop),
        }
    }

    /// `id` must be the innermost open level.
    fn require_innermost(&self, id: u64) -> Result<usize> {
        match self.open.iter().position(|level| level.id == id) {
            None => Err(Error::AlreadyClosed),
            Some(pos) if pos + 1 == self.open.len() => Ok(pos + 1),
            Some(pos) => Err(Error::NestingViolation(format!(
                "transaction at depth {} still has {} open nested transaction(s)",
                pos + 1,
                self.open.len() - pos - 1
            ))),
        }
    }
}

/// What the server told us about the session.
#[derive(Default)]
struct ServerInfo {
    parameters: HashMap<String, String>,
    backend_pid: i32,
    secret_key: i32,
    transaction_status: Option<TransactionStatus>,
    prepared: HashSet<String>,
    notifications: VecDeque<Notification>,
    handler: Option<NotificationHandler>,
}

/// The byte stream and its read buffer.
struct Session {
    channel: Box<dyn Channel>,
    read_buffer: BytesMut,
    non_blocking: bool,
}

pub(crate) struct Shared {
    session: tokio::sync::Mutex<Session>,
    state: Mutex<State>,
    server: Mutex<ServerInfo>,
    non_blocking: bool,
    result_format: Format,
}

/// Which way a COPY streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyDirection {
    /// `COPY ... FROM STDIN`
    In,
    /// `COPY ... TO STDOUT`
    Out,
}

/// How a transaction level ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finish {
    Commit,
    Rollback,
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
///
/// ```ignore
/// let conn = Connection::connect("host=localhost dbname=app").await?;
/// let mut tx = conn.begin().await?;
/// tx.execute("INSERT INTO t (id, name) VALUES ($1, $2)", (42, "hello")).await?;
/// tx.commit().await?;
/// ```
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connect using a conninfo string or URL. Missing settings come from
    /// the `PG*` environment variables.
    pub async fn connect(conninfo: &str) -> Result<Self> {
        Self::connect_with(Config::parse(conninfo)?).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let channel: Box<dyn Channel> = match config.endpoint() {
            Endpoint::Tcp { host, port } => {
                let connect = TcpStream::connect((host.as_str(), port));
                let stream = match config.connect_timeout {
                    Some(limit) => tokio::time::timeout(limit, connect)
                        .await
                        .map_err(|_| Error::Timeout)?,
                    None => connect.await,
                }
                .map_err(|e| {
                    Error::Connection(format!("could not connect to {}:{}: {}", host, port, e))
                })?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| Error::Connection(format!("could not set TCP_NODELAY: {}", e)))?;
                Box::new(stream)
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let connect = tokio::net::UnixStream::connect(&path);
                let stream = match config.connect_timeout {
                    Some(limit) => tokio::time::timeout(limit, connect)
                        .await
                        .map_err(|_| Error::Timeout)?,
                    None => connect.await,
                }
                .map_err(|e| {
                    Error::Connection(format!("could not connect to {}: {}", path.display(), e))
                })?;
                Box::new(stream)
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => {
                return Err(Error::Config(format!(
                    "Unix sockets are not available on this platform: {}",
                    path.display()
                )))
            }
        };

        Self::connect_with_channel(channel, config).await
    }

    /// Run the startup handshake over an already open channel.
    pub async fn connect_with_channel<C: Channel + 'static>(
        channel: C,
        config: Config,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            session: tokio::sync::Mutex::new(Session {
                channel: Box::new(channel),
                read_buffer: BytesMut::with_capacity(8192),
                non_blocking: config.non_blocking,
            }),
            state: Mutex::new(State {
                status: ConnectionStatus::Disconnected,
                open: Vec::new(),
                next_id: 1,
                savepoints: 0,
                pending: Vec::new(),
                copy: None,
                timeout: config.timeout,
            }),
            server: Mutex::new(ServerInfo::default()),
            non_blocking: config.non_blocking,
            result_format: config.result_format,
        });

        shared.startup(&config).await?;
        Ok(Self { shared })
    }

    /// Execute a statement outside any transaction.
    ///
    /// `statement` is either SQL text with `$n` placeholders or the name of
    /// a statement registered with [`prepare`](Self::prepare). While a
    /// transaction is open, go through the innermost [`Transaction`].
    pub async fn execute<P: ToParams>(&self, statement: &str, params: P) -> Result<QueryResult> {
        self.shared.execute(None, statement, &params.to_params()).await
    }

    /// Open a transaction: a top-level one at depth 0, a savepoint below the
    /// innermost open transaction otherwise.
    pub async fn begin(&self) -> Result<Transaction> {
        self.shared.begin(Scope::Connection, None).await
    }

    /// Open a top-level transaction with explicit settings.
    pub async fn transaction(
        &self,
        isolation: IsolationLevel,
        access: AccessMode,
    ) -> Result<Transaction> {
        self.shared
            .begin(Scope::Connection, Some((isolation, access)))
            .await
    }

    /// Start `COPY ... FROM STDIN` outside any transaction.
    ///
    /// The connection is reserved for the writer until it finishes, is
    /// cancelled, or is dropped (which aborts the COPY).
    pub async fn table_writer(&self, statement: &str) -> Result<TableWriter> {
        self.shared.table_writer(None, statement).await
    }

    /// Start `COPY ... TO STDOUT` outside any transaction.
    pub async fn table_reader(&self, statement: &str) -> Result<TableReader> {
        self.shared.table_reader(None, statement).await
    }

    /// Register a named prepared statement.
    pub async fn prepare(&self, name: &str, statement: &str) -> Result<()> {
        validate_identifier(name)?;
        let (mut exchange, ()) = self.shared.acquire(|_| Ok(()))?;
        let result = exchange.parse(name, statement).await;
        if result.is_ok() {
            self.shared.server.lock().prepared.insert(name.to_string());
        }
        exchange.complete(result)
    }

    /// Release a named prepared statement.
    pub async fn deallocate(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        let (mut exchange, ()) = self.shared.acquire(|_| Ok(()))?;
        let result = exchange.close_statement(name).await;
        if result.is_ok() {
            self.shared.server.lock().prepared.remove(name);
        }
        exchange.complete(result)
    }

    pub fn is_prepared(&self, name: &str) -> bool {
        self.shared.server.lock().prepared.contains(name)
    }

    /// `LISTEN` on a channel.
    pub async fn listen(&self, channel: &str) -> Result<()> {
        self.shared
            .control(format!("LISTEN {}", escape_identifier(channel)))
            .await
    }

    /// `UNLISTEN` a channel.
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        self.shared
            .control(format!("UNLISTEN {}", escape_identifier(channel)))
            .await
    }

    /// `NOTIFY` a channel, with an optional payload.
    pub async fn notify(&self, channel: &str, payload: Option<&str>) -> Result<()> {
        let statement = match payload {
            Some(payload) => format!(
                "NOTIFY {}, {}",
                escape_identifier(channel),
                escape_literal(payload)
            ),
            None => format!("NOTIFY {}", escape_identifier(channel)),
        };
        self.shared.control(statement).await
    }

    /// Deliver notifications to `handler` as they arrive instead of queueing
    /// them for [`take_notifications`](Self::take_notifications).
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.server.lock().handler = Some(Arc::new(handler));
    }

    pub fn clear_notification_handler(&self) {
        self.shared.server.lock().handler = None;
    }

    /// Drain queued notifications.
    pub fn take_notifications(&self) -> Vec<Notification> {
        self.shared.server.lock().notifications.drain(..).collect()
    }

    /// Read whatever the server has already sent without waiting, and
    /// dispatch any notifications in it. Returns how many were received.
    pub async fn process_notifications(&self) -> Result<usize> {
        let (mut exchange, ()) = self.shared.acquire(|_| Ok(()))?;
        let result = exchange.consume_available().await;
        exchange.complete(result)
    }

    /// Send Terminate and close the channel.
    ///
    /// Open transactions are implicitly rolled back by the server; their
    /// handles fail with [`Error::UseAfterClose`] from now on.
    pub async fn close(&self) -> Result<()> {
        let mut session = self.shared.session.try_lock().map_err(|_| Error::Busy)?;
        let (previous, timeout) = {
            let mut state = self.shared.state.lock();
            if state.status == ConnectionStatus::Closed {
                return Ok(());
            }
            let previous = state.status;
            state.status = ConnectionStatus::Closed;
            state.open.clear();
            state.pending.clear();
            state.copy = None;
            (previous, state.timeout)
        };

        if previous != ConnectionStatus::Broken {
            if let Err(e) = session.send(&TerminateMessage.encode(), timeout).await {
                debug!(error = %e, "failed to send Terminate");
            }
        }
        if let Err(e) = session.channel.shutdown().await {
            debug!(error = %e, "failed to shut down channel");
        }

        debug!("connection closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().status
    }

    /// Number of open transaction levels.
    pub fn depth(&self) -> usize {
        self.shared.state.lock().open.len()
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.shared
            .server
            .lock()
            .transaction_status
            .unwrap_or(TransactionStatus::Idle)
    }

    /// A server parameter reported at startup or since, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.server.lock().parameters.get(name).cloned()
    }

    pub fn backend_pid(&self) -> i32 {
        self.shared.server.lock().backend_pid
    }

    /// Per-wait timeout for the readiness poller. `None` waits indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.state.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.state.lock().timeout
    }

    pub fn is_non_blocking(&self) -> bool {
        self.shared.non_blocking
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Connection")
            .field("status", &state.status)
            .field("depth", &state.open.len())
            .field("non_blocking", &self.shared.non_blocking)
            .finish()
    }
}

// ============================================================================
// Shared operations
// ============================================================================

/// Who is asking to open a transaction.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope {
    Connection,
    Transaction(u64),
}

impl Shared {
    /// Take the session for one operation.
    ///
    /// `check` runs under the bookkeeping lock; if it fails nothing is sent.
    fn acquire<T>(&self, check: impl FnOnce(&mut State) -> Result<T>) -> Result<(Exchange<'_>, T)> {
        let session = self.session.try_lock().map_err(|_| Error::Busy)?;
        let mut state = self.state.lock();
        match state.status {
            ConnectionStatus::Closed => return Err(Error::UseAfterClose),
            ConnectionStatus::Broken => {
                return Err(Error::Connection(
                    "connection is broken; close it and reconnect".to_string(),
                ))
            }
            _ => {}
        }
        if state.copy.is_some() {
            return Err(Error::CopyInProgress);
        }

        let value = check(&mut *state)?;
        state.status = ConnectionStatus::Sending;
        let exchange = Exchange {
            shared: self,
            session,
            pending: std::mem::take(&mut state.pending),
            timeout: state.timeout,
            done: false,
        };
        Ok((exchange, value))
    }

    /// Take the session for the next step of the COPY owned by `id`.
    /// Queued cleanup stays queued until the COPY is over.
    fn acquire_copy(&self, id: u64) -> Result<Exchange<'_>> {
        let session = self.session.try_lock().map_err(|_| Error::Busy)?;
        let mut state = self.state.lock();
        match state.status {
            ConnectionStatus::Closed => return Err(Error::UseAfterClose),
            ConnectionStatus::Broken => {
                return Err(Error::Connection(
                    "connection is broken; close it and reconnect".to_string(),
                ))
            }
            _ => {}
        }
        if state.copy != Some(id) {
            return Err(Error::AlreadyClosed);
        }

        state.status = ConnectionStatus::Sending;
        Ok(Exchange {
            shared: self,
            session,
            pending: Vec::new(),
            timeout: state.timeout,
            done: false,
        })
    }

    pub(crate) async fn execute(
        &self,
        scope: Option<u64>,
        statement: &str,
        params: &[Parameter],
    ) -> Result<QueryResult> {
        if params.len() > u16::MAX as usize {
            return Err(Error::Protocol(format!(
                "too many parameters: {}",
                params.len()
            )));
        }
        let prepared = self.server.lock().prepared.contains(statement);

        let (mut exchange, ()) = self.acquire(|state| state.require_scope(scope))?;
        let result = exchange.extended(statement, prepared, params).await;
        exchange.complete(result)
    }

    pub(crate) async fn table_writer(
        self: &Arc<Self>,
        scope: Option<u64>,
        statement: &str,
    ) -> Result<TableWriter> {
        let (id, columns) = self.start_copy(scope, statement, CopyDirection::In).await?;
        Ok(TableWriter::new(Arc::downgrade(self), id, columns))
    }

    pub(crate) async fn table_reader(
        self: &Arc<Self>,
        scope: Option<u64>,
        statement: &str,
    ) -> Result<TableReader> {
        let (id, columns) = self.start_copy(scope, statement, CopyDirection::Out).await?;
        Ok(TableReader::new(Arc::downgrade(self), id, columns))
    }

    async fn start_copy(
        &self,
        scope: Option<u64>,
        statement: &str,
        direction: CopyDirection,
    ) -> Result<(u64, usize)> {
        let (mut exchange, id) = self.acquire(|state| {
            state.require_scope(scope)?;
            let id = state.next_id;
            state.next_id += 1;
            Ok(id)
        })?;
        let result = exchange.start_copy(statement, direction).await;
        if result.is_ok() {
            self.state.lock().copy = Some(id);
        }
        let columns = exchange.complete(result)?;
        debug!(?direction, columns, "copy started");
        Ok((id, columns))
    }

    /// Send one chunk of COPY FROM STDIN data.
    pub(crate) async fn copy_write(&self, id: u64, data: &[u8]) -> Result<()> {
        let mut exchange = self.acquire_copy(id)?;
        let result = exchange.send(&CopyDataMessage { data }.encode()).await;
        exchange.complete(result)
    }

    /// Send the last chunk and CopyDone. Returns the rows the server stored.
    pub(crate) async fn copy_done(&self, id: u64, data: &[u8]) -> Result<u64> {
        let mut exchange = self.acquire_copy(id)?;
        let result = exchange.finish_copy(data).await;
        self.state.lock().copy = None;
        exchange.complete(result)
    }

    /// Abort COPY FROM STDIN with `reason`.
    pub(crate) async fn copy_fail(&self, id: u64, reason: &str) -> Result<()> {
        let mut exchange = self.acquire_copy(id)?;
        let result = exchange.abort_copy(reason).await;
        self.state.lock().copy = None;
        exchange.complete(result)
    }

    /// Next chunk of COPY TO STDOUT data, `None` once the COPY is over.
    pub(crate) async fn copy_read(&self, id: u64) -> Result<Option<Bytes>> {
        let mut exchange = self.acquire_copy(id)?;
        let result = exchange.read_copy().await;
        if !matches!(result, Ok(Some(_))) {
            self.state.lock().copy = None;
        }
        exchange.complete(result)
    }

    pub(crate) fn copy_active(&self, id: u64) -> bool {
        self.state.lock().copy == Some(id)
    }

    /// A table reader or writer went out of scope mid-COPY. The abort (or
    /// drain) is queued ahead of anything else pending.
    pub(crate) fn abandon_copy(&self, id: u64, direction: CopyDirection) {
        let mut state = self.state.lock();
        if state.copy != Some(id)
            || matches!(
                state.status,
                ConnectionStatus::Closed | ConnectionStatus::Broken
            )
        {
            return;
        }
        state.copy = None;
        let cleanup = match direction {
            CopyDirection::In => Pending::CopyFail,
            CopyDirection::Out => Pending::CopyDrain,
        };
        state.pending.insert(0, cleanup);
        if state.status == ConnectionStatus::Copying {
            state.status = ConnectionStatus::Idle;
        }
        debug!(?direction, "copy dropped; cleanup queued");
    }

    pub(crate) async fn begin(
        self: &Arc<Self>,
        scope: Scope,
        settings: Option<(IsolationLevel, AccessMode)>,
    ) -> Result<Transaction> {
        let (mut exchange, (id, depth, savepoint, statement)) = self.acquire(|state| {
            if let Scope::Transaction(parent) = scope {
                state.require_innermost(parent)?;
            }
            let id = state.next_id;
            state.next_id += 1;

            if state.open.is_empty() {
                state.savepoints = 0;
                let statement = match settings {
                    Some((isolation, access)) => start_transaction(isolation, access),
                    None => "START TRANSACTION".to_string(),
                };
                Ok((id, 1, None, statement))
            } else if settings.is_some() {
                Err(Error::NestingViolation(
                    "isolation level and access mode apply to top-level transactions only"
                        .to_string(),
                ))
            } else {
                state.savepoints += 1;
                let name = format!("sp_{}", state.savepoints);
                let statement = format!("SAVEPOINT {}", escape_identifier(&name));
                Ok((id, state.open.len() + 1, Some(name), statement))
            }
        })?;

        let result = exchange.simple(&statement).await;
        if result.is_ok() {
            self.state.lock().open.push(Level {
                id,
                savepoint: savepoint.clone(),
            });
        }
        exchange.complete(result)?;

        debug!(depth, savepoint = savepoint.as_deref(), "transaction opened");
        Ok(Transaction::new(Arc::downgrade(self), id, depth, savepoint))
    }

    /// Commit or roll back level `id`.
    ///
    /// The outer error means the level was left untouched; the inner one is
    /// the outcome of the statement after the level was closed.
    pub(crate) async fn finish(&self, id: u64, action: Finish) -> Result<Result<()>> {
        let (mut exchange, (depth, statement)) = self.acquire(|state| {
            let depth = state.require_innermost(id)?;
            let level = state.open.pop();
            let statement = match (action, level.and_then(|l| l.savepoint)) {
                (Finish::Commit, None) => "COMMIT TRANSACTION".to_string(),
                (Finish::Rollback, None) => "ROLLBACK TRANSACTION".to_string(),
                (Finish::Commit, Some(name)) => {
                    format!("RELEASE SAVEPOINT {}", escape_identifier(&name))
                }
                (Finish::Rollback, Some(name)) => {
                    format!("ROLLBACK TO SAVEPOINT {}", escape_identifier(&name))
                }
            };
            Ok((depth, statement))
        })?;

        let result = exchange.simple(&statement).await;
        debug!(depth, ?action, ok = result.is_ok(), "transaction closed");
        Ok(exchange.complete(result).map(drop))
    }

    /// A transaction handle went out of scope while open.
    ///
    /// Drop cannot do I/O, so the rollback is queued for the next operation.
    /// Deeper levels go with it.
    pub(crate) fn abandon(&self, id: u64) {
        let mut state = self.state.lock();
        if matches!(
            state.status,
            ConnectionStatus::Closed | ConnectionStatus::Broken
        ) {
            return;
        }
        let Some(pos) = state.open.iter().position(|level| level.id == id) else {
            return;
        };

        let statement = match &state.open[pos].savepoint {
            None => "ROLLBACK TRANSACTION".to_string(),
            Some(name) => format!("ROLLBACK TO SAVEPOINT {}", escape_identifier(name)),
        };
        let invalidated = state.open.len() - pos - 1;
        state.open.truncate(pos);
        state.pending.push(Pending::Rollback(statement));
        debug!(depth = pos + 1, invalidated, "transaction dropped; rollback queued");
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().status == ConnectionStatus::Closed
    }

    /// Run a statement that returns no rows.
    async fn control(&self, statement: String) -> Result<()> {
        let (mut exchange, ()) = self.acquire(|_| Ok(()))?;
        let result = exchange.simple(&statement).await.map(drop);
        exchange.complete(result)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    fn dispatch(&self, notification: Notification) {
        trace!(channel = %notification.channel, "notification received");
        let handler = self.server.lock().handler.clone();
        match handler {
            Some(handler) => handler(&notification),
            None => self.server.lock().notifications.push_back(notification),
        }
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Perform the startup handshake (authentication).
    async fn startup(&self, config: &Config) -> Result<()> {
        let mut session = self.session.lock().await;
        let timeout = config.connect_timeout;
        let user = config.effective_user();

        let mut options = Vec::new();
        if let Some(name) = &config.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
        options.extend(config.options.iter().cloned());
        if !options.iter().any(|(key, _)| key == "client_encoding") {
            options.push(("client_encoding".to_string(), "UTF8".to_string()));
        }
        let startup = StartupMessage {
            user: user.to_string(),
            database: Some(config.effective_dbname().to_string()),
            options,
        };

        debug!(user, dbname = config.effective_dbname(), "starting handshake");
        self.set_status(ConnectionStatus::Connecting(Handshake::AwaitingWritable));
        session.send(&startup.encode(), timeout).await?;

        loop {
            self.set_status(ConnectionStatus::Connecting(Handshake::AwaitingReadable));
            let msg = session.receive(timeout).await?;
            self.set_status(ConnectionStatus::Connecting(Handshake::AwaitingWritable));

            match msg {
                BackendMessage::AuthenticationOk => {
                    debug!("authenticated");
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = required_password(config)?;
                    let msg = PasswordMessage {
                        password: password.to_string(),
                    };
                    session.send(&msg.encode(), timeout).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password = required_password(config)?;
                    let msg = PasswordMessage {
                        password: md5_password(user, password, &salt),
                    };
                    session.send(&msg.encode(), timeout).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(Error::Connection(format!(
                            "server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let password = required_password(config)?;
                    self.authenticate_scram(&mut session, user, password, timeout)
                        .await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.server.lock().parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    let mut server = self.server.lock();
                    server.backend_pid = process_id;
                    server.secret_key = secret_key;
                }
                BackendMessage::NoticeResponse { fields } => log_notice(&fields),
                BackendMessage::ReadyForQuery { status } => {
                    self.server.lock().transaction_status = Some(status);
                    self.set_status(ConnectionStatus::Idle);
                    debug!(backend_pid = self.server.lock().backend_pid, "connected");
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(Error::Connection(format!(
                        "server rejected the connection: {}",
                        server_error(&fields)
                    )));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn authenticate_scram(
        &self,
        session: &mut Session,
        user: &str,
        password: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let client = ScramClient::new(user, password);
        let initial = SaslInitialResponseMessage {
            mechanism: scram::MECHANISM.to_string(),
            data: client.client_first_message(),
        };
        session.send(&initial.encode(), timeout).await?;

        let server_first = match session.receive(timeout).await? {
            BackendMessage::AuthenticationSASLContinue { data } => data,
            BackendMessage::ErrorResponse { fields } => {
                return Err(Error::Connection(format!(
                    "authentication failed: {}",
                    server_error(&fields)
                )))
            }
            other => return Err(unexpected_auth_message(&other)),
        };
        let (client_final, verifier) = client
            .client_final_message(&server_first)
            .map_err(|e| Error::Connection(format!("SCRAM authentication failed: {}", e)))?;
        session
            .send(&SaslResponseMessage { data: client_final }.encode(), timeout)
            .await?;

        match session.receive(timeout).await? {
            BackendMessage::AuthenticationSASLFinal { data } => verifier
                .verify(&data)
                .map_err(|e| Error::Connection(format!("SCRAM authentication failed: {}", e))),
            BackendMessage::ErrorResponse { fields } => Err(Error::Connection(format!(
                "authentication failed: {}",
                server_error(&fields)
            ))),
            other => Err(unexpected_auth_message(&other)),
        }
    }
}

// ============================================================================
// Exchange
// ============================================================================

/// Exclusive use of the session for one operation.
///
/// Finishing through [`complete`](Self::complete) returns the connection to
/// idle, or marks it broken on a channel-level error. Dropping it before
/// that (a cancelled future) also marks it broken, because the rest of the
/// response is still on the wire.
struct Exchange<'a> {
    shared: &'a Shared,
    session: tokio::sync::MutexGuard<'a, Session>,
    pending: Vec<Pending>,
    timeout: Option<Duration>,
    done: bool,
}

impl Exchange<'_> {
    fn complete<T>(mut self, result: Result<T>) -> Result<T> {
        self.done = true;
        let broken = match &result {
            Err(e) if e.is_connection_error() => {
                warn!(error = %e, "connection broken");
                true
            }
            _ => false,
        };
        let mut state = self.shared.state.lock();
        state.status = if broken {
            ConnectionStatus::Broken
        } else if state.copy.is_some() {
            ConnectionStatus::Copying
        } else {
            ConnectionStatus::Idle
        };
        result
    }

    /// Send cleanup queued by dropped handles. Server errors are logged,
    /// not returned.
    async fn flush_pending(&mut self) -> Result<()> {
        for cleanup in std::mem::take(&mut self.pending) {
            let result = match &cleanup {
                Pending::CopyFail => self.abort_copy("COPY abandoned by the client").await,
                Pending::CopyDrain => self.until_ready().await,
                Pending::Rollback(statement) => self.simple_query(statement).await.map(drop),
            };
            match result {
                Ok(()) => trace!(?cleanup, "queued cleanup sent"),
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => warn!(?cleanup, error = %e, "queued cleanup failed"),
            }
        }
        Ok(())
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.session.send(buf, self.timeout).await
    }

    /// Next message that is not asynchronous (notice, parameter status,
    /// notification). Those are handled here.
    async fn receive(&mut self) -> Result<BackendMessage> {
        loop {
            let msg = self.session.receive(self.timeout).await?;
            if let Some(msg) = self.handle_async(msg) {
                return Ok(msg);
            }
        }
    }

    fn handle_async(&self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::NoticeResponse { fields } => log_notice(&fields),
            BackendMessage::ParameterStatus { name, value } => {
                self.shared.server.lock().parameters.insert(name, value);
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => self.shared.dispatch(Notification {
                process_id,
                channel,
                payload,
            }),
            other => return Some(other),
        }
        None
    }

    fn ready_for_query(&self, status: TransactionStatus) {
        self.shared.server.lock().transaction_status = Some(status);
    }

    /// Drain messages until ReadyForQuery (after error).
    async fn drain_until_ready(&mut self) -> Result<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.receive().await? {
                self.ready_for_query(status);
                return Ok(());
            }
        }
    }

    async fn server_failure<T>(&mut self, fields: &HashMap<u8, String>) -> Result<T> {
        self.drain_until_ready().await?;
        let error = server_error(fields);
        debug!(code = %error.code, message = %error.message, "server error");
        Err(Error::Server(error))
    }

    /// Simple query protocol, for control statements.
    async fn simple(&mut self, statement: &str) -> Result<Vec<QueryResult>> {
        self.flush_pending().await?;
        self.simple_query(statement).await
    }

    async fn simple_query(&mut self, statement: &str) -> Result<Vec<QueryResult>> {
        trace!(statement, "simple query");
        let msg = QueryMessage {
            query: statement.to_string(),
        };
        self.send(&msg.encode()).await?;

        let mut results = Vec::new();
        let mut columns: Arc<[Column]> = Arc::from(Vec::new());
        let mut rows = Vec::new();

        loop {
            match self.receive().await? {
                BackendMessage::RowDescription { fields } => {
                    columns = fields.into_iter().map(Column::from).collect();
                }
                BackendMessage::DataRow { values } => {
                    check_row_width(&columns, &values)?;
                    rows.push(values);
                }
                BackendMessage::CommandComplete { tag } => {
                    let columns = std::mem::replace(&mut columns, Arc::from(Vec::new()));
                    results.push(QueryResult::new(columns, std::mem::take(&mut rows), tag));
                }
                BackendMessage::EmptyQueryResponse => {
                    results.push(QueryResult::without_rows(String::new()));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready_for_query(status);
                    return Ok(results);
                }
                BackendMessage::ErrorResponse { fields } => {
                    return self.server_failure(&fields).await;
                }
                _ => {}
            }
        }
    }

    /// Extended query protocol: Parse (unless `prepared`), Bind, Describe,
    /// Execute, Sync.
    async fn extended(
        &mut self,
        statement: &str,
        prepared: bool,
        params: &[Parameter],
    ) -> Result<QueryResult> {
        self.flush_pending().await?;
        trace!(statement, params = params.len(), prepared, "execute");

        let mut buf = BytesMut::new();
        let name = if prepared {
            statement.to_string()
        } else {
            let parse = ParseMessage {
                name: String::new(),
                query: statement.to_string(),
                param_types: params.iter().map(|p| p.oid).collect(),
            };
            buf.extend_from_slice(&parse.encode());
            String::new()
        };
        let bind = BindMessage {
            portal: String::new(),
            statement: name,
            params,
            result_formats: vec![self.shared.result_format],
        };
        buf.extend_from_slice(&bind.encode());
        let describe = DescribeMessage {
            kind: b'P',
            name: String::new(),
        };
        buf.extend_from_slice(&describe.encode());
        let execute = ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        };
        buf.extend_from_slice(&execute.encode());
        buf.extend_from_slice(&SyncMessage.encode());
        self.send(&buf).await?;

        let mut columns: Arc<[Column]> = Arc::from(Vec::new());
        let mut rows = Vec::new();
        let mut tag = String::new();

        loop {
            match self.receive().await? {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::NoData
                | BackendMessage::EmptyQueryResponse
                | BackendMessage::PortalSuspended => {}
                BackendMessage::RowDescription { fields } => {
                    columns = fields.into_iter().map(Column::from).collect();
                }
                BackendMessage::DataRow { values } => {
                    check_row_width(&columns, &values)?;
                    rows.push(values);
                }
                BackendMessage::CommandComplete { tag: t } => tag = t,
                BackendMessage::ReadyForQuery { status } => {
                    self.ready_for_query(status);
                    return Ok(QueryResult::new(columns, rows, tag));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return self.server_failure(&fields).await;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during execute: {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn parse(&mut self, name: &str, statement: &str) -> Result<()> {
        self.flush_pending().await?;
        trace!(name, statement, "prepare");

        let mut buf = BytesMut::new();
        let parse = ParseMessage {
            name: name.to_string(),
            query: statement.to_string(),
            param_types: Vec::new(),
        };
        buf.extend_from_slice(&parse.encode());
        buf.extend_from_slice(&SyncMessage.encode());
        self.send(&buf).await?;
        self.until_ready().await
    }

    async fn close_statement(&mut self, name: &str) -> Result<()> {
        self.flush_pending().await?;
        trace!(name, "deallocate");

        let mut buf = BytesMut::new();
        let close = CloseMessage {
            kind: b'S',
            name: name.to_string(),
        };
        buf.extend_from_slice(&close.encode());
        buf.extend_from_slice(&SyncMessage.encode());
        self.send(&buf).await?;
        self.until_ready().await
    }

    async fn until_ready(&mut self) -> Result<()> {
        loop {
            match self.receive().await? {
                BackendMessage::ReadyForQuery { status } => {
                    self.ready_for_query(status);
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return self.server_failure(&fields).await;
                }
                _ => {}
            }
        }
    }

    /// Send a COPY statement and wait for the server to switch into copy
    /// mode. Returns the column count.
    async fn start_copy(&mut self, statement: &str, direction: CopyDirection) -> Result<usize> {
        self.flush_pending().await?;
        trace!(statement, ?direction, "copy");
        let msg = QueryMessage {
            query: statement.to_string(),
        };
        self.send(&msg.encode()).await?;

        let mismatch = |got: &str| {
            let wanted = match direction {
                CopyDirection::In => "COPY ... FROM STDIN",
                CopyDirection::Out => "COPY ... TO STDOUT",
            };
            Error::Copy(format!("expected a {} statement, got {}", wanted, got))
        };

        loop {
            match self.receive().await? {
                BackendMessage::CopyInResponse { column_formats, .. } => {
                    if direction == CopyDirection::In {
                        return Ok(column_formats.len());
                    }
                    match self.abort_copy("expected COPY TO STDOUT").await {
                        Err(e) if e.is_connection_error() => return Err(e),
                        _ => return Err(mismatch("COPY FROM STDIN")),
                    }
                }
                BackendMessage::CopyOutResponse { column_formats, .. } => {
                    if direction == CopyDirection::Out {
                        return Ok(column_formats.len());
                    }
                    self.until_ready().await?;
                    return Err(mismatch("COPY TO STDOUT"));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready_for_query(status);
                    return Err(mismatch("a statement that does not copy"));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return self.server_failure(&fields).await;
                }
                _ => {}
            }
        }
    }

    async fn finish_copy(&mut self, data: &[u8]) -> Result<u64> {
        let mut buf = BytesMut::new();
        if !data.is_empty() {
            buf.extend_from_slice(&CopyDataMessage { data }.encode());
        }
        buf.extend_from_slice(&CopyDoneMessage.encode());
        self.send(&buf).await?;

        let mut tag = String::new();
        loop {
            match self.receive().await? {
                BackendMessage::CommandComplete { tag: t } => tag = t,
                BackendMessage::ReadyForQuery { status } => {
                    self.ready_for_query(status);
                    return Ok(parse_rows_affected(&tag));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return self.server_failure(&fields).await;
                }
                _ => {}
            }
        }
    }

    /// Send CopyFail. The server's error reply confirms the abort and is
    /// not reported.
    async fn abort_copy(&mut self, reason: &str) -> Result<()> {
        let msg = CopyFailMessage {
            message: reason.to_string(),
        };
        self.send(&msg.encode()).await?;
        match self.until_ready().await {
            Err(Error::Server(error)) => {
                trace!(code = %error.code, "copy aborted");
                Ok(())
            }
            other => other,
        }
    }

    async fn read_copy(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.receive().await? {
                BackendMessage::CopyData { data } => return Ok(Some(data)),
                BackendMessage::ReadyForQuery { status } => {
                    self.ready_for_query(status);
                    return Ok(None);
                }
                BackendMessage::ErrorResponse { fields } => {
                    return self.server_failure(&fields).await;
                }
                // CopyDone, CommandComplete
                _ => {}
            }
        }
    }

    /// Dispatch buffered and readable asynchronous messages without waiting.
    async fn consume_available(&mut self) -> Result<usize> {
        self.flush_pending().await?;
        let mut delivered = 0;

        self.session.read_available()?;
        while let Some(msg) = self.session.next_buffered()? {
            if let BackendMessage::NotificationResponse { .. } = msg {
                delivered += 1;
            }
            if let Some(other) = self.handle_async(msg) {
                return Err(Error::Protocol(format!(
                    "unexpected message while idle: {:?}",
                    other
                )));
            }
        }

        trace!(delivered, "notifications processed");
        Ok(delivered)
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.set_status(ConnectionStatus::Broken);
            debug!("operation abandoned mid-exchange; connection marked broken");
        }
    }
}

// ============================================================================
// Session I/O
// ============================================================================

impl Session {
    /// Write the whole buffer, waiting on the poller whenever the channel
    /// would block.
    async fn send(&mut self, mut buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        if !self.non_blocking {
            let write = async {
                self.channel.write_all(buf).await?;
                self.channel.flush().await
            };
            return with_timeout(timeout, write)
                .await?
                .map_err(|e| Error::Connection(format!("send failed: {}", e)));
        }

        while !buf.is_empty() {
            match self.channel.try_write(buf) {
                Ok(0) => {
                    return Err(Error::Connection(
                        "channel closed while sending".to_string(),
                    ))
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(Direction::Write, timeout).await?
                }
                Err(e) => return Err(Error::Connection(format!("send failed: {}", e))),
            }
        }
        Ok(())
    }

    /// Receive a backend message.
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = self.next_buffered()? {
                return Ok(msg);
            }
            self.fill(timeout).await?;
        }
    }

    /// Decode the next complete message already in the read buffer.
    fn next_buffered(&mut self) -> Result<Option<BackendMessage>> {
        match frame_len(&self.read_buffer)? {
            Some(len) => {
                let mut frame = self.read_buffer.split_to(len).freeze();
                BackendMessage::decode(&mut frame).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn fill(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut chunk = [0u8; 8192];
        let n = if self.non_blocking {
            loop {
                match self.channel.try_read(&mut chunk) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.wait(Direction::Read, timeout).await?
                    }
                    Err(e) => return Err(Error::Connection(format!("receive failed: {}", e))),
                }
            }
        } else {
            with_timeout(timeout, self.channel.read(&mut chunk))
                .await?
                .map_err(|e| Error::Connection(format!("receive failed: {}", e)))?
        };

        if n == 0 {
            return Err(Error::Connection(
                "server closed the connection".to_string(),
            ));
        }
        self.read_buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Pull in whatever is readable right now.
    fn read_available(&mut self) -> Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            match self.channel.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Connection(
                        "server closed the connection".to_string(),
                    ))
                }
                Ok(n) => self.read_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Connection(format!("receive failed: {}", e))),
            }
        }
    }

    async fn wait(&self, direction: Direction, timeout: Option<Duration>) -> Result<()> {
        trace!(?direction, ?timeout, "waiting for channel readiness");
        match wait_ready(&*self.channel, direction, timeout).await {
            PollStatus::Ready => Ok(()),
            PollStatus::Timeout => Err(Error::Timeout),
            PollStatus::Error(e) => Err(Error::Connection(format!("poll failed: {}", e))),
        }
    }
}

async fn with_timeout<F: std::future::Future>(
    timeout: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| Error::Timeout),
        None => Ok(future.await),
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn required_password(config: &Config) -> Result<&str> {
    config
        .password
        .as_deref()
        .ok_or_else(|| Error::Connection("server requested a password, none configured".into()))
}

fn unexpected_auth_message(msg: &BackendMessage) -> Error {
    Error::Protocol(format!(
        "unexpected message during authentication: {:?}",
        msg
    ))
}

fn log_notice(fields: &HashMap<u8, String>) {
    let notice = server_error(fields);
    warn!(severity = %notice.severity, code = %notice.code, "{}", notice.message);
}

/// Compute MD5 password hash.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // md5(md5(password + user) + salt)
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}

fn start_transaction(isolation: IsolationLevel, access: AccessMode) -> String {
    let modes: Vec<&str> = [isolation.as_sql(), access.as_sql()]
        .into_iter()
        .flatten()
        .collect();
    if modes.is_empty() {
        "START TRANSACTION".to_string()
    } else {
        format!("START TRANSACTION {}", modes.join(", "))
    }
}

/// Letters, digits and underscores, not starting with a digit.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= MAX_IDENTIFIER_LEN;
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

fn check_row_width(columns: &[Column], values: &[Option<Bytes>]) -> Result<()> {
    if values.len() != columns.len() {
        return Err(Error::Protocol(format!(
            "DataRow has {} values but RowDescription has {} columns",
            values.len(),
            columns.len()
        )));
    }
    Ok(())
}

/// Quote an identifier: `my "table"` becomes `"my ""table"""`.
pub fn escape_identifier(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote a string literal. Backslashes switch to the `E'...'` form so the
/// result is valid whatever `standard_conforming_strings` is set to.
pub fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 3);
    if value.contains('\\') {
        out.push('E');
    }
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}
