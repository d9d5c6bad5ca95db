//! Session lifecycle and statement execution.
//!
//! A [`Session`] is one logged-in connection. Clones share the connection;
//! every exchange holds the wire mutex for its whole request and response,
//! so concurrent callers never interleave bytes.
//!
//! Errors that leave the wire state unknown (I/O failure, protocol
//! corruption, cancellation or timeout after the request went out) put the
//! session into [`SessionState::Bad`]. From then on every operation returns
//! [`Error::BadConnection`] carrying the same recorded cause, without
//! touching the network.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};

use asedb_core::error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind};
use asedb_core::{Cx, Error, Value};

use crate::config::ConnectorConfig;
use crate::protocol::token::protocol_error;
use crate::protocol::{
    Codec, Column, CursorInfo, DEFAULT_PACKET_SIZE, EnvChange, LoginParams, LoginStatus, Message,
    env_type,
};
use crate::rows::{Cursor, Rows};
use crate::transport::{AbortHandle, Socket, Transport};
use crate::types::{interpolate_params, is_cursor_query};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Attention and logout are abandoned after this long.
const BEST_EFFORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// Login in progress
    Connecting,
    /// Idle and usable
    Ready,
    /// A statement is on the wire
    Executing,
    /// A cursor fetch is on the wire
    Fetching,
    /// Quarantined; carries the error that broke the session
    Bad(Arc<Error>),
    /// Closed by the caller
    Closed,
}

impl SessionState {
    /// Can this session accept a new request?
    pub fn can_execute(&self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Executing | SessionState::Fetching
        )
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, SessionState::Bad(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Executing => write!(f, "executing"),
            SessionState::Fetching => write!(f, "fetching"),
            SessionState::Bad(cause) => write!(f, "bad ({})", cause),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// What the server reported about itself at login and since.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub program: String,
    pub version: String,
    pub tds_version: String,
    pub database: String,
    pub language: String,
    pub charset: String,
    /// Negotiated packet size
    pub packet_size: usize,
}

impl ServerInfo {
    /// Record an environment change; returns the new packet size when the
    /// change negotiates one.
    fn apply(&mut self, change: &EnvChange) -> Option<usize> {
        match change.kind {
            env_type::DATABASE => self.database.clone_from(&change.new_value),
            env_type::LANGUAGE => self.language.clone_from(&change.new_value),
            env_type::CHARSET => self.charset.clone_from(&change.new_value),
            env_type::PACKET_SIZE => match change.new_value.trim().parse::<usize>() {
                Ok(size) => {
                    self.packet_size = size;
                    return Some(size);
                }
                Err(_) => {
                    tracing::warn!(value = %change.new_value, "Ignoring unparseable packet size");
                }
            },
            other => tracing::trace!(kind = other, "Ignoring environment change"),
        }
        None
    }
}

fn dotted(version: [u8; 4]) -> String {
    version
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn connection_error(kind: ConnectionErrorKind, message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: message.into(),
        source: None,
    })
}

fn login_params(config: &ConnectorConfig) -> LoginParams {
    let mut params = LoginParams::new(config.username.clone(), config.password.clone());
    params.language.clone_from(&config.locale);
    params.app_name.clone_from(&config.app_name);
    params.server_name.clone_from(&config.host);
    params.packet_size = config.buffer_size;
    params
}

/// Everything one response carried that the caller may need.
#[derive(Debug, Default)]
struct Response {
    columns: Option<Arc<[Column]>>,
    rows: Vec<Vec<Value>>,
    /// Result sets after the first; their rows are discarded
    extra_results: usize,
    rows_affected: Option<u64>,
    cursor: Option<CursorInfo>,
    /// First server error; reported once the response is drained
    error: Option<Error>,
}

/// The connection itself. Only reachable through the session mutex.
#[derive(Debug)]
struct Wire {
    session: u64,
    transport: Transport,
    codec: Codec,
    in_tx: bool,
    server: ServerInfo,
    server_changed: bool,
}

impl Wire {
    #[allow(clippy::result_large_err)]
    fn send(&mut self, cx: &Cx, request: &[u8]) -> Result<(), Error> {
        self.transport.write(request);
        self.transport.flush(cx)
    }

    fn apply_env(&mut self, changes: &[EnvChange]) {
        for change in changes {
            tracing::debug!(
                session = self.session,
                kind = change.kind,
                value = %change.new_value,
                "Environment change"
            );
            if let Some(size) = self.server.apply(change) {
                self.codec.set_packet_size(size);
            }
        }
        self.server_changed = true;
    }

    #[allow(clippy::result_large_err)]
    fn login(&mut self, cx: &Cx, params: &LoginParams) -> Result<(), Error> {
        let request = self.codec.encode_login(params);
        self.send(cx, &request)?;

        let mut ack = None;
        let mut failure = None;
        let mut packet_size = None;
        loop {
            match self.codec.decode_next(cx, &mut self.transport)? {
                Message::LoginAck(a) => ack = Some(a),
                Message::EnvChange(changes) => {
                    for change in &changes {
                        if let Some(size) = self.server.apply(change) {
                            packet_size = Some(size);
                        }
                    }
                }
                Message::ServerMessage(msg) => {
                    if !msg.is_error() {
                        tracing::debug!(number = msg.number, message = %msg.message.trim(), "Login message");
                    } else if failure.is_none() {
                        failure = Some(msg);
                    }
                }
                Message::Done(done) => {
                    if !done.has_more() {
                        break;
                    }
                }
                _ => {}
            }
        }

        let failure_text = |default: &str| {
            failure
                .as_ref()
                .map_or_else(|| default.to_string(), |m| m.message.trim().to_string())
        };
        let Some(ack) = ack else {
            return Err(match &failure {
                Some(_) => connection_error(
                    ConnectionErrorKind::Authentication,
                    failure_text("Login failed"),
                ),
                None => protocol_error("server did not acknowledge the login"),
            });
        };
        match ack.status {
            LoginStatus::Succeeded => {}
            LoginStatus::Failed => {
                return Err(connection_error(
                    ConnectionErrorKind::Authentication,
                    failure_text("Login failed"),
                ));
            }
            LoginStatus::Negotiate => {
                return Err(connection_error(
                    ConnectionErrorKind::Authentication,
                    "Server requested login negotiation, which is not supported",
                ));
            }
            LoginStatus::Other(status) => {
                return Err(protocol_error(format!("unknown login status {}", status)));
            }
        }

        self.server.program = ack.server_program;
        self.server.version = dotted(ack.server_version);
        self.server.tds_version = dotted(ack.tds_version);
        self.codec
            .set_packet_size(packet_size.unwrap_or(DEFAULT_PACKET_SIZE));
        self.server.packet_size = self.codec.packet_size();
        Ok(())
    }

    /// Read one complete response.
    ///
    /// Server errors are collected and returned in the `Response` so the
    /// stream is always drained; only wire-level failures abort the read.
    #[allow(clippy::result_large_err)]
    fn read_response(&mut self, cx: &Cx, sql: Option<&str>) -> Result<Response, Error> {
        let mut resp = Response::default();
        loop {
            match self.codec.decode_next(cx, &mut self.transport)? {
                Message::ColumnMetadata(columns) => {
                    if resp.columns.is_none() && resp.rows.is_empty() {
                        resp.columns = Some(columns);
                    } else {
                        resp.extra_results += 1;
                    }
                }
                Message::RowData(values) => {
                    if resp.extra_results == 0 {
                        resp.rows.push(values);
                    }
                }
                Message::ServerMessage(msg) => {
                    if msg.is_fatal() {
                        return Err(connection_error(
                            ConnectionErrorKind::Aborted,
                            format!(
                                "Server terminated the session: {} (number {}, severity {})",
                                msg.message.trim(),
                                msg.number,
                                msg.severity
                            ),
                        ));
                    }
                    if msg.is_error() {
                        if resp.error.is_none() {
                            resp.error = Some(msg.to_query_error(sql));
                        } else {
                            tracing::debug!(number = msg.number, message = %msg.message.trim(), "Additional server error");
                        }
                    } else if msg.severity >= 10 {
                        tracing::warn!(
                            session = self.session,
                            number = msg.number,
                            message = %msg.message.trim(),
                            "Server message"
                        );
                    } else {
                        tracing::debug!(
                            session = self.session,
                            number = msg.number,
                            message = %msg.message.trim(),
                            "Server message"
                        );
                    }
                }
                Message::Done(done) => {
                    if done.is_attention_ack() {
                        return Err(protocol_error("unexpected attention acknowledgement"));
                    }
                    if let Some(count) = done.row_count() {
                        resp.rows_affected = Some(resp.rows_affected.unwrap_or(0) + count);
                    }
                    if done.is_error() && resp.error.is_none() {
                        resp.error = Some(Error::Query(QueryError {
                            sql: sql.map(str::to_string),
                            ..QueryError::new(
                                QueryErrorKind::Database,
                                "Statement failed without a server message",
                            )
                        }));
                    }
                    if done.transaction_aborted() && self.in_tx {
                        tracing::warn!(session = self.session, "Server rolled back the open transaction");
                    }
                    self.in_tx = done.in_transaction();
                    if !done.has_more() {
                        break;
                    }
                }
                Message::CursorInfo(info) => {
                    if info.cursor_id != 0 || resp.cursor.is_none() {
                        resp.cursor = Some(info);
                    }
                }
                Message::ReturnStatus(status) => {
                    tracing::trace!(session = self.session, status, "Return status");
                }
                Message::EnvChange(changes) => self.apply_env(&changes),
                Message::LoginAck(_) => {
                    return Err(protocol_error("login acknowledgement outside login"));
                }
                Message::Capability | Message::ParamMetadata(_) | Message::ParamData(_) => {}
            }
        }
        if resp.extra_results > 0 {
            tracing::debug!(
                session = self.session,
                discarded = resp.extra_results,
                "Discarded rows of additional result sets"
            );
        }
        Ok(resp)
    }

    #[allow(clippy::result_large_err)]
    fn language(&mut self, cx: &Cx, sql: &str) -> Result<Response, Error> {
        let request = self.codec.encode_query(sql);
        self.send(cx, &request)?;
        let mut resp = self.read_response(cx, Some(sql))?;
        match resp.error.take() {
            Some(error) => Err(error),
            None => Ok(resp),
        }
    }

    /// Declare, size and open a cursor, then fetch its first batch.
    #[allow(clippy::result_large_err)]
    fn open_cursor(
        &mut self,
        cx: &Cx,
        name: &str,
        sql: &str,
        fetch_size: usize,
    ) -> Result<(Cursor, Vec<Vec<Value>>), Error> {
        let request = self.codec.encode_cursor_open(name, sql, fetch_size);
        self.send(cx, &request)?;
        let mut resp = self.read_response(cx, Some(sql))?;

        let cursor_id = resp
            .cursor
            .as_ref()
            .map(|info| info.cursor_id)
            .filter(|id| *id != 0);
        if let Some(error) = resp.error.take() {
            if let Some(id) = cursor_id {
                self.close_cursor(cx, id)?;
            }
            return Err(error);
        }
        let id = cursor_id.ok_or_else(|| protocol_error("server did not assign a cursor id"))?;

        let mut cursor = Cursor {
            id,
            name: name.to_string(),
            columns: resp.columns.or_else(|| self.codec.columns()),
            open: true,
        };
        match self.fetch(cx, &mut cursor, fetch_size) {
            Ok(rows) => Ok((cursor, rows)),
            Err(error) => {
                if cursor.open && !error.is_fatal_to_session() {
                    self.close_cursor(cx, cursor.id)?;
                }
                Err(error)
            }
        }
    }

    /// Fetch up to `fetch_size` rows. A short batch means the cursor is
    /// exhausted; it is closed before returning.
    #[allow(clippy::result_large_err)]
    fn fetch(
        &mut self,
        cx: &Cx,
        cursor: &mut Cursor,
        fetch_size: usize,
    ) -> Result<Vec<Vec<Value>>, Error> {
        self.codec.set_columns(cursor.columns.clone());
        let request = self.codec.encode_fetch_more(cursor.id, fetch_size);
        self.send(cx, &request)?;
        let mut resp = self.read_response(cx, None)?;
        if resp.columns.is_some() {
            cursor.columns = resp.columns.take();
        }
        if let Some(error) = resp.error.take() {
            return Err(error);
        }
        tracing::trace!(
            session = self.session,
            cursor = cursor.id,
            rows = resp.rows.len(),
            "Fetched batch"
        );
        if resp.rows.len() < fetch_size {
            self.close_cursor(cx, cursor.id)?;
            cursor.open = false;
        }
        Ok(resp.rows)
    }

    #[allow(clippy::result_large_err)]
    fn close_cursor(&mut self, cx: &Cx, id: i32) -> Result<(), Error> {
        let request = self.codec.encode_cursor_close(id);
        self.send(cx, &request)?;
        let mut resp = self.read_response(cx, None)?;
        if let Some(error) = resp.error.take() {
            tracing::debug!(session = self.session, cursor = id, error = %error, "Cursor close reported an error");
        }
        Ok(())
    }
}

struct Shared {
    id: u64,
    config: ConnectorConfig,
    state: RwLock<SessionState>,
    /// First fatal error; set once
    cause: OnceLock<Arc<Error>>,
    wire: Mutex<Wire>,
    /// Cursors whose `Rows` were dropped while open
    orphans: Mutex<Vec<i32>>,
    /// Set by `close`; no new exchange starts once it is.
    closing: AtomicBool,
    abort: AbortHandle,
    in_tx: AtomicBool,
    server: RwLock<ServerInfo>,
    next_cursor: AtomicU64,
}

/// A logged-in connection to one server.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to the configured server and log in.
    ///
    /// The connect and the login exchange are each bounded by the
    /// configured timeout.
    #[tracing::instrument(level = "debug", skip(cx, config), fields(host = %config.host, port = config.port))]
    #[allow(clippy::result_large_err)]
    pub fn connect(cx: &Cx, config: ConnectorConfig) -> Result<Self, Error> {
        let config = config.normalized();
        config.validate()?;
        let transport = Transport::open(
            cx,
            &config.host,
            config.port,
            config.timeout,
            config.poll_interval,
            config.tls.as_ref(),
        )?;
        Self::login(cx, config, transport)
    }

    /// Log in over an already connected socket.
    #[allow(clippy::result_large_err)]
    pub fn connect_over(
        cx: &Cx,
        config: ConnectorConfig,
        socket: Box<dyn Socket>,
    ) -> Result<Self, Error> {
        let config = config.normalized();
        config.validate()?;
        let transport = Transport::from_socket(socket, config.poll_interval);
        Self::login(cx, config, transport)
    }

    #[allow(clippy::result_large_err)]
    fn login(cx: &Cx, config: ConnectorConfig, transport: Transport) -> Result<Self, Error> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        // Responses up to the requested size are accepted until the server
        // confirms what it will actually use.
        let mut wire = Wire {
            session: id,
            transport,
            codec: Codec::new(config.buffer_size),
            in_tx: false,
            server: ServerInfo::default(),
            server_changed: false,
        };

        wire.transport
            .set_deadline(Some(Instant::now() + config.timeout));
        let result = wire.login(cx, &login_params(&config));
        wire.transport.set_deadline(None);
        if let Err(e) = result {
            tracing::debug!(session = id, error = %e, "Login failed");
            wire.transport.close();
            return Err(e);
        }

        tracing::info!(
            session = id,
            peer = %wire.transport.peer(),
            server = %wire.server.program,
            version = %wire.server.version,
            packet_size = wire.server.packet_size,
            database = %wire.server.database,
            "Logged in"
        );

        wire.server_changed = false;
        let server = wire.server.clone();
        let abort = wire.transport.abort_handle();
        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                state: RwLock::new(SessionState::Ready),
                cause: OnceLock::new(),
                wire: Mutex::new(wire),
                orphans: Mutex::new(Vec::new()),
                closing: AtomicBool::new(false),
                abort,
                in_tx: AtomicBool::new(false),
                server: RwLock::new(server),
                next_cursor: AtomicU64::new(1),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The configuration this session was opened with.
    pub fn config(&self) -> &ConnectorConfig {
        &self.shared.config
    }

    pub fn fetch_size(&self) -> usize {
        self.shared.config.fetch_size
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_bad(&self) -> bool {
        self.shared.cause.get().is_some()
    }

    /// The error that quarantined this session, if any.
    pub fn bad_cause(&self) -> Option<Arc<Error>> {
        self.shared.cause.get().cloned()
    }

    /// Did the last completed statement leave a transaction open?
    pub fn in_transaction(&self) -> bool {
        self.shared.in_tx.load(Ordering::Acquire)
    }

    pub fn server_info(&self) -> ServerInfo {
        self.shared
            .server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a statement and return its rows.
    ///
    /// `?` placeholders are replaced by `args` rendered as SQL literals.
    /// Plain selects are streamed through a server cursor `fetch_size` rows
    /// at a time; anything else is read in full and split into batches.
    #[tracing::instrument(level = "debug", skip(self, cx, args), fields(session = self.shared.id))]
    #[allow(clippy::result_large_err)]
    pub fn execute(&self, cx: &Cx, sql: &str, args: &[Value]) -> Result<Rows, Error> {
        let sql = if args.is_empty() {
            sql.to_string()
        } else {
            interpolate_params(sql, args)?
        };
        let fetch_size = self.shared.config.fetch_size;

        if is_cursor_query(&sql) {
            let name = format!(
                "asedb_c{}",
                self.shared.next_cursor.fetch_add(1, Ordering::Relaxed)
            );
            let (cursor, first) = self.run(cx, SessionState::Executing, |wire, cx| {
                wire.open_cursor(cx, &name, &sql, fetch_size)
            })?;
            tracing::debug!(
                cursor = %cursor.name,
                id = cursor.id,
                rows = first.len(),
                open = cursor.open,
                "Cursor opened"
            );
            Ok(Rows::from_cursor(self.clone(), cursor, first, fetch_size))
        } else {
            let resp = self.run(cx, SessionState::Executing, |wire, cx| {
                wire.language(cx, &sql)
            })?;
            Ok(Rows::buffered(
                self.clone(),
                resp.columns,
                resp.rows,
                resp.rows_affected,
                fetch_size,
            ))
        }
    }

    /// Run a statement for its effect; returns the rows affected.
    #[tracing::instrument(level = "debug", skip(self, cx, args), fields(session = self.shared.id))]
    #[allow(clippy::result_large_err)]
    pub fn exec(&self, cx: &Cx, sql: &str, args: &[Value]) -> Result<u64, Error> {
        let sql = if args.is_empty() {
            sql.to_string()
        } else {
            interpolate_params(sql, args)?
        };
        let resp = self.run(cx, SessionState::Executing, |wire, cx| {
            wire.language(cx, &sql)
        })?;
        Ok(resp.rows_affected.unwrap_or(0))
    }

    /// Log out and release the connection.
    ///
    /// Close ignores cancellation on `cx` and always succeeds. On a bad
    /// session it returns `Ok(())` instead of the recorded cause, which stays
    /// available through [`Session::bad_cause`]. If another thread is in the
    /// middle of an exchange, close waits briefly and then aborts it.
    #[tracing::instrument(level = "debug", skip(self, _cx), fields(session = self.shared.id))]
    #[allow(clippy::result_large_err)]
    pub fn close(&self, _cx: &Cx) -> Result<(), Error> {
        self.shared.closing.store(true, Ordering::Release);
        if self.is_bad() || matches!(self.state(), SessionState::Closed) {
            self.set_state(SessionState::Closed);
            return Ok(());
        }

        match self.acquire_wire(None, BEST_EFFORT_TIMEOUT) {
            Ok(mut wire) => self.shut_down(&mut wire),
            Err(Error::BadConnection(_)) => {}
            Err(_) => {
                tracing::debug!(session = self.shared.id, "Session busy, aborting the exchange in flight");
                self.shared.abort.abort();
            }
        }
        self.set_state(SessionState::Closed);
        Ok(())
    }

    /// Next batch of an open cursor.
    #[allow(clippy::result_large_err)]
    pub(crate) fn fetch_batch(
        &self,
        cx: &Cx,
        cursor: &mut Cursor,
        fetch_size: usize,
    ) -> Result<Vec<Vec<Value>>, Error> {
        self.run(cx, SessionState::Fetching, |wire, cx| {
            wire.fetch(cx, cursor, fetch_size)
        })
    }

    /// Close a cursor. A cursor on a dead session is already gone.
    #[allow(clippy::result_large_err)]
    pub(crate) fn close_cursor(&self, cx: &Cx, id: i32) -> Result<(), Error> {
        if self.is_bad() || self.is_closing() {
            return Ok(());
        }
        self.run(cx, SessionState::Fetching, |wire, cx| {
            wire.close_cursor(cx, id)
        })
    }

    /// Queue a cursor to be closed at the start of the next exchange.
    pub(crate) fn queue_orphan(&self, id: i32) {
        if self.is_bad() || self.is_closing() {
            return;
        }
        self.shared
            .orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }

    /// `Closed` is terminal.
    fn set_state(&self, state: SessionState) {
        let mut current = self
            .shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !matches!(*current, SessionState::Closed) {
            *current = state;
        }
    }

    fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Log out if the wire is between exchanges, then drop the socket.
    fn shut_down(&self, wire: &mut Wire) {
        if wire.transport.is_closed() {
            return;
        }
        if wire.codec.is_idle() {
            let logout = wire.codec.encode_logout();
            wire.transport.send_best_effort(&logout, BEST_EFFORT_TIMEOUT);
        }
        wire.transport.close();
        self.shared
            .orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!(session = self.shared.id, "Session closed");
    }

    #[allow(clippy::result_large_err)]
    fn check_usable(&self) -> Result<(), Error> {
        if let Some(cause) = self.shared.cause.get() {
            return Err(Error::BadConnection(Arc::clone(cause)));
        }
        if self.is_closing() || matches!(self.state(), SessionState::Closed) {
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                "Session is closed",
            ));
        }
        Ok(())
    }

    /// Record `cause` as the reason this session is unusable.
    ///
    /// The first recorded cause wins; every caller gets that one back.
    fn mark_bad(&self, cause: Error) -> Error {
        let cause = Arc::clone(self.shared.cause.get_or_init(|| Arc::new(cause)));
        tracing::warn!(session = self.shared.id, error = %cause, "Session marked bad");
        self.set_state(SessionState::Bad(Arc::clone(&cause)));
        Error::BadConnection(cause)
    }

    /// Take the wire mutex, waiting at most the configured timeout.
    ///
    /// A failed wait leaves the session as it was.
    #[allow(clippy::result_large_err)]
    fn lock_wire(&self, cx: &Cx) -> Result<MutexGuard<'_, Wire>, Error> {
        self.acquire_wire(Some(cx), self.shared.config.timeout)
    }

    /// Poll for the wire mutex for up to `wait`, observing `cx` if given.
    #[allow(clippy::result_large_err)]
    fn acquire_wire(&self, cx: Option<&Cx>, wait: Duration) -> Result<MutexGuard<'_, Wire>, Error> {
        let deadline = Instant::now() + wait;
        let mut backoff = Duration::from_millis(1);
        loop {
            if cx.is_some_and(Cx::is_cancel_requested) {
                return Err(Error::Cancelled);
            }
            match self.shared.wire.try_lock() {
                Ok(wire) => return Ok(wire),
                Err(TryLockError::Poisoned(poisoned)) => {
                    poisoned.into_inner().transport.close();
                    return Err(self.mark_bad(Error::Custom(
                        "a thread panicked while holding the session".to_string(),
                    )));
                }
                Err(TryLockError::WouldBlock) => {}
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::Timeout);
            }
            std::thread::sleep(backoff.min(left));
            backoff = (backoff * 2).min(self.shared.config.poll_interval);
        }
    }

    /// Run one exchange under the wire mutex.
    #[allow(clippy::result_large_err)]
    fn run<T>(
        &self,
        cx: &Cx,
        phase: SessionState,
        op: impl FnOnce(&mut Wire, &Cx) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.check_usable()?;
        if cx.is_cancel_requested() {
            return Err(Error::Cancelled);
        }
        let mut wire = self.lock_wire(cx)?;
        self.check_usable()?;

        self.set_state(phase);
        wire.transport
            .set_deadline(Some(Instant::now() + self.shared.config.timeout));
        let sent_before = wire.transport.bytes_sent();
        let result = self
            .close_orphans(&mut *wire, cx)
            .and_then(|()| op(&mut *wire, cx));
        wire.transport.set_deadline(None);

        self.shared.in_tx.store(wire.in_tx, Ordering::Release);
        if wire.server_changed {
            wire.server_changed = false;
            *self
                .shared
                .server
                .write()
                .unwrap_or_else(PoisonError::into_inner) = wire.server.clone();
        }

        let outcome = match result {
            Ok(value) => {
                self.set_state(SessionState::Ready);
                Ok(value)
            }
            Err(error) => Err(self.fail(&mut *wire, error, sent_before)),
        };
        if self.is_closing() {
            self.shut_down(&mut wire);
        }
        outcome
    }

    /// Decide what an exchange error does to the session.
    ///
    /// Errors the server reported leave it ready. So does a cancellation or
    /// timeout that struck before any byte went out. Everything else
    /// quarantines it.
    fn fail(&self, wire: &mut Wire, error: Error, sent_before: u64) -> Error {
        let interrupted = matches!(error, Error::Cancelled | Error::Timeout);
        let untouched = wire.transport.bytes_sent() == sent_before && wire.codec.is_idle();
        if !error.is_fatal_to_session() || (interrupted && untouched) {
            self.set_state(SessionState::Ready);
            return error;
        }

        if interrupted {
            let attention = wire.codec.encode_attention();
            wire.transport.send_best_effort(&attention, BEST_EFFORT_TIMEOUT);
        }
        wire.transport.close();
        wire.codec.reset();
        self.mark_bad(error)
    }

    #[allow(clippy::result_large_err)]
    fn close_orphans(&self, wire: &mut Wire, cx: &Cx) -> Result<(), Error> {
        loop {
            let next = self
                .shared
                .orphans
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop();
            let Some(id) = next else {
                return Ok(());
            };
            if let Err(e) = wire.close_cursor(cx, id) {
                self.shared
                    .orphans
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(id);
                return Err(e);
            }
            tracing::debug!(session = self.shared.id, cursor = id, "Closed orphaned cursor");
        }
    }
}
