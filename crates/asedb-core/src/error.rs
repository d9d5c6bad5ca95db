//! Error types for asedb operations.

use std::fmt;
use std::sync::Arc;

/// The primary error type for all asedb operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, login, disconnect)
    Connection(ConnectionError),
    /// Errors reported by the server for a statement
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Protocol errors (malformed or unexpected wire data)
    Protocol(ProtocolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation exceeded its deadline
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// The session was quarantined earlier; carries the recorded cause.
    ///
    /// Every operation on a bad session returns this variant with the same
    /// shared cause, so callers can compare causes with `Arc::ptr_eq`.
    BadConnection(Arc<Error>),
    /// Operation the driver deliberately does not provide
    Unsupported(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Login rejected by the server
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
    /// Server terminated the session (fatal severity or unexpected attention)
    Aborted,
    /// Session was already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    /// Server message number
    pub number: Option<i32>,
    /// Server severity class
    pub severity: Option<u8>,
    pub state: Option<u8>,
    pub server: Option<String>,
    pub procedure: Option<String>,
    pub line: Option<u16>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, check)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected, chosen as victim
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Cancelled
    Cancelled,
    /// Other database error
    Database,
}

impl QueryErrorKind {
    /// Classify a server message number.
    pub fn from_server_number(number: i32) -> Self {
        match number {
            102 | 156 | 170 => QueryErrorKind::Syntax,
            207 | 208 | 2812 => QueryErrorKind::NotFound,
            229 | 230 | 10330 => QueryErrorKind::Permission,
            233 | 515 | 546 | 547 | 2601 | 2615 | 2627 => QueryErrorKind::Constraint,
            1205 => QueryErrorKind::Deadlock,
            8152 | 9502 => QueryErrorKind::DataTruncation,
            3618 => QueryErrorKind::Cancelled,
            _ => QueryErrorKind::Database,
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Does this error leave a session's wire state untrustworthy?
    ///
    /// Server-reported statement errors do not; the response stream stays in
    /// sync. Everything that interrupts or corrupts an exchange does.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Protocol(_)
                | Error::Io(_)
                | Error::Timeout
                | Error::Cancelled
                | Error::BadConnection(_)
        )
    }

    /// Is this the bad-connection marker of a quarantined session?
    pub fn is_bad_connection(&self) -> bool {
        matches!(self, Error::BadConnection(_))
    }

    /// The recorded cause, when this is a bad-connection error.
    pub fn bad_connection_cause(&self) -> Option<&Arc<Error>> {
        match self {
            Error::BadConnection(cause) => Some(cause),
            _ => None,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) => true,
            Error::BadConnection(_) => true,
            _ => false,
        }
    }

    /// Was the operation cancelled, directly or as the recorded cause?
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::BadConnection(cause) => cause.is_cancelled(),
            Error::Query(q) => q.kind == QueryErrorKind::Cancelled,
            _ => false,
        }
    }

    /// Did the operation time out, directly or as the recorded cause?
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::BadConnection(cause) => cause.is_timeout(),
            Error::Query(q) => q.kind == QueryErrorKind::Timeout,
            _ => false,
        }
    }

    /// Is this a retryable error (deadlock victim)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => q.kind == QueryErrorKind::Deadlock,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for integrity violations)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the server message number if available
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Error::Query(q) => q.number,
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// A query error with just a message; server fields left empty.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            number: None,
            severity: None,
            state: None,
            server: None,
            procedure: None,
            line: None,
            source: None,
        }
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        matches!(self.number, Some(2601 | 2627))
    }

    /// Is this a foreign key or check violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.number == Some(547)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => match (e.number, e.severity) {
                (Some(number), Some(severity)) => write!(
                    f,
                    "Query error (Msg {}, Level {}): {}",
                    number, severity, e.message
                ),
                _ => write!(f, "Query error: {}", e.message),
            },
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::BadConnection(cause) => write!(f, "Bad connection: {}", cause),
            Error::Unsupported(what) => write!(f, "Unsupported operation: {}", what),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            Error::BadConnection(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.number {
            Some(number) => write!(f, "{} (Msg {})", self.message, number),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for asedb operations.
pub type Result<T> = std::result::Result<T, Error>;
