//! Core types shared by the asedb driver crates.
//!
//! - `Error` taxonomy, including the bad-connection marker a session carries
//!   once it can no longer be trusted
//! - `Value` for dynamically typed column data and query arguments
//! - `Row` and `ColumnInfo` for result rows
//! - `Cx` re-export from asupersync for cancellation

// Re-export asupersync's context so callers do not need a direct dependency.
pub use asupersync::Cx;

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError,
    QueryErrorKind, Result, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
