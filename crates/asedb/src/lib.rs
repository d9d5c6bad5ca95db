//! SAP ASE (Sybase) driver for Rust.
//!
//! This crate implements the TDS 5.0 wire protocol from scratch over a
//! blocking socket. It provides:
//!
//! - Packet framing and token stream decoding
//! - Login with locale and packet size negotiation
//! - Language requests and server cursors for streaming selects
//! - Sessions shared between threads, with bad-connection quarantine
//! - Cancellation and timeouts through asupersync's `Cx`
//! - Optional TLS via rustls (`tls` feature)
//!
//! # Example
//!
//! ```rust,ignore
//! use asedb::{Connector, ConnectorConfig};
//! use asedb_core::Cx;
//!
//! let connector = Connector::new(
//!     ConnectorConfig::new()
//!         .host("db.example.com:5000")
//!         .username("sa")
//!         .password("secret")
//!         .fetch_size(500),
//! );
//! let cx = Cx::for_testing();
//! let session = connector.connect(&cx)?;
//! let mut rows = session.execute(&cx, "select id, name from users where id > ?", &[10_i32.into()])?;
//! while let Some(batch) = rows.next_batch(&cx)? {
//!     for row in batch.rows() {
//!         println!("{:?}", row.get_by_name("name"));
//!     }
//! }
//! session.close(&cx)?;
//! ```

/// Unwrap a reader result, or report that more input is needed.
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

pub mod config;
pub mod connector;
pub mod driver;
pub mod protocol;
pub mod rows;
pub mod session;
pub mod tls;
pub mod transport;
pub mod types;

pub use config::{ConnectorConfig, TlsConfig};
pub use connector::Connector;
pub use driver::{AseDriver, Conn, DRIVER_NAME, Driver, DriverRegistry};
pub use protocol::Column;
pub use rows::{RowBatch, Rows};
pub use session::{ServerInfo, Session, SessionState};
pub use transport::Socket;
pub use types::DataType;
