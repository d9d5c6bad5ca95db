//! Database-agnostic driver surface.
//!
//! Host applications own a [`DriverRegistry`] and open connections by
//! driver name and DSN. Nothing is registered globally.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use asedb_core::{Cx, Error, Value};

use crate::config::ConnectorConfig;
use crate::rows::Rows;
use crate::session::Session;

/// Name [`AseDriver`] is registered under by [`DriverRegistry::with_defaults`].
pub const DRIVER_NAME: &str = "asedb";

/// Something that can open connections from a DSN.
pub trait Driver: Send + Sync + fmt::Debug {
    #[allow(clippy::result_large_err)]
    fn open(&self, cx: &Cx, dsn: &str) -> Result<Conn, Error>;
}

/// Driver for ASE over TDS 5.0.
#[derive(Debug, Default, Clone, Copy)]
pub struct AseDriver;

impl Driver for AseDriver {
    fn open(&self, cx: &Cx, dsn: &str) -> Result<Conn, Error> {
        let config = ConnectorConfig::from_dsn(dsn)?;
        Ok(Conn::new(Session::connect(cx, config)?))
    }
}

/// Name to driver table.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with [`AseDriver`] under [`DRIVER_NAME`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(DRIVER_NAME.to_string(), Arc::new(AseDriver));
        registry
    }

    /// Add a driver. A name can only be registered once.
    #[allow(clippy::result_large_err)]
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Result<(), Error> {
        let name = name.into();
        let mut drivers = self
            .drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if drivers.contains_key(&name) {
            return Err(Error::Custom(format!(
                "driver '{}' is already registered",
                name
            )));
        }
        tracing::debug!(driver = %name, "Registered driver");
        drivers.insert(name, driver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Open a connection through the named driver.
    #[allow(clippy::result_large_err)]
    pub fn open(&self, cx: &Cx, name: &str, dsn: &str) -> Result<Conn, Error> {
        let driver = self
            .get(name)
            .ok_or_else(|| Error::Custom(format!("unknown driver '{}'", name)))?;
        driver.open(cx, dsn)
    }
}

/// A connection handed out by a [`Driver`].
#[derive(Debug, Clone)]
pub struct Conn {
    session: Session,
}

impl Conn {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run a query and stream its rows.
    #[allow(clippy::result_large_err)]
    pub fn query_context(&self, cx: &Cx, sql: &str, args: &[Value]) -> Result<Rows, Error> {
        self.session.execute(cx, sql, args)
    }

    /// Run a statement; returns the rows affected.
    #[allow(clippy::result_large_err)]
    pub fn exec_context(&self, cx: &Cx, sql: &str, args: &[Value]) -> Result<u64, Error> {
        self.session.exec(cx, sql, args)
    }

    /// Prepared statements are not provided; statements run as language
    /// requests with client-side interpolation.
    #[allow(clippy::result_large_err)]
    pub fn prepare(&self, _sql: &str) -> Result<(), Error> {
        Err(Error::Unsupported(
            "prepared statements are not supported by asedb".to_string(),
        ))
    }

    /// Transactions are not managed by the driver. Issue `begin tran` and
    /// `commit tran` as statements instead.
    #[allow(clippy::result_large_err)]
    pub fn begin(&self) -> Result<(), Error> {
        Err(Error::Unsupported(
            "driver-managed transactions are not supported by asedb".to_string(),
        ))
    }

    /// Should a pool discard this connection?
    pub fn is_bad(&self) -> bool {
        self.session.is_bad()
    }

    #[allow(clippy::result_large_err)]
    pub fn close(&self, cx: &Cx) -> Result<(), Error> {
        self.session.close(cx)
    }
}
