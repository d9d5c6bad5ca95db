//! Session factory holding mutable connection settings.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use asedb_core::{Cx, Error};

use crate::config::{
    ConnectorConfig, TlsConfig, clamp_buffer_size, clamp_fetch_size, clamp_poll_interval,
    clamp_timeout,
};
use crate::session::Session;
use crate::transport::Socket;

/// Opens sessions from a shared configuration.
///
/// Setters may be called from any thread at any time. Each session takes a
/// snapshot of the configuration when it connects, so a change only affects
/// sessions opened afterwards. Out-of-range values are clamped, not rejected.
#[derive(Debug, Default)]
pub struct Connector {
    config: RwLock<ConnectorConfig>,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config: RwLock::new(config.normalized()),
        }
    }

    /// Build a connector from an `ase://` DSN.
    #[allow(clippy::result_large_err)]
    pub fn from_dsn(dsn: &str) -> Result<Self, Error> {
        Ok(Self::new(ConnectorConfig::from_dsn(dsn)?))
    }

    fn read(&self) -> RwLockReadGuard<'_, ConnectorConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConnectorConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> ConnectorConfig {
        self.read().clone()
    }

    pub fn locale(&self) -> String {
        self.read().locale.clone()
    }

    pub fn fetch_size(&self) -> usize {
        self.read().fetch_size
    }

    pub fn timeout(&self) -> Duration {
        self.read().timeout
    }

    pub fn buffer_size(&self) -> usize {
        self.read().buffer_size
    }

    pub fn poll_interval(&self) -> Duration {
        self.read().poll_interval
    }

    pub fn tls_config(&self) -> Option<TlsConfig> {
        self.read().tls.clone()
    }

    pub fn set_locale(&self, locale: impl Into<String>) {
        self.write().locale = locale.into();
    }

    pub fn set_fetch_size(&self, size: usize) {
        self.write().fetch_size = clamp_fetch_size(size);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.write().timeout = clamp_timeout(timeout);
    }

    pub fn set_buffer_size(&self, size: usize) {
        self.write().buffer_size = clamp_buffer_size(size);
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.write().poll_interval = clamp_poll_interval(interval);
    }

    /// `None` switches new sessions back to plaintext.
    pub fn set_tls_config(&self, tls: Option<TlsConfig>) {
        self.write().tls = tls;
    }

    /// Open and log in a new session.
    #[allow(clippy::result_large_err)]
    pub fn connect(&self, cx: &Cx) -> Result<Session, Error> {
        let config = self.config();
        Session::connect(cx, config)
    }

    /// Open a session over a stream the caller already connected.
    #[allow(clippy::result_large_err)]
    pub fn connect_over(&self, cx: &Cx, socket: Box<dyn Socket>) -> Result<Session, Error> {
        let config = self.config();
        Session::connect_over(cx, config, socket)
    }
}
