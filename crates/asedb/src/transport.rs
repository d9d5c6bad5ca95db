//! Byte transport to the server.
//!
//! Reads block in slices of the poll interval. Between slices the transport
//! checks the caller's `Cx` for cancellation and the current exchange
//! deadline, so a blocked read aborts within about one poll interval of
//! either. An [`AbortHandle`] lets another thread stop it the same way.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use asedb_core::Cx;
use asedb_core::error::{ConnectionError, ConnectionErrorKind, Error};

use crate::config::TlsConfig;
use crate::protocol::FrameSource;
use crate::tls::TlsStream;

/// A bidirectional byte stream the transport can drive.
pub trait Socket: Read + Write + Send + std::fmt::Debug {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// Shut down both directions, unblocking any reader.
    fn shutdown(&self) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(feature = "tls")]
impl Socket for TlsStream<TcpStream> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.get_ref().set_write_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.get_ref().shutdown(Shutdown::Both)
    }
}

fn connection_error(kind: ConnectionErrorKind, message: String, source: Option<io::Error>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message,
        source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Stops a transport's blocking reads and writes from another thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The connection to one server.
#[derive(Debug)]
pub struct Transport {
    socket: Option<Box<dyn Socket>>,
    abort: AbortHandle,
    write_buf: Vec<u8>,
    deadline: Option<Instant>,
    poll_interval: Duration,
    read_timeout: Option<Duration>,
    bytes_sent: u64,
    peer: String,
}

impl Transport {
    /// Resolve, connect and, when configured, negotiate TLS.
    ///
    /// `timeout` bounds the TCP connect to each resolved address.
    #[allow(clippy::result_large_err)]
    pub fn open(
        cx: &Cx,
        host: &str,
        port: u16,
        timeout: Duration,
        poll_interval: Duration,
        tls: Option<&TlsConfig>,
    ) -> Result<Self, Error> {
        if cx.is_cancel_requested() {
            return Err(Error::Cancelled);
        }
        let peer = format!("{}:{}", host, port);

        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                connection_error(
                    ConnectionErrorKind::DnsResolution,
                    format!("Failed to resolve {}: {}", peer, e),
                    Some(e),
                )
            })?
            .collect();
        if addrs.is_empty() {
            return Err(connection_error(
                ConnectionErrorKind::DnsResolution,
                format!("No addresses found for {}", peer),
                None,
            ));
        }

        let mut last_err = None;
        let mut stream = None;
        for addr in &addrs {
            if cx.is_cancel_requested() {
                return Err(Error::Cancelled);
            }
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) => {
                let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                    ConnectionErrorKind::Refused
                } else {
                    ConnectionErrorKind::Connect
                };
                return Err(connection_error(
                    kind,
                    format!("Failed to connect to {}: {}", peer, e),
                    Some(e),
                ));
            }
            (None, None) => {
                return Err(connection_error(
                    ConnectionErrorKind::Connect,
                    format!("Failed to connect to {}", peer),
                    None,
                ));
            }
        };
        stream.set_nodelay(true).ok();

        let socket: Box<dyn Socket> = match tls {
            Some(tls_config) => {
                // The handshake blocks; bound it by the connect timeout.
                stream.set_read_timeout(Some(timeout)).ok();
                stream.set_write_timeout(Some(timeout)).ok();
                let tls_stream = TlsStream::new(stream, tls_config, host)?;
                into_socket(tls_stream)?
            }
            None => Box::new(stream),
        };

        tracing::debug!(peer = %peer, tls = tls.is_some(), "Transport connected");
        let mut transport = Self::from_socket(socket, poll_interval);
        transport.peer = peer;
        Ok(transport)
    }

    /// Drive an already connected stream.
    pub fn from_socket(socket: Box<dyn Socket>, poll_interval: Duration) -> Self {
        Self {
            socket: Some(socket),
            abort: AbortHandle::default(),
            write_buf: Vec::with_capacity(1024),
            deadline: None,
            poll_interval,
            read_timeout: None,
            bytes_sent: 0,
            peer: String::from("<socket>"),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Deadline for blocking reads and writes; `None` waits indefinitely.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Total bytes written to the socket.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn closed_error() -> Error {
        connection_error(
            ConnectionErrorKind::Closed,
            "Transport is closed".to_string(),
            None,
        )
    }

    /// Time left for the next blocking slice, or a timeout error.
    #[allow(clippy::result_large_err)]
    fn next_slice(&self, cx: &Cx) -> Result<Duration, Error> {
        if self.abort.is_aborted() {
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                format!("Connection to {} was closed by another thread", self.peer),
                None,
            ));
        }
        if cx.is_cancel_requested() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::Timeout);
                }
                Ok(left.min(self.poll_interval).max(Duration::from_millis(1)))
            }
            None => Ok(self.poll_interval),
        }
    }

    /// Read at least one byte.
    #[allow(clippy::result_large_err)]
    pub fn read(&mut self, cx: &Cx, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let slice = self.next_slice(cx)?;
            let socket = self.socket.as_mut().ok_or_else(Self::closed_error)?;
            if self.read_timeout != Some(slice) {
                socket.set_read_timeout(Some(slice)).map_err(Error::Io)?;
                self.read_timeout = Some(slice);
            }
            match socket.read(buf) {
                Ok(0) => {
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        format!("Connection to {} closed by server", self.peer),
                        None,
                    ));
                }
                Ok(n) => return Ok(n),
                Err(e) if is_retry(&e) => {}
                Err(e) => {
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        format!("Failed to read from {}: {}", self.peer, e),
                        Some(e),
                    ));
                }
            }
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn read_exact(&mut self, cx: &Cx, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(cx, &mut buf[filled..])?;
        }
        Ok(())
    }

    /// Queue bytes; nothing reaches the socket until [`Transport::flush`].
    pub fn write(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Write all queued bytes.
    ///
    /// Cancellation is observed before the first byte and while the socket
    /// is not accepting data. The queue is empty afterwards either way.
    #[allow(clippy::result_large_err)]
    pub fn flush(&mut self, cx: &Cx) -> Result<(), Error> {
        let result = self.drain(cx);
        self.write_buf.clear();
        result
    }

    #[allow(clippy::result_large_err)]
    fn drain(&mut self, cx: &Cx) -> Result<(), Error> {
        let mut written = 0;
        while written < self.write_buf.len() {
            let slice = self.next_slice(cx)?;
            let socket = self.socket.as_mut().ok_or_else(Self::closed_error)?;
            socket.set_write_timeout(Some(slice)).ok();
            match socket.write(&self.write_buf[written..]) {
                Ok(0) => {
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        format!("Connection to {} closed while writing", self.peer),
                        None,
                    ));
                }
                Ok(n) => {
                    written += n;
                    self.bytes_sent += n as u64;
                }
                Err(e) if is_retry(&e) => {}
                Err(e) => {
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        format!("Failed to write to {}: {}", self.peer, e),
                        Some(e),
                    ));
                }
            }
        }

        // A TLS stream may still hold accepted bytes the socket has not taken.
        loop {
            let slice = self.next_slice(cx)?;
            let socket = self.socket.as_mut().ok_or_else(Self::closed_error)?;
            socket.set_write_timeout(Some(slice)).ok();
            match socket.flush() {
                Ok(()) => break,
                Err(e) if is_retry(&e) => {}
                Err(e) => {
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        format!("Failed to flush stream to {}: {}", self.peer, e),
                        Some(e),
                    ));
                }
            }
        }
        tracing::trace!(bytes = written, "Flushed request");
        Ok(())
    }

    /// Write and flush, ignoring cancellation. Used for attention and
    /// logout, which must go out even when the caller has given up.
    pub fn send_best_effort(&mut self, data: &[u8], timeout: Duration) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        socket.set_write_timeout(Some(timeout)).ok();
        match socket.write_all(data).and_then(|()| socket.flush()) {
            Ok(()) => {
                self.bytes_sent += data.len() as u64;
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Best-effort send failed");
                false
            }
        }
    }

    /// Shut down and drop the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.write_buf.clear();
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.shutdown() {
                tracing::trace!(error = %e, "Socket shutdown failed");
            }
            tracing::debug!(peer = %self.peer, "Transport closed");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl FrameSource for Transport {
    fn read_exact(&mut self, cx: &Cx, buf: &mut [u8]) -> Result<(), Error> {
        Transport::read_exact(self, cx, buf)
    }
}

#[cfg(feature = "tls")]
#[allow(clippy::unnecessary_wraps, clippy::result_large_err)]
fn into_socket(stream: TlsStream<TcpStream>) -> Result<Box<dyn Socket>, Error> {
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
#[allow(clippy::result_large_err)]
fn into_socket(_stream: TlsStream<TcpStream>) -> Result<Box<dyn Socket>, Error> {
    Err(crate::tls::tls_error("TLS support requires the 'tls' feature"))
}
