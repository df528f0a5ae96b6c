//! Unicast discovery over TCP.
//!
//! The exchange itself is blocking; the `_async` variants move it onto
//! tokio's blocking pool. A [`StreamCloser`] taken from a
//! [`UnicastConnection`] aborts the exchange from another thread; the
//! blocked side sees `ConnectionAborted` rather than a truncated stream.

use crate::config::UnicastConfig;
use crate::constraints::{InvocationConstraints, ResolvedConstraints};
use crate::error::{DiscoveryError, Result};
use crate::format::FormatRegistry;
use crate::marshal::MarshalContext;
use crate::protocol::{
    serve_unicast_discovery, Discovery, Locator, ProtocolGeneration, UnicastResponse,
    DEFAULT_SOCKET_TIMEOUT,
};
use crate::security::ClientSubjectChecker;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, instrument};

/// Connect to `locator` within the resolved connection deadline.
///
/// Without a deadline constraint each address gets `connect_timeout`.
/// The resolved socket timeout is applied to reads and writes.
#[instrument(level = "debug", skip(constraints), fields(%locator))]
pub fn connect(
    locator: &Locator,
    constraints: &InvocationConstraints,
    connect_timeout: Duration,
) -> Result<UnicastConnection> {
    let resolved = ResolvedConstraints::resolve(constraints)?;
    let deadline = resolved.connection_deadline();

    let mut last_error = None;
    for addr in (locator.host(), locator.port()).to_socket_addrs()? {
        let timeout = match deadline {
            Some(deadline) => match deadline.duration_since(SystemTime::now()) {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connection deadline passed").into())
                }
            },
            None => connect_timeout,
        };
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                apply_socket_timeout(&stream, &resolved)?;
                debug!(%addr, "Connected for unicast discovery");
                return Ok(UnicastConnection::new(stream));
            }
            Err(e) => {
                debug!(%addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {locator}")))
        .into())
}

fn apply_socket_timeout(stream: &TcpStream, resolved: &ResolvedConstraints) -> Result<()> {
    let timeout = resolved.unicast_socket_timeout(DEFAULT_SOCKET_TIMEOUT);
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(())
}

/// Connect and run the client exchange
pub fn discover(
    discovery: &Discovery,
    locator: &Locator,
    constraints: &InvocationConstraints,
    ctx: &MarshalContext,
    connect_timeout: Duration,
) -> Result<UnicastResponse> {
    let mut connection = connect(locator, constraints, connect_timeout)?;
    discovery.do_unicast_discovery(&mut connection, locator, constraints, ctx)
}

pub async fn discover_async(
    discovery: Discovery,
    locator: Locator,
    constraints: InvocationConstraints,
    ctx: MarshalContext,
    connect_timeout: Duration,
) -> Result<UnicastResponse> {
    tokio::task::spawn_blocking(move || {
        discover(&discovery, &locator, &constraints, &ctx, connect_timeout)
    })
    .await
    .map_err(|e| DiscoveryError::Internal(format!("unicast discovery task failed: {e}")))?
}

/// Lookup-service listener on `ip` at the configured port
#[instrument(level = "debug", skip(config), fields(port = config.port))]
pub fn listen(config: &UnicastConfig, ip: IpAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(config.listen_addr(ip))?;
    debug!(addr = ?listener.local_addr().ok(), "Listening for unicast discovery");
    Ok(listener)
}

/// Answer one accepted connection in whichever generation the client speaks
pub fn serve_connection(
    mut stream: TcpStream,
    formats: &Arc<FormatRegistry>,
    response: &UnicastResponse,
    constraints: &InvocationConstraints,
    checker: &dyn ClientSubjectChecker,
    ctx: &MarshalContext,
) -> Result<ProtocolGeneration> {
    let resolved = ResolvedConstraints::resolve(constraints)?;
    apply_socket_timeout(&stream, &resolved)?;
    serve_unicast_discovery(formats, response, &mut stream, constraints, checker, ctx)
}

pub async fn serve_connection_async(
    stream: TcpStream,
    formats: Arc<FormatRegistry>,
    response: UnicastResponse,
    constraints: InvocationConstraints,
    checker: Arc<dyn ClientSubjectChecker>,
    ctx: MarshalContext,
) -> Result<ProtocolGeneration> {
    tokio::task::spawn_blocking(move || {
        serve_connection(stream, &formats, &response, &constraints, checker.as_ref(), &ctx)
    })
    .await
    .map_err(|e| DiscoveryError::Internal(format!("unicast serve task failed: {e}")))?
}

/// Client stream that a [`StreamCloser`] can abort
#[derive(Debug)]
pub struct UnicastConnection {
    stream: TcpStream,
    closed: Arc<AtomicBool>,
}

impl UnicastConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn closer(&self) -> Result<StreamCloser> {
        Ok(StreamCloser {
            stream: self.stream.try_clone()?,
            closed: Arc::clone(&self.closed),
        })
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "discovery stream closed")
}

impl Read for UnicastConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(aborted());
        }
        let n = self.stream.read(buf)?;
        // shutdown wakes a blocked read with end-of-stream
        if n == 0 && !buf.is_empty() && self.is_closed() {
            return Err(aborted());
        }
        Ok(n)
    }
}

impl Write for UnicastConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(aborted());
        }
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Aborts a [`UnicastConnection`] from another thread
#[derive(Debug)]
pub struct StreamCloser {
    stream: TcpStream,
    closed: Arc<AtomicBool>,
}

impl StreamCloser {
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}
