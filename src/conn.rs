//! Byte-stream connections to remote peers.

use crate::monitor::Direction;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::select;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Capability of a transport to a single peer.
///
/// All methods take `&self` so that one send and one receive can be in flight at the same time,
/// which [`Link`] enforces. [`Connection::close`] must fail every pending and subsequent I/O call.
pub trait Connection: Send + Sync {
    fn connect(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Write some bytes from `buf`, returns how many were written. 0 means the peer is gone.
    fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Read some bytes into `buf`, returns how many were read. 0 means the peer is gone.
    fn receive(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn is_incoming(&self) -> bool;

    fn can_reconnect(&self) -> bool {
        !self.is_incoming()
    }

    /// Raw bytes of the remote IP address.
    fn address_bytes(&self) -> Vec<u8>;

    fn uri(&self) -> &Url;

    fn close(&self);
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

fn peer_uri(addr: &SocketAddr) -> io::Result<Url> {
    let text = match addr {
        SocketAddr::V4(v4) => format!("tcp://{v4}"),
        SocketAddr::V6(v6) => format!("ipv6://{v6}"),
    };
    Url::parse(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// TCP connection over IPv4 (`tcp://`) or IPv6 (`ipv6://`).
pub struct TcpConnection {
    remote_addr: SocketAddr,
    uri: Url,
    incoming: bool,
    stream: Mutex<Option<Arc<TcpStream>>>,
    closed: CancellationToken,
}

impl TcpConnection {
    /// Not yet connected, see [`Connection::connect`].
    pub fn outbound(remote_addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            uri: peer_uri(&remote_addr)?,
            remote_addr,
            incoming: false,
            stream: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    /// Wrap an accepted stream.
    pub fn inbound(stream: TcpStream) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            uri: peer_uri(&remote_addr)?,
            remote_addr,
            incoming: true,
            stream: Mutex::new(Some(Arc::new(stream))),
            closed: CancellationToken::new(),
        })
    }

    /// Create an outbound connection from an endpoint URI such as `tcp://10.0.0.1:6881`
    /// or `ipv6://[fe80::1]:6881`.
    pub fn from_uri(uri: &str) -> io::Result<Self> {
        fn invalid(msg: String) -> io::Error {
            io::Error::new(io::ErrorKind::InvalidInput, msg)
        }
        let url = Url::parse(uri).map_err(|e| invalid(format!("{uri}: {e}")))?;
        let host = url.host_str().ok_or_else(|| invalid(format!("{uri}: no host")))?;
        let ip: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|e| invalid(format!("{uri}: {e}")))?;
        let port = url.port().ok_or_else(|| invalid(format!("{uri}: no port")))?;
        match (url.scheme(), ip) {
            ("tcp", IpAddr::V4(_)) | ("ipv6", IpAddr::V6(_)) => {
                Self::outbound(SocketAddr::new(ip, port))
            }
            (scheme, _) => Err(invalid(format!("{uri}: unsupported scheme '{scheme}'"))),
        }
    }

    pub fn remote_addr(&self) -> &SocketAddr {
        &self.remote_addr
    }

    fn stream(&self) -> io::Result<Arc<TcpStream>> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Connection for TcpConnection {
    async fn connect(&self) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        let stream = select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_error()),
            result = TcpStream::connect(self.remote_addr) => result?,
        };
        log::debug!("{} => connected", self.remote_addr);
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(stream));
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        loop {
            select! {
                biased;
                _ = self.closed.cancelled() => return Err(closed_error()),
                ready = stream.writable() => ready?,
            }
            match stream.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        loop {
            select! {
                biased;
                _ = self.closed.cancelled() => return Err(closed_error()),
                ready = stream.readable() => ready?,
            }
            match stream.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn address_bytes(&self) -> Vec<u8> {
        match self.remote_addr.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }

    fn uri(&self) -> &Url {
        &self.uri
    }

    fn close(&self) {
        self.closed.cancel();
        // the socket is closed once the in-flight calls have observed the cancellation
        if self.stream.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            log::debug!("{} => connection closed", self.remote_addr);
        }
    }
}

/// Connection plus the bookkeeping that allows at most one send and one receive at a time.
pub struct Link<C> {
    connection: C,
    sending: AtomicBool,
    receiving: AtomicBool,
}

/// Proof of exclusive use of one direction of a [`Link`], released on drop.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C: Connection> Link<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            sending: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn into_inner(self) -> C {
        self.connection
    }

    /// Returns `None` if a transfer in `direction` is already in progress.
    pub(crate) fn begin(&self, direction: Direction) -> Option<InFlight<'_>> {
        let flag = match direction {
            Direction::Send => &self.sending,
            Direction::Receive => &self.receiving,
        };
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}
