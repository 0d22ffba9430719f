use crate::conn::Connection;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::select;
use tokio_util::sync::CancellationToken;
use url::Url;

fn test_uri() -> Url {
    Url::parse("tcp://127.0.0.1:6881").unwrap()
}

/// One end of an in-memory byte pipe.
pub struct PipeConnection {
    reader: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
    writer: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
    incoming: bool,
    uri: Url,
    closed: CancellationToken,
}

/// Two connected ends, the first one outgoing and the second one incoming.
pub fn pipe() -> (PipeConnection, PipeConnection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let wrap = |stream: DuplexStream, incoming: bool| {
        let (reader, writer) = tokio::io::split(stream);
        PipeConnection {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            incoming,
            uri: test_uri(),
            closed: CancellationToken::new(),
        }
    };
    (wrap(a, false), wrap(b, true))
}

impl PipeConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Connection for PipeConnection {
    async fn connect(&self) -> io::Result<()> {
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        select! {
            biased;
            _ = self.closed.cancelled() => Err(io::ErrorKind::ConnectionAborted.into()),
            result = writer.write(buf) => result,
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        select! {
            biased;
            _ = self.closed.cancelled() => Err(io::ErrorKind::ConnectionAborted.into()),
            result = reader.read(buf) => result,
        }
    }

    fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn address_bytes(&self) -> Vec<u8> {
        vec![127, 0, 0, 1]
    }

    fn uri(&self) -> &Url {
        &self.uri
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Transfers at most `cap` bytes per call. Received bytes are `0, 1, 2, ...` wrapping at 256.
pub struct CappedConnection {
    cap: usize,
    calls: AtomicUsize,
    received: AtomicUsize,
    sent: Mutex<Vec<u8>>,
    uri: Url,
}

impl CappedConnection {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            calls: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            uri: test_uri(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<u8> {
        self.sent.lock().unwrap().clone()
    }
}

impl Connection for CappedConnection {
    async fn connect(&self) -> io::Result<()> {
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let len = buf.len().min(self.cap);
        self.sent.lock().unwrap().extend_from_slice(&buf[..len]);
        Ok(len)
    }

    async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let len = buf.len().min(self.cap);
        let start = self.received.fetch_add(len, Ordering::SeqCst);
        for (i, byte) in buf[..len].iter_mut().enumerate() {
            *byte = (start + i) as u8;
        }
        Ok(len)
    }

    fn is_incoming(&self) -> bool {
        false
    }

    fn address_bytes(&self) -> Vec<u8> {
        vec![127, 0, 0, 1]
    }

    fn uri(&self) -> &Url {
        &self.uri
    }

    fn close(&self) {}
}

/// Never completes a connect attempt.
pub struct UnresponsiveConnection {
    pub closed: CancellationToken,
    uri: Url,
}

impl UnresponsiveConnection {
    pub fn new() -> Self {
        Self {
            closed: CancellationToken::new(),
            uri: test_uri(),
        }
    }
}

impl Connection for UnresponsiveConnection {
    async fn connect(&self) -> io::Result<()> {
        self.closed.cancelled().await;
        Err(io::ErrorKind::ConnectionAborted.into())
    }

    async fn send(&self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    async fn receive(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn is_incoming(&self) -> bool {
        false
    }

    fn address_bytes(&self) -> Vec<u8> {
        vec![10, 0, 0, 1]
    }

    fn uri(&self) -> &Url {
        &self.uri
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
