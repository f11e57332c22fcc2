//! Byte-pipe transport
//!
//! The transport knows nothing about DNP3 framing. It moves raw bytes between
//! the session actor and a connected stream, and keeps simple counters.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`TransportSettings`] | Remote endpoint plus optional local bind address |
//! | [`Dnp3Transport`] | Trait the session actors drive |
//! | [`StreamTransport`] | Implementation over any `AsyncRead + AsyncWrite` stream |
//! | [`TcpTransport`] | `StreamTransport<TcpStream>` with `open` / `accept` |
//!
//! Dropping a transport releases the socket on every exit path; `close()` also
//! performs an orderly shutdown first.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::{Dnp3Error, Dnp3Result};

/// Size of the stack buffer used by one `receive()` call
const READ_CHUNK_SIZE: usize = 4096;

/// Where to connect (master) or listen (outstation)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Host name or IP literal
    pub address: String,
    pub port: u16,
    /// Local interface to bind before connecting
    pub local_address: Option<IpAddr>,
    /// Upper bound on connection establishment
    pub connect_timeout: Duration,
}

impl TransportSettings {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            local_address: None,
            connect_timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_local_address(mut self, local: IpAddr) -> Self {
        self.local_address = Some(local);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reject settings that can never be opened
    pub fn validate(&self) -> Dnp3Result<()> {
        if self.address.trim().is_empty() {
            return Err(Dnp3Error::configuration("address must not be empty"));
        }
        if self.port == 0 {
            return Err(Dnp3Error::configuration("port must be in 1..=65535"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Dnp3Error::configuration("connect timeout must be non-zero"));
        }
        Ok(())
    }

    /// "address:port" as accepted by the resolver
    pub fn endpoint(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.address, self.port),
        }
    }

    async fn resolve(&self) -> Dnp3Result<SocketAddr> {
        let endpoint = self.endpoint();
        let mut addrs = tokio::net::lookup_host(&endpoint).await.map_err(|e| {
            Dnp3Error::connection(format!("Failed to resolve {}: {}", endpoint, e))
        })?;
        addrs
            .next()
            .ok_or_else(|| Dnp3Error::connection(format!("No address found for {}", endpoint)))
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::new("127.0.0.1", crate::constants::DEFAULT_DNP3_PORT)
    }
}

/// Transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub writes: u64,
    pub reads: u64,
    pub errors: u64,
}

/// Raw byte pipe driven by a session actor.
///
/// `receive()` must be cancel-safe: the actor races it against commands and
/// timers, and a cancelled call must not lose bytes.
pub trait Dnp3Transport: Send + 'static {
    /// Write all bytes
    fn send(&mut self, bytes: &[u8]) -> impl Future<Output = Dnp3Result<()>> + Send;

    /// Wait for the next chunk of bytes. `Ok(None)` means the peer closed.
    fn receive(&mut self) -> impl Future<Output = Dnp3Result<Option<Bytes>>> + Send;

    fn is_connected(&self) -> bool;

    /// Shut the stream down. Idempotent.
    fn close(&mut self) -> impl Future<Output = Dnp3Result<()>> + Send;

    fn get_stats(&self) -> TransportStats;
}

/// Transport over any connected async stream
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    peer: Option<SocketAddr>,
    connected: bool,
    stats: TransportStats,
}

/// TCP transport
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already connected stream
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            peer: None,
            connected: true,
            stats: TransportStats::default(),
        }
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl TcpTransport {
    /// Connect to the configured endpoint.
    ///
    /// Fails with [`Dnp3Error::Connection`] when the address cannot be
    /// resolved, the port refuses, or the connect timeout elapses.
    pub async fn open(settings: &TransportSettings) -> Dnp3Result<Self> {
        settings.validate()?;
        let remote = settings.resolve().await?;

        let connect = async {
            match settings.local_address {
                Some(local) => {
                    let socket = match local {
                        IpAddr::V4(_) => TcpSocket::new_v4()?,
                        IpAddr::V6(_) => TcpSocket::new_v6()?,
                    };
                    socket.bind(SocketAddr::new(local, 0))?;
                    socket.connect(remote).await
                }
                None => TcpStream::connect(remote).await,
            }
        };

        let stream = tokio::time::timeout(settings.connect_timeout, connect)
            .await
            .map_err(|_| {
                Dnp3Error::connection(format!(
                    "Connect to {} timed out after {:?}",
                    remote, settings.connect_timeout
                ))
            })?
            .map_err(|e| Dnp3Error::connection(format!("Connect to {} failed: {}", remote, e)))?;

        Self::from_tcp(stream)
    }

    /// Wait for one inbound connection on `listener`
    pub async fn accept(listener: &TcpListener) -> Dnp3Result<Self> {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Dnp3Error::connection(format!("Accept failed: {}", e)))?;
        Self::from_tcp(stream)
    }

    fn from_tcp(stream: TcpStream) -> Dnp3Result<Self> {
        // DNP3 frames are small; coalescing only adds latency
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        tracing::debug!("TCP transport connected to {:?}", peer);
        Ok(Self {
            peer,
            ..Self::from_stream(stream)
        })
    }
}

impl<S> Dnp3Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, bytes: &[u8]) -> Dnp3Result<()> {
        if !self.connected {
            return Err(Dnp3Error::ConnectionLost);
        }
        if let Err(e) = self.stream.write_all(bytes).await {
            self.stats.errors += 1;
            self.connected = false;
            return Err(Dnp3Error::Io(e));
        }
        self.stats.writes += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    async fn receive(&mut self) -> Dnp3Result<Option<Bytes>> {
        if !self.connected {
            return Ok(None);
        }
        let mut buf = [0u8; READ_CHUNK_SIZE];
        match self.stream.read(&mut buf).await {
            Ok(0) => {
                self.connected = false;
                Ok(None)
            }
            Ok(n) => {
                self.stats.reads += 1;
                self.stats.bytes_received += n as u64;
                Ok(Some(Bytes::copy_from_slice(&buf[..n])))
            }
            Err(e) => {
                self.stats.errors += 1;
                self.connected = false;
                Err(Dnp3Error::Io(e))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> Dnp3Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        // The peer may already be gone; the socket is released on drop either way
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Transport shutdown error ignored: {}", e);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }
}
