use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Spare capacity reserved before each socket read
const READ_RESERVE: usize = 8 * 1024;

async fn with_timeout<T>(
    timeout: Option<Duration>,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, op)
            .await
            .map_err(|_| Error::Timeout(timeout))?,
        None => op.await,
    }
}

async fn read_some<R>(reader: &mut R, buf: &mut BytesMut) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(READ_RESERVE);
    match reader.read_buf(buf).await? {
        0 => Err(Error::ConnectionClosed),
        n => Ok(n),
    }
}

/// Raw TCP byte stream
pub struct TcpTransport {
    stream: TcpStream,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
}

impl TcpTransport {
    /// Connect to a remote TCP address with no timeouts
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::builder().address(addr).connect().await
    }

    /// Connect with a connect timeout
    pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        Self::builder()
            .address(addr)
            .connect_timeout(timeout)
            .connect()
            .await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Create from an existing TcpStream
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            send_timeout: None,
            receive_timeout: None,
        }
    }

    /// Get the remote address of this connection
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.peer_addr().map_err(Into::into)
    }

    /// Get the local address of this connection
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr().map_err(Into::into)
    }

    /// Split into independently owned read and write halves
    pub fn into_split(self) -> (TcpTransportReader, TcpTransportWriter) {
        let (read, write) = self.stream.into_split();
        (
            TcpTransportReader {
                half: read,
                receive_timeout: self.receive_timeout,
            },
            TcpTransportWriter {
                half: write,
                send_timeout: self.send_timeout,
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        with_timeout(self.send_timeout, async move {
            stream.write_all(bytes).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    async fn receive(&mut self, buf: &mut BytesMut) -> Result<usize> {
        with_timeout(self.receive_timeout, read_some(&mut self.stream, buf)).await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Read half of a split [`TcpTransport`]
pub struct TcpTransportReader {
    half: OwnedReadHalf,
    receive_timeout: Option<Duration>,
}

impl TcpTransportReader {
    pub async fn receive(&mut self, buf: &mut BytesMut) -> Result<usize> {
        with_timeout(self.receive_timeout, read_some(&mut self.half, buf)).await
    }
}

/// Write half of a split [`TcpTransport`]
pub struct TcpTransportWriter {
    half: OwnedWriteHalf,
    send_timeout: Option<Duration>,
}

impl TcpTransportWriter {
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let half = &mut self.half;
        with_timeout(self.send_timeout, async move {
            half.write_all(bytes).await?;
            half.flush().await?;
            Ok(())
        })
        .await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

/// TCP listener for accepting incoming connections
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<(TcpTransport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((TcpTransport::from_stream(stream), addr))
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl crate::transport::TransportListener for TcpTransportListener {
    type Transport = TcpTransport;

    async fn accept(&self) -> Result<Self::Transport> {
        let (transport, _) = TcpTransportListener::accept(self).await?;
        Ok(transport)
    }

    // Tokio's TcpListener closes on drop
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builder for configuring TCP transport
#[derive(Default)]
pub struct TcpTransportBuilder {
    address: Option<SocketAddr>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to connect to
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.address = Some(addr);
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set the receive timeout
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// Connect with the configured settings
    pub async fn connect(self) -> Result<TcpTransport> {
        let addr = self
            .address
            .ok_or_else(|| Error::Custom("Address not set".to_string()))?;

        let stream = with_timeout(self.connect_timeout, async {
            TcpStream::connect(addr).await.map_err(Error::from)
        })
        .await?;
        stream.set_nodelay(true)?;

        Ok(TcpTransport {
            stream,
            send_timeout: self.send_timeout,
            receive_timeout: self.receive_timeout,
        })
    }
}
