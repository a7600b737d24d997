use bytes::BytesMut;

use crate::error::Result;

pub mod tcp;

pub use self::tcp::{
    TcpTransport, TcpTransportBuilder, TcpTransportListener, TcpTransportReader,
    TcpTransportWriter,
};

/// Byte-stream transport for one connection
///
/// Framing belongs to the [`Protocol`](crate::protocol::Protocol); a transport
/// only moves bytes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Write all of `bytes`
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Append whatever bytes are available to `buf`, returning how many were read
    ///
    /// Fails with [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) at end of stream.
    async fn receive(&mut self, buf: &mut BytesMut) -> Result<usize>;

    /// Close the transport connection
    async fn close(&mut self) -> Result<()>;
}

/// Accepts inbound transports
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    type Transport: Transport + 'static;

    async fn accept(&self) -> Result<Self::Transport>;

    async fn close(&mut self) -> Result<()>;
}
