//! Incremental frame decoding over one connection's byte stream.

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::pool::PooledResponse;
use crate::protocol::Protocol;
use crate::request::Request;

/// Accumulates received bytes and yields complete frames
///
/// Owned by the single task reading a connection. Bytes of a partial frame
/// stay buffered until a later read completes it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer to read the socket into directly
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet consumed by a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete response, or `None` until more bytes arrive
    pub fn next_response<P: Protocol + ?Sized>(
        &mut self,
        protocol: &P,
    ) -> Result<Option<PooledResponse>> {
        retry_on_short(protocol.decode_response(&mut self.buf))
    }

    /// Next complete request, or `None` until more bytes arrive
    pub fn next_request<P: Protocol + ?Sized>(&mut self, protocol: &P) -> Result<Option<Request>> {
        retry_on_short(protocol.decode_request(&mut self.buf))
    }
}

fn retry_on_short<T>(decoded: Result<T>) -> Result<Option<T>> {
    match decoded {
        Ok(frame) => Ok(Some(frame)),
        Err(Error::InsufficientData) => Ok(None),
        Err(e) => Err(e),
    }
}
