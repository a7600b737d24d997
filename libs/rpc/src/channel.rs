use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{TcpTransport, TcpTransportReader, TcpTransportWriter};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Proof that a frame was fully written to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub channel_id: u64,
    pub bytes_written: usize,
}

/// One pooled connection to a remote endpoint
///
/// Writes are serialized by an async lock so concurrent calls can share the
/// channel. The read half is handed out once to whoever drives decoding.
///
/// A channel counts the calls still waiting for a reply on it. A retired
/// channel is closed once that count drops to zero, never before.
pub struct Channel {
    id: u64,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<TcpTransportWriter>,
    reader: Mutex<Option<TcpTransportReader>>,
    open: AtomicBool,
    in_flight: AtomicUsize,
    retired: AtomicBool,
    close_claimed: AtomicBool,
}

impl Channel {
    /// Create a channel from a connected transport
    pub fn from_transport(transport: TcpTransport) -> Result<Self> {
        let peer = transport.peer_addr()?;
        let (reader, writer) = transport.into_split();
        Ok(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            open: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            close_claimed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the channel unusable; later writes fail with `ConnectionClosed`
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Calls registered on this channel that have not completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn begin_call(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `true` when this ended the last call on a retired channel,
    /// in which case the caller must close it
    pub fn end_call(&self) -> bool {
        let was_last = self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
        was_last && self.retired.load(Ordering::SeqCst) && self.claim_close()
    }

    /// Stop reusing this channel
    ///
    /// Returns `true` when no call is in flight and the caller must close it
    /// now. Otherwise whoever ends the last call closes it.
    pub fn retire(&self) -> bool {
        self.retired.store(true, Ordering::SeqCst);
        self.in_flight.load(Ordering::SeqCst) == 0 && self.claim_close()
    }

    fn claim_close(&self) -> bool {
        !self.close_claimed.swap(true, Ordering::SeqCst)
    }

    /// Take the read half; `None` once a reader has already been started
    pub fn take_reader(&self) -> Option<TcpTransportReader> {
        self.reader.lock().take()
    }

    /// Write one complete frame
    pub async fn write(&self, frame: &[u8]) -> Result<WriteReceipt> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            self.mark_closed();
            return Err(e);
        }
        Ok(WriteReceipt {
            channel_id: self.id,
            bytes_written: frame.len(),
        })
    }

    /// Shut down the write side and mark the channel closed
    pub async fn close(&self) -> Result<()> {
        self.mark_closed();
        self.writer.lock().await.close().await
    }

    /// Mark closed now and shut the write side down on a background task
    ///
    /// Outside a runtime the channel is only marked closed; its socket shuts
    /// down when the last handle is dropped.
    pub fn close_detached(self: &Arc<Self>) {
        self.mark_closed();
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = channel.close().await {
                debug!(channel = channel.id(), error = %e, "channel close failed");
            }
        });
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
