use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::TcpTransport;

/// Pool of channels to one remote endpoint
///
/// Callers borrow a channel with `acquire` and hand it back with `release`
/// once they no longer need it to themselves, or `evict` it when it is broken.
/// A released channel may still have calls waiting for replies on it.
#[async_trait::async_trait]
pub trait ChannelGroup: Send + Sync {
    fn endpoint(&self) -> SocketAddr;

    /// Borrow an open channel, connecting a new one if none is idle
    async fn acquire(&self) -> Result<Arc<Channel>>;

    /// Return a healthy channel for reuse
    fn release(&self, channel: Arc<Channel>);

    /// Drop a channel that must not be reused
    fn evict(&self, channel: Arc<Channel>);

    /// Close idle channels and refuse further acquires
    fn close(&self) {}
}

/// Channel group over plain TCP connections with a bounded idle list
pub struct TcpChannelGroup {
    endpoint: SocketAddr,
    connect_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Arc<Channel>>>,
    closed: AtomicBool,
}

impl TcpChannelGroup {
    pub fn new(endpoint: SocketAddr, config: &ClientConfig) -> Self {
        Self {
            endpoint,
            connect_timeout: config.connect_timeout(),
            max_idle: config.max_idle_channels,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of channels currently idle
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Retire a surplus channel; it closes once its last call completes
    fn retire(channel: Arc<Channel>) {
        if channel.retire() {
            debug!(channel = channel.id(), "closing surplus channel");
            channel.close_detached();
        } else {
            debug!(
                channel = channel.id(),
                in_flight = channel.in_flight(),
                "retiring busy channel"
            );
        }
    }
}

#[async_trait::async_trait]
impl ChannelGroup for TcpChannelGroup {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn acquire(&self) -> Result<Arc<Channel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(channel) if channel.is_open() => return Ok(channel),
                Some(channel) => debug!(channel = channel.id(), "discarding closed idle channel"),
                None => break,
            }
        }

        let transport = TcpTransport::connect_timeout(self.endpoint, self.connect_timeout).await?;
        let channel = Arc::new(Channel::from_transport(transport)?);
        debug!(channel = channel.id(), endpoint = %self.endpoint, "opened channel");
        Ok(channel)
    }

    fn release(&self, channel: Arc<Channel>) {
        if !channel.is_open() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle && !self.closed.load(Ordering::Acquire) {
            idle.push(channel);
        } else {
            drop(idle);
            Self::retire(channel);
        }
    }

    fn evict(&self, channel: Arc<Channel>) {
        debug!(channel = channel.id(), endpoint = %self.endpoint, "evicting channel");
        self.idle.lock().retain(|c| c.id() != channel.id());
        channel.close_detached();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let idle = std::mem::take(&mut *self.idle.lock());
        debug!(endpoint = %self.endpoint, channels = idle.len(), "closing channel group");
        for channel in idle {
            channel.close_detached();
        }
    }
}
