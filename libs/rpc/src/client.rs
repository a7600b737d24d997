//! Client invocation path.
//!
//! [`RpcClient::invoke`] builds a request through the active protocol, writes it
//! to a channel borrowed from the channel group and parks the call in a
//! dispatch table keyed by correlation id. A reader task per channel decodes
//! responses and completes calls from that table. Whoever removes a call from
//! the table (reader, timeout, or write failure) is the only one that
//! completes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use meridian_core::{InvocationContext, MethodRegistry};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{Channel, WriteReceipt};
use crate::channel_group::{ChannelGroup, TcpChannelGroup};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::frame::FrameDecoder;
use crate::invocation::Invocation;
use crate::pool::PooledResponse;
use crate::protocol::Protocol;
use crate::request::{Request, RpcCallback};
use crate::response::Reply;
use crate::transport::TcpTransportReader;

enum Completion {
    Sync(oneshot::Sender<Result<PooledResponse>>),
    Async {
        callback: Arc<dyn RpcCallback>,
        request: Request,
    },
}

struct PendingCall {
    channel: Arc<Channel>,
    /// The protocol keeps the channel until the reply arrives
    held: bool,
    receipt: WriteReceipt,
    timer: Option<AbortHandle>,
    completion: Completion,
}

/// Outstanding calls plus the collaborators needed to send and finish them
struct Dispatcher {
    protocol: Arc<dyn Protocol>,
    group: Arc<dyn ChannelGroup>,
    config: ClientConfig,
    calls: DashMap<u64, PendingCall>,
    /// channel id -> correlation id of the call holding it
    held: DashMap<u64, u64>,
    readers: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

impl Dispatcher {
    fn ensure_reader(self: &Arc<Self>, channel: &Arc<Channel>) {
        if let Some(reader) = channel.take_reader() {
            let dispatcher = Arc::clone(self);
            let task_channel = Arc::clone(channel);
            let handle =
                tokio::spawn(async move { dispatcher.read_loop(task_channel, reader).await });
            let mut readers = self.readers.lock();
            readers.retain(|h| !h.is_finished());
            readers.push(handle.abort_handle());
        }
    }

    async fn read_loop(self: Arc<Self>, channel: Arc<Channel>, mut reader: TcpTransportReader) {
        let mut decoder = FrameDecoder::new();
        let error = 'read: loop {
            if let Err(e) = reader.receive(decoder.buffer_mut()).await {
                break 'read e;
            }
            loop {
                match decoder.next_response(&*self.protocol) {
                    Ok(Some(response)) => self.complete(&channel, response),
                    Ok(None) => break,
                    Err(e) => break 'read e,
                }
            }
        };

        match &error {
            Error::ConnectionClosed => debug!(channel = channel.id(), "channel closed by peer"),
            e if e.is_connection_fatal() => {
                warn!(channel = channel.id(), error = %e, "channel failed, dropping it")
            }
            _ => debug!(channel = channel.id(), error = %error, "channel read failed"),
        }
        channel.mark_closed();
        self.group.evict(Arc::clone(&channel));
        self.fail_channel(channel.id(), &error);
    }

    /// Borrow a channel, run the pre-send hook and encode the frame
    async fn prepare(self: &Arc<Self>, request: &mut Request) -> Result<(Arc<Channel>, Vec<u8>)> {
        let channel = self.group.acquire().await?;
        self.ensure_reader(&channel);
        self.protocol
            .before_request_sent(request, &self.config, self.group.as_ref());
        match self.protocol.encode_request(request) {
            Ok(frame) => Ok((channel, frame)),
            Err(e) => {
                self.group.release(channel);
                Err(e)
            }
        }
    }

    fn register(&self, id: u64, channel: &Arc<Channel>, frame_len: usize, completion: Completion) {
        let held = !self.protocol.return_channel_before_response();
        if held {
            self.held.insert(channel.id(), id);
        }
        channel.begin_call();
        self.calls.insert(
            id,
            PendingCall {
                channel: Arc::clone(channel),
                held,
                receipt: WriteReceipt {
                    channel_id: channel.id(),
                    bytes_written: frame_len,
                },
                timer: None,
                completion,
            },
        );
    }

    /// Write a registered call's frame and apply the channel return policy
    async fn transmit(&self, id: u64, channel: Arc<Channel>, frame: &[u8]) {
        match channel.write(frame).await {
            Ok(_) => {
                if self.protocol.return_channel_before_response() {
                    self.group.release(channel);
                }
            }
            Err(e) => {
                warn!(id, channel = channel.id(), error = %e, "request write failed");
                // A held channel is evicted by the failing call itself
                if self.protocol.return_channel_before_response() {
                    self.group.evict(channel);
                }
                self.fail(id, e);
            }
        }
    }

    /// Fail the call with a timeout once `deadline` passes
    fn arm_timer(self: &Arc<Self>, id: u64, deadline: Instant) {
        let timeout = self.config.timeout();
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!(id, ?timeout, "async call timed out");
            dispatcher.fail(id, Error::Timeout(timeout));
        });
        match self.calls.get_mut(&id) {
            Some(mut call) => call.timer = Some(handle.abort_handle()),
            None => handle.abort(),
        }
    }

    fn complete(&self, channel: &Arc<Channel>, response: PooledResponse) {
        let id = match response.correlation_id {
            Some(id) => id,
            None => match self.held.get(&channel.id()) {
                Some(id) => *id,
                None => {
                    warn!(channel = channel.id(), "response on a channel with no outstanding call");
                    return;
                }
            },
        };
        match self.calls.remove(&id) {
            Some((_, call)) => self.finish(call, Ok(response)),
            None => warn!(
                channel = channel.id(),
                error = %Error::DispatchMismatch(id),
                "dropping late or unknown response"
            ),
        }
    }

    /// Fail a call that is still outstanding
    fn fail(&self, id: u64, error: Error) {
        if let Some((_, call)) = self.calls.remove(&id) {
            self.finish(call, Err(error));
        }
    }

    fn fail_channel(&self, channel_id: u64, cause: &Error) {
        let ids: Vec<u64> = self
            .calls
            .iter()
            .filter(|entry| entry.channel.id() == channel_id)
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            let error = match cause {
                Error::MalformedFrame(msg) => Error::MalformedFrame(msg.clone()),
                _ => Error::ConnectionClosed,
            };
            self.fail(id, error);
        }
    }

    fn finish(&self, mut call: PendingCall, outcome: Result<PooledResponse>) {
        if let Some(timer) = call.timer.take() {
            timer.abort();
        }
        if call.channel.end_call() {
            debug!(channel = call.channel.id(), "last call done on retired channel");
            call.channel.close_detached();
        }
        if call.held {
            self.held.remove(&call.channel.id());
            let channel = Arc::clone(&call.channel);
            match &outcome {
                Ok(_) => self.group.release(channel),
                Err(_) => self.group.evict(channel),
            }
        }

        match call.completion {
            // A dropped receiver means the caller gave up; the response returns to the pool
            Completion::Sync(tx) => {
                let _ = tx.send(outcome);
            }
            Completion::Async { callback, request } => match outcome {
                Ok(response) => {
                    callback.complete(response.reply());
                    self.protocol
                        .after_response_sent(&request, &response, &call.receipt);
                }
                Err(e) => callback.complete(Err(e)),
            },
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
        let ids: Vec<u64> = self.calls.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.fail(id, Error::ConnectionClosed);
        }
        self.group.close();
    }
}

/// Fails a synchronous call whose caller stopped waiting for it
struct AbandonGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: u64,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        // No-op once the call has been completed
        self.dispatcher
            .fail(self.id, Error::Custom("call abandoned by caller".to_string()));
    }
}

/// Client for one remote endpoint
///
/// Dropping the client closes it, see [`close`](Self::close).
pub struct RpcClient {
    protocol: Arc<dyn Protocol>,
    registry: Arc<MethodRegistry>,
    dispatcher: Arc<Dispatcher>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Client using the protocol selected in `config`
    pub fn new(config: ClientConfig, registry: MethodRegistry, group: Arc<dyn ChannelGroup>) -> Self {
        let protocol = config.protocol.build(config.max_body_size);
        Self::with_protocol(config, protocol, registry, group)
    }

    pub fn with_protocol(
        config: ClientConfig,
        protocol: Arc<dyn Protocol>,
        registry: MethodRegistry,
        group: Arc<dyn ChannelGroup>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher {
            protocol: Arc::clone(&protocol),
            group,
            config,
            calls: DashMap::new(),
            held: DashMap::new(),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        Self {
            protocol,
            registry: Arc::new(registry),
            dispatcher,
            next_id: AtomicU64::new(1),
        }
    }

    /// Client over a [`TcpChannelGroup`]; connections open lazily on first call
    pub fn tcp(addr: SocketAddr, config: ClientConfig, registry: MethodRegistry) -> Self {
        let group = Arc::new(TcpChannelGroup::new(addr, &config));
        Self::new(config, registry, group)
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn config(&self) -> &ClientConfig {
        &self.dispatcher.config
    }

    /// Calls sent but not yet completed
    pub fn pending_calls(&self) -> usize {
        self.dispatcher.calls.len()
    }

    /// Stop reader tasks, fail outstanding calls and close idle channels
    ///
    /// Later invocations fail with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.dispatcher.close();
    }

    /// Invoke a remote method
    ///
    /// A synchronous call resolves to `Some(reply)` or an error. When the last of
    /// two or more arguments is a callback the call is asynchronous: this
    /// resolves to `None` as soon as the request is built, and the callback
    /// receives the outcome exactly once from a background task. Errors raised
    /// while building the request are returned directly in both modes.
    pub async fn invoke(
        &self,
        ctx: &InvocationContext,
        invocation: Invocation,
    ) -> Result<Option<Reply>> {
        if self.dispatcher.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let mut request = self.protocol.init_request(
            ctx,
            &self.registry,
            &self.dispatcher.config,
            invocation,
        )?;
        request.correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match request.callback.clone() {
            None => self.call_sync(request).await.map(Some),
            Some(callback) => {
                self.call_async(request, callback);
                Ok(None)
            }
        }
    }

    async fn call_sync(&self, mut request: Request) -> Result<Reply> {
        let timeout = self.dispatcher.config.timeout();
        let deadline = Instant::now() + timeout;
        let id = request.correlation_id;

        let (channel, frame) =
            match tokio::time::timeout_at(deadline, self.dispatcher.prepare(&mut request)).await {
                Ok(prepared) => prepared?,
                Err(_) => return Err(Error::Timeout(timeout)),
            };
        let receipt = WriteReceipt {
            channel_id: channel.id(),
            bytes_written: frame.len(),
        };
        let (tx, rx) = oneshot::channel();
        self.dispatcher
            .register(id, &channel, frame.len(), Completion::Sync(tx));
        let _guard = AbandonGuard {
            dispatcher: &self.dispatcher,
            id,
        };
        self.dispatcher.transmit(id, channel, &frame).await;

        let response = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                debug!(id, ?timeout, "call timed out");
                self.dispatcher.fail(id, Error::Timeout(timeout));
                return Err(Error::Timeout(timeout));
            }
        };

        let reply = response.reply();
        self.protocol
            .after_response_sent(&request, &response, &receipt);
        reply
    }

    /// Send on a background task; the deadline covers connecting as well
    fn call_async(&self, mut request: Request, callback: Arc<dyn RpcCallback>) {
        let timeout = self.dispatcher.config.timeout();
        let deadline = Instant::now() + timeout;
        let id = request.correlation_id;
        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::spawn(async move {
            let prepared = tokio::time::timeout_at(deadline, dispatcher.prepare(&mut request)).await;
            let (channel, frame) = match prepared {
                Ok(Ok(prepared)) => prepared,
                Ok(Err(e)) => return callback.complete(Err(e)),
                Err(_) => {
                    debug!(id, ?timeout, "async call timed out before sending");
                    return callback.complete(Err(Error::Timeout(timeout)));
                }
            };
            dispatcher.register(id, &channel, frame.len(), Completion::Async { callback, request });
            dispatcher.arm_timer(id, deadline);
            dispatcher.transmit(id, channel, &frame).await;
        });
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.dispatcher.close();
    }
}
