use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use meridian_core::{CompressType, InvocationContext, MethodDescriptor, MethodRegistry, Value};
use meridian_rpc::protocol::nshead::{LOG_ID_HEADER, PROVIDER_HEADER};
use meridian_rpc::transport::{TcpTransport, TcpTransportListener, Transport};
use meridian_rpc::{
    handler_fn, Arg, Channel, ChannelGroup, ClientConfig, Error, FrameDecoder, Invocation,
    MethodHandler, NsHeadProtocol, PooledResponse, Protocol, ProtocolType, Reply, Request,
    Response, RpcClient, RpcServer, ServiceRegistry, StandardProtocol, TcpChannelGroup,
    WriteReceipt,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> MethodRegistry {
    MethodRegistry::new()
        .with(MethodDescriptor::new("EchoService", "echo", 1))
        .unwrap()
        .with(MethodDescriptor::new("EchoService", "echo_attachments", 1))
        .unwrap()
        .with(MethodDescriptor::new("EchoService", "missing", 0))
        .unwrap()
        .with(MethodDescriptor::new("EchoService", "big", 0))
        .unwrap()
        .with(MethodDescriptor::new("EchoService", "echo_headers", 0))
        .unwrap()
}

/// Echoes the argument back along with the request attachments
struct EchoAttachments;

impl MethodHandler for EchoAttachments {
    fn handle(&self, request: &Request, response: &mut Response) -> Result<(), String> {
        let args = request.arg_values().map_err(|e| e.to_string())?;
        response.result = args.into_iter().next();
        response.kv_attachment = request.kv_attachment.clone();
        response.binary_attachment = request.binary_attachment.clone();
        Ok(())
    }
}

/// Replies with the request's `log-id/provider` headers
struct EchoHeaders;

impl MethodHandler for EchoHeaders {
    fn handle(&self, request: &Request, response: &mut Response) -> Result<(), String> {
        let header = |name: &str| request.headers.get(name).cloned().unwrap_or_default();
        response.result = Some(Value::from(format!(
            "{}/{}",
            header(LOG_ID_HEADER),
            header(PROVIDER_HEADER)
        )));
        Ok(())
    }
}

async fn start_server(protocol: Arc<dyn Protocol>) -> SocketAddr {
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let services = ServiceRegistry::new()
        .with(
            MethodDescriptor::new("EchoService", "echo", 1),
            handler_fn(|args| Ok(args[0].clone())),
        )
        .unwrap()
        .with(
            MethodDescriptor::new("EchoService", "echo_attachments", 1),
            EchoAttachments,
        )
        .unwrap()
        .with(
            MethodDescriptor::new("EchoService", "big", 0),
            handler_fn(|_| Ok(Value::from("x".repeat(4096)))),
        )
        .unwrap()
        .with(MethodDescriptor::new("EchoService", "echo_headers", 0), EchoHeaders)
        .unwrap();
    let server = RpcServer::new(protocol, services);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// Server that reads everything and never answers
async fn start_silent_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn echo(text: &str) -> Invocation {
    Invocation::new("echo", vec![Arg::from(text)])
}

/// Callback that counts completions and forwards the first outcome
fn counting_callback(
    count: Arc<AtomicUsize>,
) -> (Arg, oneshot::Receiver<meridian_rpc::Result<Reply>>) {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let callback = Arg::callback(move |result: meridian_rpc::Result<Reply>| {
        count.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    });
    (callback, rx)
}

#[tokio::test]
async fn sync_echo_round_trip() {
    init_tracing();
    let addr = start_server(Arc::new(StandardProtocol::new())).await;
    let client = RpcClient::tcp(addr, ClientConfig::default(), registry());

    let reply = client
        .invoke(&InvocationContext::new(), echo("hi"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.result, Value::from("hi"));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn sync_call_times_out_when_server_is_silent() {
    init_tracing();
    let addr = start_silent_server().await;
    let config = ClientConfig::default().with_timeout(Duration::from_millis(500));
    let client = RpcClient::tcp(addr, config, registry());

    let started = Instant::now();
    let result = client.invoke(&InvocationContext::new(), echo("hi")).await;
    let elapsed = started.elapsed();

    match result {
        Err(Error::Timeout(d)) => assert_eq!(d, Duration::from_millis(500)),
        other => panic!("Expected Timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(450), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn async_callback_fires_exactly_once() {
    init_tracing();
    let addr = start_server(Arc::new(StandardProtocol::new())).await;
    let config = ClientConfig::default().with_timeout(Duration::from_millis(300));
    let client = RpcClient::tcp(addr, config, registry());

    let count = Arc::new(AtomicUsize::new(0));
    let (callback, rx) = counting_callback(Arc::clone(&count));
    let returned = client
        .invoke(
            &InvocationContext::new(),
            Invocation::new("echo", vec![Arg::from("hi"), callback]),
        )
        .await
        .unwrap();
    assert!(returned.is_none());

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap().result, Value::from("hi"));

    // Past the call timeout, the timer must not complete the call again
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn async_timeout_reaches_callback_once() {
    init_tracing();
    let addr = start_silent_server().await;
    let config = ClientConfig::default().with_timeout(Duration::from_millis(200));
    let client = RpcClient::tcp(addr, config, registry());

    let count = Arc::new(AtomicUsize::new(0));
    let (callback, rx) = counting_callback(Arc::clone(&count));
    client
        .invoke(
            &InvocationContext::new(),
            Invocation::new("echo", vec![Arg::from("hi"), callback]),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::Timeout(_))));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn build_errors_are_returned_directly_in_async_mode() {
    let count = Arc::new(AtomicUsize::new(0));
    let (callback, _rx) = counting_callback(Arc::clone(&count));
    // Nothing listens here; the call must fail before any connect
    let client = RpcClient::tcp("127.0.0.1:1".parse().unwrap(), ClientConfig::default(), registry());

    let result = client
        .invoke(
            &InvocationContext::new(),
            Invocation::new("unknown", vec![Arg::from("hi"), callback]),
        )
        .await;

    assert!(matches!(result, Err(Error::MethodNotRegistered(_))));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

/// Hands out the same channel to every caller
struct SharedChannel {
    endpoint: SocketAddr,
    channel: Arc<Channel>,
    acquired: AtomicUsize,
}

#[async_trait::async_trait]
impl ChannelGroup for SharedChannel {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn acquire(&self) -> meridian_rpc::Result<Arc<Channel>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.channel))
    }

    fn release(&self, _channel: Arc<Channel>) {}

    fn evict(&self, _channel: Arc<Channel>) {}
}

async fn shared_channel(addr: SocketAddr) -> Arc<SharedChannel> {
    let channel = Channel::from_transport(TcpTransport::connect(addr).await.unwrap()).unwrap();
    Arc::new(SharedChannel {
        endpoint: addr,
        channel: Arc::new(channel),
        acquired: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn pipelined_calls_share_one_channel() {
    init_tracing();
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // Collect both requests, then answer them in reverse order
    tokio::spawn(async move {
        let protocol = StandardProtocol::new();
        let (mut transport, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut requests = Vec::new();
        while requests.len() < 2 {
            transport.receive(decoder.buffer_mut()).await.unwrap();
            while let Some(request) = decoder.next_request(&protocol).unwrap() {
                requests.push(request);
            }
        }
        for request in requests.iter().rev() {
            let text = request.args[0].as_value().unwrap().as_str().unwrap();
            let response = Response {
                correlation_id: Some(request.correlation_id),
                result: Some(Value::from(format!("reply-{}", text))),
                ..Default::default()
            };
            transport
                .send(&protocol.encode_response(&response).unwrap())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let group = shared_channel(addr).await;
    let client = RpcClient::new(ClientConfig::default(), registry(), group.clone());
    let ctx = InvocationContext::new();

    let (a, b) = tokio::join!(client.invoke(&ctx, echo("a")), client.invoke(&ctx, echo("b")));

    assert_eq!(a.unwrap().unwrap().result, Value::from("reply-a"));
    assert_eq!(b.unwrap().unwrap().result, Value::from("reply-b"));
    assert_eq!(group.acquired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn nshead_holds_channel_until_reply() {
    init_tracing();
    let addr = start_server(Arc::new(NsHeadProtocol::new())).await;
    let config = ClientConfig::default().with_protocol(ProtocolType::NsHead);
    let group = Arc::new(TcpChannelGroup::new(addr, &config));
    let client = RpcClient::new(config, registry(), group.clone());
    assert!(!client.protocol().return_channel_before_response());

    for text in ["first", "second"] {
        let reply = client
            .invoke(&InvocationContext::new(), echo(text))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.result, Value::from(text));
        // Released back to the group once the reply arrived
        assert_eq!(group.idle_count(), 1);
    }
}

#[tokio::test]
async fn nshead_timeout_evicts_held_channel() {
    init_tracing();
    let addr = start_silent_server().await;
    let config = ClientConfig::default()
        .with_protocol(ProtocolType::NsHead)
        .with_timeout(Duration::from_millis(200));
    let group = Arc::new(TcpChannelGroup::new(addr, &config));
    let client = RpcClient::new(config, registry(), group.clone());

    let result = client.invoke(&InvocationContext::new(), echo("hi")).await;

    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(group.idle_count(), 0);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn late_response_is_dropped() {
    init_tracing();
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // First request is answered after the client gave up, the rest at once
    tokio::spawn(async move {
        let protocol = StandardProtocol::new();
        let (mut transport, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut answered = 0;
        loop {
            if transport.receive(decoder.buffer_mut()).await.is_err() {
                return;
            }
            while let Some(request) = decoder.next_request(&protocol).unwrap() {
                if answered == 0 {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                }
                answered += 1;
                let response = Response {
                    correlation_id: Some(request.correlation_id),
                    result: Some(Value::Int(answered)),
                    ..Default::default()
                };
                transport
                    .send(&protocol.encode_response(&response).unwrap())
                    .await
                    .unwrap();
            }
        }
    });

    let config = ClientConfig::default().with_timeout(Duration::from_millis(200));
    let client = RpcClient::tcp(addr, config, registry());
    let ctx = InvocationContext::new();

    assert!(matches!(
        client.invoke(&ctx, echo("slow")).await,
        Err(Error::Timeout(_))
    ));

    // Let the late reply arrive and be discarded
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.pending_calls(), 0);

    let reply = client.invoke(&ctx, echo("fast")).await.unwrap().unwrap();
    assert_eq!(reply.result, Value::Int(2));
}

#[tokio::test]
async fn malformed_reply_fails_pending_call() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(b"GARBAGE-GARBAGE-GARBAGE").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = RpcClient::tcp(addr, ClientConfig::default(), registry());
    let result = client.invoke(&InvocationContext::new(), echo("hi")).await;

    assert!(matches!(result, Err(Error::MalformedFrame(_))));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn unknown_remote_method_is_a_remote_error() {
    init_tracing();
    let addr = start_server(Arc::new(StandardProtocol::new())).await;
    let client = RpcClient::tcp(addr, ClientConfig::default(), registry());

    let result = client
        .invoke(&InvocationContext::new(), Invocation::new("missing", vec![]))
        .await;

    match result {
        Err(Error::Remote(msg)) => assert!(msg.contains("EchoService.missing")),
        other => panic!("Expected Remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn attachments_travel_both_ways() {
    init_tracing();
    for (protocol_type, protocol) in [
        (ProtocolType::Standard, Arc::new(StandardProtocol::new()) as Arc<dyn Protocol>),
        (ProtocolType::NsHead, Arc::new(NsHeadProtocol::new()) as Arc<dyn Protocol>),
    ] {
        let addr = start_server(protocol).await;
        let config = ClientConfig::default()
            .with_protocol(protocol_type)
            .with_compress_type(CompressType::Gzip);
        let client = RpcClient::tcp(addr, config, registry());

        let ctx = InvocationContext::new()
            .with_kv("trace", "abc")
            .with_binary_attachment(Bytes::from_static(b"\x00\x01blob"));
        let reply = client
            .invoke(
                &ctx,
                Invocation::new("echo_attachments", vec![Arg::from("payload")]),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.result, Value::from("payload"));
        assert_eq!(reply.kv_attachment.get("trace").map(String::as_str), Some("abc"));
        assert_eq!(
            reply.binary_attachment.as_deref(),
            Some(&b"\x00\x01blob"[..])
        );
    }
}

#[tokio::test]
async fn server_drops_connection_on_malformed_request() {
    init_tracing();
    let addr = start_server(Arc::new(StandardProtocol::new())).await;

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"NOT-A-FRAME-AT-ALL").await.unwrap();

    let mut buf = BytesMut::with_capacity(64);
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_buf(&mut buf))
        .await
        .unwrap();
    // Closed without a reply
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn unencodable_reply_fails_only_its_own_call() {
    init_tracing();
    let addr = start_server(Arc::new(StandardProtocol::with_max_body_size(1024))).await;
    let group = shared_channel(addr).await;
    let client = RpcClient::new(ClientConfig::default(), registry(), group);
    let ctx = InvocationContext::new();

    let small = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.invoke(&ctx, echo("small")).await
    };
    let (big, small) = tokio::join!(client.invoke(&ctx, Invocation::new("big", vec![])), small);

    match big {
        Err(Error::Remote(msg)) => assert!(msg.starts_with("Codec error"), "{}", msg),
        other => panic!("Expected Remote error, got {:?}", other),
    }
    assert_eq!(small.unwrap().unwrap().result, Value::from("small"));
}

/// Reads one request, answers it after `delay` unless the client hangs up
/// first, then reports whether the client closed the connection
async fn start_slow_server(delay: Duration) -> (SocketAddr, oneshot::Receiver<bool>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let protocol = StandardProtocol::new();
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let request = loop {
            read.read_buf(decoder.buffer_mut()).await.unwrap();
            if let Some(request) = decoder.next_request(&protocol).unwrap() {
                break request;
            }
        };

        let mut rest = [0u8; 64];
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = read.read(&mut rest) => return,
        }
        let response = Response {
            correlation_id: Some(request.correlation_id),
            result: Some(Value::from("late")),
            ..Default::default()
        };
        write
            .write_all(&protocol.encode_response(&response).unwrap())
            .await
            .unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), read.read(&mut rest)).await;
        let _ = closed_tx.send(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));
    });
    (addr, closed_rx)
}

#[tokio::test]
async fn surplus_channel_outlives_its_pending_call() {
    init_tracing();
    let (addr, closed) = start_slow_server(Duration::from_millis(50)).await;
    let config = ClientConfig::default().with_max_idle_channels(0);
    let group = Arc::new(TcpChannelGroup::new(addr, &config));
    let client = RpcClient::new(config, registry(), group.clone());

    let reply = client
        .invoke(&InvocationContext::new(), echo("hi"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.result, Value::from("late"));
    assert_eq!(group.idle_count(), 0);
    // No room to keep it, so it closes once the call is done
    assert!(tokio::time::timeout(Duration::from_secs(3), closed)
        .await
        .unwrap()
        .unwrap());
}

#[tokio::test]
async fn dropping_client_closes_its_connections() {
    init_tracing();
    let (addr, closed) = start_slow_server(Duration::ZERO).await;
    let client = RpcClient::tcp(addr, ClientConfig::default(), registry());

    client
        .invoke(&InvocationContext::new(), echo("hi"))
        .await
        .unwrap()
        .unwrap();
    drop(client);

    assert!(tokio::time::timeout(Duration::from_secs(3), closed)
        .await
        .unwrap()
        .unwrap());
}

#[tokio::test]
async fn closed_client_fails_pending_and_new_calls() {
    init_tracing();
    let addr = start_silent_server().await;
    let client = RpcClient::tcp(addr, ClientConfig::default(), registry());

    let count = Arc::new(AtomicUsize::new(0));
    let (callback, rx) = counting_callback(Arc::clone(&count));
    client
        .invoke(
            &InvocationContext::new(),
            Invocation::new("echo", vec![Arg::from("hi"), callback]),
        )
        .await
        .unwrap();
    // Let the call reach the wire
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.pending_calls(), 1);

    client.close();

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::ConnectionClosed)));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(matches!(
        client.invoke(&InvocationContext::new(), echo("again")).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn async_invoke_returns_before_connecting() {
    init_tracing();
    // Nothing listens here, so the connect fails on the background task
    let client = RpcClient::tcp("127.0.0.1:1".parse().unwrap(), ClientConfig::default(), registry());
    let count = Arc::new(AtomicUsize::new(0));
    let (callback, rx) = counting_callback(Arc::clone(&count));

    let returned = client
        .invoke(
            &InvocationContext::new(),
            Invocation::new("echo", vec![Arg::from("hi"), callback]),
        )
        .await
        .unwrap();
    assert!(returned.is_none());
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_err());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

/// Group whose connects never finish
struct StalledGroup {
    endpoint: SocketAddr,
}

#[async_trait::async_trait]
impl ChannelGroup for StalledGroup {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn acquire(&self) -> meridian_rpc::Result<Arc<Channel>> {
        std::future::pending().await
    }

    fn release(&self, _channel: Arc<Channel>) {}

    fn evict(&self, _channel: Arc<Channel>) {}
}

#[tokio::test]
async fn call_timeout_covers_connecting() {
    init_tracing();
    let config = ClientConfig::default().with_timeout(Duration::from_millis(200));
    let group = Arc::new(StalledGroup {
        endpoint: "127.0.0.1:1".parse().unwrap(),
    });
    let client = RpcClient::new(config, registry(), group);

    let started = Instant::now();
    let count = Arc::new(AtomicUsize::new(0));
    let (callback, rx) = counting_callback(Arc::clone(&count));
    client
        .invoke(
            &InvocationContext::new(),
            Invocation::new("echo", vec![Arg::from("hi"), callback]),
        )
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    let result = client.invoke(&InvocationContext::new(), echo("hi")).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_calls(), 0);
}

type Events = Arc<Mutex<Vec<String>>>;

/// Delegates to another protocol and records the hooks it runs
struct Recording {
    inner: Arc<dyn Protocol>,
    events: Events,
}

impl Recording {
    fn wrap(inner: Arc<dyn Protocol>) -> (Arc<Self>, Events) {
        let events = Events::default();
        let protocol = Arc::new(Self {
            inner,
            events: Arc::clone(&events),
        });
        (protocol, events)
    }
}

impl Protocol for Recording {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn create_request(&self) -> Request {
        self.inner.create_request()
    }

    fn create_response(&self) -> Response {
        self.inner.create_response()
    }

    fn before_request_sent(
        &self,
        request: &mut Request,
        config: &ClientConfig,
        channel_group: &dyn ChannelGroup,
    ) {
        self.inner.before_request_sent(request, config, channel_group);
        self.events
            .lock()
            .unwrap()
            .push(format!("before {}", request.correlation_id));
    }

    fn after_response_sent(&self, request: &Request, response: &Response, receipt: &WriteReceipt) {
        self.inner.after_response_sent(request, response, receipt);
        assert!(receipt.bytes_written > 0);
        self.events
            .lock()
            .unwrap()
            .push(format!("after {}", request.correlation_id));
    }

    fn return_channel_before_response(&self) -> bool {
        self.inner.return_channel_before_response()
    }

    fn encode_request(&self, request: &Request) -> meridian_rpc::Result<Vec<u8>> {
        self.inner.encode_request(request)
    }

    fn decode_request(&self, buf: &mut BytesMut) -> meridian_rpc::Result<Request> {
        self.inner.decode_request(buf)
    }

    fn encode_response(&self, response: &Response) -> meridian_rpc::Result<Vec<u8>> {
        self.inner.encode_response(response)
    }

    fn decode_response(&self, buf: &mut BytesMut) -> meridian_rpc::Result<PooledResponse> {
        self.inner.decode_response(buf)
    }
}

#[tokio::test]
async fn sync_call_runs_hooks_once_in_order() {
    init_tracing();
    let addr = start_server(Arc::new(StandardProtocol::new())).await;
    let (protocol, events) = Recording::wrap(Arc::new(StandardProtocol::new()));
    let config = ClientConfig::default();
    let group = Arc::new(TcpChannelGroup::new(addr, &config));
    let client = RpcClient::with_protocol(config, protocol, registry(), group);

    client
        .invoke(&InvocationContext::new(), echo("hi"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*events.lock().unwrap(), ["before 1", "after 1"]);

    // A remote error still arrives as a response
    assert!(client
        .invoke(&InvocationContext::new(), Invocation::new("missing", vec![]))
        .await
        .is_err());
    assert_eq!(
        *events.lock().unwrap(),
        ["before 1", "after 1", "before 2", "after 2"]
    );
}

#[tokio::test]
async fn async_call_runs_after_hook_once_callback_returns() {
    init_tracing();
    let addr = start_server(Arc::new(StandardProtocol::new())).await;
    let (protocol, events) = Recording::wrap(Arc::new(StandardProtocol::new()));
    let config = ClientConfig::default().with_timeout(Duration::from_millis(300));
    let group = Arc::new(TcpChannelGroup::new(addr, &config));
    let client = RpcClient::with_protocol(config, protocol, registry(), group);

    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let callback_events = Arc::clone(&events);
    let callback = Arg::callback(move |result: meridian_rpc::Result<Reply>| {
        callback_events.lock().unwrap().push("callback".to_string());
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    });
    client
        .invoke(
            &InvocationContext::new(),
            Invocation::new("echo", vec![Arg::from("hi"), callback]),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap().result, Value::from("hi"));

    // Past the timeout nothing else may run
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*events.lock().unwrap(), ["before 1", "callback", "after 1"]);
}

#[tokio::test]
async fn server_runs_after_hook_once_per_reply() {
    init_tracing();
    let (protocol, events) = Recording::wrap(Arc::new(StandardProtocol::new()));
    let addr = start_server(protocol).await;
    let client = RpcClient::tcp(addr, ClientConfig::default(), registry());

    for text in ["a", "b"] {
        client
            .invoke(&InvocationContext::new(), echo(text))
            .await
            .unwrap()
            .unwrap();
    }
    // The hook runs after the write, possibly after the client saw the reply
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*events.lock().unwrap(), ["after 1", "after 2"]);
}

#[tokio::test]
async fn nshead_requests_carry_log_id_and_provider() {
    init_tracing();
    let addr = start_server(Arc::new(NsHeadProtocol::new())).await;
    let config = ClientConfig::default().with_protocol(ProtocolType::NsHead);
    let client = RpcClient::tcp(addr, config, registry());

    for expected in ["1/meridian", "2/meridian"] {
        let reply = client
            .invoke(&InvocationContext::new(), Invocation::new("echo_headers", vec![]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.result, Value::from(expected));
    }
}
