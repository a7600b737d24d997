use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_core::{MethodDescriptor, Value};
use tracing::{debug, warn};

use crate::channel::WriteReceipt;
use crate::error::{Error, Result};
use crate::frame::FrameDecoder;
use crate::pool::PooledResponse;
use crate::protocol::Protocol;
use crate::request::Request;
use crate::response::Response;
use crate::transport::{Transport, TransportListener};

/// Server-side implementation of one method
pub trait MethodHandler: Send + Sync {
    /// Fill `response` for `request`; an `Err` is sent back as the call's error
    fn handle(&self, request: &Request, response: &mut Response) -> std::result::Result<(), String>;
}

/// Handler built from a function of the argument values
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync,
{
    FnHandler(f)
}

impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync,
{
    fn handle(&self, request: &Request, response: &mut Response) -> std::result::Result<(), String> {
        let args = request.arg_values().map_err(|e| e.to_string())?;
        response.result = Some((self.0)(&args)?);
        Ok(())
    }
}

struct Registered {
    descriptor: Arc<MethodDescriptor>,
    handler: Arc<dyn MethodHandler>,
}

/// Dispatch table from (service, method) to handler
#[derive(Default)]
pub struct ServiceRegistry {
    methods: HashMap<(String, String), Registered>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: MethodDescriptor,
        handler: impl MethodHandler + 'static,
    ) -> Result<()> {
        let key = (
            descriptor.service_name().to_string(),
            descriptor.method_name().to_string(),
        );
        if self.methods.contains_key(&key) {
            return Err(meridian_core::Error::DuplicateMethod(format!("{}.{}", key.0, key.1)).into());
        }
        self.methods.insert(
            key,
            Registered {
                descriptor: Arc::new(descriptor),
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Builder-style variant of [`register`](Self::register)
    pub fn with(
        mut self,
        descriptor: MethodDescriptor,
        handler: impl MethodHandler + 'static,
    ) -> Result<Self> {
        self.register(descriptor, handler)?;
        Ok(self)
    }

    fn lookup(&self, service_name: &str, method_name: &str) -> Option<&Registered> {
        self.methods
            .get(&(service_name.to_string(), method_name.to_string()))
    }
}

/// Serves registered methods over any [`TransportListener`]
#[derive(Clone)]
pub struct RpcServer {
    protocol: Arc<dyn Protocol>,
    services: Arc<ServiceRegistry>,
    next_connection: Arc<AtomicU64>,
}

impl RpcServer {
    pub fn new(protocol: Arc<dyn Protocol>, services: ServiceRegistry) -> Self {
        Self {
            protocol,
            services: Arc::new(services),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Accept connections until the listener fails
    pub async fn serve<L: TransportListener>(&self, listener: L) -> Result<()> {
        loop {
            let transport = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(transport).await {
                    warn!(error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Answer requests on one connection, in arrival order
    ///
    /// Returns `Ok` when the peer closes the connection and `Err` on a
    /// malformed frame or transport failure.
    pub async fn serve_connection<T: Transport>(&self, mut transport: T) -> Result<()> {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut decoder = FrameDecoder::new();
        debug!(connection, protocol = self.protocol.name(), "serving connection");

        loop {
            match transport.receive(decoder.buffer_mut()).await {
                Ok(_) => {}
                Err(Error::ConnectionClosed) => {
                    debug!(connection, "peer closed connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            while let Some(request) = decoder.next_request(&*self.protocol)? {
                let mut response = self.dispatch(&request);
                let frame = self.encode_reply(&request, &mut response)?;
                transport.send(&frame).await?;
                let receipt = WriteReceipt {
                    channel_id: connection,
                    bytes_written: frame.len(),
                };
                self.protocol
                    .after_response_sent(&request, &response, &receipt);
            }
        }
    }

    /// Encode `response`, replacing it with an error reply for the same call
    /// when it cannot be encoded
    fn encode_reply(&self, request: &Request, response: &mut PooledResponse) -> Result<Vec<u8>> {
        match self.protocol.encode_response(response) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!(
                    id = request.correlation_id,
                    method = %request.method_name,
                    error = %e,
                    "reply could not be encoded"
                );
                response.reset();
                response.correlation_id = Some(request.correlation_id);
                response.error = Some(e.to_string());
                self.protocol.encode_response(response)
            }
        }
    }

    fn dispatch(&self, request: &Request) -> PooledResponse {
        let mut response = self.protocol.get_response();
        response.correlation_id = Some(request.correlation_id);
        response.compress_type = request.compress_type;

        let Some(registered) = self
            .services
            .lookup(&request.service_name, &request.method_name)
        else {
            let error = Error::MethodNotRegistered(format!(
                "{}.{}",
                request.service_name, request.method_name
            ));
            response.error = Some(error.to_string());
            return response;
        };

        let expected = registered.descriptor.param_count();
        if request.args.len() != expected {
            let error = Error::ArgumentCount {
                method: request.method_name.clone(),
                expected,
                actual: request.args.len(),
            };
            response.error = Some(error.to_string());
            return response;
        }

        if let Err(msg) = registered.handler.handle(request, &mut response) {
            response.result = None;
            response.error = Some(msg);
        }
        response
    }
}
