use std::any::Any;
use std::sync::Arc;

use meridian_core::{InvocationContext, MethodRegistry};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::request::{Arg, Request};

/// A local call about to become a request: method name, target and raw arguments
#[derive(Clone)]
pub struct Invocation {
    pub method_name: String,
    pub target: Option<Arc<dyn Any + Send + Sync>>,
    pub args: Vec<Arg>,
}

impl Invocation {
    pub fn new(method_name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            method_name: method_name.into(),
            target: None,
            args,
        }
    }

    /// Record the stub instance the call was made on
    pub fn with_target(mut self, target: Arc<dyn Any + Send + Sync>) -> Self {
        self.target = Some(target);
        self
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("method_name", &self.method_name)
            .field("args", &self.args)
            .finish()
    }
}

/// Build the request for `invocation` using `protocol` to create it
///
/// A trailing callback marks the call asynchronous only when at least two
/// arguments were passed; a lone callback is kept as a literal argument.
pub fn build_request<P: Protocol + ?Sized>(
    protocol: &P,
    ctx: &InvocationContext,
    registry: &MethodRegistry,
    config: &ClientConfig,
    invocation: Invocation,
) -> Result<Request> {
    let descriptor = registry
        .lookup(&invocation.method_name)
        .ok_or_else(|| Error::MethodNotRegistered(invocation.method_name.clone()))?;

    let mut request = protocol.create_request();
    request.compress_type = config.compress_type;
    request.target = invocation.target;
    request.service_name = descriptor.service_name().to_string();
    request.method_name = descriptor.method_name().to_string();
    if let Some(meta) = descriptor.header_meta() {
        request.header_meta = Some(meta.clone());
    }

    let mut args = invocation.args;
    if args.len() > 1 {
        if let Some(Arg::Callback(callback)) = args.last() {
            request.callback = Some(callback.clone());
            args.pop();
        }
    }
    if args.len() != descriptor.param_count() {
        return Err(Error::ArgumentCount {
            method: descriptor.method_name().to_string(),
            expected: descriptor.param_count(),
            actual: args.len(),
        });
    }
    request.args = args;
    request.descriptor = Some(descriptor);

    request.kv_attachment = ctx.request_kv_attachment().clone();
    // An empty attachment is carried as none
    request.binary_attachment = ctx
        .request_binary_attachment()
        .filter(|b| !b.is_empty())
        .cloned();

    Ok(request)
}
