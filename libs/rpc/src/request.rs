use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use meridian_core::{CompressType, HeaderMeta, MethodDescriptor, Value};

use crate::error::Result;
use crate::response::Reply;

/// Completion handler for an asynchronous call
///
/// Invoked exactly once, with either the decoded reply or the error that
/// ended the call.
pub trait RpcCallback: Send + Sync {
    fn complete(&self, result: Result<Reply>);
}

impl<F> RpcCallback for F
where
    F: Fn(Result<Reply>) + Send + Sync,
{
    fn complete(&self, result: Result<Reply>) {
        self(result)
    }
}

/// One positional argument of an invocation
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    Callback(Arc<dyn RpcCallback>),
}

impl Arg {
    pub fn value(value: impl Into<Value>) -> Self {
        Arg::Value(value.into())
    }

    pub fn callback(callback: impl RpcCallback + 'static) -> Self {
        Arg::Callback(Arc::new(callback))
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Arg::Callback(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            Arg::Callback(_) => None,
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Arg::Callback(_) => f.write_str("Callback"),
        }
    }
}

impl PartialEq for Arg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Arg::Value(a), Arg::Value(b)) => a == b,
            (Arg::Callback(a), Arg::Callback(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Value(value.into())
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Value(value.into())
    }
}

/// How the caller waits for the outcome of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// The caller awaits the reply
    Sync,
    /// The reply is delivered to the request's callback
    Async,
}

/// Wire-level request for one outbound call
#[derive(Default)]
pub struct Request {
    pub correlation_id: u64,
    pub service_name: String,
    pub method_name: String,
    pub descriptor: Option<Arc<MethodDescriptor>>,
    pub target: Option<Arc<dyn Any + Send + Sync>>,
    pub args: Vec<Arg>,
    pub compress_type: CompressType,
    pub kv_attachment: HashMap<String, String>,
    pub binary_attachment: Option<Bytes>,
    pub header_meta: Option<HeaderMeta>,
    /// Protocol-specific headers, owned by the protocol that created the request
    pub headers: HashMap<String, String>,
    pub callback: Option<Arc<dyn RpcCallback>>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        if self.callback.is_some() {
            DispatchMode::Async
        } else {
            DispatchMode::Sync
        }
    }

    /// Argument values in order, failing on the first one that is a callback
    pub fn arg_values(&self) -> Result<Vec<Value>> {
        self.args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.as_value()
                    .cloned()
                    .ok_or(crate::error::Error::UnencodableArgument(i))
            })
            .collect()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("correlation_id", &self.correlation_id)
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .field("args", &self.args)
            .field("compress_type", &self.compress_type)
            .field("kv_attachment", &self.kv_attachment)
            .field(
                "binary_attachment_len",
                &self.binary_attachment.as_ref().map(Bytes::len),
            )
            .field("header_meta", &self.header_meta)
            .field("headers", &self.headers)
            .field("dispatch_mode", &self.dispatch_mode())
            .finish()
    }
}
