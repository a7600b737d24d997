//! Meridian RPC - Protocol abstraction and invocation pipeline
//!
//! A [`Protocol`] turns local invocations into framed requests and decodes
//! framed responses. [`RpcClient`] drives calls over a [`ChannelGroup`] in
//! either of two modes: synchronous (the caller awaits the reply) or
//! asynchronous (a trailing callback argument receives it). [`RpcServer`]
//! answers the same frames on the other side.
//!
//! # Example
//!
//! ```no_run
//! use meridian_core::{InvocationContext, MethodDescriptor, MethodRegistry};
//! use meridian_rpc::{Arg, ClientConfig, Invocation, RpcClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = MethodRegistry::new().with(MethodDescriptor::new("EchoService", "echo", 1))?;
//! let client = RpcClient::tcp("127.0.0.1:8080".parse()?, ClientConfig::default(), registry);
//!
//! let ctx = InvocationContext::new().with_kv("trace", "abc");
//! let reply = client
//!     .invoke(&ctx, Invocation::new("echo", vec![Arg::from("hi")]))
//!     .await?;
//! println!("{:?}", reply.map(|r| r.result));
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod channel_group;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod invocation;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod response;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use channel::{Channel, WriteReceipt};
pub use channel_group::{ChannelGroup, TcpChannelGroup};
pub use client::RpcClient;
pub use config::{ClientConfig, ProtocolType};
pub use error::{Error, Result};
pub use frame::FrameDecoder;
pub use invocation::Invocation;
pub use pool::{PooledResponse, ResponsePool};
pub use protocol::{NsHeadProtocol, Protocol, StandardProtocol};
pub use request::{Arg, DispatchMode, Request, RpcCallback};
pub use response::{Reply, Response};
pub use server::{handler_fn, MethodHandler, RpcServer, ServiceRegistry};
