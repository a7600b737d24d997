//! Wire protocols.
//!
//! A [`Protocol`] owns everything that differs between wire formats: how a
//! request and response are framed, what happens right before a request is
//! written and after a response is delivered, and whether a channel can be
//! handed back to its group before the reply arrives. The provided methods
//! describe a correlated, pipelined TCP protocol; other formats override only
//! what they need.

use bytes::BytesMut;
use meridian_core::{InvocationContext, MethodRegistry};

use crate::channel::WriteReceipt;
use crate::channel_group::ChannelGroup;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::invocation::{build_request, Invocation};
use crate::pool::{PooledResponse, ResponsePool};
use crate::request::Request;
use crate::response::Response;

pub mod nshead;
pub mod standard;

pub use self::nshead::NsHeadProtocol;
pub use self::standard::StandardProtocol;

pub trait Protocol: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Fresh request with no state shared with other calls
    fn create_request(&self) -> Request {
        Request::new()
    }

    fn create_response(&self) -> Response {
        Response::new()
    }

    /// Reset response from the shared pool, built with
    /// [`create_response`](Self::create_response) on a miss
    fn get_response(&self) -> PooledResponse {
        ResponsePool::shared().acquire_with(|| self.create_response())
    }

    /// Turn a local invocation into a request for this protocol
    fn init_request(
        &self,
        ctx: &InvocationContext,
        registry: &MethodRegistry,
        config: &ClientConfig,
        invocation: Invocation,
    ) -> Result<Request> {
        build_request(self, ctx, registry, config, invocation)
    }

    /// Called right before the request frame is written
    fn before_request_sent(
        &self,
        _request: &mut Request,
        _config: &ClientConfig,
        _channel_group: &dyn ChannelGroup,
    ) {
    }

    /// Called once a response has been delivered: on the client after the
    /// caller or callback consumed it, on the server after it was written
    fn after_response_sent(&self, _request: &Request, _response: &Response, _receipt: &WriteReceipt) {
    }

    /// `true` when requests carry a correlation id, so the channel can serve
    /// other calls while this one waits for its reply
    fn return_channel_before_response(&self) -> bool {
        true
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>>;

    /// Decode one request frame from the front of `buf`
    ///
    /// Returns [`Error::InsufficientData`](crate::Error::InsufficientData)
    /// without touching `buf` if the frame is incomplete.
    fn decode_request(&self, buf: &mut BytesMut) -> Result<Request>;

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>>;

    /// Decode one response frame from the front of `buf`
    ///
    /// Same buffer contract as [`decode_request`](Self::decode_request).
    fn decode_response(&self, buf: &mut BytesMut) -> Result<PooledResponse>;
}
