//! Nshead framing: a fixed 36-byte little-endian header followed by a body.
//!
//! ```text
//! [2]  id
//! [2]  version
//! [4]  log id
//! [16] provider, NUL padded
//! [4]  magic 0xfb709394
//! [4]  reserved
//! [4]  body length
//! ```
//!
//! The header has no room for a correlation id, so a channel can carry only
//! one outstanding call and replies are matched by the channel they arrive on.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meridian_core::{CompressType, HeaderMeta, Value};
use serde::{Deserialize, Serialize};

use crate::channel_group::ChannelGroup;
use crate::codec::{BincodeCodec, Codec};
use crate::config::{ClientConfig, DEFAULT_MAX_BODY_SIZE};
use crate::error::{Error, Result};
use crate::pool::PooledResponse;
use crate::protocol::Protocol;
use crate::request::{Arg, Request};
use crate::response::Response;

pub const NSHEAD_MAGIC: u32 = 0xfb70_9394;
pub const NSHEAD_LEN: usize = 36;
const PROVIDER_LEN: usize = 16;

/// Header carrying the nshead log id
pub const LOG_ID_HEADER: &str = "log-id";
/// Header carrying the nshead provider name
pub const PROVIDER_HEADER: &str = "provider";

#[derive(Debug, Clone, PartialEq)]
struct NsHead {
    id: u16,
    version: u16,
    log_id: u32,
    provider: String,
    body_len: u32,
}

impl NsHead {
    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16_le(self.id);
        out.put_u16_le(self.version);
        out.put_u32_le(self.log_id);
        let mut provider = [0u8; PROVIDER_LEN];
        // Keep a trailing NUL and never split a character
        let mut n = self.provider.len().min(PROVIDER_LEN - 1);
        while !self.provider.is_char_boundary(n) {
            n -= 1;
        }
        provider[..n].copy_from_slice(&self.provider.as_bytes()[..n]);
        out.put_slice(&provider);
        out.put_u32_le(NSHEAD_MAGIC);
        out.put_u32_le(0);
        out.put_u32_le(self.body_len);
    }

    fn read(mut src: &[u8]) -> Result<Self> {
        let id = src.get_u16_le();
        let version = src.get_u16_le();
        let log_id = src.get_u32_le();
        let provider_raw = &src[..PROVIDER_LEN];
        let end = provider_raw
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(PROVIDER_LEN);
        let provider = String::from_utf8_lossy(&provider_raw[..end]).into_owned();
        src.advance(PROVIDER_LEN);
        let magic = src.get_u32_le();
        if magic != NSHEAD_MAGIC {
            return Err(Error::malformed(format!("bad nshead magic {:#x}", magic)));
        }
        let _reserved = src.get_u32_le();
        let body_len = src.get_u32_le();
        Ok(Self {
            id,
            version,
            log_id,
            provider,
            body_len,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct RequestBody {
    service_name: String,
    method_name: String,
    compress_type: i32,
    kv_attachment: HashMap<String, String>,
    binary_attachment: Option<Bytes>,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ResponseBody {
    error: Option<String>,
    compress_type: i32,
    kv_attachment: HashMap<String, String>,
    binary_attachment: Option<Bytes>,
    payload: Vec<u8>,
}

/// Header-framed protocol without correlation ids
#[derive(Debug, Clone)]
pub struct NsHeadProtocol {
    codec: BincodeCodec,
    max_body_size: usize,
    default_meta: HeaderMeta,
}

impl NsHeadProtocol {
    pub fn new() -> Self {
        Self::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }

    /// Capped at `u32::MAX`, the largest length the header can carry
    pub fn with_max_body_size(max_body_size: usize) -> Self {
        let max_body_size = max_body_size.min(u32::MAX as usize);
        Self {
            codec: BincodeCodec::with_limit(max_body_size as u64),
            max_body_size,
            default_meta: HeaderMeta::default(),
        }
    }

    /// Header metadata used when the method descriptor declares none
    pub fn with_default_meta(mut self, meta: HeaderMeta) -> Self {
        self.default_meta = meta;
        self
    }

    fn write_frame(&self, mut head: NsHead, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() > self.max_body_size {
            return Err(Error::Codec(format!(
                "Frame body too large: {} bytes",
                body.len()
            )));
        }
        head.body_len = body.len() as u32;
        let mut out = Vec::with_capacity(NSHEAD_LEN + body.len());
        head.write(&mut out);
        out.put_slice(body);
        Ok(out)
    }

    fn split_frame(&self, buf: &mut BytesMut) -> Result<(NsHead, Bytes)> {
        if buf.len() < NSHEAD_LEN {
            return Err(Error::InsufficientData);
        }
        let head = NsHead::read(&buf[..NSHEAD_LEN])?;
        let body_len = head.body_len as usize;
        if body_len > self.max_body_size {
            return Err(Error::malformed(format!(
                "body too large: {} bytes",
                body_len
            )));
        }
        if buf.len() < NSHEAD_LEN + body_len {
            return Err(Error::InsufficientData);
        }
        buf.advance(NSHEAD_LEN);
        Ok((head, buf.split_to(body_len).freeze()))
    }

    fn decode_body<T: for<'de> Deserialize<'de>>(&self, body: &[u8]) -> Result<T> {
        self.codec
            .decode(body)
            .map_err(|e| Error::malformed(format!("unreadable body: {}", e)))
    }

    fn unpack<T: for<'de> Deserialize<'de>>(
        &self,
        compress_type: i32,
        payload: &[u8],
    ) -> Result<(CompressType, T)> {
        let compress_type = CompressType::from_number(compress_type)
            .map_err(|e| Error::malformed(e.to_string()))?;
        let raw = compress_type
            .decompress(payload)
            .map_err(|e| Error::malformed(e.to_string()))?;
        Ok((compress_type, self.decode_body(&raw)?))
    }
}

impl Default for NsHeadProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for NsHeadProtocol {
    fn name(&self) -> &'static str {
        "nshead"
    }

    fn create_request(&self) -> Request {
        let mut request = Request::new();
        request.header_meta = Some(self.default_meta.clone());
        request
    }

    fn before_request_sent(
        &self,
        request: &mut Request,
        _config: &ClientConfig,
        channel_group: &dyn ChannelGroup,
    ) {
        let provider = request
            .header_meta
            .as_ref()
            .unwrap_or(&self.default_meta)
            .provider
            .clone();
        request
            .headers
            .insert(LOG_ID_HEADER.to_string(), (request.correlation_id as u32).to_string());
        request.headers.insert(PROVIDER_HEADER.to_string(), provider);
        tracing::trace!(
            endpoint = %channel_group.endpoint(),
            log_id = request.correlation_id as u32,
            "stamped nshead headers"
        );
    }

    fn return_channel_before_response(&self) -> bool {
        false
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>> {
        let args = request.arg_values()?;
        let payload = request.compress_type.compress(&self.codec.encode(&args)?)?;
        let body = self.codec.encode(&RequestBody {
            service_name: request.service_name.clone(),
            method_name: request.method_name.clone(),
            compress_type: request.compress_type.number(),
            kv_attachment: request.kv_attachment.clone(),
            binary_attachment: request.binary_attachment.clone(),
            payload,
        })?;

        let meta = request.header_meta.as_ref().unwrap_or(&self.default_meta);
        let head = NsHead {
            id: meta.id,
            version: meta.version,
            log_id: request
                .headers
                .get(LOG_ID_HEADER)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            provider: request
                .headers
                .get(PROVIDER_HEADER)
                .cloned()
                .unwrap_or_else(|| meta.provider.clone()),
            body_len: 0,
        };
        self.write_frame(head, &body)
    }

    fn decode_request(&self, buf: &mut BytesMut) -> Result<Request> {
        let (head, body) = self.split_frame(buf)?;
        let body: RequestBody = self.decode_body(&body)?;
        let (compress_type, args): (_, Vec<Value>) =
            self.unpack(body.compress_type, &body.payload)?;

        let mut request = self.create_request();
        request.correlation_id = u64::from(head.log_id);
        request.service_name = body.service_name;
        request.method_name = body.method_name;
        request.compress_type = compress_type;
        request.args = args.into_iter().map(Arg::Value).collect();
        request.kv_attachment = body.kv_attachment;
        request.binary_attachment = body.binary_attachment;
        request
            .headers
            .insert(LOG_ID_HEADER.to_string(), head.log_id.to_string());
        request
            .headers
            .insert(PROVIDER_HEADER.to_string(), head.provider.clone());
        request.header_meta = Some(HeaderMeta {
            id: head.id,
            version: head.version,
            provider: head.provider,
        });
        Ok(request)
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        let payload = response
            .compress_type
            .compress(&self.codec.encode(&response.result)?)?;
        let body = self.codec.encode(&ResponseBody {
            error: response.error.clone(),
            compress_type: response.compress_type.number(),
            kv_attachment: response.kv_attachment.clone(),
            binary_attachment: response.binary_attachment.clone(),
            payload,
        })?;
        let head = NsHead {
            id: self.default_meta.id,
            version: self.default_meta.version,
            // Echo the caller's log id; it is not used for matching
            log_id: response.correlation_id.unwrap_or_default() as u32,
            provider: self.default_meta.provider.clone(),
            body_len: 0,
        };
        self.write_frame(head, &body)
    }

    fn decode_response(&self, buf: &mut BytesMut) -> Result<PooledResponse> {
        let (_head, body) = self.split_frame(buf)?;
        let body: ResponseBody = self.decode_body(&body)?;
        let (compress_type, result): (_, Option<Value>) =
            self.unpack(body.compress_type, &body.payload)?;

        let mut response = self.get_response();
        response.result = result;
        response.error = body.error;
        response.compress_type = compress_type;
        response.kv_attachment = body.kv_attachment;
        response.binary_attachment = body.binary_attachment;
        Ok(response)
    }
}
