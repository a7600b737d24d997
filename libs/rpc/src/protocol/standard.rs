//! Correlated binary framing.
//!
//! ```text
//! [4]  magic "MRPC"
//! [4]  body size (meta + payload + attachment), big-endian
//! [4]  meta size, big-endian
//! [..] meta        bincode RequestMeta / ResponseMeta
//! [..] payload     compressed bincode arguments / result
//! [..] attachment  raw binary attachment, length recorded in meta
//! ```
//!
//! An empty binary attachment is not distinguished from none and decodes as
//! `None`.

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meridian_core::{CompressType, Value};
use serde::{Deserialize, Serialize};

use crate::codec::{BincodeCodec, Codec};
use crate::config::DEFAULT_MAX_BODY_SIZE;
use crate::error::{Error, Result};
use crate::pool::PooledResponse;
use crate::protocol::Protocol;
use crate::request::{Arg, Request};
use crate::response::Response;

pub const MAGIC: &[u8; 4] = b"MRPC";
pub const HEADER_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct RequestMeta<'a> {
    correlation_id: u64,
    service_name: Cow<'a, str>,
    method_name: Cow<'a, str>,
    compress_type: i32,
    kv_attachment: Cow<'a, HashMap<String, String>>,
    attachment_size: u32,
}

#[derive(Serialize, Deserialize)]
struct ResponseMeta<'a> {
    correlation_id: u64,
    error: Option<Cow<'a, str>>,
    compress_type: i32,
    kv_attachment: Cow<'a, HashMap<String, String>>,
    attachment_size: u32,
}

/// Default pipelined protocol: every frame carries the request's correlation id
#[derive(Debug, Clone)]
pub struct StandardProtocol {
    codec: BincodeCodec,
    max_body_size: usize,
}

impl StandardProtocol {
    pub fn new() -> Self {
        Self::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }

    /// Frame bodies above `max_body_size` are refused; lengths travel as u32 so
    /// the limit is capped at `u32::MAX`
    pub fn with_max_body_size(max_body_size: usize) -> Self {
        let max_body_size = max_body_size.min(u32::MAX as usize);
        Self {
            codec: BincodeCodec::with_limit(max_body_size as u64),
            max_body_size,
        }
    }

    fn write_frame(&self, meta: &[u8], payload: &[u8], attachment: &[u8]) -> Result<Vec<u8>> {
        let body_size = meta.len() + payload.len() + attachment.len();
        if body_size > self.max_body_size {
            return Err(Error::Codec(format!(
                "Frame body too large: {} bytes",
                body_size
            )));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body_size);
        out.put_slice(MAGIC);
        out.put_u32(body_size as u32);
        out.put_u32(meta.len() as u32);
        out.put_slice(meta);
        out.put_slice(payload);
        out.put_slice(attachment);
        Ok(out)
    }

    /// Split one complete frame off `buf`, returning its meta and remaining body
    fn split_frame(&self, buf: &mut BytesMut) -> Result<(Bytes, Bytes)> {
        if buf.len() < HEADER_LEN {
            return Err(Error::InsufficientData);
        }
        if &buf[..4] != MAGIC {
            return Err(Error::malformed(format!("bad magic {:02x?}", &buf[..4])));
        }
        let body_size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let meta_size = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if body_size > self.max_body_size {
            return Err(Error::malformed(format!(
                "body too large: {} bytes",
                body_size
            )));
        }
        if meta_size > body_size {
            return Err(Error::malformed(format!(
                "meta size {} exceeds body size {}",
                meta_size, body_size
            )));
        }
        if buf.len() < HEADER_LEN + body_size {
            return Err(Error::InsufficientData);
        }

        let mut frame = buf.split_to(HEADER_LEN + body_size).freeze();
        frame.advance(HEADER_LEN);
        let meta = frame.split_to(meta_size);
        Ok((meta, frame))
    }

    fn decode_meta<T: for<'de> Deserialize<'de>>(&self, meta: &[u8]) -> Result<T> {
        self.codec
            .decode(meta)
            .map_err(|e| Error::malformed(format!("unreadable meta: {}", e)))
    }

    fn decode_payload<T: for<'de> Deserialize<'de>>(
        &self,
        compress_type: i32,
        payload: &[u8],
    ) -> Result<(CompressType, T)> {
        let compress_type = CompressType::from_number(compress_type)
            .map_err(|e| Error::malformed(e.to_string()))?;
        let raw = compress_type
            .decompress(payload)
            .map_err(|e| Error::malformed(e.to_string()))?;
        let value = self
            .codec
            .decode(&raw)
            .map_err(|e| Error::malformed(format!("unreadable payload: {}", e)))?;
        Ok((compress_type, value))
    }
}

impl Default for StandardProtocol {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `body` into payload and trailing attachment
fn split_attachment(mut body: Bytes, attachment_size: u32) -> Result<(Bytes, Option<Bytes>)> {
    let attachment_size = attachment_size as usize;
    if attachment_size > body.len() {
        return Err(Error::malformed(format!(
            "attachment size {} exceeds remaining body {}",
            attachment_size,
            body.len()
        )));
    }
    let attachment = body.split_off(body.len() - attachment_size);
    let attachment = (!attachment.is_empty()).then_some(attachment);
    Ok((body, attachment))
}

impl Protocol for StandardProtocol {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>> {
        let args = request.arg_values()?;
        let payload = request.compress_type.compress(&self.codec.encode(&args)?)?;
        let attachment = request.binary_attachment.as_deref().unwrap_or_default();

        let meta = RequestMeta {
            correlation_id: request.correlation_id,
            service_name: Cow::Borrowed(&request.service_name),
            method_name: Cow::Borrowed(&request.method_name),
            compress_type: request.compress_type.number(),
            kv_attachment: Cow::Borrowed(&request.kv_attachment),
            attachment_size: attachment.len() as u32,
        };
        let meta = self.codec.encode(&meta)?;
        self.write_frame(&meta, &payload, attachment)
    }

    fn decode_request(&self, buf: &mut BytesMut) -> Result<Request> {
        let (meta, body) = self.split_frame(buf)?;
        let meta: RequestMeta<'static> = self.decode_meta(&meta)?;
        let (payload, attachment) = split_attachment(body, meta.attachment_size)?;
        let (compress_type, args): (_, Vec<Value>) =
            self.decode_payload(meta.compress_type, &payload)?;

        let mut request = self.create_request();
        request.correlation_id = meta.correlation_id;
        request.service_name = meta.service_name.into_owned();
        request.method_name = meta.method_name.into_owned();
        request.compress_type = compress_type;
        request.args = args.into_iter().map(Arg::Value).collect();
        request.kv_attachment = meta.kv_attachment.into_owned();
        request.binary_attachment = attachment;
        Ok(request)
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        let payload = response
            .compress_type
            .compress(&self.codec.encode(&response.result)?)?;
        let attachment = response.binary_attachment.as_deref().unwrap_or_default();

        let meta = ResponseMeta {
            correlation_id: response.correlation_id.unwrap_or_default(),
            error: response.error.as_deref().map(Cow::Borrowed),
            compress_type: response.compress_type.number(),
            kv_attachment: Cow::Borrowed(&response.kv_attachment),
            attachment_size: attachment.len() as u32,
        };
        let meta = self.codec.encode(&meta)?;
        self.write_frame(&meta, &payload, attachment)
    }

    fn decode_response(&self, buf: &mut BytesMut) -> Result<PooledResponse> {
        let (meta, body) = self.split_frame(buf)?;
        let meta: ResponseMeta<'static> = self.decode_meta(&meta)?;
        let (payload, attachment) = split_attachment(body, meta.attachment_size)?;
        let (compress_type, result): (_, Option<Value>) =
            self.decode_payload(meta.compress_type, &payload)?;

        let mut response = self.get_response();
        response.correlation_id = Some(meta.correlation_id);
        response.result = result;
        response.error = meta.error.map(Cow::into_owned);
        response.compress_type = compress_type;
        response.kv_attachment = meta.kv_attachment.into_owned();
        response.binary_attachment = attachment;
        Ok(response)
    }
}
