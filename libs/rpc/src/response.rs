use std::collections::HashMap;

use bytes::Bytes;
use meridian_core::{CompressType, Value};

use crate::error::{Error, Result};

/// Wire-level response, usually borrowed from a [`ResponsePool`](crate::pool::ResponsePool)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// Id of the request this answers; `None` when the protocol carries none
    pub correlation_id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub kv_attachment: HashMap<String, String>,
    pub binary_attachment: Option<Bytes>,
    pub compress_type: CompressType,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every field back to its default, keeping map capacity
    pub fn reset(&mut self) {
        self.correlation_id = None;
        self.result = None;
        self.error = None;
        self.kv_attachment.clear();
        self.binary_attachment = None;
        self.compress_type = CompressType::None;
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Caller-visible outcome: the reply, or the remote error it carries
    pub fn reply(&self) -> Result<Reply> {
        if let Some(error) = &self.error {
            return Err(Error::Remote(error.clone()));
        }
        Ok(Reply {
            result: self.result.clone().unwrap_or_default(),
            kv_attachment: self.kv_attachment.clone(),
            binary_attachment: self.binary_attachment.clone(),
        })
    }
}

/// Result of a completed call as handed to the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub result: Value,
    pub kv_attachment: HashMap<String, String>,
    pub binary_attachment: Option<Bytes>,
}
