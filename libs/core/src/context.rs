use std::collections::HashMap;

use bytes::Bytes;

/// Attachments the caller wants carried on one outgoing request
///
/// A context is passed explicitly into request construction, so two calls
/// running concurrently never observe each other's attachments.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    kv_attachment: HashMap<String, String>,
    binary_attachment: Option<Bytes>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key/value attachment
    pub fn with_kv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kv_attachment.insert(key.into(), value.into());
        self
    }

    /// Set the binary attachment
    pub fn with_binary_attachment(mut self, data: impl Into<Bytes>) -> Self {
        self.binary_attachment = Some(data.into());
        self
    }

    pub fn set_kv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.kv_attachment.insert(key.into(), value.into());
    }

    pub fn set_binary_attachment(&mut self, data: impl Into<Bytes>) {
        self.binary_attachment = Some(data.into());
    }

    pub fn request_kv_attachment(&self) -> &HashMap<String, String> {
        &self.kv_attachment
    }

    pub fn request_binary_attachment(&self) -> Option<&Bytes> {
        self.binary_attachment.as_ref()
    }
}
