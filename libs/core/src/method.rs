use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Header fields used by header-framed protocols (nshead style)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMeta {
    pub id: u16,
    pub version: u16,
    pub provider: String,
}

impl Default for HeaderMeta {
    fn default() -> Self {
        Self {
            id: 0,
            version: 1,
            provider: "meridian".to_string(),
        }
    }
}

/// Immutable description of one remotely callable method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    service_name: String,
    method_name: String,
    param_count: usize,
    header_meta: Option<HeaderMeta>,
}

impl MethodDescriptor {
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        param_count: usize,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            param_count,
            header_meta: None,
        }
    }

    /// Attach header metadata for header-framed protocols
    pub fn with_header_meta(mut self, meta: HeaderMeta) -> Self {
        self.header_meta = Some(meta);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Number of declared parameters, excluding any completion callback
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn header_meta(&self) -> Option<&HeaderMeta> {
        self.header_meta.as_ref()
    }
}

/// Method-name keyed lookup table, built once when a client stub is registered
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its method name
    pub fn register(&mut self, descriptor: MethodDescriptor) -> Result<()> {
        let name = descriptor.method_name().to_string();
        if self.methods.contains_key(&name) {
            return Err(Error::DuplicateMethod(name));
        }
        self.methods.insert(name, Arc::new(descriptor));
        Ok(())
    }

    /// Builder-style variant of [`register`](Self::register)
    pub fn with(mut self, descriptor: MethodDescriptor) -> Result<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn lookup(&self, method_name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(method_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
