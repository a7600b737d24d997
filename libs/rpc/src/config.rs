use std::sync::Arc;
use std::time::Duration;

use meridian_core::CompressType;
use serde::{Deserialize, Serialize};

use crate::protocol::{NsHeadProtocol, Protocol, StandardProtocol};

/// Default upper bound for a single frame body (64MB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Wire protocol selected by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    /// Correlated, pipelined framing
    #[default]
    Standard,
    /// Header framing without correlation ids; one call per channel at a time
    NsHead,
}

impl ProtocolType {
    pub fn build(self, max_body_size: usize) -> Arc<dyn Protocol> {
        match self {
            ProtocolType::Standard => Arc::new(StandardProtocol::with_max_body_size(max_body_size)),
            ProtocolType::NsHead => Arc::new(NsHeadProtocol::with_max_body_size(max_body_size)),
        }
    }
}

/// Client-side call settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub protocol: ProtocolType,
    pub compress_type: CompressType,
    /// Per-call deadline in milliseconds
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Idle channels kept per endpoint
    pub max_idle_channels: usize,
    pub max_body_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolType::Standard,
            compress_type: CompressType::None,
            timeout_ms: 1000,
            connect_timeout_ms: 1000,
            max_idle_channels: 8,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: ProtocolType) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_compress_type(mut self, compress_type: CompressType) -> Self {
        self.compress_type = compress_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_idle_channels(mut self, max: usize) -> Self {
        self.max_idle_channels = max;
        self
    }

    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
