use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Default cap on how much memory one decode may allocate (64MB)
pub const DEFAULT_DECODE_LIMIT: u64 = 64 * 1024 * 1024;

/// Bincode codec for frame metadata and bodies
///
/// Decoding is bounded so a corrupt length prefix inside a frame cannot
/// trigger an oversized allocation.
#[derive(Debug, Clone, Copy)]
pub struct BincodeCodec {
    limit: u64,
}

impl BincodeCodec {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_DECODE_LIMIT)
    }

    pub fn with_limit(limit: u64) -> Self {
        Self { limit }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.limit)
    }
}

impl Default for BincodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        self.options()
            .serialize(value)
            .map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        self.options()
            .deserialize(bytes)
            .map_err(|e| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_trailing_bytes() {
        let codec = BincodeCodec::new();
        let mut bytes = codec.encode(&7u32).unwrap();
        bytes.push(0);
        assert!(codec.decode::<u32>(&bytes).is_err());
    }

    #[test]
    fn limit_caps_claimed_lengths() {
        let codec = BincodeCodec::with_limit(16);
        // A Vec<u8> claiming u64::MAX elements
        let bytes = u64::MAX.to_le_bytes();
        match codec.decode::<Vec<u8>>(&bytes) {
            Err(Error::Codec(_)) => {}
            other => panic!("Expected Codec error, got {:?}", other),
        }
    }
}
