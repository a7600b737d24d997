use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for a single decompressed body (64MB)
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Compression applied to a request or response body
///
/// The discriminants are the numeric codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum CompressType {
    #[default]
    None = 0,
    Gzip = 2,
    Zlib = 3,
}

impl CompressType {
    /// Wire code of this compression type
    pub fn number(self) -> i32 {
        self as i32
    }

    /// Parse a wire code
    pub fn from_number(number: i32) -> Result<Self> {
        match number {
            0 => Ok(Self::None),
            2 => Ok(Self::Gzip),
            3 => Ok(Self::Zlib),
            other => Err(Error::UnknownCompressType(other)),
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress, refusing output larger than [`MAX_DECOMPRESSED_SIZE`]
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => read_bounded(GzDecoder::new(data)),
            Self::Zlib => read_bounded(ZlibDecoder::new(data)),
        }
    }
}

fn read_bounded(reader: impl Read) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let limit = MAX_DECOMPRESSED_SIZE as u64 + 1;
    reader.take(limit).read_to_end(&mut out)?;
    if out.len() > MAX_DECOMPRESSED_SIZE {
        return Err(Error::Compression(format!(
            "decompressed body exceeds {} bytes",
            MAX_DECOMPRESSED_SIZE
        )));
    }
    Ok(out)
}
