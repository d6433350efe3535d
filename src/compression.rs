// src/compression.rs

//! Compression helpers shared by the content store and changeset contents
//!
//! Blobs at rest default to zstd; file contents inside changesets are gzip
//! compressed.

use crate::error::Result;
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// zstd level used for stored blobs
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd,
    Gzip,
}

impl Compression {
    /// File suffix for blobs stored with this compression
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Zstd => ".zst",
            Compression::Gzip => ".gz",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => Ok(zstd::encode_all(data, ZSTD_LEVEL)?),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => Ok(zstd::decode_all(data)?),
            Compression::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_modes_shrink_repetitive_data() {
        let data = b"conary ".repeat(1000);
        for mode in [Compression::Zstd, Compression::Gzip] {
            let packed = mode.compress(&data).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(mode.decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        assert!(Compression::Gzip.decompress(b"not gzip").is_err());
        assert!(Compression::Zstd.decompress(b"not zstd").is_err());
    }
}
