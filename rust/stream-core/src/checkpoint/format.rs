// rust/stream-core/src/checkpoint/format.rs

//! Checkpoint file header and compression codecs.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{Result, StreamError};

/// Metadata key holding the epoch a snapshot was taken under.
pub(crate) const EPOCH_KEY: &str = "epoch";

/// Payload compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    /// Compresses `data`. `level` is only used by zstd.
    pub fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Zstd => zstd::encode_all(data, level)
                .map_err(|e| StreamError::checkpoint_with_source("zstd compression failed", e)),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| StreamError::checkpoint(format!("lz4 decompression failed: {e}"))),
            Compression::Zstd => zstd::decode_all(data)
                .map_err(|e| StreamError::checkpoint_with_source("zstd decompression failed", e)),
        }
    }
}

impl FromStr for Compression {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(StreamError::checkpoint(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// XXHash64 of `data` with seed 0.
pub(crate) fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Header for a checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Magic bytes identifying this as a checkpoint file ("RSPC")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    /// Compression algorithm used ("none", "lz4", or "zstd")
    pub compression: String,
    /// Size of the data before compression
    pub uncompressed_size: u64,
    /// XXHash64 checksum of the uncompressed data
    pub checksum: u64,
    pub metadata: HashMap<String, String>,
}

impl CheckpointHeader {
    pub const MAGIC: [u8; 4] = *b"RSPC";

    pub const VERSION: u32 = 1;

    pub fn new(compression: Compression, uncompressed_size: u64, checksum: u64) -> Self {
        Self::with_metadata(compression, uncompressed_size, checksum, HashMap::new())
    }

    pub fn with_metadata(
        compression: Compression,
        uncompressed_size: u64,
        checksum: u64,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            compression: compression.as_str().to_string(),
            uncompressed_size,
            checksum,
            metadata,
        }
    }

    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }

    /// The epoch recorded by the writer, if any.
    pub fn epoch(&self) -> Option<u64> {
        self.metadata.get(EPOCH_KEY).and_then(|e| e.parse().ok())
    }

    pub fn compression(&self) -> Result<Compression> {
        self.compression.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_new() {
        let header = CheckpointHeader::new(Compression::Lz4, 1000, 12345);

        assert_eq!(header.magic, *b"RSPC");
        assert_eq!(header.version, CheckpointHeader::VERSION);
        assert_eq!(header.compression, "lz4");
        assert_eq!(header.compression().unwrap(), Compression::Lz4);
        assert_eq!(header.uncompressed_size, 1000);
        assert!(header.metadata.is_empty());
        assert_eq!(header.epoch(), None);
    }

    #[test]
    fn test_header_epoch() {
        let mut metadata = HashMap::new();
        metadata.insert(EPOCH_KEY.to_string(), "7".to_string());
        let header = CheckpointHeader::with_metadata(Compression::Zstd, 10, 0, metadata);
        assert_eq!(header.epoch(), Some(7));

        let mut garbled = header.clone();
        garbled.metadata.insert(EPOCH_KEY.to_string(), "seven".to_string());
        assert_eq!(garbled.epoch(), None);
    }

    #[test]
    fn test_validate() {
        let header = CheckpointHeader::new(Compression::None, 100, 0);
        assert!(header.validate_magic());
        assert!(header.validate_version());

        let mut invalid = header.clone();
        invalid.magic = *b"XXXX";
        invalid.version = 999;
        assert!(!invalid.validate_magic());
        assert!(!invalid.validate_version());
    }

    #[test]
    fn test_header_bincode() {
        let header = CheckpointHeader::new(Compression::Lz4, 1000, 12345);
        let encoded = bincode::serialize(&header).unwrap();
        let decoded: CheckpointHeader = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_codecs() {
        let data = b"abcabcabcabcabcabcabcabc".repeat(20);
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let packed = compression.compress(&data, 3).unwrap();
            assert_eq!(compression.decompress(&packed).unwrap(), data);
        }
        assert!(Compression::Lz4.compress(&data, 0).unwrap().len() < data.len());
    }

    #[test]
    fn test_unknown_compression() {
        let err = "brotli".parse::<Compression>().unwrap_err();
        assert!(matches!(err, StreamError::Checkpoint { .. }));
        assert_eq!("zstd".parse::<Compression>().unwrap().to_string(), "zstd");
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
    }
}
