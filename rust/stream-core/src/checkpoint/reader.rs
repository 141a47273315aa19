// rust/stream-core/src/checkpoint/reader.rs

//! Checkpoint reader implementation.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::state::DatasetState;

use super::format::{checksum, CheckpointHeader};
use super::writer::checkpoint_files;

/// Reads and verifies checkpoints.
pub struct CheckpointReader {
    checkpoint_dir: PathBuf,
}

impl CheckpointReader {
    /// Creates a reader; `checkpoint_dir` is only used by [`latest`](Self::latest).
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
        }
    }

    /// Newest checkpoint named `name`, or `None` when there is none or the
    /// directory does not exist yet.
    pub fn latest(&self, name: &str) -> Result<Option<PathBuf>> {
        if !self.checkpoint_dir.is_dir() {
            return Ok(None);
        }
        Ok(checkpoint_files(&self.checkpoint_dir, name)?.pop())
    }

    /// Reads and decompresses a checkpoint, verifying its integrity.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The magic bytes or version are invalid
    /// - Decompression fails
    /// - The checksum or size doesn't match
    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let checkpoint_data = fs::read(path)
            .map_err(|e| StreamError::storage_with_source(path, "failed to read checkpoint", e))?;

        if checkpoint_data.len() < 4 {
            return Err(StreamError::checkpoint("checkpoint file too small"));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&checkpoint_data[..4]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;

        if checkpoint_data.len() < 4 + header_len {
            return Err(StreamError::checkpoint(
                "checkpoint file truncated: header incomplete",
            ));
        }
        let header = decode_header(&checkpoint_data[4..4 + header_len])?;

        let decompressed = header.compression()?.decompress(&checkpoint_data[4 + header_len..])?;

        let computed = checksum(&decompressed);
        if computed != header.checksum {
            return Err(StreamError::checkpoint(format!(
                "checksum mismatch: expected {}, got {computed}",
                header.checksum
            )));
        }
        if decompressed.len() as u64 != header.uncompressed_size {
            return Err(StreamError::checkpoint(format!(
                "size mismatch: expected {}, got {}",
                header.uncompressed_size,
                decompressed.len()
            )));
        }

        debug!(path = %path.display(), bytes = decompressed.len(), "Checkpoint read");
        Ok(decompressed)
    }

    /// Reads the header from a checkpoint without decompressing the data.
    pub fn read_header(&self, path: &Path) -> Result<CheckpointHeader> {
        let mut file = File::open(path)
            .map_err(|e| StreamError::storage_with_source(path, "failed to open checkpoint", e))?;

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|e| StreamError::checkpoint_with_source("failed to read header length", e))?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;

        let mut header_bytes = vec![0u8; header_len];
        file.read_exact(&mut header_bytes)
            .map_err(|e| StreamError::checkpoint_with_source("failed to read header", e))?;

        decode_header(&header_bytes)
    }

    /// Reads a JSON payload written by
    /// [`CheckpointWriter::write_json`](super::CheckpointWriter::write_json).
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let data = self.read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Reads a pipeline snapshot. The epoch in the payload must agree with
    /// the one recorded in the header.
    pub fn read_state(&self, path: &Path) -> Result<DatasetState> {
        let header = self.read_header(path)?;
        let state: DatasetState = self.read_json(path)?;
        match header.epoch() {
            Some(epoch) if epoch != state.epoch => Err(StreamError::checkpoint(format!(
                "epoch mismatch: header says {epoch}, snapshot says {}",
                state.epoch
            ))),
            _ => Ok(state),
        }
    }
}

fn decode_header(bytes: &[u8]) -> Result<CheckpointHeader> {
    let header: CheckpointHeader = bincode::deserialize(bytes)
        .map_err(|e| StreamError::checkpoint(format!("failed to deserialize header: {e}")))?;

    if !header.validate_magic() {
        return Err(StreamError::checkpoint(format!(
            "invalid magic bytes: expected {:?}, got {:?}",
            CheckpointHeader::MAGIC,
            header.magic
        )));
    }
    if !header.validate_version() {
        return Err(StreamError::checkpoint(format!(
            "unsupported version: expected {}, got {}",
            CheckpointHeader::VERSION,
            header.version
        )));
    }
    Ok(header)
}
