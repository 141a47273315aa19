// rust/stream-core/src/checkpoint/writer.rs

//! Checkpoint writer implementation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::CheckpointConfig;
use crate::error::{Result, StreamError};
use crate::state::DatasetState;

use super::format::{checksum, CheckpointHeader, Compression, EPOCH_KEY};

/// Writes checkpoints with compression and integrity verification.
///
/// Files are named `{name}_{timestamp_ms}_{sequence}.ckpt`, so sorting the
/// names of one writer's files gives their write order.
pub struct CheckpointWriter {
    config: CheckpointConfig,
    sequence: AtomicU64,
}

impl CheckpointWriter {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Writes the JSON form of a pipeline snapshot, tagged with its epoch.
    ///
    /// # Errors
    ///
    /// Fails if the state cannot be serialized or the file cannot be written.
    pub fn write_state(&self, name: &str, state: &DatasetState) -> Result<PathBuf> {
        self.write_json(name, state, state.epoch)
    }

    /// Writes any serializable snapshot as JSON, tagged with `epoch`.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T, epoch: u64) -> Result<PathBuf> {
        let data = serde_json::to_vec(value)?;
        let mut metadata = HashMap::new();
        metadata.insert(EPOCH_KEY.to_string(), epoch.to_string());
        self.write(name, &data, metadata)
    }

    /// Writes a checkpoint and returns the path to the saved file.
    ///
    /// The checkpoint is written atomically (if configured) and old checkpoints
    /// are cleaned up according to the `keep_last_n` configuration.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error for an unknown compression name and a
    /// storage error when the directory or file cannot be written.
    pub fn write(
        &self,
        name: &str,
        data: &[u8],
        metadata: HashMap<String, String>,
    ) -> Result<PathBuf> {
        let dir = &self.config.checkpoint_dir;
        fs::create_dir_all(dir).map_err(|e| {
            StreamError::storage_with_source(dir, "failed to create checkpoint directory", e)
        })?;

        let compression: Compression = self.config.compression.parse()?;
        let compressed = compression.compress(data, self.config.compression_level)?;
        let header =
            CheckpointHeader::with_metadata(compression, data.len() as u64, checksum(data), metadata);

        let header_bytes = bincode::serialize(&header).map_err(|e| {
            StreamError::checkpoint(format!("failed to serialize header: {e}"))
        })?;
        let header_len = u32::try_from(header_bytes.len())
            .map_err(|_| StreamError::checkpoint("checkpoint header too large"))?;

        let mut checkpoint_data = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
        checkpoint_data.extend_from_slice(&header_len.to_le_bytes());
        checkpoint_data.extend_from_slice(&header_bytes);
        checkpoint_data.extend_from_slice(&compressed);

        let filename = self.generate_filename(name);
        let final_path = dir.join(&filename);

        if self.config.atomic_writes {
            let temp_path = dir.join(format!(".{filename}.tmp"));
            write_file(&temp_path, &checkpoint_data)?;
            fs::rename(&temp_path, &final_path).map_err(|e| {
                StreamError::storage_with_source(&final_path, "failed to move checkpoint in place", e)
            })?;
        } else {
            write_file(&final_path, &checkpoint_data)?;
        }

        info!(
            path = %final_path.display(),
            bytes = checkpoint_data.len(),
            compression = %compression,
            "Checkpoint written"
        );

        self.cleanup_old_checkpoints(name)?;
        Ok(final_path)
    }

    fn generate_filename(&self, name: &str) -> String {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{name}_{timestamp:013}_{sequence:06}.ckpt")
    }

    /// Deletes all but the newest `keep_last_n` checkpoints named `name`.
    fn cleanup_old_checkpoints(&self, name: &str) -> Result<()> {
        let dir = &self.config.checkpoint_dir;
        let mut matching = checkpoint_files(dir, name)?;
        if matching.len() <= self.config.keep_last_n {
            return Ok(());
        }
        let to_delete = matching.len() - self.config.keep_last_n;
        for path in matching.drain(..to_delete) {
            debug!(path = %path.display(), "Removing old checkpoint");
            fs::remove_file(&path).map_err(|e| {
                StreamError::storage_with_source(&path, "failed to remove old checkpoint", e)
            })?;
        }
        Ok(())
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .map_err(|e| StreamError::storage_with_source(path, "failed to write checkpoint data", e))
}

/// Checkpoint files named `name` in `dir`, oldest first. Temporary files
/// are skipped.
pub(crate) fn checkpoint_files(dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        StreamError::storage_with_source(dir, "failed to list checkpoint directory", e)
    })?;

    let prefix = format!("{name}_");
    let mut matching = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            StreamError::storage_with_source(dir, "failed to list checkpoint directory", e)
        })?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        if filename.starts_with(&prefix) && filename.ends_with(".ckpt") {
            matching.push(filename);
        }
    }
    matching.sort();
    Ok(matching.into_iter().map(|f| dir.join(f)).collect())
}
