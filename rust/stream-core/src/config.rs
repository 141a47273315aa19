// rust/stream-core/src/config.rs

//! Configuration management for streaming pipelines.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.
//!
//! # Example
//!
//! ```
//! use stream_core::config::StreamConfig;
//!
//! let config: StreamConfig = r#"
//!     [pipeline]
//!     format = "arrow"
//!     shuffle = true
//!     seed = 7
//! "#.parse().unwrap();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.pipeline.seed, Some(7));
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, StreamError};

// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub pipeline: PipelineConfig,
    pub map: MapConfig,
    pub distributed: DistributedSection,
    pub checkpoint: CheckpointConfig,
}

/// Output representation and shuffling of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output format: "python", "arrow" or "tensor".
    pub format: String,
    // Whether to apply a buffered shuffle.
    pub shuffle: bool,
    // Optional seed for reproducible shuffling.
    pub seed: Option<u64>,
    // Reservoir size for the buffered shuffle.
    pub shuffle_buffer_size: usize,
    // Rows per batch when iterating batches; None yields rows.
    pub batch_size: Option<usize>,
    pub drop_last_batch: bool,
}

/// Defaults for map transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Maximum number of async transform tasks in flight.
    pub max_concurrency: usize,
    /// Default batch size for batched transforms.
    pub batch_size: usize,
}

// Node assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedSection {
    pub rank: usize,
    pub world_size: usize,
}

// Checkpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Directory for storing checkpoints.
    pub checkpoint_dir: PathBuf,
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    // Compression level (algorithm-specific).
    pub compression_level: i32,
    // Number of recent checkpoints to keep.
    pub keep_last_n: usize,
    // Whether to use atomic writes (write to temp then rename).
    pub atomic_writes: bool,
    // Records consumed between two checkpoints.
    pub every_n_examples: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            format: "python".to_string(),
            shuffle: false,
            seed: None,
            shuffle_buffer_size: 1000,
            batch_size: None,
            drop_last_batch: false,
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1000,
            batch_size: 1000,
        }
    }
}

impl Default for DistributedSection {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./checkpoints"),
            compression: "lz4".to_string(),
            compression_level: 1,
            keep_last_n: 3,
            atomic_writes: true,
            every_n_examples: 1000,
        }
    }
}

impl FromStr for StreamConfig {
    type Err = StreamError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| StreamError::config_with_source("failed to parse TOML config", e))
    }
}

impl StreamConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `RSP_` and use underscores
    // to separate nested fields. For example:
    // - `RSP_PIPELINE_SEED` overrides `pipeline.seed`
    // - `RSP_MAP_MAX_CONCURRENCY` overrides `map.max_concurrency`
    // - `RSP_DISTRIBUTED_RANK` overrides `distributed.rank`
    // - `RSP_CHECKPOINT_COMPRESSION` overrides `checkpoint.compression`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Pipeline overrides
        if let Ok(val) = std::env::var("RSP_PIPELINE_FORMAT") {
            self.pipeline.format = val.to_lowercase();
        }
        if let Ok(val) = std::env::var("RSP_PIPELINE_SHUFFLE") {
            if let Ok(v) = val.parse() {
                self.pipeline.shuffle = v;
            }
        }
        if let Ok(val) = std::env::var("RSP_PIPELINE_SEED") {
            if let Ok(v) = val.parse() {
                self.pipeline.seed = Some(v);
            }
        }
        if let Ok(val) = std::env::var("RSP_PIPELINE_SHUFFLE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.pipeline.shuffle_buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("RSP_PIPELINE_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.pipeline.batch_size = Some(v);
            }
        }
        if let Ok(val) = std::env::var("RSP_PIPELINE_DROP_LAST_BATCH") {
            if let Ok(v) = val.parse() {
                self.pipeline.drop_last_batch = v;
            }
        }

        // Map overrides
        if let Ok(val) = std::env::var("RSP_MAP_MAX_CONCURRENCY") {
            if let Ok(v) = val.parse() {
                self.map.max_concurrency = v;
            }
        }
        if let Ok(val) = std::env::var("RSP_MAP_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.map.batch_size = v;
            }
        }

        // Distributed overrides
        if let Ok(val) = std::env::var("RSP_DISTRIBUTED_RANK") {
            if let Ok(v) = val.parse() {
                self.distributed.rank = v;
            }
        }
        if let Ok(val) = std::env::var("RSP_DISTRIBUTED_WORLD_SIZE") {
            if let Ok(v) = val.parse() {
                self.distributed.world_size = v;
            }
        }

        // Checkpoint overrides
        if let Ok(val) = std::env::var("RSP_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RSP_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        if let Ok(val) = std::env::var("RSP_CHECKPOINT_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.checkpoint.compression_level = v;
            }
        }
        if let Ok(val) = std::env::var("RSP_CHECKPOINT_KEEP_LAST_N") {
            if let Ok(v) = val.parse() {
                self.checkpoint.keep_last_n = v;
            }
        }
        if let Ok(val) = std::env::var("RSP_CHECKPOINT_ATOMIC_WRITES") {
            if let Ok(v) = val.parse() {
                self.checkpoint.atomic_writes = v;
            }
        }
        if let Ok(val) = std::env::var("RSP_CHECKPOINT_EVERY_N_EXAMPLES") {
            if let Ok(v) = val.parse() {
                self.checkpoint.every_n_examples = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Pipeline validation
        let valid_formats = ["python", "arrow", "tensor"];
        if !valid_formats.contains(&self.pipeline.format.as_str()) {
            return Err(StreamError::config(format!(
                "pipeline.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }
        if self.pipeline.shuffle_buffer_size == 0 {
            return Err(StreamError::config(
                "pipeline.shuffle_buffer_size must be greater than 0",
            ));
        }
        if self.pipeline.batch_size == Some(0) {
            return Err(StreamError::config(
                "pipeline.batch_size must be greater than 0",
            ));
        }

        // Map validation
        if self.map.max_concurrency == 0 {
            return Err(StreamError::config(
                "map.max_concurrency must be greater than 0",
            ));
        }
        if self.map.batch_size == 0 {
            return Err(StreamError::config("map.batch_size must be greater than 0"));
        }

        // Distributed validation
        if self.distributed.world_size == 0 {
            return Err(StreamError::config(
                "distributed.world_size must be greater than 0",
            ));
        }
        if self.distributed.rank >= self.distributed.world_size {
            return Err(StreamError::config(format!(
                "distributed.rank ({}) must be smaller than distributed.world_size ({})",
                self.distributed.rank, self.distributed.world_size
            )));
        }

        // Checkpoint validation
        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(StreamError::config(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }
        if self.checkpoint.keep_last_n == 0 {
            return Err(StreamError::config(
                "checkpoint.keep_last_n must be greater than 0",
            ));
        }
        if self.checkpoint.every_n_examples == 0 {
            return Err(StreamError::config(
                "checkpoint.every_n_examples must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();

        assert_eq!(config.pipeline.format, "python");
        assert!(!config.pipeline.shuffle);
        assert!(config.pipeline.seed.is_none());
        assert_eq!(config.pipeline.shuffle_buffer_size, 1000);
        assert!(config.pipeline.batch_size.is_none());

        assert_eq!(config.map.max_concurrency, 1000);
        assert_eq!(config.map.batch_size, 1000);

        assert_eq!(config.distributed.rank, 0);
        assert_eq!(config.distributed.world_size, 1);

        assert_eq!(
            config.checkpoint.checkpoint_dir,
            PathBuf::from("./checkpoints")
        );
        assert_eq!(config.checkpoint.compression, "lz4");
        assert_eq!(config.checkpoint.keep_last_n, 3);
        assert!(config.checkpoint.atomic_writes);
        assert_eq!(config.checkpoint.every_n_examples, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [distributed]
            rank = 1
            world_size = 4
        "#;
        let config: StreamConfig = toml.parse().unwrap();

        assert_eq!(config.distributed.rank, 1);
        assert_eq!(config.distributed.world_size, 4);
        // Other sections should be defaults
        assert_eq!(config.pipeline.format, "python");
        assert_eq!(config.map.max_concurrency, 1000);
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [pipeline]
            format = "arrow"
            shuffle = true
            seed = 42
            shuffle_buffer_size = 64
            batch_size = 16
            drop_last_batch = true

            [map]
            max_concurrency = 8
            batch_size = 32

            [distributed]
            rank = 2
            world_size = 3

            [checkpoint]
            checkpoint_dir = "/checkpoints"
            compression = "zstd"
            compression_level = 3
            keep_last_n = 5
            atomic_writes = false
            every_n_examples = 10
        "#;

        let config: StreamConfig = toml.parse().unwrap();

        assert_eq!(config.pipeline.format, "arrow");
        assert!(config.pipeline.shuffle);
        assert_eq!(config.pipeline.seed, Some(42));
        assert_eq!(config.pipeline.shuffle_buffer_size, 64);
        assert_eq!(config.pipeline.batch_size, Some(16));
        assert!(config.pipeline.drop_last_batch);
        assert_eq!(config.map.max_concurrency, 8);
        assert_eq!(config.map.batch_size, 32);
        assert_eq!(config.distributed.rank, 2);
        assert_eq!(config.distributed.world_size, 3);
        assert_eq!(config.checkpoint.compression, "zstd");
        assert_eq!(config.checkpoint.compression_level, 3);
        assert_eq!(config.checkpoint.keep_last_n, 5);
        assert!(!config.checkpoint.atomic_writes);
        assert_eq!(config.checkpoint.every_n_examples, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<StreamConfig, _> = "invalid = [".parse();
        assert!(matches!(result, Err(StreamError::Config { .. })));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [checkpoint]
            checkpoint_dir = "/tmp/ckpt"
            "#
        )
        .unwrap();

        let config = StreamConfig::from_file(file.path()).unwrap();
        assert_eq!(config.checkpoint.checkpoint_dir, PathBuf::from("/tmp/ckpt"));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = StreamConfig::from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(StreamError::Storage { .. })));
    }

    #[test]
    fn test_from_file_validates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[distributed]\nrank = 3\nworld_size = 2").unwrap();
        assert!(StreamConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = StreamConfig::default();
        config.pipeline.format = "pandas".to_string();
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.pipeline.shuffle_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.pipeline.batch_size = Some(0);
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.map.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.distributed.world_size = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.checkpoint.compression = "gzip".to_string();
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.checkpoint.keep_last_n = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rank_out_of_range() {
        let mut config = StreamConfig::default();
        config.distributed.rank = 4;
        config.distributed.world_size = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("distributed.rank"));
    }

    // Helper to clear all RSP_ environment variables for test isolation
    fn clear_rsp_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("RSP_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variables are global state, so every override case lives
    // in this one test.
    #[test]
    fn test_env_overrides() {
        clear_rsp_env_vars();

        std::env::set_var("RSP_PIPELINE_FORMAT", "Arrow");
        std::env::set_var("RSP_PIPELINE_SEED", "12345");
        std::env::set_var("RSP_MAP_MAX_CONCURRENCY", "16");
        std::env::set_var("RSP_DISTRIBUTED_RANK", "1");
        std::env::set_var("RSP_DISTRIBUTED_WORLD_SIZE", "2");
        std::env::set_var("RSP_CHECKPOINT_COMPRESSION", "zstd");

        let config = StreamConfig::default().with_env_overrides();

        assert_eq!(config.pipeline.format, "arrow");
        assert_eq!(config.pipeline.seed, Some(12345));
        assert_eq!(config.map.max_concurrency, 16);
        assert_eq!(config.distributed.rank, 1);
        assert_eq!(config.distributed.world_size, 2);
        assert_eq!(config.checkpoint.compression, "zstd");
        assert!(config.validate().is_ok());

        clear_rsp_env_vars();

        // Unparsable values keep the defaults
        std::env::set_var("RSP_MAP_MAX_CONCURRENCY", "many");
        let config = StreamConfig::default().with_env_overrides();
        assert_eq!(config.map.max_concurrency, 1000);

        clear_rsp_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = StreamConfig::default();
        original.pipeline.seed = Some(9);
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: StreamConfig = toml_str.parse().unwrap();

        assert_eq!(parsed.pipeline.seed, Some(9));
        assert_eq!(parsed.checkpoint.compression, original.checkpoint.compression);
        assert_eq!(parsed.map.max_concurrency, original.map.max_concurrency);
    }
}
