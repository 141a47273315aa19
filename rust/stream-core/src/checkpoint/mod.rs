// rust/stream-core/src/checkpoint/mod.rs

//! Durable storage for pipeline snapshots.
//!
//! A [`DatasetState`](crate::state::DatasetState) is plain data; this module
//! puts it on disk so a run can be resumed by another process:
//! - compression (none, lz4, zstd)
//! - XXHash64 integrity checks
//! - atomic writes through a temporary file
//! - retention of the newest `keep_last_n` files per name
//!
//! # Format
//!
//! ```text
//! +------------------------+
//! | Header Length (4 bytes)|  <- u32 little-endian
//! +------------------------+
//! | Header (bincode)       |  <- CheckpointHeader, magic "RSPC"
//! +------------------------+
//! | Compressed Data        |  <- Payload compressed per header
//! +------------------------+
//! ```
//!
//! The payload of a pipeline checkpoint is the JSON form of its state. The
//! epoch it was taken under is always recorded in the header metadata.
//!
//! # Example
//!
//! ```no_run
//! use stream_core::checkpoint::{CheckpointReader, CheckpointWriter};
//! use stream_core::config::CheckpointConfig;
//! use stream_core::IterableDataset;
//!
//! # fn main() -> stream_core::Result<()> {
//! let ds = IterableDataset::from_rows(Vec::new(), 1)?;
//! let config = CheckpointConfig::default();
//! let writer = CheckpointWriter::new(config.clone());
//! let path = writer.write_state("train", &ds.state_dict()?)?;
//!
//! let reader = CheckpointReader::new(&config.checkpoint_dir);
//! let state = reader.read_state(&path)?;
//! assert_eq!(reader.latest("train")?, Some(path));
//! # let _ = state;
//! # Ok(())
//! # }
//! ```

mod format;
mod reader;
mod writer;

pub use format::{CheckpointHeader, Compression};
pub use reader::CheckpointReader;
pub use writer::CheckpointWriter;
