// rust/stream-core/src/lib.rs

//! Resumable Streaming Pipelines - Core Library
//!
//! This crate provides lazily evaluated pipelines over keyed records read
//! from sharded sources. Every stage of a pipeline can report an exact
//! snapshot of its position and be restored from one, so an interrupted
//! run resumes where it stopped.
//!
//! The building blocks are:
//! - [`iterable`]: the stream operators and their shared contract
//! - [`state`]: the snapshot types, composed the way operators are
//! - [`dataset`]: the user-facing [`IterableDataset`] facade
//! - [`loader`]: a multi-threaded worker pool over a dataset
//! - [`checkpoint`]: durable, verified snapshot files

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::StreamConfig;
pub use error::{Result, StreamError};

pub mod features;
pub mod formatting;
pub mod generator;
pub mod records;
pub mod sharding;
pub mod state;

pub use features::Features;
pub use formatting::{FormatType, FormattingConfig};
pub use generator::Generator;
pub use records::{Key, Record, Row, Table};
pub use sharding::GenKwargs;
pub use state::{DatasetState, IterableState};

pub mod iterable;
pub use iterable::{BoxedIterable, ExamplesIterable, MapFunction, MapOptions, StoppingStrategy};

pub mod dataset;
pub use dataset::{
    concatenate_datasets, interleave_datasets, split_dataset_by_node, Axis, DatasetIter,
    IterableDataset,
};

pub mod loader;
pub use loader::{LoaderConfig, LoaderState, WorkerPoolLoader};

pub mod checkpoint;
pub use checkpoint::{CheckpointHeader, CheckpointReader, CheckpointWriter};
