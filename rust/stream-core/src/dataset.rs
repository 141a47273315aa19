// rust/stream-core/src/dataset.rs

//! The pipeline facade.
//!
//! An [`IterableDataset`] owns the root of an operator tree plus the
//! settings that only make sense at iteration time: the output format, the
//! shard-order shuffling, the node split and the epoch. Every call to
//! [`IterableDataset::iter`] rebuilds a concrete chain from these settings,
//! rewinds it and applies the stored snapshot if it belongs to the current
//! epoch.
//!
//! Transformations never touch data: they return a new dataset wrapping the
//! operator tree in one more operator.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use stream_core::dataset::IterableDataset;
//!
//! let rows = (0..6).map(|i| json!({"a": i}).as_object().unwrap().clone()).collect();
//! let mut ds = IterableDataset::from_rows(rows, 3).unwrap();
//!
//! let mut seen = Vec::new();
//! let mut iter = ds.iter().unwrap();
//! while let Some(record) = iter.next() {
//!     seen.push(record.unwrap());
//!     if seen.len() == 3 {
//!         break;
//!     }
//! }
//! let state = iter.state_dict();
//!
//! ds.load_state_dict(state);
//! let rest: Vec<_> = ds.iter().unwrap().map(|r| r.unwrap()).collect();
//! assert_eq!(rest.len(), 3);
//! assert_eq!(rest[0].as_row().unwrap()["a"], json!(3));
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::datatypes::{DataType, Field};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::features::Features;
use crate::formatting::{FormatType, FormattingConfig};
use crate::generator::Generator;
use crate::iterable::{
    BoxedIterable, BufferShuffledExamplesIterable, CyclingMultiSourcesExamplesIterable,
    ExamplesIterable, FilterFunction, FormattedExamplesIterable, GenerateExamplesFn, GenerateTablesFn,
    HorizontallyConcatenatedMultiSourcesExamplesIterable, Indices, MapFunction, MapOptions,
    MappedExamplesIterable, RandomlyCyclingMultiSourcesExamplesIterable,
    RebatchedArrowExamplesIterable, RepeatExamplesIterable, SelectColumnsIterable,
    SkipExamplesIterable, SourceExamplesIterable, StepExamplesIterable, StoppingStrategy,
    TakeExamplesIterable, VerticallyConcatenatedMultiSourcesExamplesIterable,
};
use crate::records::{examples_to_batch, table_to_rows, Record, Row, Table};
use crate::sharding::GenKwargs;
use crate::state::DatasetState;

/// Rows read to infer the features of a dataset with unknown columns.
const HEAD_SIZE: usize = 5;

static STEP_FALLBACK_LOGGED: AtomicBool = AtomicBool::new(false);

/// Shard-order shuffling applied at iteration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShufflingConfig {
    pub generator: Generator,
    /// The seed the generator was built from, if any.
    pub seed: Option<u64>,
}

/// The node this dataset is read on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    pub rank: usize,
    pub world_size: usize,
}

/// Axis of [`concatenate_datasets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Axis {
    /// One dataset after the other.
    #[default]
    Rows,
    /// Records zipped side by side.
    Columns,
}

/// A lazily evaluated, resumable stream of records.
#[derive(Clone)]
pub struct IterableDataset {
    ex_iterable: BoxedIterable,
    features: Option<Features>,
    formatting: Option<FormattingConfig>,
    shuffling: Option<ShufflingConfig>,
    distributed: Option<DistributedConfig>,
    epoch: u64,
    starting_state: Option<DatasetState>,
    // The chain of the latest iteration.
    prepared: Option<BoxedIterable>,
}

impl fmt::Debug for IterableDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterableDataset")
            .field("features", &self.column_names())
            .field("num_shards", &self.num_shards())
            .field("operator", &self.ex_iterable.name())
            .finish()
    }
}

impl IterableDataset {
    /// Wraps an operator tree. Typed operators provide the features.
    pub fn new(ex_iterable: BoxedIterable) -> Self {
        let features = if ex_iterable.is_typed() {
            ex_iterable.features()
        } else {
            None
        };
        Self {
            ex_iterable,
            features,
            formatting: None,
            shuffling: None,
            distributed: None,
            epoch: 0,
            starting_state: None,
            prepared: None,
        }
    }

    /// A dataset generating rows from `kwargs`. Array-valued entries of
    /// `kwargs` are shard lists.
    ///
    /// # Errors
    ///
    /// Returns a config error if the shard lists have different lengths.
    pub fn from_generator(generate_examples_fn: GenerateExamplesFn, kwargs: GenKwargs) -> Result<Self> {
        Ok(Self::new(Box::new(SourceExamplesIterable::new(
            generate_examples_fn,
            kwargs,
        )?)))
    }

    /// A dataset generating tables from `kwargs`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the shard lists have different lengths.
    pub fn from_table_generator(generate_tables_fn: GenerateTablesFn, kwargs: GenKwargs) -> Result<Self> {
        Ok(Self::new(Box::new(SourceExamplesIterable::from_tables(
            generate_tables_fn,
            kwargs,
        )?)))
    }

    /// An in-memory dataset split into `num_shards` contiguous shards.
    pub fn from_rows(rows: Vec<Row>, num_shards: usize) -> Result<Self> {
        Ok(Self::new(Box::new(SourceExamplesIterable::from_rows(
            rows, num_shards,
        )?)))
    }

    /// An in-memory dataset with one shard per table.
    pub fn from_record_batches(tables: Vec<Table>) -> Result<Self> {
        Ok(Self::new(Box::new(SourceExamplesIterable::from_record_batches(tables)?)))
    }

    /// A dataset sharing this one's settings over another operator tree.
    fn derive(&self, ex_iterable: BoxedIterable) -> Self {
        Self {
            ex_iterable,
            features: self.features.clone(),
            formatting: self.formatting,
            shuffling: self.shuffling.clone(),
            distributed: self.distributed,
            epoch: 0,
            starting_state: None,
            prepared: None,
        }
    }

    fn check_distributed_shuffling(self) -> Result<Self> {
        let unseeded = self.shuffling.as_ref().is_some_and(|s| s.seed.is_none());
        if unseeded && self.distributed.is_some_and(|d| d.world_size > 1) {
            return Err(StreamError::config(
                "The dataset doesn't have a fixed random seed across nodes to shuffle and split \
                 the list of dataset shards by node. Please pass a seed to shuffle() so that all \
                 the nodes use the same one.",
            ));
        }
        Ok(self)
    }

    pub fn features(&self) -> Option<&Features> {
        self.features.as_ref()
    }

    pub fn column_names(&self) -> Option<Vec<String>> {
        self.features.as_ref().map(Features::column_names)
    }

    pub fn formatting(&self) -> Option<FormattingConfig> {
        self.formatting
    }

    pub fn shuffling(&self) -> Option<&ShufflingConfig> {
        self.shuffling.as_ref()
    }

    pub fn distributed(&self) -> Option<DistributedConfig> {
        self.distributed
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Moves to another epoch. Shuffled datasets reseed their shard order
    /// and buffers from the epoch.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Number of shards this node iterates over.
    pub fn num_shards(&self) -> usize {
        let num_shards = self.ex_iterable.num_shards();
        match self.distributed {
            Some(d) if d.world_size > 0 && num_shards % d.world_size == 0 => num_shards / d.world_size,
            _ => num_shards,
        }
    }

    /// Snapshot of the latest iteration, or of the start if none ran.
    ///
    /// # Errors
    ///
    /// Fails if the iteration chain cannot be built.
    pub fn state_dict(&self) -> Result<DatasetState> {
        if let Some(prepared) = &self.prepared {
            return Ok(DatasetState {
                examples_iterable: prepared.state(),
                epoch: self.epoch,
            });
        }
        if let Some(state) = self.starting_state.as_ref().filter(|s| s.epoch == self.epoch) {
            return Ok(state.clone());
        }
        let mut chain = self.build_chain(Some(1), false)?;
        Ok(DatasetState {
            examples_iterable: chain.init_state(),
            epoch: self.epoch,
        })
    }

    /// Makes the next iteration resume from `state`. The snapshot is
    /// ignored if it was taken in another epoch.
    pub fn load_state_dict(&mut self, state: DatasetState) {
        self.starting_state = Some(state);
        self.prepared = None;
    }

    /// Builds the chain for one iteration, without rewinding it.
    fn build_chain(&self, batch_size: Option<usize>, drop_last_batch: bool) -> Result<BoxedIterable> {
        let mut ex_iterable = self.ex_iterable.clone();
        if let Some(formatting) = self.formatting {
            if ex_iterable.has_table_path() || formatting.is_table() {
                ex_iterable = Box::new(RebatchedArrowExamplesIterable::new(
                    ex_iterable,
                    batch_size,
                    drop_last_batch,
                ));
            }
        }
        if let Some(shuffling) = &self.shuffling {
            let generator = shuffling.generator.effective_epoch_generator(self.epoch);
            ex_iterable = ex_iterable.shuffle_shards(&generator);
        }
        if let Some(DistributedConfig { rank, world_size }) = self.distributed {
            let num_shards = ex_iterable.num_shards();
            if num_shards % world_size == 0 {
                if rank == 0 {
                    info!(
                        shards_per_node = num_shards / world_size,
                        world_size, "Assigning shards of the dataset to each node"
                    );
                }
                ex_iterable = ex_iterable.shard(world_size, rank, false)?;
            } else {
                if rank == 0 && !STEP_FALLBACK_LOGGED.swap(true, Ordering::Relaxed) {
                    info!(
                        num_shards,
                        world_size,
                        "Assigning 1 out of {world_size} examples of the dataset to each node. \
                         Use a number of shards that is a factor of the world size to split \
                         shards across nodes instead."
                    );
                }
                ex_iterable = Box::new(StepExamplesIterable::new(ex_iterable, world_size, rank));
            }
        }
        if self.formatting.is_some()
            || (self.features.is_some() && ex_iterable.features() != self.features)
        {
            ex_iterable = Box::new(FormattedExamplesIterable::new(
                ex_iterable,
                self.features.clone(),
                self.formatting,
            ));
        }
        Ok(ex_iterable)
    }

    /// Rewinds `ex_iterable`, applies the stored snapshot and keeps it as
    /// the live chain.
    fn start(&mut self, mut ex_iterable: BoxedIterable) -> Result<&mut BoxedIterable> {
        ex_iterable.init_state();
        if let Some(state) = self.starting_state.as_ref().filter(|s| s.epoch == self.epoch) {
            ex_iterable.load_state(&state.examples_iterable)?;
        }
        Ok(self.prepared.insert(ex_iterable))
    }

    fn output(&self, chain: &dyn ExamplesIterable, batch: Option<(usize, bool)>) -> Output {
        let table_path = self
            .formatting
            .filter(|f| chain.has_table_path() || f.is_table());
        match (table_path, batch) {
            (Some(formatting), _) => Output::Tables {
                to_rows: !formatting.is_table(),
                batched: batch.is_some(),
            },
            (None, None) => Output::Rows,
            (None, Some((batch_size, drop_last_batch))) => Output::RowBatches {
                batch_size,
                drop_last_batch,
            },
        }
    }

    /// Iterates over records.
    ///
    /// # Errors
    ///
    /// Fails if the chain cannot be built or the stored snapshot does not
    /// fit it.
    pub fn iter(&mut self) -> Result<DatasetIter<'_>> {
        let chain = self.build_chain(Some(1), false)?;
        let output = self.output(chain.as_ref(), None);
        let epoch = self.epoch;
        let chain = self.start(chain)?;
        Ok(DatasetIter::new(chain, epoch, output, false))
    }

    /// Iterates over batches of `batch_size` records: column lists, or
    /// tables with the arrow format.
    ///
    /// # Errors
    ///
    /// Returns a config error for a zero batch size.
    pub fn iter_batches(&mut self, batch_size: usize, drop_last_batch: bool) -> Result<DatasetIter<'_>> {
        if batch_size == 0 {
            return Err(StreamError::config("batch_size must be positive"));
        }
        let chain = self.build_chain(Some(batch_size), drop_last_batch)?;
        let output = self.output(chain.as_ref(), Some((batch_size, drop_last_batch)));
        let epoch = self.epoch;
        let chain = self.start(chain)?;
        Ok(DatasetIter::new(chain, epoch, output, false))
    }

    /// Iterates over the records of one data-loading worker.
    ///
    /// Shards are dealt to workers round-robin. A worker that gets no shard
    /// yields nothing.
    ///
    /// # Errors
    ///
    /// Returns a config error if `worker_id` is out of range.
    pub fn iter_worker(&mut self, num_workers: usize, worker_id: usize) -> Result<DatasetIter<'_>> {
        if num_workers == 0 || worker_id >= num_workers {
            return Err(StreamError::config(format!(
                "invalid worker {worker_id} out of {num_workers} workers"
            )));
        }
        let chain = self.build_chain(Some(1), false)?;
        let num_shards = chain.num_shards();
        let is_main = worker_id == 0 && self.distributed.map_or(true, |d| d.rank == 0);
        if is_main && num_shards < num_workers {
            warn!(
                num_workers,
                num_shards,
                "Too many data loading workers: stopping {} of them. Split the dataset into more \
                 shards to parallelize further.",
                num_workers - num_shards
            );
        }
        let node = self.distributed.map_or(0, |d| d.rank);
        let shard_indices = chain.split_shard_indices_by_worker(num_workers, worker_id, false);
        let empty = shard_indices.is_empty();
        if empty {
            debug!(node, worker_id, num_shards, "Stopping worker: fewer shards than workers");
        } else {
            debug!(
                node,
                worker_id,
                "Starting to iterate over {}/{} shards",
                shard_indices.len(),
                num_shards
            );
        }
        let chain = chain.shard(num_workers, worker_id, false)?;
        let output = self.output(chain.as_ref(), None);
        let epoch = self.epoch;
        let chain = self.start(chain)?;
        Ok(DatasetIter::new(chain, epoch, output, empty))
    }

    /// Applies the `[pipeline]` and `[distributed]` sections of a config.
    ///
    /// # Errors
    ///
    /// Fails for an unknown format or an invalid node split.
    pub fn configure(&self, config: &StreamConfig) -> Result<Self> {
        let pipeline = &config.pipeline;
        let format: FormatType = pipeline.format.parse()?;
        let mut ds = self.with_format(Some(format));
        if pipeline.shuffle {
            ds = ds.shuffle(pipeline.seed, pipeline.shuffle_buffer_size)?;
        }
        let distributed = &config.distributed;
        if distributed.world_size > 1 {
            ds = split_dataset_by_node(&ds, distributed.rank, distributed.world_size)?;
        }
        Ok(ds)
    }

    /// Sets the output format. The python format yields plain rows.
    pub fn with_format(&self, format_type: Option<FormatType>) -> Self {
        let mut ds = self.derive(self.ex_iterable.clone());
        ds.formatting = format_type.map(FormattingConfig::new);
        ds
    }

    /// Feature set handed to a map's input, if the records need a cast.
    fn map_input_features(&self) -> Option<Features> {
        let typed = self.ex_iterable.is_typed()
            && (self.features.is_none() || self.features == self.ex_iterable.features());
        if typed {
            None
        } else {
            self.features.clone()
        }
    }

    /// The operator a map or filter reads from, formatted for the function.
    ///
    /// Table functions always read batches of `batch_size` rows.
    fn map_input(
        &self,
        batch_size: Option<usize>,
        drop_last_batch: bool,
        table_function: bool,
    ) -> BoxedIterable {
        let input_features = self.map_input_features();
        let ex_iterable = self.ex_iterable.clone();
        match self.formatting {
            Some(formatting) if formatting.is_table() => {
                let formatted =
                    FormattedExamplesIterable::new(ex_iterable, input_features, Some(formatting));
                Box::new(RebatchedArrowExamplesIterable::new(
                    Box::new(formatted),
                    batch_size,
                    drop_last_batch,
                ))
            }
            _ => {
                let mut ex_iterable = ex_iterable;
                if table_function || (self.formatting.is_some() && ex_iterable.has_table_path()) {
                    ex_iterable = Box::new(RebatchedArrowExamplesIterable::new(
                        ex_iterable,
                        batch_size,
                        drop_last_batch,
                    ));
                }
                if self.formatting.is_some() || input_features.is_some() {
                    ex_iterable = Box::new(FormattedExamplesIterable::new(
                        ex_iterable,
                        input_features,
                        self.formatting,
                    ));
                }
                ex_iterable
            }
        }
    }

    /// Applies `function` to every record, or every batch when
    /// `options.batched` is set.
    ///
    /// The new dataset's features are `options.features`.
    pub fn map(&self, function: MapFunction, options: MapOptions) -> Self {
        let batch_size = if options.batched { options.batch_size } else { Some(1) };
        let input = self.map_input(batch_size, options.drop_last_batch, function.is_table());
        let features = options.features.clone();
        let mut ds = self.derive(Box::new(MappedExamplesIterable::new(input, function, options)));
        ds.features = features;
        ds
    }

    /// Keeps the records for which `predicate` holds.
    pub fn filter(&self, predicate: FilterFunction, options: MapOptions) -> Self {
        let batch_size = if options.batched { options.batch_size } else { Some(1) };
        let input = self.map_input(batch_size, false, predicate.is_table());
        self.derive(Box::new(MappedExamplesIterable::filter(input, predicate, options)))
    }

    /// Shuffles with a buffer of `buffer_size` records and permutes the
    /// shard order at each iteration.
    ///
    /// # Errors
    ///
    /// Returns a config error for an unseeded shuffle of a dataset split
    /// across nodes.
    pub fn shuffle(&self, seed: Option<u64>, buffer_size: usize) -> Result<Self> {
        let generator = seed.map_or_else(Generator::from_entropy, Generator::new);
        let mut ds = self.derive(Box::new(BufferShuffledExamplesIterable::new(
            self.ex_iterable.clone(),
            buffer_size,
            generator.clone(),
        )));
        ds.shuffling = Some(ShufflingConfig { generator, seed });
        ds.check_distributed_shuffling()
    }

    /// Skips the first `n` records.
    ///
    /// Without a configured shuffle the shard order is frozen. Sharding
    /// splits `n` across the parts unless the dataset is split by node.
    pub fn skip(&self, n: usize) -> Self {
        self.derive(Box::new(SkipExamplesIterable::new(
            self.ex_iterable.clone(),
            n,
            self.shuffling.is_none(),
            self.distributed.is_none(),
        )))
    }

    /// Keeps the first `n` records, with the same shuffling and sharding
    /// rules as [`IterableDataset::skip`].
    pub fn take(&self, n: usize) -> Self {
        self.derive(Box::new(TakeExamplesIterable::new(
            self.ex_iterable.clone(),
            n,
            self.shuffling.is_none(),
            self.distributed.is_none(),
        )))
    }

    /// Repeats the dataset `num_times` times, or forever.
    pub fn repeat(&self, num_times: Option<usize>) -> Self {
        self.derive(Box::new(RepeatExamplesIterable::new(
            self.ex_iterable.clone(),
            num_times,
        )))
    }

    /// The `index`-th of `num_shards` parts of the dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range or a source cannot be
    /// partitioned.
    pub fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<Self> {
        if index >= num_shards {
            return Err(StreamError::invalid_shard(index, num_shards));
        }
        Ok(self.derive(self.ex_iterable.shard(num_shards, index, contiguous)?))
    }

    /// Adds a column; record `idx` gets `column[idx]`.
    pub fn add_column(&self, name: &str, column: Vec<Value>) -> Self {
        let name = name.to_string();
        let column = Arc::new(column);
        let function = MapFunction::sync(move |row: Row, indices: Option<Indices>| {
            if row.contains_key(&name) {
                return Err(StreamError::config(format!(
                    "Error when adding {name}: column {name} is already in the dataset."
                )));
            }
            let Some(Indices::One(idx)) = indices else {
                return Err(StreamError::transform("add_column expects one index per record"));
            };
            let value = column.get(idx).cloned().ok_or_else(|| {
                StreamError::transform(format!(
                    "column {name} has {} values, record {idx} is out of range",
                    column.len()
                ))
            })?;
            let mut out = Row::new();
            out.insert(name.clone(), value);
            Ok(out)
        });
        self.map(
            function,
            MapOptions {
                with_indices: true,
                ..MapOptions::default()
            },
        )
    }

    pub fn rename_column(&self, original_column_name: &str, new_column_name: &str) -> Result<Self> {
        self.rename_columns([(original_column_name, new_column_name)])
    }

    /// Renames columns, keeping their features.
    ///
    /// # Errors
    ///
    /// Returns a config error when the features are known and a source
    /// column is missing or a target already exists. Unknown features defer
    /// the same check to iteration.
    pub fn rename_columns<S: Into<String>>(
        &self,
        column_mapping: impl IntoIterator<Item = (S, S)>,
    ) -> Result<Self> {
        let mapping: Vec<(String, String)> = column_mapping
            .into_iter()
            .map(|(from, to)| (from.into(), to.into()))
            .collect();
        let columns: Option<HashSet<String>> = self
            .column_names()
            .map(|names| names.into_iter().collect());
        if let Some(columns) = &columns {
            check_rename(&mapping, columns)?;
        }

        let row_mapping = mapping.clone();
        let function = MapFunction::sync(move |row: Row, _| {
            let present: HashSet<String> = row.keys().cloned().collect();
            check_rename(&row_mapping, &present)?;
            Ok(row_mapping
                .iter()
                .map(|(from, to)| (to.clone(), row.get(from).cloned().unwrap_or(Value::Null)))
                .collect())
        });
        let mut ds = self.map(
            function,
            MapOptions {
                remove_columns: Some(mapping.iter().map(|(from, _)| from.clone()).collect()),
                ..MapOptions::default()
            },
        );
        ds.features = self.features.clone().map(|mut features| {
            for (from, to) in &mapping {
                features.rename(from, to);
            }
            features
        });
        Ok(ds)
    }

    /// Drops columns.
    ///
    /// # Errors
    ///
    /// Returns a config error for a column missing from known features.
    pub fn remove_columns<S: AsRef<str>>(&self, column_names: &[S]) -> Result<Self> {
        let column_names: Vec<String> = column_names.iter().map(|c| c.as_ref().to_string()).collect();
        self.check_columns_exist(&column_names)?;
        let mut ds = self.map(
            MapFunction::sync(|_, _| Ok(Row::new())),
            MapOptions {
                remove_columns: Some(column_names.clone()),
                ..MapOptions::default()
            },
        );
        ds.features = self.features.clone().map(|mut features| {
            for column in &column_names {
                features.remove(column);
            }
            features
        });
        Ok(ds)
    }

    /// Keeps only the given columns, in the given order.
    ///
    /// # Errors
    ///
    /// Returns a config error for a column missing from known features.
    pub fn select_columns<S: AsRef<str>>(&self, column_names: &[S]) -> Result<Self> {
        let column_names: Vec<String> = column_names.iter().map(|c| c.as_ref().to_string()).collect();
        self.check_columns_exist(&column_names)?;
        let mut ds = self.derive(Box::new(SelectColumnsIterable::new(
            self.ex_iterable.clone(),
            column_names.clone(),
        )));
        ds.features = self.features.as_ref().map(|f| f.select(&column_names));
        Ok(ds)
    }

    fn check_columns_exist(&self, column_names: &[String]) -> Result<()> {
        let Some(features) = &self.features else {
            return Ok(());
        };
        let missing: Vec<&String> = column_names.iter().filter(|c| !features.contains(c)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StreamError::config(format!(
                "Column name {missing:?} not in the dataset. Columns in the dataset: {:?}.",
                features.column_names()
            )))
        }
    }

    /// Declares the type of one column. Records are cast when iterated.
    ///
    /// # Errors
    ///
    /// Returns a config error if the features are unknown.
    pub fn cast_column(&self, column: &str, dtype: DataType) -> Result<Self> {
        let Some(mut features) = self.features.clone() else {
            return Err(StreamError::config(format!(
                "cannot cast column {column}: the features of the dataset are unknown"
            )));
        };
        features.insert(column, dtype);
        Ok(self.cast(features))
    }

    /// Declares the features of the dataset. Records are projected onto them
    /// when iterated.
    pub fn cast(&self, features: Features) -> Self {
        let mut ds = self.derive(self.ex_iterable.clone());
        ds.features = Some(features);
        ds
    }

    /// Groups records into batches: each output record holds one list per
    /// column.
    pub fn batch(&self, batch_size: usize, drop_last_batch: bool) -> Self {
        let features = self.features.as_ref().map(|features| {
            Features::new(features.iter().map(|(name, dtype)| {
                (
                    name.clone(),
                    DataType::List(Arc::new(Field::new("item", dtype.clone(), true))),
                )
            }))
        });
        let function = MapFunction::sync(|batch: Row, _| {
            Ok(batch
                .into_iter()
                .map(|(column, values)| (column, Value::Array(vec![values])))
                .collect())
        });
        self.map(
            function,
            MapOptions {
                batched: true,
                batch_size: Some(batch_size),
                drop_last_batch,
                features,
                ..MapOptions::default()
            },
        )
    }

    /// First rows of the dataset, unformatted.
    fn head(&self, n: usize) -> Result<Vec<Row>> {
        let mut ds = self.with_format(None);
        ds.epoch = self.epoch;
        let mut rows = Vec::with_capacity(n);
        for record in ds.iter()?.take(n) {
            if let Record::Row(row) = record? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Returns a copy with known features, inferring them from the first
    /// records if needed.
    ///
    /// # Errors
    ///
    /// Fails if the head of the dataset cannot be read or typed.
    pub fn resolve_features(&self) -> Result<Self> {
        if self.features.is_some() {
            return Ok(self.clone());
        }
        let features = if self.ex_iterable.is_typed() {
            self.ex_iterable.features().unwrap_or_default()
        } else {
            Features::infer_from_rows(&self.head(HEAD_SIZE)?)?
        };
        let mut ds = self.clone();
        ds.features = Some(features);
        Ok(ds)
    }
}

fn check_rename(mapping: &[(String, String)], columns: &HashSet<String>) -> Result<()> {
    let sources: Vec<&String> = mapping.iter().map(|(from, _)| from).collect();
    let targets: Vec<&String> = mapping.iter().map(|(_, to)| to).collect();
    let missing: Vec<&&String> = sources.iter().filter(|c| !columns.contains(c.as_str())).collect();
    if !missing.is_empty() {
        return Err(StreamError::config(format!(
            "Error when renaming {sources:?} to {targets:?}: columns {missing:?} are not in the dataset."
        )));
    }
    let present: Vec<&&String> = targets.iter().filter(|c| columns.contains(c.as_str())).collect();
    if !present.is_empty() {
        return Err(StreamError::config(format!(
            "Error when renaming {sources:?} to {targets:?}: columns {present:?} are already in the dataset."
        )));
    }
    Ok(())
}

/// Chains datasets one after the other, or zips them column-wise.
///
/// Features of every input are resolved and aligned; records missing a
/// column get nulls.
///
/// # Errors
///
/// Returns a config error for an empty input, conflicting column types or,
/// along [`Axis::Columns`], a column present in several inputs.
pub fn concatenate_datasets(datasets: &[IterableDataset], axis: Axis) -> Result<IterableDataset> {
    if datasets.is_empty() {
        return Err(StreamError::config("Unable to concatenate an empty list of datasets."));
    }
    let resolved = datasets
        .iter()
        .map(IterableDataset::resolve_features)
        .collect::<Result<Vec<_>>>()?;
    let feature_sets: Vec<Features> = resolved.iter().filter_map(|d| d.features.clone()).collect();
    if axis == Axis::Columns {
        let mut seen = HashSet::new();
        let duplicates: Vec<String> = feature_sets
            .iter()
            .flat_map(Features::column_names)
            .filter(|column| !seen.insert(column.clone()))
            .collect();
        if !duplicates.is_empty() {
            return Err(StreamError::config(format!(
                "The columns {duplicates:?} appear in several datasets"
            )));
        }
    }
    let features = Features::align(&feature_sets)?;
    let ex_iterables: Vec<BoxedIterable> = resolved.iter().map(|d| d.ex_iterable.clone()).collect();
    let ex_iterable: BoxedIterable = match axis {
        Axis::Rows => Box::new(VerticallyConcatenatedMultiSourcesExamplesIterable::new(ex_iterables)),
        Axis::Columns => Box::new(HorizontallyConcatenatedMultiSourcesExamplesIterable::new(ex_iterables)),
    };
    let mut ds = IterableDataset::new(ex_iterable);
    ds.features = Some(features);
    Ok(ds)
}

/// Alternates between datasets.
///
/// Without `probabilities` the sources are cycled in order; with them each
/// record comes from a source drawn at random from a generator seeded with
/// `seed`.
///
/// # Errors
///
/// Returns a config error for an empty input, conflicting column types or
/// invalid probabilities.
pub fn interleave_datasets(
    datasets: &[IterableDataset],
    probabilities: Option<Vec<f64>>,
    seed: Option<u64>,
    stopping_strategy: StoppingStrategy,
) -> Result<IterableDataset> {
    if datasets.is_empty() {
        return Err(StreamError::config("Unable to interleave an empty list of datasets."));
    }
    let resolved = datasets
        .iter()
        .map(IterableDataset::resolve_features)
        .collect::<Result<Vec<_>>>()?;
    let feature_sets: Vec<Features> = resolved.iter().filter_map(|d| d.features.clone()).collect();
    let features = Features::align(&feature_sets)?;
    let ex_iterables: Vec<BoxedIterable> = resolved.iter().map(|d| d.ex_iterable.clone()).collect();
    let ex_iterable: BoxedIterable = match probabilities {
        None => Box::new(CyclingMultiSourcesExamplesIterable::new(
            ex_iterables,
            stopping_strategy,
        )),
        Some(probabilities) => {
            let generator = seed.map_or_else(Generator::from_entropy, Generator::new);
            Box::new(RandomlyCyclingMultiSourcesExamplesIterable::new(
                ex_iterables,
                generator,
                Some(probabilities),
                stopping_strategy,
            )?)
        }
    };
    let mut ds = IterableDataset::new(ex_iterable);
    ds.features = Some(features);
    Ok(ds)
}

/// The part of `dataset` read by node `rank` out of `world_size`.
///
/// Shards are split across nodes when their number is a multiple of
/// `world_size`; otherwise each node keeps one record out of `world_size`.
/// Splitting an already split dataset composes the two splits.
///
/// # Errors
///
/// Returns a config error if `rank` is out of range, or if the dataset is
/// shuffled without a seed.
pub fn split_dataset_by_node(
    dataset: &IterableDataset,
    rank: usize,
    world_size: usize,
) -> Result<IterableDataset> {
    if world_size == 0 || rank >= world_size {
        return Err(StreamError::config(format!(
            "invalid rank {rank} for a world of size {world_size}"
        )));
    }
    let distributed = match dataset.distributed {
        Some(previous) => DistributedConfig {
            rank: world_size * previous.rank + rank,
            world_size: world_size * previous.world_size,
        },
        None => DistributedConfig { rank, world_size },
    };
    let mut ds = dataset.derive(dataset.ex_iterable.clone());
    ds.distributed = Some(distributed);
    ds.check_distributed_shuffling()
}

#[derive(Debug, Clone, Copy)]
enum Output {
    Rows,
    RowBatches {
        batch_size: usize,
        drop_last_batch: bool,
    },
    Tables {
        to_rows: bool,
        batched: bool,
    },
}

/// Iterator over the records of a dataset.
///
/// It borrows the dataset's live chain: once dropped,
/// [`IterableDataset::state_dict`] reports the position it reached.
pub struct DatasetIter<'a> {
    ex_iterable: &'a mut BoxedIterable,
    epoch: u64,
    output: Output,
    pending: VecDeque<Row>,
    done: bool,
}

impl<'a> DatasetIter<'a> {
    fn new(ex_iterable: &'a mut BoxedIterable, epoch: u64, output: Output, done: bool) -> Self {
        Self {
            ex_iterable,
            epoch,
            output,
            pending: VecDeque::new(),
            done,
        }
    }

    /// Snapshot right after the latest record yielded.
    pub fn state_dict(&self) -> DatasetState {
        DatasetState {
            examples_iterable: self.ex_iterable.state(),
            epoch: self.epoch,
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        match self.output {
            Output::Rows => Ok(self.ex_iterable.next_row()?.map(|(_, row)| Record::Row(row))),
            Output::RowBatches {
                batch_size,
                drop_last_batch,
            } => {
                let mut rows = Vec::with_capacity(batch_size);
                while rows.len() < batch_size {
                    match self.ex_iterable.next_row()? {
                        Some((_, row)) => rows.push(row),
                        None => break,
                    }
                }
                if rows.is_empty() || (drop_last_batch && rows.len() < batch_size) {
                    return Ok(None);
                }
                Ok(Some(Record::Row(examples_to_batch(&rows))))
            }
            Output::Tables { to_rows, batched } => loop {
                if let Some(row) = self.pending.pop_front() {
                    return Ok(Some(Record::Row(row)));
                }
                let Some((_, table)) = self.ex_iterable.next_table()? else {
                    return Ok(None);
                };
                match (to_rows, batched) {
                    (false, _) => return Ok(Some(Record::Table(table))),
                    (true, true) => {
                        return Ok(Some(Record::Row(examples_to_batch(&table_to_rows(&table)?))))
                    }
                    (true, false) => self.pending.extend(table_to_rows(&table)?),
                }
            },
        }
    }
}

impl Iterator for DatasetIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
