// rust/stream-core/src/iterable/map.rs

//! User transforms over the stream: row, batched, asynchronous and columnar
//! maps, and filtering.
//!
//! A map keeps a checkpoint of its child (`previous_state`) and counts the
//! outputs yielded since then. Resuming reloads that checkpoint, reapplies
//! the function and drops the counted outputs, so a batch that was half
//! consumed is recomputed rather than stored. The checkpoint only moves
//! forward once every output of the unit it covers has been handed out.
//!
//! Filtering is a map whose function returns a boolean mask under
//! [`MASK_COLUMN`]; rows with a falsy mask are dropped after the map.
//!
//! # Example
//!
//! ```
//! use serde_json::{json, Value};
//! use stream_core::iterable::{ExamplesIterable, MapFunction, MapOptions, MappedExamplesIterable, SourceExamplesIterable};
//!
//! let rows = (0..3).map(|i| json!({"id": i}).as_object().unwrap().clone()).collect();
//! let source = SourceExamplesIterable::from_rows(rows, 1).unwrap();
//! let double = MapFunction::sync(|mut row, _| {
//!     let id = row["id"].as_i64().unwrap_or_default();
//!     row.insert("double".into(), Value::from(id * 2));
//!     Ok(row)
//! });
//! let mut mapped = MappedExamplesIterable::new(Box::new(source), double, MapOptions::default());
//! mapped.init_state();
//! let (_, row) = mapped.next_row().unwrap().unwrap();
//! assert_eq!(row["double"], json!(0));
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use arrow::array::{AsArray, BooleanArray};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use super::scheduler::OrderedTaskPool;
use super::{BoxedIterable, ExamplesIterable};
use crate::error::{Result, StreamError};
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{
    append_column, batch_len, batch_to_examples, examples_to_batch, filter_table,
    remove_table_columns, rows_to_table, select_table_columns, table_to_rows, Key,
    Row, Table,
};
use crate::state::{mismatch, IterableState, MappedState};

/// Column carrying a filter's keep/drop decision through the map machinery.
pub const MASK_COLUMN: &str = "===MASK===";

/// Default number of rows per batch for batched maps.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default bound on in-flight asynchronous calls.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1000;

/// Positions of the inputs passed to a function called `with_indices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indices {
    One(usize),
    Many(Vec<usize>),
}

/// Result of a columnar function: a table, or a batch of lists.
#[derive(Debug, Clone)]
pub enum TableOutput {
    Table(Table),
    Batch(Row),
}

impl From<Table> for TableOutput {
    fn from(table: Table) -> Self {
        TableOutput::Table(table)
    }
}

impl From<Row> for TableOutput {
    fn from(batch: Row) -> Self {
        TableOutput::Batch(batch)
    }
}

impl TableOutput {
    fn into_table(self) -> Result<Table> {
        match self {
            TableOutput::Table(table) => Ok(table),
            TableOutput::Batch(batch) => rows_to_table(&batch_to_examples(batch)?),
        }
    }
}

pub type SyncRowFn<T> = Arc<dyn Fn(Row, Option<Indices>) -> Result<T> + Send + Sync>;
pub type AsyncRowFn<T> =
    Arc<dyn Fn(Row, Option<Indices>) -> BoxFuture<'static, Result<T>> + Send + Sync>;
pub type TableFn<T> = Arc<dyn Fn(Table, Option<Indices>) -> Result<T> + Send + Sync>;

/// A transform applied by [`MappedExamplesIterable`].
///
/// Row functions receive one row, or a batch of lists when the map is
/// batched. Table functions receive upstream tables and make the map keep a
/// columnar path.
#[derive(Clone)]
pub enum MapFunction {
    Sync(SyncRowFn<Row>),
    Async(AsyncRowFn<Row>),
    Table(TableFn<TableOutput>),
}

impl MapFunction {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Row, Option<Indices>) -> Result<Row> + Send + Sync + 'static,
    {
        MapFunction::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Row, Option<Indices>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Row>> + Send + 'static,
    {
        MapFunction::Async(Arc::new(move |row: Row, indices: Option<Indices>| {
            f(row, indices).boxed()
        }))
    }

    pub fn table<F, O>(f: F) -> Self
    where
        F: Fn(Table, Option<Indices>) -> Result<O> + Send + Sync + 'static,
        O: Into<TableOutput>,
    {
        MapFunction::Table(Arc::new(move |table: Table, indices: Option<Indices>| {
            f(table, indices).map(Into::into)
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, MapFunction::Async(_))
    }

    pub fn is_table(&self) -> bool {
        matches!(self, MapFunction::Table(_))
    }
}

/// A predicate applied by a filtering [`MappedExamplesIterable`].
///
/// Row predicates return a boolean, or a list of booleans when batched.
#[derive(Clone)]
pub enum FilterFunction {
    Sync(SyncRowFn<Value>),
    Async(AsyncRowFn<Value>),
    Table(TableFn<BooleanArray>),
}

impl FilterFunction {
    pub fn is_table(&self) -> bool {
        matches!(self, FilterFunction::Table(_))
    }

    pub fn sync<F, M>(f: F) -> Self
    where
        F: Fn(Row, Option<Indices>) -> Result<M> + Send + Sync + 'static,
        M: Into<Value>,
    {
        FilterFunction::Sync(Arc::new(move |row: Row, indices: Option<Indices>| {
            f(row, indices).map(Into::into)
        }))
    }

    pub fn asynchronous<F, Fut, M>(f: F) -> Self
    where
        F: Fn(Row, Option<Indices>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M>> + Send + 'static,
        M: Into<Value>,
    {
        FilterFunction::Async(Arc::new(move |row: Row, indices: Option<Indices>| {
            f(row, indices)
                .map(|mask: Result<M>| mask.map(Into::into))
                .boxed()
        }))
    }

    pub fn table<F>(f: F) -> Self
    where
        F: Fn(Table, Option<Indices>) -> Result<BooleanArray> + Send + Sync + 'static,
    {
        FilterFunction::Table(Arc::new(f))
    }

    /// Wraps the predicate into a map that emits the mask column.
    pub fn into_map_function(self) -> MapFunction {
        fn mask_row(mask: Value) -> Row {
            let mut out = Row::new();
            out.insert(MASK_COLUMN.to_string(), mask);
            out
        }
        match self {
            FilterFunction::Sync(f) => {
                MapFunction::Sync(Arc::new(move |row: Row, indices: Option<Indices>| {
                    f(row, indices).map(mask_row)
                }))
            }
            FilterFunction::Async(f) => {
                MapFunction::Async(Arc::new(move |row: Row, indices: Option<Indices>| {
                    f(row, indices)
                        .map(|mask: Result<Value>| mask.map(mask_row))
                        .boxed()
                }))
            }
            FilterFunction::Table(f) => {
                MapFunction::Table(Arc::new(move |table: Table, indices: Option<Indices>| {
                    let mask = f(table.clone(), indices)?;
                    if mask.len() != table.num_rows() {
                        return Err(StreamError::schema(format!(
                            "filter mask has {} values for a table of {} rows",
                            mask.len(),
                            table.num_rows()
                        )));
                    }
                    let masked = append_column(&table, MASK_COLUMN, Arc::new(mask))?;
                    Ok(TableOutput::Table(masked))
                }))
            }
        }
    }
}

/// Python-style truthiness of a mask value.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone)]
pub struct MapOptions {
    /// Pass input positions to the function.
    pub with_indices: bool,
    /// Pass only these columns to the function.
    pub input_columns: Option<Vec<String>>,
    pub batched: bool,
    /// Rows per batch; `None` or zero passes the whole stream as one batch.
    pub batch_size: Option<usize>,
    pub drop_last_batch: bool,
    /// Input columns dropped from the output.
    pub remove_columns: Option<Vec<String>>,
    /// Schema of the outputs, if known.
    pub features: Option<Features>,
    pub max_concurrency: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            with_indices: false,
            input_columns: None,
            batched: false,
            batch_size: Some(DEFAULT_BATCH_SIZE),
            drop_last_batch: false,
            remove_columns: None,
            features: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl MapOptions {
    fn batch_limit(&self) -> Option<usize> {
        self.batch_size.filter(|&n| n > 0)
    }
}

#[derive(Debug, Clone, Default)]
struct MapState {
    previous_state: Option<IterableState>,
    num_examples_since_previous_state: usize,
    previous_state_example_idx: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassMode {
    Rows,
    Tables,
}

/// Checkpoint to install once the outputs of one input unit are handed out.
struct Checkpoint {
    previous_state: IterableState,
    example_idx: usize,
}

struct PendingTask {
    key: Key,
    inputs: Row,
    checkpoint: Option<Checkpoint>,
}

/// One row, or one batch of rows, read from the child.
struct InputUnit {
    key: Key,
    inputs: Row,
    indices: Indices,
}

struct MapPass {
    mode: PassMode,
    current_idx: usize,
    num_to_skip: usize,
    outputs: VecDeque<(Key, Row)>,
    on_drained: Option<Checkpoint>,
    input_exhausted: bool,
    pool: Option<OrderedTaskPool<Row>>,
    tasks: VecDeque<PendingTask>,
    checkpoint_armed: bool,
}

impl MapPass {
    fn cancel(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.cancel();
        }
        self.tasks.clear();
    }
}

pub struct MappedExamplesIterable {
    ex_iterable: BoxedIterable,
    function: MapFunction,
    options: MapOptions,
    filter: bool,
    state: MapState,
    pass: Option<MapPass>,
}

impl MappedExamplesIterable {
    pub fn new(ex_iterable: BoxedIterable, function: MapFunction, options: MapOptions) -> Self {
        Self {
            ex_iterable,
            function,
            options,
            filter: false,
            state: MapState::default(),
            pass: None,
        }
    }

    /// Keeps the rows for which `predicate` is truthy. Input columns are never
    /// removed by a filter.
    pub fn filter(ex_iterable: BoxedIterable, predicate: FilterFunction, options: MapOptions) -> Self {
        let options = MapOptions {
            remove_columns: None,
            drop_last_batch: false,
            features: None,
            ..options
        };
        Self {
            filter: true,
            ..Self::new(ex_iterable, predicate.into_map_function(), options)
        }
    }

    pub fn options(&self) -> &MapOptions {
        &self.options
    }

    fn wrap(&self, ex_iterable: BoxedIterable) -> Self {
        Self {
            ex_iterable,
            function: self.function.clone(),
            options: self.options.clone(),
            filter: self.filter,
            state: MapState::default(),
            pass: None,
        }
    }

    fn open(&mut self, mode: PassMode) -> Result<MapPass> {
        let mut num_to_skip = 0;
        if let Some(previous) = &self.state.previous_state {
            self.ex_iterable.load_state(previous)?;
            num_to_skip = self.state.num_examples_since_previous_state;
        }
        let current_idx = self.state.previous_state_example_idx;
        let reset = match (&self.function, mode) {
            (MapFunction::Table(_), PassMode::Tables) => {
                // Whole tables are yielded, so the child's live snapshot is
                // authoritative and the skipped rows are sliced off below.
                self.state.previous_state = None;
                self.state.num_examples_since_previous_state = 0;
                false
            }
            (MapFunction::Table(_), PassMode::Rows) => true,
            (MapFunction::Async(_), _) => true,
            (MapFunction::Sync(_), _) => self.options.batched,
        };
        if reset {
            self.state.previous_state = Some(self.ex_iterable.state());
            self.state.num_examples_since_previous_state = 0;
        }
        let pool = match self.function {
            MapFunction::Async(_) => Some(OrderedTaskPool::new(self.options.max_concurrency)?),
            _ => None,
        };
        Ok(MapPass {
            mode,
            current_idx,
            num_to_skip,
            outputs: VecDeque::new(),
            on_drained: None,
            input_exhausted: false,
            pool,
            tasks: VecDeque::new(),
            checkpoint_armed: false,
        })
    }

    fn with_pass<T>(
        &mut self,
        mode: PassMode,
        f: impl FnOnce(&mut Self, &mut MapPass) -> Result<T>,
    ) -> Result<T> {
        let mut pass = match self.pass.take() {
            Some(pass) if pass.mode == mode => pass,
            Some(mut other) => {
                other.cancel();
                self.open(mode)?
            }
            None => self.open(mode)?,
        };
        match f(self, &mut pass) {
            Ok(value) => {
                self.pass = Some(pass);
                Ok(value)
            }
            Err(e) => {
                if !pass.tasks.is_empty() {
                    debug!(error = %e, "Async map failed, canceling pending tasks");
                }
                pass.cancel();
                Err(e)
            }
        }
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.state.previous_state = Some(checkpoint.previous_state);
        self.state.num_examples_since_previous_state = 0;
        self.state.previous_state_example_idx = checkpoint.example_idx;
    }

    fn next_output(&mut self, pass: &mut MapPass) -> Result<Option<(Key, Row)>> {
        loop {
            if let Some(output) = pass.outputs.pop_front() {
                if self.state.previous_state.is_some() {
                    self.state.num_examples_since_previous_state += 1;
                }
                if pass.num_to_skip > 0 {
                    pass.num_to_skip -= 1;
                    continue;
                }
                return Ok(Some(output));
            }
            if let Some(checkpoint) = pass.on_drained.take() {
                self.apply_checkpoint(checkpoint);
            }
            let function = self.function.clone();
            let produced = match &function {
                MapFunction::Sync(f) => self.fill_sync(pass, f)?,
                MapFunction::Async(f) => self.fill_async(pass, f)?,
                MapFunction::Table(f) => self.fill_table_rows(pass, f)?,
            };
            if !produced {
                return Ok(None);
            }
        }
    }

    fn pull_input(&mut self, pass: &mut MapPass) -> Result<Option<InputUnit>> {
        if pass.input_exhausted {
            return Ok(None);
        }
        if !self.options.batched {
            let Some((key, row)) = self.ex_iterable.next_row()? else {
                pass.input_exhausted = true;
                return Ok(None);
            };
            let idx = pass.current_idx;
            pass.current_idx += 1;
            return Ok(Some(InputUnit {
                key,
                inputs: row,
                indices: Indices::One(idx),
            }));
        }
        let limit = self.options.batch_limit();
        let mut keys = Vec::new();
        let mut rows = Vec::new();
        while limit.map_or(true, |n| rows.len() < n) {
            match self.ex_iterable.next_row()? {
                Some((key, row)) => {
                    keys.push(key);
                    rows.push(row);
                }
                None => {
                    pass.input_exhausted = true;
                    break;
                }
            }
        }
        let short = limit.is_some_and(|n| rows.len() < n);
        if rows.is_empty() || (short && self.options.drop_last_batch) {
            pass.input_exhausted = true;
            return Ok(None);
        }
        let start = pass.current_idx;
        pass.current_idx += rows.len();
        Ok(Some(InputUnit {
            key: Key::join(&keys),
            inputs: examples_to_batch(&rows),
            indices: Indices::Many((start..pass.current_idx).collect()),
        }))
    }

    fn function_input(&self, inputs: &Row) -> Result<Row> {
        let Some(columns) = &self.options.input_columns else {
            return Ok(inputs.clone());
        };
        let mut selected = Row::new();
        for column in columns {
            let value = inputs.get(column).ok_or_else(|| {
                StreamError::schema(format!(
                    "input column '{column}' not found in {:?}",
                    inputs.keys().collect::<Vec<_>>()
                ))
            })?;
            selected.insert(column.clone(), value.clone());
        }
        Ok(selected)
    }

    fn indices(&self, indices: Indices) -> Option<Indices> {
        self.options.with_indices.then_some(indices)
    }

    /// Merges the function's output over its inputs and fans batches out.
    fn finish_unit(&self, key: Key, mut inputs: Row, mut processed: Row) -> Result<Vec<(Key, Row)>> {
        if self.options.batched {
            batch_len(&processed)?;
        }
        if let Some(remove) = &self.options.remove_columns {
            for column in remove {
                let original = inputs.shift_remove(column);
                // An output column equal to the removed input is the input
                // passed through, so it goes too.
                if self.options.input_columns.is_none()
                    && original.is_some()
                    && processed.get(column) == original.as_ref()
                {
                    processed.shift_remove(column);
                }
            }
        }
        for (column, value) in processed {
            inputs.insert(column, value);
        }
        if self.options.batched {
            Ok(batch_to_examples(inputs)?
                .into_iter()
                .map(|row| (key.clone(), row))
                .collect())
        } else {
            Ok(vec![(key, inputs)])
        }
    }

    fn fill_sync(&mut self, pass: &mut MapPass, f: &SyncRowFn<Row>) -> Result<bool> {
        let Some(unit) = self.pull_input(pass)? else {
            return Ok(false);
        };
        if !self.options.batched {
            self.state.previous_state_example_idx = pass.current_idx;
        }
        let processed = f(self.function_input(&unit.inputs)?, self.indices(unit.indices))?;
        let outputs = self.finish_unit(unit.key, unit.inputs, processed)?;
        pass.outputs.extend(outputs);
        if self.options.batched {
            pass.on_drained = Some(Checkpoint {
                previous_state: self.ex_iterable.state(),
                example_idx: pass.current_idx,
            });
        }
        Ok(true)
    }

    fn fill_async(&mut self, pass: &mut MapPass, f: &AsyncRowFn<Row>) -> Result<bool> {
        loop {
            let ready = match pass.pool.as_mut() {
                Some(pool) if !pass.input_exhausted => pool.pop_ready()?,
                Some(pool) => pool.wait_for_head()?,
                None => return Err(StreamError::task("async map pass has no task pool")),
            };
            if let Some(processed) = ready {
                let Some(task) = pass.tasks.pop_front() else {
                    return Err(StreamError::task("async map result without a pending task"));
                };
                let outputs = self.finish_unit(task.key, task.inputs, processed)?;
                pass.outputs.extend(outputs);
                if let Some(checkpoint) = task.checkpoint {
                    pass.on_drained = Some(checkpoint);
                    pass.checkpoint_armed = false;
                }
                return Ok(true);
            }
            if pass.input_exhausted {
                return Ok(false);
            }
            let Some(unit) = self.pull_input(pass)? else {
                continue;
            };
            let future = f(self.function_input(&unit.inputs)?, self.indices(unit.indices));
            let checkpoint = if pass.checkpoint_armed {
                None
            } else {
                pass.checkpoint_armed = true;
                Some(Checkpoint {
                    previous_state: self.ex_iterable.state(),
                    example_idx: pass.current_idx,
                })
            };
            pass.tasks.push_back(PendingTask {
                key: unit.key,
                inputs: unit.inputs,
                checkpoint,
            });
            if let Some(pool) = pass.pool.as_mut() {
                pool.submit(future)?;
            }
        }
    }

    /// Applies a columnar function to the next upstream table. Returns the
    /// input key, the number of input rows and the output table.
    fn map_next_table(&mut self, f: &TableFn<TableOutput>) -> Result<Option<(Key, usize, Table)>> {
        let Some((key, table)) = self.ex_iterable.next_table()? else {
            return Ok(None);
        };
        let len = table.num_rows();
        if self.options.batched && self.options.drop_last_batch {
            if let Some(n) = self.options.batch_limit() {
                if len < n {
                    return Ok(None);
                }
            }
        }
        let start = self.state.previous_state_example_idx;
        let input = match &self.options.input_columns {
            Some(columns) => select_table_columns(&table, columns)?,
            None => table,
        };
        let indices = if self.options.batched {
            Indices::Many((start..start + len).collect())
        } else {
            Indices::One(start)
        };
        let mut output = f(input, self.indices(indices))?.into_table()?;
        if let Some(remove) = &self.options.remove_columns {
            output = remove_table_columns(&output, remove)?;
        }
        Ok(Some((key, len, output)))
    }

    fn fill_table_rows(&mut self, pass: &mut MapPass, f: &TableFn<TableOutput>) -> Result<bool> {
        if pass.input_exhausted {
            return Ok(false);
        }
        let Some((key, len, output)) = self.map_next_table(f)? else {
            pass.input_exhausted = true;
            return Ok(false);
        };
        pass.current_idx += len;
        for (i, row) in table_to_rows(&output)?.into_iter().enumerate() {
            pass.outputs.push_back((key.with_suffix(format!("_{i}")), row));
        }
        pass.on_drained = Some(Checkpoint {
            previous_state: self.ex_iterable.state(),
            example_idx: self.state.previous_state_example_idx + len,
        });
        Ok(true)
    }

    fn next_mapped_table(&mut self, pass: &mut MapPass) -> Result<Option<(Key, Table)>> {
        let MapFunction::Table(f) = self.function.clone() else {
            return Err(StreamError::task("table pass opened on a row function"));
        };
        loop {
            if pass.input_exhausted {
                return Ok(None);
            }
            let Some((key, len, mut output)) = self.map_next_table(&f)? else {
                pass.input_exhausted = true;
                return Ok(None);
            };
            self.state.previous_state_example_idx += len;
            if pass.num_to_skip > 0 {
                let skipped = pass.num_to_skip.min(output.num_rows());
                pass.num_to_skip -= skipped;
                output = output.slice(skipped, output.num_rows() - skipped);
            }
            if self.filter {
                output = apply_table_mask(&output)?;
            }
            if output.num_rows() > 0 {
                return Ok(Some((key, output)));
            }
        }
    }
}

/// Drops the mask column and keeps the rows it marks.
fn apply_table_mask(table: &Table) -> Result<Table> {
    let schema = table.schema();
    let (idx, _) = schema
        .column_with_name(MASK_COLUMN)
        .ok_or_else(|| StreamError::schema("filter output is missing its mask column"))?;
    let mask = table
        .column(idx)
        .as_boolean_opt()
        .ok_or_else(|| StreamError::schema("filter mask must be a boolean column"))?
        .clone();
    let unmasked = remove_table_columns(table, &[MASK_COLUMN.to_string()])?;
    filter_table(&unmasked, &mask)
}

impl ExamplesIterable for MappedExamplesIterable {
    fn name(&self) -> &'static str {
        if self.filter {
            "FilteredExamplesIterable"
        } else {
            "MappedExamplesIterable"
        }
    }

    fn num_shards(&self) -> usize {
        self.ex_iterable.num_shards()
    }

    fn has_table_path(&self) -> bool {
        self.function.is_table()
    }

    fn is_typed(&self) -> bool {
        if self.filter {
            self.ex_iterable.is_typed()
        } else {
            self.options.features.is_some()
        }
    }

    fn features(&self) -> Option<Features> {
        if self.filter {
            self.ex_iterable.features()
        } else {
            self.options.features.clone()
        }
    }

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(self.wrap(self.ex_iterable.shuffle_shards(generator)))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(
            self.wrap(self.ex_iterable.shard(num_shards, index, contiguous)?),
        ))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        let mut copy = self.wrap(self.ex_iterable.boxed_clone());
        copy.state = self.state.clone();
        Box::new(copy)
    }

    fn init_state(&mut self) -> IterableState {
        if let Some(mut pass) = self.pass.take() {
            pass.cancel();
        }
        self.ex_iterable.init_state();
        self.state = MapState::default();
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::Mapped(s) = state else {
            return Err(mismatch(self.name(), "mapped", state));
        };
        if let Some(mut pass) = self.pass.take() {
            pass.cancel();
        }
        self.ex_iterable.load_state(&s.examples_iterable)?;
        self.state = MapState {
            previous_state: s.previous_state.as_deref().cloned(),
            num_examples_since_previous_state: s.num_examples_since_previous_state,
            previous_state_example_idx: s.previous_state_example_idx,
        };
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::Mapped(MappedState {
            examples_iterable: Box::new(self.ex_iterable.state()),
            previous_state: self.state.previous_state.clone().map(Box::new),
            num_examples_since_previous_state: self.state.num_examples_since_previous_state,
            previous_state_example_idx: self.state.previous_state_example_idx,
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        let filter = self.filter;
        self.with_pass(PassMode::Rows, |this, pass| loop {
            let Some((key, mut row)) = this.next_output(pass)? else {
                return Ok(None);
            };
            if !filter {
                return Ok(Some((key, row)));
            }
            let keep = row.shift_remove(MASK_COLUMN).is_some_and(|mask| is_truthy(&mask));
            if keep {
                return Ok(Some((key, row)));
            }
        })
    }

    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        if !self.function.is_table() {
            return match self.next_row()? {
                Some((key, row)) => Ok(Some((key, rows_to_table(std::slice::from_ref(&row))?))),
                None => Ok(None),
            };
        }
        self.with_pass(PassMode::Tables, |this, pass| this.next_mapped_table(pass))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use serde_json::json;

    use super::*;
    use crate::iterable::test_utils::*;

    fn add_double() -> MapFunction {
        MapFunction::sync(|mut row, _| {
            let id = row["id"].as_i64().unwrap();
            row.insert("double".into(), json!(id * 2));
            Ok(row)
        })
    }

    fn mapped(n: i64, function: MapFunction, options: MapOptions) -> MappedExamplesIterable {
        MappedExamplesIterable::new(id_source(n, 2), function, options)
    }

    #[test]
    fn test_row_map_merges_outputs() {
        let mut it = mapped(4, add_double(), MapOptions::default());
        it.init_state();
        let rows = drain_rows(&mut it);
        assert_eq!(ids(&rows), vec![0, 1, 2, 3]);
        assert_eq!(rows[3]["double"], json!(6));
        assert_eq!(
            rows[0].keys().cloned().collect::<Vec<_>>(),
            vec!["id".to_string(), "double".to_string()]
        );
    }

    #[test]
    fn test_batched_map_sizes_and_drop_last() {
        let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&sizes);
        let record = MapFunction::sync(move |batch, _| {
            seen.lock().unwrap().push(batch_len(&batch)?);
            Ok(batch)
        });
        let options = MapOptions {
            batched: true,
            batch_size: Some(4),
            ..MapOptions::default()
        };
        let mut it = mapped(10, record.clone(), options.clone());
        it.init_state();
        assert_eq!(drain_ids(&mut it), (0..10).collect::<Vec<_>>());
        assert_eq!(*sizes.lock().unwrap(), vec![4, 4, 2]);

        let mut it = mapped(
            10,
            record,
            MapOptions {
                drop_last_batch: true,
                ..options
            },
        );
        it.init_state();
        assert_eq!(drain_ids(&mut it), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_batched_map_can_change_row_count() {
        let duplicate = MapFunction::sync(|batch, _| {
            let ids = batch["id"].as_array().cloned().unwrap_or_default();
            let doubled: Vec<Value> = ids.iter().flat_map(|v| [v.clone(), v.clone()]).collect();
            let mut out = Row::new();
            out.insert("id".into(), Value::Array(doubled));
            Ok(out)
        });
        let options = MapOptions {
            batched: true,
            batch_size: Some(3),
            remove_columns: Some(vec!["id".into()]),
            ..MapOptions::default()
        };
        let mut it = mapped(4, duplicate, options);
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_resumes_everywhere(&it);
    }

    #[test]
    fn test_batched_output_length_mismatch_fails_whole_batch() {
        let uneven = MapFunction::sync(|batch: Row, _| {
            if batch["id"][0] == json!(0) {
                return Ok(batch);
            }
            let mut out = Row::new();
            out.insert("a".into(), json!([1, 2]));
            out.insert("b".into(), json!([1]));
            Ok(out)
        });
        let options = MapOptions {
            batched: true,
            batch_size: Some(2),
            ..MapOptions::default()
        };
        let mut it = mapped(4, uneven, options);
        it.init_state();
        assert_eq!(it.next_row().unwrap().unwrap().1["id"], json!(0));
        assert_eq!(it.next_row().unwrap().unwrap().1["id"], json!(1));
        assert!(matches!(it.next_row(), Err(StreamError::Schema { .. })));
    }

    #[test]
    fn test_remove_columns_and_input_columns() {
        let f = MapFunction::sync(|row, _| {
            assert_eq!(row.len(), 1);
            let mut out = Row::new();
            out.insert("label".into(), json!(row["id"].as_i64().unwrap() % 2));
            Ok(out)
        });
        let options = MapOptions {
            input_columns: Some(vec!["id".into()]),
            remove_columns: Some(vec!["id".into()]),
            ..MapOptions::default()
        };
        let mut it = mapped(3, f, options);
        it.init_state();
        let rows = drain_rows(&mut it);
        assert_eq!(rows, vec![row(json!({"label": 0})), row(json!({"label": 1})), row(json!({"label": 0}))]);

        let missing = MapOptions {
            input_columns: Some(vec!["nope".into()]),
            ..MapOptions::default()
        };
        let mut it = mapped(3, add_double(), missing);
        it.init_state();
        assert!(matches!(it.next_row(), Err(StreamError::Schema { .. })));
    }

    #[test]
    fn test_with_indices() {
        let f = MapFunction::sync(|mut row, indices| {
            let Some(Indices::One(i)) = indices else {
                return Err(StreamError::transform("missing index"));
            };
            row.insert("idx".into(), json!(i));
            Ok(row)
        });
        let options = MapOptions {
            with_indices: true,
            ..MapOptions::default()
        };
        let mut it = mapped(3, f, options);
        it.init_state();
        it.next_row().unwrap();
        let snapshot = it.state();
        let (_, row) = it.next_row().unwrap().unwrap();
        assert_eq!(row["idx"], json!(1));

        let mut resumed = it.boxed_clone();
        resumed.load_state(&snapshot).unwrap();
        let (_, row) = resumed.next_row().unwrap().unwrap();
        assert_eq!(row["idx"], json!(1));
    }

    #[test]
    fn test_batched_resume_mid_batch() {
        let options = MapOptions {
            batched: true,
            batch_size: Some(3),
            ..MapOptions::default()
        };
        assert_resumes_everywhere(&mapped(8, add_double(), options.clone()));

        let mut it = mapped(8, add_double(), options);
        it.init_state();
        for _ in 0..4 {
            it.next_row().unwrap();
        }
        let IterableState::Mapped(state) = it.state() else {
            panic!("expected a mapped snapshot");
        };
        assert!(state.previous_state.is_some());
        assert_eq!(state.num_examples_since_previous_state, 1);
        assert_eq!(state.previous_state_example_idx, 3);
    }

    #[test]
    fn test_row_map_resumes_everywhere() {
        assert_resumes_everywhere(&mapped(7, add_double(), MapOptions::default()));
    }

    #[test]
    fn test_async_map_keeps_order() {
        let f = MapFunction::asynchronous(|mut row: Row, _| async move {
            let id = row["id"].as_i64().unwrap();
            tokio::time::sleep(Duration::from_millis((10 - id as u64) * 2)).await;
            row.insert("done".into(), json!(true));
            Ok(row)
        });
        let options = MapOptions {
            max_concurrency: 4,
            ..MapOptions::default()
        };
        let mut it = mapped(10, f, options);
        it.init_state();
        let rows = drain_rows(&mut it);
        assert_eq!(ids(&rows), (0..10).collect::<Vec<_>>());
        assert!(rows.iter().all(|r| r["done"] == json!(true)));
    }

    #[test]
    fn test_async_map_resumes_everywhere() {
        let f = MapFunction::asynchronous(|mut row: Row, _| async move {
            row.insert("seen".into(), json!(1));
            Ok(row)
        });
        let options = MapOptions {
            max_concurrency: 2,
            ..MapOptions::default()
        };
        assert_resumes_everywhere(&mapped(9, f, options));
    }

    #[test]
    fn test_async_error_propagates() {
        let f = MapFunction::asynchronous(|row: Row, _| async move {
            if row["id"] == json!(3) {
                return Err(StreamError::transform("boom"));
            }
            Ok(row)
        });
        let mut it = mapped(10, f, MapOptions::default());
        it.init_state();
        let mut seen = Vec::new();
        let err = loop {
            match it.next_row() {
                Ok(Some((_, row))) => seen.push(row["id"].as_i64().unwrap()),
                Ok(None) => panic!("expected an error"),
                Err(e) => break e,
            }
        };
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(matches!(err, StreamError::Transform { .. }));
    }

    #[test]
    fn test_filter_rows_and_batches() {
        let even = FilterFunction::sync(|row, _| Ok(row["id"].as_i64().unwrap() % 2 == 0));
        let mut it = MappedExamplesIterable::filter(id_source(7, 2), even, MapOptions::default());
        it.init_state();
        let rows = drain_rows(&mut it);
        assert_eq!(ids(&rows), vec![0, 2, 4, 6]);
        assert!(rows.iter().all(|r| !r.contains_key(MASK_COLUMN)));
        assert_resumes_everywhere(&it);

        let batched = FilterFunction::sync(|batch, _| {
            let mask: Vec<bool> = batch["id"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_i64().unwrap() > 2)
                .collect();
            Ok(mask)
        });
        let options = MapOptions {
            batched: true,
            batch_size: Some(2),
            ..MapOptions::default()
        };
        let mut it = MappedExamplesIterable::filter(id_source(6, 1), batched, options);
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![3, 4, 5]);
    }

    fn id_tables() -> BoxedIterable {
        let tables = [0..3, 3..5]
            .into_iter()
            .map(|r| {
                let ids: Int64Array = r.collect::<Vec<i64>>().into();
                RecordBatch::try_from_iter(vec![("id", Arc::new(ids) as _)]).unwrap()
            })
            .collect();
        Box::new(crate::iterable::SourceExamplesIterable::from_record_batches(tables).unwrap())
    }

    fn add_one_table() -> MapFunction {
        MapFunction::table(|table: Table, _| {
            let ids = table.column(0).as_primitive::<arrow::datatypes::Int64Type>();
            let plus: Int64Array = ids.iter().map(|v| v.map(|v| v + 1)).collect();
            append_column(&table, "plus", Arc::new(plus))
        })
    }

    #[test]
    fn test_table_map_keeps_columnar_path() {
        let mut it = MappedExamplesIterable::new(id_tables(), add_one_table(), MapOptions::default());
        assert!(it.has_table_path());
        it.init_state();
        let tables = drain_tables(&mut it);
        assert_eq!(tables.len(), 2);
        assert_eq!(table_ids(&tables), vec![0, 1, 2, 3, 4]);
        assert_eq!(tables[0].num_columns(), 2);
    }

    #[test]
    fn test_table_map_row_path_keys_and_resume() {
        let mut it = MappedExamplesIterable::new(id_tables(), add_one_table(), MapOptions::default());
        it.init_state();
        let (key, row) = it.next_row().unwrap().unwrap();
        assert_eq!(key.to_string(), "0_0");
        assert_eq!(row["plus"], json!(1));
        assert_resumes_everywhere(&it);
    }

    #[test]
    fn test_table_filter() {
        let keep_odd = FilterFunction::table(|table: Table, _| {
            let ids = table.column(0).as_primitive::<arrow::datatypes::Int64Type>();
            Ok(ids.iter().map(|v| v.map(|v| v % 2 == 1)).collect())
        });
        let mut it = MappedExamplesIterable::filter(id_tables(), keep_odd, MapOptions::default());
        it.init_state();
        let tables = drain_tables(&mut it);
        assert_eq!(table_ids(&tables), vec![1, 3]);
        assert_eq!(tables[0].num_columns(), 1);

        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![1, 3]);
    }
}
