// rust/stream-core/src/iterable/mod.rs

//! Stream operators.
//!
//! Every operator implements [`ExamplesIterable`]: a pull-based cursor over
//! `(Key, Row)` pairs with an optional columnar path over `(Key, Table)`
//! pairs. Operators wrap their children by value (`BoxedIterable`), so a
//! pipeline is a tree owned by its root.
//!
//! The checkpoint lifecycle is explicit:
//!
//! - `init_state` rewinds the operator (and its children) to the start and
//!   returns the fresh snapshot,
//! - `load_state` moves the cursor to a snapshot,
//! - `state` reports the snapshot of the current position at any time.
//!
//! Operators open their pass lazily on the first pull after a rewind or a
//! load, so loading is free until data is requested.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use stream_core::iterable::{ExamplesIterable, SourceExamplesIterable, TakeExamplesIterable};
//!
//! let rows = (0..5).map(|i| json!({"id": i}).as_object().unwrap().clone()).collect();
//! let source = SourceExamplesIterable::from_rows(rows, 1).unwrap();
//! let mut take = TakeExamplesIterable::new(Box::new(source), 2, true, true);
//! take.init_state();
//! assert!(take.next_row().unwrap().is_some());
//! let snapshot = take.state();
//! assert!(take.next_row().unwrap().is_some());
//! assert!(take.next_row().unwrap().is_none());
//!
//! take.load_state(&snapshot).unwrap();
//! let (_, row) = take.next_row().unwrap().unwrap();
//! assert_eq!(row["id"], json!(1));
//! ```

pub mod concat;
pub mod cycling;
pub mod formatted;
pub mod map;
pub mod rebatch;
pub mod scheduler;
pub mod select;
pub mod shuffle;
pub mod source;
pub mod window;

pub use concat::{
    HorizontallyConcatenatedMultiSourcesExamplesIterable,
    VerticallyConcatenatedMultiSourcesExamplesIterable,
};
pub use cycling::{
    CyclingMultiSourcesExamplesIterable, RandomlyCyclingMultiSourcesExamplesIterable,
    StoppingStrategy,
};
pub use formatted::FormattedExamplesIterable;
pub use map::{
    FilterFunction, Indices, MapFunction, MapOptions, MappedExamplesIterable, TableOutput,
    MASK_COLUMN,
};
pub use rebatch::RebatchedArrowExamplesIterable;
pub use select::SelectColumnsIterable;
pub use shuffle::BufferShuffledExamplesIterable;
pub use source::{GenerateExamplesFn, GenerateTablesFn, RowIter, SourceExamplesIterable, TableIter};
pub use window::{
    RepeatExamplesIterable, SkipExamplesIterable, StepExamplesIterable, TakeExamplesIterable,
};

use crate::error::Result;
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{rows_to_table, Key, Row, Table};
use crate::sharding;
use crate::state::IterableState;

pub type BoxedIterable = Box<dyn ExamplesIterable>;

/// Shared contract of every stream operator.
pub trait ExamplesIterable: Send {
    /// Operator name, used in state errors and logs.
    fn name(&self) -> &'static str;

    fn num_shards(&self) -> usize;

    /// Whether `next_table` preserves the upstream columnar chunks instead of
    /// wrapping single rows.
    fn has_table_path(&self) -> bool {
        false
    }

    /// Whether records already conform to `features()`.
    fn is_typed(&self) -> bool {
        false
    }

    fn features(&self) -> Option<Features> {
        None
    }

    /// Returns a copy with the order of the source shards permuted.
    ///
    /// Implementations fork `generator` before drawing, so the caller's
    /// handle is never advanced.
    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable;

    /// Returns a copy restricted to the shards owned by worker `index` out
    /// of `num_shards`.
    ///
    /// # Errors
    ///
    /// Fails if the operator cannot be partitioned, for example when a source
    /// has ambiguous shard lists.
    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable>;

    fn split_shard_indices_by_worker(
        &self,
        num_shards: usize,
        index: usize,
        contiguous: bool,
    ) -> Vec<usize> {
        sharding::split_shard_indices_by_worker(self.num_shards(), num_shards, index, contiguous)
    }

    /// A copy at the same snapshot with no open pass.
    fn boxed_clone(&self) -> BoxedIterable;

    /// Rewinds to the start and returns the fresh snapshot.
    fn init_state(&mut self) -> IterableState;

    /// Moves the cursor to `state`.
    ///
    /// # Errors
    ///
    /// Returns a state error if the snapshot was taken from a different
    /// kind of operator.
    fn load_state(&mut self, state: &IterableState) -> Result<()>;

    /// Snapshot of the current position.
    fn state(&self) -> IterableState;

    fn next_row(&mut self) -> Result<Option<(Key, Row)>>;

    /// Next columnar chunk. Operators without a table path wrap each row in
    /// a one-row table.
    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        match self.next_row()? {
            Some((key, row)) => Ok(Some((key, rows_to_table(std::slice::from_ref(&row))?))),
            None => Ok(None),
        }
    }
}

impl Clone for BoxedIterable {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use serde_json::{json, Value};

    use super::*;
    use crate::records::table_to_rows;

    pub fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    /// Rows `{"id": 0..n}` split into `num_shards` shards.
    pub fn id_source(n: i64, num_shards: usize) -> BoxedIterable {
        let rows = (0..n).map(|i| row(json!({"id": i}))).collect();
        Box::new(SourceExamplesIterable::from_rows(rows, num_shards).unwrap())
    }

    pub fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter().map(|r| r["id"].as_i64().unwrap()).collect()
    }

    pub fn drain_rows(it: &mut dyn ExamplesIterable) -> Vec<Row> {
        let mut out = Vec::new();
        while let Some((_, row)) = it.next_row().unwrap() {
            out.push(row);
        }
        out
    }

    pub fn drain_ids(it: &mut dyn ExamplesIterable) -> Vec<i64> {
        ids(&drain_rows(it))
    }

    pub fn drain_tables(it: &mut dyn ExamplesIterable) -> Vec<Table> {
        let mut out = Vec::new();
        while let Some((_, table)) = it.next_table().unwrap() {
            out.push(table);
        }
        out
    }

    pub fn table_ids(tables: &[Table]) -> Vec<i64> {
        tables
            .iter()
            .flat_map(|t| ids(&table_to_rows(t).unwrap()))
            .collect()
    }

    /// Checks that a snapshot taken after every yielded row resumes at the
    /// next row on a fresh copy of `it`.
    pub fn assert_resumes_everywhere(it: &dyn ExamplesIterable) {
        let mut reference = it.boxed_clone();
        reference.init_state();
        let expected = drain_ids(reference.as_mut());
        for k in 0..=expected.len() {
            let mut first = it.boxed_clone();
            first.init_state();
            for _ in 0..k {
                first.next_row().unwrap();
            }
            let snapshot = first.state();
            let mut second = it.boxed_clone();
            second.init_state();
            second.load_state(&snapshot).unwrap();
            assert_eq!(drain_ids(second.as_mut()), expected[k..], "resume after {k} rows");
        }
    }
}
