// rust/stream-core/src/iterable/source.rs

//! Leaf operators: generation functions over sharded keyword arguments.
//!
//! A source is a generation function plus a `GenKwargs` object whose list
//! entries enumerate the shards. Row sources yield `(Key, Row)` pairs, table
//! sources yield `(Key, Table)` chunks. Both count positions in rows, so a
//! snapshot taken on either path resumes on the other.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{json, Value};

use super::{BoxedIterable, ExamplesIterable};
use crate::error::{Result, StreamError};
use crate::generator::Generator;
use crate::records::{rows_to_table, table_to_rows, Key, Row, Table};
use crate::sharding::{
    distribute_shards, merge_gen_kwargs, number_of_shards_in_gen_kwargs, shuffle_gen_kwargs,
    split_gen_kwargs, GenKwargs,
};
use crate::state::{mismatch, IterableState, SourceState};

pub type RowIter = Box<dyn Iterator<Item = Result<(Key, Row)>> + Send>;
pub type TableIter = Box<dyn Iterator<Item = Result<(Key, Table)>> + Send>;

/// Generation function of a row source, called once per shard.
pub type GenerateExamplesFn = Arc<dyn Fn(&GenKwargs) -> Result<RowIter> + Send + Sync>;

/// Generation function of a table source, called once per shard.
pub type GenerateTablesFn = Arc<dyn Fn(&GenKwargs) -> Result<TableIter> + Send + Sync>;

#[derive(Clone)]
enum Generate {
    Rows(GenerateExamplesFn),
    Tables(GenerateTablesFn),
}

pub struct SourceExamplesIterable {
    generate: Generate,
    kwargs: GenKwargs,
    num_shards: usize,
    // Set for the shuffled-order variant; forked on every pass.
    shuffle: Option<Generator>,
    state: SourceState,
    pass: Option<SourcePass>,
}

struct SourcePass {
    shards: Vec<GenKwargs>,
    reader: Option<ShardReader>,
}

enum ShardReader {
    Rows(RowIter),
    Tables {
        iter: TableIter,
        // First chunk after a mid-table resume, already sliced.
        pending: Option<(Key, Table)>,
        rows: VecDeque<Row>,
        rows_key: Key,
    },
}

impl ShardReader {
    fn open(generate: &Generate, kwargs: &GenKwargs, skip: usize) -> Result<Self> {
        match generate {
            Generate::Rows(f) => {
                let mut iter = f(kwargs)?;
                for _ in 0..skip {
                    match iter.next() {
                        Some(item) => {
                            item?;
                        }
                        None => break,
                    }
                }
                Ok(ShardReader::Rows(iter))
            }
            Generate::Tables(f) => {
                let mut iter = f(kwargs)?;
                let mut seen = 0;
                let mut pending = None;
                for item in iter.by_ref() {
                    let (key, table) = item?;
                    let len = table.num_rows();
                    if seen + len <= skip {
                        seen += len;
                        continue;
                    }
                    let offset = skip - seen;
                    pending = Some((key, table.slice(offset, len - offset)));
                    break;
                }
                Ok(ShardReader::Tables {
                    iter,
                    pending,
                    rows: VecDeque::new(),
                    rows_key: Key::Int(0),
                })
            }
        }
    }

    fn next_chunk(
        iter: &mut TableIter,
        pending: &mut Option<(Key, Table)>,
    ) -> Result<Option<(Key, Table)>> {
        if let Some(chunk) = pending.take() {
            return Ok(Some(chunk));
        }
        for item in iter.by_ref() {
            let (key, table) = item?;
            if table.num_rows() > 0 {
                return Ok(Some((key, table)));
            }
        }
        Ok(None)
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        match self {
            ShardReader::Rows(iter) => iter.next().transpose(),
            ShardReader::Tables {
                iter,
                pending,
                rows,
                rows_key,
            } => loop {
                if let Some(row) = rows.pop_front() {
                    return Ok(Some((rows_key.clone(), row)));
                }
                match Self::next_chunk(iter, pending)? {
                    Some((key, table)) => {
                        rows.extend(table_to_rows(&table)?);
                        *rows_key = key;
                    }
                    None => return Ok(None),
                }
            },
        }
    }

    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        match self {
            ShardReader::Rows(iter) => match iter.next().transpose()? {
                Some((key, row)) => Ok(Some((key, rows_to_table(std::slice::from_ref(&row))?))),
                None => Ok(None),
            },
            ShardReader::Tables {
                iter,
                pending,
                rows,
                rows_key,
            } => {
                if !rows.is_empty() {
                    let rest: Vec<Row> = rows.drain(..).collect();
                    return Ok(Some((rows_key.clone(), rows_to_table(&rest)?)));
                }
                Self::next_chunk(iter, pending)
            }
        }
    }
}

impl SourceExamplesIterable {
    /// A row source.
    ///
    /// # Errors
    ///
    /// Returns a config error when the list entries of `kwargs` have
    /// different lengths.
    pub fn new(generate_examples_fn: GenerateExamplesFn, kwargs: GenKwargs) -> Result<Self> {
        Self::build(Generate::Rows(generate_examples_fn), kwargs)
    }

    /// A table source.
    pub fn from_tables(generate_tables_fn: GenerateTablesFn, kwargs: GenKwargs) -> Result<Self> {
        Self::build(Generate::Tables(generate_tables_fn), kwargs)
    }

    fn build(generate: Generate, kwargs: GenKwargs) -> Result<Self> {
        let num_shards = number_of_shards_in_gen_kwargs(&kwargs)?;
        Ok(Self {
            generate,
            kwargs,
            num_shards,
            shuffle: None,
            state: SourceState::default(),
            pass: None,
        })
    }

    /// An in-memory row source split into at most `num_shards` contiguous
    /// shards. Keys are the row positions.
    pub fn from_rows(rows: Vec<Row>, num_shards: usize) -> Result<Self> {
        let rows = Arc::new(rows);
        let kwargs = range_kwargs(rows.len(), num_shards);
        let generate: GenerateExamplesFn = Arc::new(move |kwargs: &GenKwargs| {
            let rows = Arc::clone(&rows);
            let indices = parse_ranges(kwargs)?.into_iter().flatten();
            Ok(Box::new(
                indices.map(move |i| Ok::<_, StreamError>((Key::from(i), rows[i].clone()))),
            ) as RowIter)
        });
        Self::new(generate, kwargs)
    }

    /// An in-memory table source; each table is one shard.
    pub fn from_record_batches(tables: Vec<Table>) -> Result<Self> {
        let tables = Arc::new(tables);
        let mut kwargs = GenKwargs::new();
        kwargs.insert(
            "tables".to_string(),
            Value::Array((0..tables.len()).map(|i| json!(i)).collect()),
        );
        let generate: GenerateTablesFn = Arc::new(move |kwargs: &GenKwargs| {
            let tables = Arc::clone(&tables);
            let indices: Vec<usize> = kwargs
                .get("tables")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_u64().map(|i| i as usize))
                        .filter(|&i| i < tables.len())
                        .collect()
                })
                .unwrap_or_default();
            Ok(Box::new(
                indices
                    .into_iter()
                    .map(move |i| Ok::<_, StreamError>((Key::from(i), tables[i].clone()))),
            ) as TableIter)
        });
        Self::from_tables(generate, kwargs)
    }

    pub fn kwargs(&self) -> &GenKwargs {
        &self.kwargs
    }

    fn with_kwargs(&self, kwargs: GenKwargs, num_shards: usize, shuffle: Option<Generator>) -> Self {
        Self {
            generate: self.generate.clone(),
            kwargs,
            num_shards,
            shuffle,
            state: SourceState::default(),
            pass: None,
        }
    }

    /// Shard argument sets in iteration order.
    fn shard_kwargs(&self) -> Result<Vec<GenKwargs>> {
        if self.num_shards == 0 {
            return Ok(Vec::new());
        }
        let kwargs = match &self.shuffle {
            Some(generator) => shuffle_gen_kwargs(&mut generator.fork(), &self.kwargs),
            None => self.kwargs.clone(),
        };
        split_gen_kwargs(&kwargs, self.num_shards)
    }

    fn reader(&mut self) -> Result<Option<&mut ShardReader>> {
        if self.pass.is_none() {
            self.pass = Some(SourcePass {
                shards: self.shard_kwargs()?,
                reader: None,
            });
        }
        let Some(pass) = self.pass.as_mut() else {
            return Ok(None);
        };
        if pass.reader.is_none() {
            let Some(kwargs) = pass.shards.get(self.state.shard_idx) else {
                return Ok(None);
            };
            pass.reader = Some(ShardReader::open(
                &self.generate,
                kwargs,
                self.state.shard_example_idx,
            )?);
        }
        Ok(pass.reader.as_mut())
    }

    fn finish_shard(&mut self) {
        self.state.shard_idx += 1;
        self.state.shard_example_idx = 0;
        if let Some(pass) = self.pass.as_mut() {
            pass.reader = None;
        }
    }
}

impl ExamplesIterable for SourceExamplesIterable {
    fn name(&self) -> &'static str {
        match (&self.generate, self.shuffle.is_some()) {
            (Generate::Rows(_), false) => "ExamplesIterable",
            (Generate::Rows(_), true) => "ShuffledDataSourcesExamplesIterable",
            (Generate::Tables(_), false) => "ArrowExamplesIterable",
            (Generate::Tables(_), true) => "ShuffledDataSourcesArrowExamplesIterable",
        }
    }

    fn num_shards(&self) -> usize {
        self.num_shards
    }

    fn has_table_path(&self) -> bool {
        matches!(self.generate, Generate::Tables(_))
    }

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(self.with_kwargs(self.kwargs.clone(), self.num_shards, Some(generator.fork())))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        let parts = self.shard_kwargs()?;
        let selected: Vec<GenKwargs> = self
            .split_shard_indices_by_worker(num_shards, index, contiguous)
            .into_iter()
            .filter_map(|i| parts.get(i).cloned())
            .collect();
        if selected.is_empty() {
            return Ok(Box::new(self.with_kwargs(GenKwargs::new(), 0, None)));
        }
        let merged = merge_gen_kwargs(&selected);
        let n = number_of_shards_in_gen_kwargs(&merged)?;
        Ok(Box::new(self.with_kwargs(merged, n, None)))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        let mut copy = self.with_kwargs(self.kwargs.clone(), self.num_shards, self.shuffle.clone());
        copy.state = self.state;
        Box::new(copy)
    }

    fn init_state(&mut self) -> IterableState {
        self.state = SourceState::default();
        self.pass = None;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        match state {
            IterableState::Source(s) => {
                self.state = *s;
                self.pass = None;
                Ok(())
            }
            other => Err(mismatch(self.name(), "source", other)),
        }
    }

    fn state(&self) -> IterableState {
        IterableState::Source(self.state)
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        loop {
            let Some(reader) = self.reader()? else {
                return Ok(None);
            };
            match reader.next_row()? {
                Some(item) => {
                    self.state.shard_example_idx += 1;
                    return Ok(Some(item));
                }
                None => self.finish_shard(),
            }
        }
    }

    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        loop {
            let Some(reader) = self.reader()? else {
                return Ok(None);
            };
            match reader.next_table()? {
                Some((key, table)) => {
                    self.state.shard_example_idx += table.num_rows();
                    return Ok(Some((key, table)));
                }
                None => self.finish_shard(),
            }
        }
    }
}

/// `{"ranges": [[start, end], ...]}` covering `0..len`.
fn range_kwargs(len: usize, num_shards: usize) -> GenKwargs {
    let ranges = if len == 0 {
        vec![0..0]
    } else {
        distribute_shards(len, num_shards.max(1))
    };
    let mut kwargs = GenKwargs::new();
    kwargs.insert(
        "ranges".to_string(),
        Value::Array(ranges.iter().map(|r| json!([r.start, r.end])).collect()),
    );
    kwargs
}

fn parse_ranges(kwargs: &GenKwargs) -> Result<Vec<std::ops::Range<usize>>> {
    let items = kwargs
        .get("ranges")
        .and_then(Value::as_array)
        .ok_or_else(|| StreamError::config("in-memory source is missing its 'ranges' argument"))?;
    items
        .iter()
        .map(|item| {
            let bounds = item.as_array().map(|b| {
                b.iter()
                    .filter_map(|v| v.as_u64().map(|x| x as usize))
                    .collect::<Vec<_>>()
            });
            match bounds.as_deref() {
                Some([start, end]) => Ok(*start..*end),
                _ => Err(StreamError::config(format!("invalid row range {item}"))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterable::test_utils::{
        assert_resumes_everywhere, drain_ids, drain_tables, id_source, row, table_ids,
    };

    fn table_source(chunks: &[&[i64]]) -> SourceExamplesIterable {
        let tables = chunks
            .iter()
            .map(|ids| {
                let rows: Vec<Row> = ids.iter().map(|i| row(json!({"id": i}))).collect();
                rows_to_table(&rows).unwrap()
            })
            .collect();
        SourceExamplesIterable::from_record_batches(tables).unwrap()
    }

    #[test]
    fn test_contiguous_shards_partition_source() {
        let source = id_source(10, 4);
        assert_eq!(source.num_shards(), 4);
        let mut all = Vec::new();
        for i in 0..4 {
            let mut shard = source.shard(4, i, true).unwrap();
            shard.init_state();
            all.extend(drain_ids(shard.as_mut()));
        }
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_strided_shards() {
        let source = id_source(6, 6);
        let mut shard = source.shard(3, 1, false).unwrap();
        assert_eq!(shard.num_shards(), 2);
        assert_eq!(drain_ids(shard.as_mut()), vec![1, 4]);

        let mut empty = id_source(2, 2).shard(4, 3, true).unwrap();
        assert_eq!(empty.num_shards(), 0);
        assert!(empty.next_row().unwrap().is_none());
    }

    #[test]
    fn test_shuffle_reorders_shards_only() {
        let source = id_source(12, 6);
        let shuffled = source.shuffle_shards(&Generator::new(3));
        assert_eq!(shuffled.num_shards(), 6);

        let mut a = shuffled.boxed_clone();
        let mut b = shuffled.boxed_clone();
        let first = drain_ids(a.as_mut());
        assert_eq!(first, drain_ids(b.as_mut()));

        // shard contents stay contiguous pairs
        for pair in first.chunks(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffled_shard_matches_shuffled_order() {
        let shuffled = id_source(8, 4).shuffle_shards(&Generator::new(9));
        let mut whole = shuffled.boxed_clone();
        let order = drain_ids(whole.as_mut());
        let mut first_half = shuffled.shard(2, 0, true).unwrap();
        assert_eq!(drain_ids(first_half.as_mut()), order[..4]);
    }

    #[test]
    fn test_row_source_resume() {
        assert_resumes_everywhere(id_source(7, 3).as_ref());
    }

    #[test]
    fn test_table_source_resumes_mid_table() {
        let mut source = table_source(&[&[0, 1, 2], &[3, 4]]);
        source.init_state();
        source.next_row().unwrap();
        source.next_row().unwrap();
        let snapshot = source.state();
        assert_eq!(
            snapshot,
            IterableState::Source(SourceState {
                shard_idx: 0,
                shard_example_idx: 2
            })
        );

        let mut resumed = source.boxed_clone();
        resumed.load_state(&snapshot).unwrap();
        let tables = drain_tables(resumed.as_mut());
        assert_eq!(tables[0].num_rows(), 1);
        assert_eq!(table_ids(&tables), vec![2, 3, 4]);
    }

    #[test]
    fn test_table_source_counts_rows() {
        let mut source = table_source(&[&[0, 1, 2], &[3, 4]]);
        source.init_state();
        source.next_table().unwrap();
        assert_eq!(
            source.state(),
            IterableState::Source(SourceState {
                shard_idx: 0,
                shard_example_idx: 3
            })
        );
        assert_eq!(drain_ids(&mut source), vec![3, 4]);
        assert_resumes_everywhere(&source);
    }

    #[test]
    fn test_generation_errors_propagate() {
        let generate: GenerateExamplesFn = Arc::new(|_kwargs: &GenKwargs| {
            Ok(Box::new(
                vec![
                    Ok((Key::from(0usize), row(json!({"id": 0})))),
                    Err(StreamError::transform("disk on fire")),
                ]
                .into_iter(),
            ) as RowIter)
        });
        let mut source = SourceExamplesIterable::new(generate, GenKwargs::new()).unwrap();
        assert!(source.next_row().unwrap().is_some());
        assert!(matches!(source.next_row(), Err(StreamError::Transform { .. })));
    }

    #[test]
    fn test_wrong_state_kind() {
        let mut source = id_source(3, 1);
        let err = source
            .load_state(&IterableState::HorizontallyConcatenated(
                crate::state::HorizontallyConcatenatedState {
                    ex_iterables: vec![],
                },
            ))
            .unwrap_err();
        assert!(matches!(err, StreamError::State { .. }));
    }
}
