// rust/stream-core/src/iterable/rebatch.rs

//! Re-chunking of the columnar path into fixed-size batches.
//!
//! Upstream tables are cut into chunks of at most `batch_size` rows and
//! packed into batches of exactly `batch_size` rows. The snapshot records
//! the child snapshot taken before the table the next batch starts in, the
//! number of chunks consumed since then, and how many rows of the following
//! chunk were already emitted. Resuming replays from that snapshot and drops
//! the consumed chunks instead of re-emitting their rows.

use super::{BoxedIterable, ExamplesIterable};
use crate::error::Result;
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{concat_tables, split_table, Key, Row, Table};
use crate::state::{mismatch, IterableState, RebatchedState};

pub struct RebatchedArrowExamplesIterable {
    ex_iterable: BoxedIterable,
    batch_size: Option<usize>,
    drop_last_batch: bool,
    state: RebatchState,
    pass: Option<RebatchPass>,
}

#[derive(Debug, Clone, Default)]
struct RebatchState {
    previous_state: Option<IterableState>,
    batch_idx: usize,
    num_chunks_since_previous_state: usize,
    cropped_chunk_length: usize,
}

#[derive(Default)]
struct RebatchPass {
    // Chunks of the current input table not yet processed.
    chunks: Vec<Table>,
    next_chunk: usize,
    key: Option<Key>,
    keys_buffer: Vec<Key>,
    chunks_buffer: Vec<Table>,
    buffer_len: usize,
    num_chunks_to_skip: usize,
    chunk_length_to_crop: usize,
    // Child snapshot before the current input table.
    previous_state: Option<IterableState>,
    // Bookkeeping applied once the last emitted batch has been handed out.
    after_emit: Option<(Option<IterableState>, usize)>,
    finished: bool,
}

impl RebatchedArrowExamplesIterable {
    /// `batch_size` of `None` or zero emits the whole stream as one table.
    pub fn new(ex_iterable: BoxedIterable, batch_size: Option<usize>, drop_last_batch: bool) -> Self {
        Self {
            ex_iterable,
            batch_size: batch_size.filter(|&n| n > 0),
            drop_last_batch,
            state: RebatchState::default(),
            pass: None,
        }
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    fn wrap(&self, ex_iterable: BoxedIterable) -> Self {
        Self::new(ex_iterable, self.batch_size, self.drop_last_batch)
    }

    fn open(&mut self) -> Result<RebatchPass> {
        if let Some(previous) = &self.state.previous_state {
            self.ex_iterable.load_state(previous)?;
        }
        let previous_state = Some(self.ex_iterable.state());
        self.state.previous_state = previous_state.clone();
        Ok(RebatchPass {
            num_chunks_to_skip: self.state.num_chunks_since_previous_state,
            chunk_length_to_crop: self.state.cropped_chunk_length,
            previous_state,
            ..RebatchPass::default()
        })
    }

    fn next_whole(&mut self) -> Result<Option<(Key, Table)>> {
        if self.state.batch_idx > 0 {
            return Ok(None);
        }
        if let Some(previous) = &self.state.previous_state {
            self.ex_iterable.load_state(previous)?;
        }
        let mut tables = Vec::new();
        while let Some((_, table)) = self.ex_iterable.next_table()? {
            tables.push(table);
        }
        self.state.batch_idx = 1;
        Ok(Some((Key::from("all"), concat_tables(&tables)?)))
    }

    fn emit(pass: &mut RebatchPass) -> Result<(Key, Table)> {
        let key = Key::join(&pass.keys_buffer);
        let table = concat_tables(&pass.chunks_buffer)?;
        pass.keys_buffer.clear();
        pass.chunks_buffer.clear();
        pass.buffer_len = 0;
        Ok((key, table))
    }

    fn next_batch(&mut self, batch_size: usize) -> Result<Option<(Key, Table)>> {
        let mut pass = match self.pass.take() {
            Some(pass) => pass,
            None => self.open()?,
        };
        let result = self.advance(&mut pass, batch_size);
        self.pass = Some(pass);
        result
    }

    fn advance(&mut self, pass: &mut RebatchPass, batch_size: usize) -> Result<Option<(Key, Table)>> {
        if let Some((previous_state, num_chunks)) = pass.after_emit.take() {
            self.state.previous_state = previous_state;
            self.state.num_chunks_since_previous_state = num_chunks;
        }
        if pass.finished {
            return Ok(None);
        }
        loop {
            if pass.next_chunk >= pass.chunks.len() {
                if pass.key.is_some() {
                    pass.previous_state = Some(self.ex_iterable.state());
                }
                match self.ex_iterable.next_table()? {
                    Some((key, table)) => {
                        pass.chunks = split_table(&table, batch_size);
                        pass.next_chunk = 0;
                        pass.key = Some(key);
                        continue;
                    }
                    None => {
                        pass.finished = true;
                        if self.drop_last_batch || pass.chunks_buffer.is_empty() {
                            return Ok(None);
                        }
                        self.state.previous_state = pass.previous_state.clone();
                        self.state.batch_idx += 1;
                        self.state.num_chunks_since_previous_state = 0;
                        self.state.cropped_chunk_length = 0;
                        return Self::emit(pass).map(Some);
                    }
                }
            }
            let idx = pass.next_chunk;
            pass.next_chunk += 1;
            let mut chunk = pass.chunks[idx].clone();
            let key = pass.key.clone().unwrap_or(Key::Int(0));

            if pass.num_chunks_to_skip > 1 {
                pass.num_chunks_to_skip -= 1;
                continue;
            } else if pass.num_chunks_to_skip == 1 && pass.chunk_length_to_crop == 0 {
                pass.num_chunks_to_skip = 0;
                continue;
            } else if pass.num_chunks_to_skip == 1 {
                let crop = pass.chunk_length_to_crop.min(chunk.num_rows());
                chunk = chunk.slice(crop, chunk.num_rows() - crop);
                pass.num_chunks_to_skip = 0;
                pass.chunk_length_to_crop = 0;
            }
            if chunk.num_rows() == 0 {
                continue;
            }

            let len = chunk.num_rows();
            if pass.buffer_len + len < batch_size {
                pass.keys_buffer.push(key);
                pass.chunks_buffer.push(chunk);
                pass.buffer_len += len;
            } else if pass.buffer_len + len == batch_size {
                pass.keys_buffer.push(key);
                pass.chunks_buffer.push(chunk);
                self.state.batch_idx += 1;
                self.state.num_chunks_since_previous_state += pass.chunks_buffer.len();
                self.state.cropped_chunk_length = 0;
                let batch = Self::emit(pass)?;
                pass.after_emit = Some((pass.previous_state.clone(), idx + 1));
                return Ok(Some(batch));
            } else {
                let cropped = batch_size - pass.buffer_len;
                pass.keys_buffer.push(key.with_suffix(format!("[:{cropped}]")));
                pass.chunks_buffer.push(chunk.slice(0, cropped));
                self.state.batch_idx += 1;
                self.state.num_chunks_since_previous_state += pass.chunks_buffer.len();
                self.state.cropped_chunk_length = cropped;
                let batch = Self::emit(pass)?;
                pass.keys_buffer = vec![key.with_suffix(format!("[{cropped}:]"))];
                pass.chunks_buffer = vec![chunk.slice(cropped, len - cropped)];
                pass.buffer_len = len - cropped;
                pass.after_emit = Some((pass.previous_state.clone(), idx));
                return Ok(Some(batch));
            }
        }
    }
}

impl ExamplesIterable for RebatchedArrowExamplesIterable {
    fn name(&self) -> &'static str {
        "RebatchedArrowExamplesIterable"
    }

    fn num_shards(&self) -> usize {
        self.ex_iterable.num_shards()
    }

    fn has_table_path(&self) -> bool {
        true
    }

    fn is_typed(&self) -> bool {
        self.ex_iterable.is_typed()
    }

    fn features(&self) -> Option<Features> {
        self.ex_iterable.features()
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
        self.ex_iterable.init_state();
        self.state = RebatchState::default();
        self.pass = None;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::Rebatched(s) = state else {
            return Err(mismatch(self.name(), "rebatched", state));
        };
        self.ex_iterable.load_state(&s.examples_iterable)?;
        self.state = RebatchState {
            previous_state: s.previous_state.as_deref().cloned(),
            batch_idx: s.batch_idx,
            num_chunks_since_previous_state: s.num_chunks_since_previous_state,
            cropped_chunk_length: s.cropped_chunk_length,
        };
        self.pass = None;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::Rebatched(RebatchedState {
            examples_iterable: Box::new(self.ex_iterable.state()),
            previous_state: self.state.previous_state.clone().map(Box::new),
            batch_idx: self.state.batch_idx,
            num_chunks_since_previous_state: self.state.num_chunks_since_previous_state,
            cropped_chunk_length: self.state.cropped_chunk_length,
        })
    }

    /// Rows pass straight through from the child.
    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        self.ex_iterable.next_row()
    }

    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        match self.batch_size {
            Some(batch_size) => self.next_batch(batch_size),
            None => self.next_whole(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterable::test_utils::{drain_tables, id_source, ids, row, table_ids};
    use crate::iterable::SourceExamplesIterable;
    use crate::records::{rows_to_table, table_to_rows};
    use serde_json::json;

    fn tables_source(sizes: &[usize]) -> BoxedIterable {
        let mut next = 0i64;
        let tables = sizes
            .iter()
            .map(|&n| {
                let rows: Vec<Row> = (0..n)
                    .map(|_| {
                        next += 1;
                        row(json!({"id": next - 1}))
                    })
                    .collect();
                rows_to_table(&rows).unwrap()
            })
            .collect();
        Box::new(SourceExamplesIterable::from_record_batches(tables).unwrap())
    }

    fn sizes(tables: &[Table]) -> Vec<usize> {
        tables.iter().map(|t| t.num_rows()).collect()
    }

    #[test]
    fn test_rebatch_sizes() {
        let mut rebatched = RebatchedArrowExamplesIterable::new(tables_source(&[3, 5, 2]), Some(4), false);
        let tables = drain_tables(&mut rebatched);
        assert_eq!(sizes(&tables), vec![4, 4, 2]);
        assert_eq!(table_ids(&tables), (0..10).collect::<Vec<_>>());

        let mut dropped = RebatchedArrowExamplesIterable::new(tables_source(&[3, 5, 2]), Some(4), true);
        assert_eq!(sizes(&drain_tables(&mut dropped)), vec![4, 4]);
    }

    #[test]
    fn test_rebatch_from_rows() {
        let mut rebatched = RebatchedArrowExamplesIterable::new(id_source(7, 2), Some(3), false);
        let tables = drain_tables(&mut rebatched);
        assert_eq!(sizes(&tables), vec![3, 3, 1]);
        assert_eq!(table_ids(&tables), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_rebatch_keys() {
        let mut rebatched = RebatchedArrowExamplesIterable::new(tables_source(&[3, 3]), Some(4), false);
        let (first, _) = rebatched.next_table().unwrap().unwrap();
        assert_eq!(first.to_string(), "0_1[:1]");
        let (second, _) = rebatched.next_table().unwrap().unwrap();
        assert_eq!(second.to_string(), "1[1:]");
    }

    #[test]
    fn test_whole_stream_batch() {
        let mut rebatched = RebatchedArrowExamplesIterable::new(tables_source(&[2, 3]), None, false);
        let (key, table) = rebatched.next_table().unwrap().unwrap();
        assert_eq!(key, Key::from("all"));
        assert_eq!(table.num_rows(), 5);
        assert!(rebatched.next_table().unwrap().is_none());

        let snapshot = rebatched.state();
        let mut resumed = rebatched.boxed_clone();
        resumed.load_state(&snapshot).unwrap();
        assert!(resumed.next_table().unwrap().is_none());
    }

    #[test]
    fn test_resume_after_every_batch() {
        for batch_size in 1..=6 {
            for chunking in [&[3usize, 5, 2][..], &[1, 1, 4, 4][..], &[10][..]] {
                let base = RebatchedArrowExamplesIterable::new(tables_source(chunking), Some(batch_size), false);
                let mut reference = base.boxed_clone();
                let all = table_ids(&drain_tables(reference.as_mut()));
                let mut emitted = 0;
                loop {
                    let mut first = base.boxed_clone();
                    first.init_state();
                    let mut seen = 0;
                    let mut done = false;
                    for _ in 0..emitted {
                        match first.next_table().unwrap() {
                            Some((_, t)) => seen += t.num_rows(),
                            None => done = true,
                        }
                    }
                    if done {
                        break;
                    }
                    let snapshot = first.state();
                    let mut second = base.boxed_clone();
                    second.init_state();
                    second.load_state(&snapshot).unwrap();
                    let rest = table_ids(&drain_tables(second.as_mut()));
                    assert_eq!(rest, all[seen..], "batch_size={batch_size} chunks={chunking:?} after {emitted}");
                    emitted += 1;
                    if seen == all.len() {
                        break;
                    }
                }
            }
        }
    }

    #[test]
    fn test_rows_pass_through() {
        let mut rebatched = RebatchedArrowExamplesIterable::new(id_source(3, 1), Some(2), false);
        let (_, row) = rebatched.next_row().unwrap().unwrap();
        assert_eq!(ids(&[row]), vec![0]);
        let rest = table_to_rows(&rebatched.next_table().unwrap().unwrap().1).unwrap();
        assert_eq!(ids(&rest), vec![1, 2]);
    }
}
