// rust/stream-core/src/iterable/concat.rs

//! Vertical (chained) and horizontal (zipped) concatenation of sources.

use std::collections::HashSet;

use tracing::debug;

use super::{BoxedIterable, ExamplesIterable};
use crate::error::{Result, StreamError};
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{Key, Row, Table};
use crate::state::{
    check_len, mismatch, HorizontallyConcatenatedState, IterableState, VerticallyConcatenatedState,
};

fn min_shards(ex_iterables: &[BoxedIterable]) -> usize {
    ex_iterables
        .iter()
        .map(|e| e.num_shards())
        .min()
        .unwrap_or(0)
}

fn shard_all(
    ex_iterables: &[BoxedIterable],
    num_shards: usize,
    index: usize,
    contiguous: bool,
) -> Result<Vec<BoxedIterable>> {
    ex_iterables
        .iter()
        .map(|e| e.shard(num_shards, index, contiguous))
        .collect()
}

fn load_all(
    operator: &str,
    ex_iterables: &mut [BoxedIterable],
    states: &[IterableState],
) -> Result<()> {
    check_len(operator, "ex_iterables", states.len(), ex_iterables.len())?;
    for (ex_iterable, state) in ex_iterables.iter_mut().zip(states) {
        ex_iterable.load_state(state)?;
    }
    Ok(())
}

/// Yields every record of the first source, then of the second, and so on.
/// Sources may have different columns; aligning them is left to the
/// formatting layer.
pub struct VerticallyConcatenatedMultiSourcesExamplesIterable {
    ex_iterables: Vec<BoxedIterable>,
    ex_iterable_idx: usize,
}

impl VerticallyConcatenatedMultiSourcesExamplesIterable {
    pub fn new(ex_iterables: Vec<BoxedIterable>) -> Self {
        Self {
            ex_iterables,
            ex_iterable_idx: 0,
        }
    }
}

impl ExamplesIterable for VerticallyConcatenatedMultiSourcesExamplesIterable {
    fn name(&self) -> &'static str {
        "VerticallyConcatenatedMultiSourcesExamplesIterable"
    }

    fn num_shards(&self) -> usize {
        min_shards(&self.ex_iterables)
    }

    fn has_table_path(&self) -> bool {
        !self.ex_iterables.is_empty() && self.ex_iterables.iter().all(|e| e.has_table_path())
    }

    fn is_typed(&self) -> bool {
        self.ex_iterables.first().is_some_and(|e| e.is_typed())
    }

    fn features(&self) -> Option<Features> {
        self.ex_iterables.first().and_then(|e| e.features())
    }

    /// Permutes the order of the sources, then shuffles each source with the
    /// same generator.
    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        let mut rng = generator.fork();
        let order = rng.permutation(self.ex_iterables.len());
        let ex_iterables = order
            .into_iter()
            .map(|i| self.ex_iterables[i].shuffle_shards(generator))
            .collect();
        Box::new(Self::new(ex_iterables))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(Self::new(shard_all(
            &self.ex_iterables,
            num_shards,
            index,
            contiguous,
        )?)))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self {
            ex_iterables: self.ex_iterables.iter().map(|e| e.boxed_clone()).collect(),
            ex_iterable_idx: self.ex_iterable_idx,
        })
    }

    fn init_state(&mut self) -> IterableState {
        for ex_iterable in &mut self.ex_iterables {
            ex_iterable.init_state();
        }
        self.ex_iterable_idx = 0;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::VerticallyConcatenated(s) = state else {
            return Err(mismatch(self.name(), "vertically_concatenated", state));
        };
        load_all(self.name(), &mut self.ex_iterables, &s.ex_iterables)?;
        self.ex_iterable_idx = s.ex_iterable_idx;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::VerticallyConcatenated(VerticallyConcatenatedState {
            ex_iterable_idx: self.ex_iterable_idx,
            ex_iterables: self.ex_iterables.iter().map(|e| e.state()).collect(),
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        while let Some(ex_iterable) = self.ex_iterables.get_mut(self.ex_iterable_idx) {
            if let Some(record) = ex_iterable.next_row()? {
                return Ok(Some(record));
            }
            self.ex_iterable_idx += 1;
        }
        Ok(None)
    }

    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        while let Some(ex_iterable) = self.ex_iterables.get_mut(self.ex_iterable_idx) {
            if let Some(record) = ex_iterable.next_table()? {
                return Ok(Some(record));
            }
            self.ex_iterable_idx += 1;
        }
        Ok(None)
    }
}

/// Zips sources row by row, merging the columns of each row.
///
/// Stops at the first exhausted source. Sources may not share a column,
/// which is checked on the first row of a pass.
pub struct HorizontallyConcatenatedMultiSourcesExamplesIterable {
    ex_iterables: Vec<BoxedIterable>,
    checked: bool,
}

impl HorizontallyConcatenatedMultiSourcesExamplesIterable {
    pub fn new(ex_iterables: Vec<BoxedIterable>) -> Self {
        Self {
            ex_iterables,
            checked: false,
        }
    }
}

fn check_column_names(rows: &[Row]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut duplicated = Vec::new();
    for column in rows.iter().flat_map(|row| row.keys()) {
        if !seen.insert(column.as_str()) && !duplicated.contains(column) {
            duplicated.push(column.clone());
        }
    }
    if !duplicated.is_empty() {
        return Err(StreamError::config(format!(
            "the concatenated sources can't have duplicated columns but columns {duplicated:?} are duplicated"
        )));
    }
    Ok(())
}

impl ExamplesIterable for HorizontallyConcatenatedMultiSourcesExamplesIterable {
    fn name(&self) -> &'static str {
        "HorizontallyConcatenatedMultiSourcesExamplesIterable"
    }

    fn num_shards(&self) -> usize {
        1
    }

    fn is_typed(&self) -> bool {
        self.ex_iterables.first().is_some_and(|e| e.is_typed())
    }

    fn features(&self) -> Option<Features> {
        self.ex_iterables.first().and_then(|e| e.features())
    }

    /// Shuffling would break the alignment of the zipped rows, so the sources
    /// keep their order.
    fn shuffle_shards(&self, _generator: &Generator) -> BoxedIterable {
        debug!("Horizontal concatenation ignores shard shuffling");
        Box::new(Self::new(
            self.ex_iterables.iter().map(|e| e.boxed_clone()).collect(),
        ))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(Self::new(shard_all(
            &self.ex_iterables,
            num_shards,
            index,
            contiguous,
        )?)))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self::new(
            self.ex_iterables.iter().map(|e| e.boxed_clone()).collect(),
        ))
    }

    fn init_state(&mut self) -> IterableState {
        for ex_iterable in &mut self.ex_iterables {
            ex_iterable.init_state();
        }
        self.checked = false;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::HorizontallyConcatenated(s) = state else {
            return Err(mismatch(self.name(), "horizontally_concatenated", state));
        };
        load_all(self.name(), &mut self.ex_iterables, &s.ex_iterables)?;
        self.checked = false;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::HorizontallyConcatenated(HorizontallyConcatenatedState {
            ex_iterables: self.ex_iterables.iter().map(|e| e.state()).collect(),
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        if self.ex_iterables.is_empty() {
            return Ok(None);
        }
        let mut keys = Vec::with_capacity(self.ex_iterables.len());
        let mut rows = Vec::with_capacity(self.ex_iterables.len());
        for ex_iterable in &mut self.ex_iterables {
            match ex_iterable.next_row()? {
                Some((key, row)) => {
                    keys.push(key);
                    rows.push(row);
                }
                None => return Ok(None),
            }
        }
        if !self.checked {
            check_column_names(&rows)?;
            self.checked = true;
        }
        let mut merged = Row::new();
        for row in rows {
            merged.extend(row);
        }
        Ok(Some((Key::join(&keys), merged)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::iterable::test_utils::*;
    use crate::iterable::SourceExamplesIterable;

    fn source(rows: Vec<Row>, num_shards: usize) -> BoxedIterable {
        Box::new(SourceExamplesIterable::from_rows(rows, num_shards).unwrap())
    }

    fn ids_from(start: i64, end: i64, num_shards: usize) -> BoxedIterable {
        source((start..end).map(|i| row(json!({ "id": i }))).collect(), num_shards)
    }

    #[test]
    fn test_vertical_chains_sources() {
        let mut it = VerticallyConcatenatedMultiSourcesExamplesIterable::new(vec![
            ids_from(0, 3, 1),
            ids_from(10, 12, 2),
        ]);
        assert_eq!(it.num_shards(), 1);
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![0, 1, 2, 10, 11]);
        assert_resumes_everywhere(&it);
    }

    #[test]
    fn test_vertical_table_path() {
        let tables = |start: i64| {
            let rows: Vec<Row> = (start..start + 2).map(|i| row(json!({ "id": i }))).collect();
            Box::new(
                SourceExamplesIterable::from_record_batches(vec![
                    crate::records::rows_to_table(&rows).unwrap(),
                ])
                .unwrap(),
            ) as BoxedIterable
        };
        let mut it = VerticallyConcatenatedMultiSourcesExamplesIterable::new(vec![tables(0), tables(5)]);
        assert!(it.has_table_path());
        it.init_state();
        let out = drain_tables(&mut it);
        assert_eq!(out.len(), 2);
        assert_eq!(table_ids(&out), vec![0, 1, 5, 6]);

        let mixed = VerticallyConcatenatedMultiSourcesExamplesIterable::new(vec![tables(0), ids_from(0, 1, 1)]);
        assert!(!mixed.has_table_path());
    }

    #[test]
    fn test_vertical_shuffle_permutes_sources() {
        let it = VerticallyConcatenatedMultiSourcesExamplesIterable::new(
            (0..6).map(|i| ids_from(i * 10, i * 10 + 1, 1)).collect(),
        );
        let mut orders = HashSet::new();
        for seed in 0..8 {
            let mut shuffled = it.shuffle_shards(&Generator::new(seed));
            shuffled.init_state();
            let mut ids = drain_ids(shuffled.as_mut());
            orders.insert(ids.clone());
            ids.sort_unstable();
            assert_eq!(ids, vec![0, 10, 20, 30, 40, 50]);
        }
        assert!(orders.len() > 1);
    }

    #[test]
    fn test_horizontal_zips_and_stops_at_first_exhausted() {
        let left = source((0..3).map(|i| row(json!({ "a": i }))).collect(), 1);
        let right = source((0..5).map(|i| row(json!({ "b": i * 10 }))).collect(), 1);
        let mut it = HorizontallyConcatenatedMultiSourcesExamplesIterable::new(vec![left, right]);
        it.init_state();
        let (key, first) = it.next_row().unwrap().unwrap();
        assert_eq!(key.to_string(), "0_0");
        assert_eq!(first, row(json!({"a": 0, "b": 0})));
        assert_eq!(drain_rows(&mut it).len(), 2);
    }

    #[test]
    fn test_horizontal_rejects_duplicate_columns() {
        let mut it = HorizontallyConcatenatedMultiSourcesExamplesIterable::new(vec![
            ids_from(0, 2, 1),
            ids_from(5, 7, 1),
        ]);
        it.init_state();
        assert!(matches!(it.next_row(), Err(StreamError::Config { .. })));
    }

    #[test]
    fn test_horizontal_resume() {
        let left = source((0..4).map(|i| row(json!({ "id": i }))).collect(), 1);
        let right = source((0..4).map(|i| row(json!({ "x": i }))).collect(), 1);
        let it = HorizontallyConcatenatedMultiSourcesExamplesIterable::new(vec![left, right]);
        assert_eq!(it.num_shards(), 1);
        assert_resumes_everywhere(&it);
        let mut shuffled = it.shuffle_shards(&Generator::new(3));
        shuffled.init_state();
        assert_eq!(drain_ids(shuffled.as_mut()), vec![0, 1, 2, 3]);
    }
}
