// rust/stream-core/src/iterable/select.rs

use super::{BoxedIterable, ExamplesIterable};
use crate::error::{Result, StreamError};
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{select_table_columns, Key, Row, Table};
use crate::state::IterableState;

/// Keeps only the given columns, in the given order.
pub struct SelectColumnsIterable {
    ex_iterable: BoxedIterable,
    column_names: Vec<String>,
}

impl SelectColumnsIterable {
    pub fn new(ex_iterable: BoxedIterable, column_names: Vec<String>) -> Self {
        Self {
            ex_iterable,
            column_names,
        }
    }

    fn select_row(&self, mut row: Row) -> Result<Row> {
        let mut out = Row::new();
        for column in &self.column_names {
            let value = row.shift_remove(column).ok_or_else(|| {
                StreamError::schema(format!("column '{column}' not found in the record"))
            })?;
            out.insert(column.clone(), value);
        }
        Ok(out)
    }
}

impl ExamplesIterable for SelectColumnsIterable {
    fn name(&self) -> &'static str {
        "SelectColumnsIterable"
    }

    fn num_shards(&self) -> usize {
        self.ex_iterable.num_shards()
    }

    fn has_table_path(&self) -> bool {
        self.ex_iterable.has_table_path()
    }

    fn is_typed(&self) -> bool {
        self.ex_iterable.is_typed()
    }

    fn features(&self) -> Option<Features> {
        self.ex_iterable
            .features()
            .map(|features| features.select(&self.column_names))
    }

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(Self::new(
            self.ex_iterable.shuffle_shards(generator),
            self.column_names.clone(),
        ))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(Self::new(
            self.ex_iterable.shard(num_shards, index, contiguous)?,
            self.column_names.clone(),
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self::new(
            self.ex_iterable.boxed_clone(),
            self.column_names.clone(),
        ))
    }

    fn init_state(&mut self) -> IterableState {
        self.ex_iterable.init_state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        self.ex_iterable.load_state(state)
    }

    fn state(&self) -> IterableState {
        self.ex_iterable.state()
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        match self.ex_iterable.next_row()? {
            Some((key, row)) => Ok(Some((key, self.select_row(row)?))),
            None => Ok(None),
        }
    }

    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        if !self.ex_iterable.has_table_path() {
            return match self.next_row()? {
                Some((key, row)) => Ok(Some((
                    key,
                    crate::records::rows_to_table(std::slice::from_ref(&row))?,
                ))),
                None => Ok(None),
            };
        }
        while let Some((key, table)) = self.ex_iterable.next_table()? {
            // Empty tables may carry no schema at all.
            if table.num_rows() > 0 {
                return Ok(Some((key, select_table_columns(&table, &self.column_names)?)));
            }
        }
        Ok(None)
    }
}
