// rust/stream-core/src/iterable/formatted.rs

use super::{BoxedIterable, ExamplesIterable};
use crate::error::Result;
use crate::features::Features;
use crate::formatting::FormattingConfig;
use crate::generator::Generator;
use crate::records::{Key, Row, Table};
use crate::state::IterableState;

/// Projects records onto the dataset's features at the end of a chain.
///
/// Missing columns are filled with nulls, columns are put in schema order
/// and values are cast to the declared types. Rows coming from an operator
/// that already produces typed records are passed through.
pub struct FormattedExamplesIterable {
    ex_iterable: BoxedIterable,
    features: Option<Features>,
    formatting: Option<FormattingConfig>,
}

impl FormattedExamplesIterable {
    pub fn new(
        ex_iterable: BoxedIterable,
        features: Option<Features>,
        formatting: Option<FormattingConfig>,
    ) -> Self {
        Self {
            ex_iterable,
            features,
            formatting,
        }
    }

    pub fn formatting(&self) -> Option<FormattingConfig> {
        self.formatting
    }

    fn rebuild(&self, ex_iterable: BoxedIterable) -> Self {
        Self::new(ex_iterable, self.features.clone(), self.formatting)
    }
}

impl ExamplesIterable for FormattedExamplesIterable {
    fn name(&self) -> &'static str {
        "FormattedExamplesIterable"
    }

    fn num_shards(&self) -> usize {
        self.ex_iterable.num_shards()
    }

    fn has_table_path(&self) -> bool {
        self.ex_iterable.has_table_path() && self.formatting.map_or(true, |f| f.is_table())
    }

    fn is_typed(&self) -> bool {
        self.ex_iterable.is_typed() || self.features.is_some()
    }

    fn features(&self) -> Option<Features> {
        self.features.clone()
    }

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(self.rebuild(self.ex_iterable.shuffle_shards(generator)))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(
            self.rebuild(self.ex_iterable.shard(num_shards, index, contiguous)?),
        ))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(self.rebuild(self.ex_iterable.boxed_clone()))
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
        let Some((key, row)) = self.ex_iterable.next_row()? else {
            return Ok(None);
        };
        match &self.features {
            Some(features) if !self.ex_iterable.is_typed() => Ok(Some((key, features.project_row(row)?))),
            _ => Ok(Some((key, row))),
        }
    }

    fn next_table(&mut self) -> Result<Option<(Key, Table)>> {
        let Some((key, table)) = self.ex_iterable.next_table()? else {
            return Ok(None);
        };
        match &self.features {
            Some(features) => Ok(Some((key, features.project_table(&table)?))),
            None => Ok(Some((key, table))),
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::DataType;
    use serde_json::json;

    use super::*;
    use crate::formatting::FormatType;
    use crate::iterable::test_utils::*;
    use crate::iterable::{RebatchedArrowExamplesIterable, SourceExamplesIterable};
    use crate::records::{column_names, rows_to_table};

    fn features() -> Features {
        Features::new([("id", DataType::Int64), ("score", DataType::Float64)])
    }

    #[test]
    fn test_rows_are_filled_and_cast() {
        let rows = vec![row(json!({"score": 1, "id": 0})), row(json!({"id": 1, "extra": true}))];
        let source = SourceExamplesIterable::from_rows(rows, 1).unwrap();
        let mut it = FormattedExamplesIterable::new(Box::new(source), Some(features()), None);
        assert!(it.is_typed());
        it.init_state();
        let out = drain_rows(&mut it);
        assert_eq!(out[0], row(json!({"id": 0, "score": 1.0})));
        assert_eq!(out[1], row(json!({"id": 1, "score": null})));
        assert_eq!(out[0].keys().next().map(String::as_str), Some("id"));
    }

    #[test]
    fn test_table_path_follows_formatting() {
        let table = rows_to_table(&[row(json!({"id": 3}))]).unwrap();
        let source = SourceExamplesIterable::from_record_batches(vec![table]).unwrap();
        let arrow = FormattingConfig::new(FormatType::Arrow);
        let mut it = FormattedExamplesIterable::new(Box::new(source), Some(features()), Some(arrow));
        assert!(it.has_table_path());
        it.init_state();
        let tables = drain_tables(&mut it);
        assert_eq!(column_names(&tables[0]), vec!["id".to_string(), "score".to_string()]);

        let source = SourceExamplesIterable::from_rows(vec![row(json!({"id": 3}))], 1).unwrap();
        let python = FormattingConfig::new(FormatType::Python);
        let it = FormattedExamplesIterable::new(
            Box::new(RebatchedArrowExamplesIterable::new(Box::new(source), Some(1), false)),
            None,
            Some(python),
        );
        assert!(!it.has_table_path());
    }

    #[test]
    fn test_state_passes_through() {
        let it = FormattedExamplesIterable::new(id_source(5, 2), Some(Features::new([("id", DataType::Int64)])), None);
        assert_resumes_everywhere(&it);
    }
}
