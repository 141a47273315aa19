// rust/stream-core/src/records.rs

//! Record model shared by every operator.
//!
//! A stream moves `(Key, Row)` pairs on the row path and `(Key, Table)` pairs
//! on the columnar path. A batch is the columnar transpose of several rows and
//! is represented as a `Row` whose values are JSON arrays of equal length.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use stream_core::records::{batch_to_examples, examples_to_batch, Row};
//!
//! let rows: Vec<Row> = vec![
//!     json!({"a": 1}).as_object().unwrap().clone(),
//!     json!({"a": 2, "b": "x"}).as_object().unwrap().clone(),
//! ];
//! let batch = examples_to_batch(&rows);
//! assert_eq!(batch["b"], json!([null, "x"]));
//! assert_eq!(batch_to_examples(batch).unwrap().len(), 2);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::{concat_batches, filter_record_batch};
use arrow::datatypes::{Field, Schema};
use arrow::error::ArrowError;
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::writer::JsonArray;
use arrow::json::{ReaderBuilder, WriterBuilder};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StreamError};

/// One logical record: an ordered mapping from column name to value.
pub type Row = serde_json::Map<String, Value>;

/// A sliceable, concatenable columnar chunk.
pub type Table = RecordBatch;

/// Identifier attached to each record, used for traceability only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Joins several keys with `_`, the way batched outputs are keyed.
    pub fn join<'a>(keys: impl IntoIterator<Item = &'a Key>) -> Key {
        let parts: Vec<String> = keys.into_iter().map(|k| k.to_string()).collect();
        Key::Str(parts.join("_"))
    }

    /// Appends a suffix to the key, e.g. `key_3` or `key[:2]`.
    pub fn with_suffix(&self, suffix: impl fmt::Display) -> Key {
        Key::Str(format!("{self}{suffix}"))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        // Indices past i64::MAX saturate.
        Key::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value)
    }
}

/// A record as handed to consumers: a row object or a columnar chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Row(Row),
    Table(Table),
}

impl Record {
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Record::Row(row) => Some(row),
            Record::Table(_) => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Record::Row(_) => None,
            Record::Table(table) => Some(table),
        }
    }

    pub fn into_row(self) -> Option<Row> {
        match self {
            Record::Row(row) => Some(row),
            Record::Table(_) => None,
        }
    }

    pub fn into_table(self) -> Option<Table> {
        match self {
            Record::Row(_) => None,
            Record::Table(table) => Some(table),
        }
    }
}

/// Transposes rows into a batch.
///
/// Columns are ordered by first appearance; a row missing a column
/// contributes a null.
pub fn examples_to_batch(examples: &[Row]) -> Row {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for example in examples {
        for column in example.keys() {
            if seen.insert(column.as_str()) {
                columns.push(column.clone());
            }
        }
    }
    let mut batch = Row::new();
    for column in columns {
        let values = examples
            .iter()
            .map(|example| example.get(&column).cloned().unwrap_or(Value::Null))
            .collect();
        batch.insert(column, Value::Array(values));
    }
    batch
}

/// Returns the number of rows in a batch, checking every column is a list
/// of the same length.
///
/// # Errors
///
/// Returns a schema error naming the offending columns.
pub fn batch_len(batch: &Row) -> Result<usize> {
    let mut lengths = Vec::with_capacity(batch.len());
    for (column, value) in batch {
        match value {
            Value::Array(values) => lengths.push((column.as_str(), values.len())),
            other => {
                return Err(StreamError::schema(format!(
                    "batched output column '{column}' must be a list, got {other}"
                )))
            }
        }
    }
    let Some(&(first_column, first_len)) = lengths.first() else {
        return Ok(0);
    };
    let bad: Vec<_> = lengths
        .iter()
        .filter(|(_, len)| *len != first_len)
        .collect();
    if !bad.is_empty() {
        let names: Vec<&str> = bad.iter().map(|(c, _)| *c).collect();
        let lens: Vec<usize> = bad.iter().map(|(_, l)| *l).collect();
        return Err(StreamError::schema(format!(
            "Column lengths mismatch: columns {names:?} have length {lens:?} while {first_column} has length {first_len}"
        )));
    }
    Ok(first_len)
}

/// Fans a batch back out into rows.
pub fn batch_to_examples(batch: Row) -> Result<Vec<Row>> {
    let len = batch_len(&batch)?;
    let mut rows = vec![Row::new(); len];
    for (column, value) in batch {
        if let Value::Array(values) = value {
            for (row, value) in rows.iter_mut().zip(values) {
                row.insert(column.clone(), value);
            }
        }
    }
    Ok(rows)
}

/// Builds a table holding `num_rows` rows and no columns.
pub fn empty_table(num_rows: usize) -> Result<Table> {
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::empty()),
        vec![],
        &options,
    )?)
}

/// Converts rows into one table, inferring the schema from the values.
pub fn rows_to_table(rows: &[Row]) -> Result<Table> {
    if rows.is_empty() {
        return empty_table(0);
    }
    let values = rows
        .iter()
        .map(|row| Ok::<_, ArrowError>(Value::Object(row.clone())));
    let schema = infer_json_schema_from_iterator(values)?;
    if schema.fields().is_empty() {
        return empty_table(rows.len());
    }
    let mut decoder = ReaderBuilder::new(Arc::new(schema))
        .with_batch_size(rows.len())
        .with_coerce_primitive(true)
        .build_decoder()?;
    decoder.serialize(rows)?;
    decoder
        .flush()?
        .ok_or_else(|| StreamError::schema("no rows decoded from a non-empty row list"))
}

/// Converts a table back into rows; nulls are kept as explicit `null`s.
pub fn table_to_rows(table: &Table) -> Result<Vec<Row>> {
    if table.num_rows() == 0 {
        return Ok(Vec::new());
    }
    if table.num_columns() == 0 {
        return Ok(vec![Row::new(); table.num_rows()]);
    }
    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    writer.write(table)?;
    writer.finish()?;
    let buf = writer.into_inner();
    Ok(serde_json::from_slice(&buf)?)
}

/// Concatenates tables in order.
///
/// Tables with identical schemas are concatenated column-wise; otherwise the
/// rows are re-inferred into one schema.
pub fn concat_tables(tables: &[Table]) -> Result<Table> {
    let Some(first) = tables.first() else {
        return empty_table(0);
    };
    let schema = first.schema();
    if tables.iter().all(|t| t.schema() == schema) {
        if schema.fields().is_empty() {
            return empty_table(tables.iter().map(|t| t.num_rows()).sum());
        }
        return Ok(concat_batches(&schema, tables)?);
    }
    let mut rows = Vec::new();
    for table in tables {
        rows.extend(table_to_rows(table)?);
    }
    rows_to_table(&rows)
}

/// Projects a table onto `columns`, in that order.
pub fn select_table_columns(table: &Table, columns: &[String]) -> Result<Table> {
    let schema = table.schema();
    let mut indices = Vec::with_capacity(columns.len());
    for column in columns {
        let idx = schema.index_of(column).map_err(|_| {
            StreamError::schema(format!(
                "column '{column}' not in table with columns {:?}",
                column_names(table)
            ))
        })?;
        indices.push(idx);
    }
    if indices.is_empty() {
        return empty_table(table.num_rows());
    }
    Ok(table.project(&indices)?)
}

/// Drops the given columns; unknown names are ignored.
pub fn remove_table_columns(table: &Table, columns: &[String]) -> Result<Table> {
    let schema = table.schema();
    let indices: Vec<usize> = schema
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| !columns.iter().any(|c| c == f.name()))
        .map(|(i, _)| i)
        .collect();
    if indices.len() == schema.fields().len() {
        return Ok(table.clone());
    }
    if indices.is_empty() {
        return empty_table(table.num_rows());
    }
    Ok(table.project(&indices)?)
}

/// Returns a copy of `table` with `array` appended as column `name`.
pub fn append_column(table: &Table, name: &str, array: ArrayRef) -> Result<Table> {
    if array.len() != table.num_rows() {
        return Err(StreamError::schema(format!(
            "column '{name}' has length {} while the table has {} rows",
            array.len(),
            table.num_rows()
        )));
    }
    let schema = table.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(name, array.data_type().clone(), true));
    let mut columns = table.columns().to_vec();
    columns.push(array);
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Keeps the rows whose mask value is true.
pub fn filter_table(table: &Table, mask: &BooleanArray) -> Result<Table> {
    if table.num_columns() == 0 {
        return empty_table(mask.true_count());
    }
    Ok(filter_record_batch(table, mask)?)
}

pub fn column_names(table: &Table) -> Vec<String> {
    table
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}

/// Splits a table into consecutive slices of at most `max_rows` rows.
pub fn split_table(table: &Table, max_rows: usize) -> Vec<Table> {
    let max_rows = max_rows.max(1);
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < table.num_rows() {
        let len = max_rows.min(table.num_rows() - offset);
        chunks.push(table.slice(offset, len));
        offset += len;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_key_join_and_display() {
        let keys = vec![Key::from(1usize), Key::from("a"), Key::from(3i64)];
        assert_eq!(Key::join(&keys), Key::Str("1_a_3".to_string()));
        assert_eq!(Key::from(7usize).with_suffix("_0").to_string(), "7_0");
    }

    #[test]
    fn test_key_from_huge_index_saturates() {
        assert_eq!(Key::from(usize::MAX), Key::Int(i64::MAX));
        assert_eq!(Key::from(i64::MAX as usize), Key::Int(i64::MAX));
    }

    #[test]
    fn test_examples_to_batch_widens_columns() {
        let rows = vec![row(json!({"a": 1})), row(json!({"b": 2, "a": 3}))];
        let batch = examples_to_batch(&rows);
        let columns: Vec<&String> = batch.keys().collect();
        assert_eq!(columns, vec!["a", "b"]);
        assert_eq!(batch["a"], json!([1, 3]));
        assert_eq!(batch["b"], json!([null, 2]));
    }

    #[test]
    fn test_batch_to_examples() {
        let batch = row(json!({"a": [1, 2], "b": ["x", "y"]}));
        let rows = batch_to_examples(batch).unwrap();
        assert_eq!(rows, vec![row(json!({"a": 1, "b": "x"})), row(json!({"a": 2, "b": "y"}))]);
    }

    #[test]
    fn test_batch_len_mismatch() {
        let batch = row(json!({"a": [1, 2], "b": [1]}));
        let err = batch_len(&batch).unwrap_err();
        assert!(err.to_string().contains("Column lengths mismatch"));

        let batch = row(json!({"a": 1}));
        assert!(batch_len(&batch).is_err());
    }

    #[test]
    fn test_rows_table_conversion() {
        let rows = vec![
            row(json!({"id": 0, "text": "a"})),
            row(json!({"id": 1, "text": null})),
        ];
        let table = rows_to_table(&rows).unwrap();
        assert_eq!(table.num_rows(), 2);
        assert_eq!(column_names(&table), vec!["id", "text"]);

        let back = table_to_rows(&table).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_zero_column_rows() {
        let rows = vec![Row::new(), Row::new(), Row::new()];
        let table = rows_to_table(&rows).unwrap();
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.num_columns(), 0);
        assert_eq!(table_to_rows(&table).unwrap().len(), 3);
    }

    #[test]
    fn test_concat_and_split() {
        let a = rows_to_table(&[row(json!({"x": 1})), row(json!({"x": 2}))]).unwrap();
        let b = rows_to_table(&[row(json!({"x": 3}))]).unwrap();
        let all = concat_tables(&[a, b]).unwrap();
        assert_eq!(all.num_rows(), 3);

        let chunks = split_table(&all, 2);
        assert_eq!(chunks.iter().map(|c| c.num_rows()).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_concat_mismatched_schemas() {
        let a = rows_to_table(&[row(json!({"x": 1}))]).unwrap();
        let b = rows_to_table(&[row(json!({"y": "z"}))]).unwrap();
        let all = concat_tables(&[a, b]).unwrap();
        assert_eq!(all.num_rows(), 2);
        assert_eq!(column_names(&all), vec!["x", "y"]);
    }

    #[test]
    fn test_select_remove_append() {
        let table = rows_to_table(&[row(json!({"a": 1, "b": 2, "c": 3}))]).unwrap();

        let selected = select_table_columns(&table, &["c".to_string(), "a".to_string()]).unwrap();
        assert_eq!(column_names(&selected), vec!["c", "a"]);
        assert!(select_table_columns(&table, &["missing".to_string()]).is_err());

        let removed = remove_table_columns(&table, &["b".to_string(), "zzz".to_string()]).unwrap();
        assert_eq!(column_names(&removed), vec!["a", "c"]);

        let appended =
            append_column(&table, "d", Arc::new(Int64Array::from(vec![4])) as ArrayRef).unwrap();
        assert_eq!(column_names(&appended), vec!["a", "b", "c", "d"]);
        assert!(append_column(&table, "e", Arc::new(Int64Array::from(vec![1, 2]))).is_err());
    }

    #[test]
    fn test_filter_table() {
        let table = rows_to_table(&[row(json!({"a": 1})), row(json!({"a": 2}))]).unwrap();
        let mask = BooleanArray::from(vec![false, true]);
        let filtered = filter_table(&table, &mask).unwrap();
        assert_eq!(table_to_rows(&filtered).unwrap(), vec![row(json!({"a": 2}))]);
    }
}
