// rust/stream-core/src/features.rs

//! Column typing for pipelines.
//!
//! `Features` is an ordered list of column names with their Arrow data type.
//! It acts as the pipeline's feature projector: records are padded with nulls
//! for missing columns, reordered into schema order and cast to the declared
//! types.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::new_null_array;
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::record_batch::RecordBatch;
use serde_json::{Number, Value};

use crate::error::{Result, StreamError};
use crate::records::{empty_table, Row, Table};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Features {
    fields: Vec<(String, DataType)>,
}

impl Features {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = (S, DataType)>) -> Self {
        Self {
            fields: fields.into_iter().map(|(n, t)| (n.into(), t)).collect(),
        }
    }

    pub fn from_schema(schema: &Schema) -> Self {
        Self::new(
            schema
                .fields()
                .iter()
                .map(|f| (f.name().clone(), f.data_type().clone())),
        )
    }

    /// Infers features from a handful of rows.
    pub fn infer_from_rows(rows: &[Row]) -> Result<Self> {
        let values = rows
            .iter()
            .map(|row| Ok::<_, ArrowError>(Value::Object(row.clone())));
        let schema = infer_json_schema_from_iterator(values)?;
        Ok(Self::from_schema(&schema))
    }

    pub fn to_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.fields
                .iter()
                .map(|(name, dtype)| Field::new(name, dtype.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == column)
    }

    pub fn get(&self, column: &str) -> Option<&DataType> {
        self.fields
            .iter()
            .find(|(n, _)| n == column)
            .map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, DataType)> {
        self.fields.iter()
    }

    /// Sets the type of `column`, appending it when absent.
    pub fn insert(&mut self, column: impl Into<String>, dtype: DataType) {
        let column = column.into();
        match self.fields.iter_mut().find(|(n, _)| *n == column) {
            Some(entry) => entry.1 = dtype,
            None => self.fields.push((column, dtype)),
        }
    }

    pub fn remove(&mut self, column: &str) {
        self.fields.retain(|(n, _)| n != column);
    }

    pub fn rename(&mut self, from: &str, to: &str) {
        for (name, _) in self.fields.iter_mut() {
            if name == from {
                *name = to.to_string();
            }
        }
    }

    /// Keeps only `columns`, in the order given. Unknown names are skipped.
    pub fn select(&self, columns: &[String]) -> Self {
        Self {
            fields: columns
                .iter()
                .filter_map(|c| self.get(c).map(|t| (c.clone(), t.clone())))
                .collect(),
        }
    }

    /// Merges several feature sets into their union, by order of first
    /// appearance.
    ///
    /// # Errors
    ///
    /// Returns a config error when one column has two different non-null
    /// types.
    pub fn align(features: &[Features]) -> Result<Self> {
        let mut merged = Features::default();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for set in features {
            for (name, dtype) in &set.fields {
                match positions.get(name) {
                    None => {
                        positions.insert(name.clone(), merged.fields.len());
                        merged.fields.push((name.clone(), dtype.clone()));
                    }
                    Some(&idx) => {
                        let existing = &merged.fields[idx].1;
                        if *existing == DataType::Null {
                            merged.fields[idx].1 = dtype.clone();
                        } else if *dtype != DataType::Null && existing != dtype {
                            return Err(StreamError::config(format!(
                                "The features can't be aligned because the key {name} of features has type {existing} while it is {dtype} in another dataset"
                            )));
                        }
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Projects a row onto these features.
    pub fn project_row(&self, mut row: Row) -> Result<Row> {
        let mut out = Row::new();
        for (name, dtype) in &self.fields {
            let value = row.remove(name).unwrap_or(Value::Null);
            out.insert(name.clone(), cast_value(value, dtype, name)?);
        }
        Ok(out)
    }

    /// Projects a table onto these features, adding null columns and casting.
    pub fn project_table(&self, table: &Table) -> Result<Table> {
        if self.fields.is_empty() {
            return empty_table(table.num_rows());
        }
        let schema = table.schema();
        let mut columns = Vec::with_capacity(self.fields.len());
        for (name, dtype) in &self.fields {
            let column = match schema.index_of(name) {
                Ok(idx) => {
                    let array = table.column(idx);
                    if array.data_type() == dtype {
                        array.clone()
                    } else {
                        cast(array.as_ref(), dtype)?
                    }
                }
                Err(_) => new_null_array(dtype, table.num_rows()),
            };
            columns.push(column);
        }
        Ok(RecordBatch::try_new(self.to_schema(), columns)?)
    }
}

fn cast_error(value: &Value, dtype: &DataType, column: &str) -> StreamError {
    StreamError::schema(format!(
        "cannot cast value {value} of column '{column}' to {dtype}"
    ))
}

/// Casts one JSON value to `dtype`. Types without a JSON rule pass through.
pub fn cast_value(value: Value, dtype: &DataType, column: &str) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    match dtype {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {
            let as_int = match &value {
                Value::Number(n) if n.is_i64() || n.is_u64() => return Ok(value),
                Value::Number(n) => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| f as i64),
                Value::Bool(b) => Some(i64::from(*b)),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            as_int
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| cast_error(&value, dtype, column))
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let as_float = match &value {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            as_float
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| cast_error(&value, dtype, column))
        }
        DataType::Utf8 | DataType::LargeUtf8 => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(cast_error(&other, dtype, column)),
        },
        DataType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) if s == "true" || s == "false" => Ok(Value::Bool(s == "true")),
            _ => Err(cast_error(&value, dtype, column)),
        },
        DataType::List(field) | DataType::LargeList(field) => match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| cast_value(item, field.data_type(), column))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Err(cast_error(&other, dtype, column)),
        },
        _ => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{rows_to_table, table_to_rows};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_infer_from_rows() {
        let features = Features::infer_from_rows(&[row(json!({"id": 1, "text": "a"}))]).unwrap();
        assert_eq!(features.column_names(), vec!["id", "text"]);
        assert_eq!(features.get("id"), Some(&DataType::Int64));
        assert_eq!(features.get("text"), Some(&DataType::Utf8));
    }

    #[test]
    fn test_project_row_fills_orders_and_casts() {
        let features = Features::new([
            ("label", DataType::Float64),
            ("text", DataType::Utf8),
            ("extra", DataType::Int64),
        ]);
        let projected = features
            .project_row(row(json!({"text": 5, "label": 1, "dropped": true})))
            .unwrap();
        assert_eq!(
            serde_json::to_string(&projected).unwrap(),
            r#"{"label":1.0,"text":"5","extra":null}"#
        );
    }

    #[test]
    fn test_project_row_cast_failure() {
        let features = Features::new([("n", DataType::Int64)]);
        let err = features.project_row(row(json!({"n": "abc"}))).unwrap_err();
        assert!(matches!(err, StreamError::Schema { .. }));
    }

    #[test]
    fn test_project_table() {
        let table = rows_to_table(&[row(json!({"b": 1})), row(json!({"b": 2}))]).unwrap();
        let features = Features::new([("a", DataType::Utf8), ("b", DataType::Float64)]);
        let projected = features.project_table(&table).unwrap();
        assert_eq!(projected.schema().field(1).data_type(), &DataType::Float64);
        assert_eq!(
            table_to_rows(&projected).unwrap(),
            vec![row(json!({"a": null, "b": 1.0})), row(json!({"a": null, "b": 2.0}))]
        );
    }

    #[test]
    fn test_align() {
        let a = Features::new([("id", DataType::Int64), ("x", DataType::Null)]);
        let b = Features::new([("x", DataType::Utf8), ("y", DataType::Boolean)]);
        let aligned = Features::align(&[a, b]).unwrap();
        assert_eq!(aligned.column_names(), vec!["id", "x", "y"]);
        assert_eq!(aligned.get("x"), Some(&DataType::Utf8));

        let c = Features::new([("id", DataType::Utf8)]);
        let d = Features::new([("id", DataType::Int64)]);
        assert!(Features::align(&[c, d]).is_err());
    }

    #[test]
    fn test_edit_operations() {
        let mut features = Features::new([("a", DataType::Int64), ("b", DataType::Utf8)]);
        features.rename("a", "z");
        features.insert("c", DataType::Boolean);
        features.remove("b");
        assert_eq!(features.column_names(), vec!["z", "c"]);
        assert_eq!(features.select(&["c".to_string()]).column_names(), vec!["c"]);
    }
}
