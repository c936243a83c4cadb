//! Record normalization
//!
//! Records in one batch may carry different key sets. Before a batch can become a
//! multi-row INSERT it is normalized into a [`ColumnSet`] (the sorted union of every
//! key) and one value per column per record, with absent keys filled by null.

use crate::error::{Result, SinkError};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// One row of input: column name to scalar value
pub type Record = Map<String, Value>;

/// An ordered sequence of records decoded from one unit of work
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Decode a JSON value holding either one object or an array of objects
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(record) => Ok(Self::new(vec![record])),
            Value::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for (idx, item) in items.into_iter().enumerate() {
                    match item {
                        Value::Object(record) => records.push(record),
                        other => {
                            return Err(SinkError::malformed(format!(
                                "element {} is a {}, expected an object",
                                idx,
                                json_type(&other)
                            )))
                        },
                    }
                }
                Ok(Self::new(records))
            },
            other => Err(SinkError::malformed(format!(
                "expected an object or an array of objects, got {}",
                json_type(&other)
            ))),
        }
    }

    /// Decode raw JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

impl From<Vec<Record>> for Batch {
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}

/// Lexicographically sorted, deduplicated union of the keys in a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ColumnSet(Vec<String>);

impl ColumnSet {
    pub fn from_records(records: &[Record]) -> Self {
        let names: BTreeSet<&str> = records
            .iter()
            .flat_map(|record| record.keys().map(String::as_str))
            .collect();
        Self(names.into_iter().map(str::to_string).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl<S: Into<String>> FromIterator<S> for ColumnSet {
    /// Collects, sorts, and deduplicates column names
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let names: BTreeSet<String> = iter.into_iter().map(Into::into).collect();
        Self(names.into_iter().collect())
    }
}

/// A batch aligned to its [`ColumnSet`]: every row has exactly one value per column
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    columns: ColumnSet,
    rows: Vec<Vec<Value>>,
}

impl NormalizedBatch {
    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row-major values in column order; length is `rows * columns`
    pub fn into_values(self) -> Vec<Value> {
        self.rows.into_iter().flatten().collect()
    }
}

/// Derive the column set for `records` and align every record to it.
///
/// The column set is computed once and used for every row, so row `r` column `c`
/// always lands at flat position `r * columns + c`.
pub fn normalize(records: &[Record]) -> NormalizedBatch {
    let columns = ColumnSet::from_records(records);
    let rows = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|col| record.get(col).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    NormalizedBatch { columns, rows }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
