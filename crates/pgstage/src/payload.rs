//! Units of work and their decoding
//!
//! Units travel between stages as opaque JSON bytes. A write stage decodes each unit
//! into a [`WriteRequest`]: either plain row data for the stage's own table, or an
//! explicit [`WriteTargetOverride`] naming another table for this unit only.

use crate::error::Result;
use crate::record::Batch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One opaque unit of work flowing between stages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_json(value: &Value) -> Self {
        Self(value.to_string().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the bytes as JSON; failure is `MalformedInput`
    pub fn parse(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::from_json(&value)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes())
    }
}

/// Payload shape that redirects one unit's write to another table.
///
/// Only an object with exactly these two fields decodes as an override, so row data
/// that happens to contain a `table_name` column alongside other columns stays row data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteTargetOverride {
    #[serde(alias = "tableName")]
    pub table_name: String,
    #[serde(alias = "insertData")]
    pub insert_data: Value,
}

impl WriteTargetOverride {
    fn is_usable(&self) -> bool {
        let has_data = match &self.insert_data {
            Value::Array(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
            _ => false,
        };
        !self.table_name.trim().is_empty() && has_data
    }
}

/// A decoded write stage input
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// Write `batch` into `table` instead of the stage default
    Override { table: String, batch: Batch },
    /// Write the unit itself into the stage default table
    Rows(Batch),
}

impl WriteRequest {
    pub fn decode(payload: &Payload) -> Result<Self> {
        Self::from_value(payload.parse()?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match serde_json::from_value::<WriteTargetOverride>(value.clone()) {
            Ok(over) if over.is_usable() => Ok(WriteRequest::Override {
                table: over.table_name,
                batch: Batch::from_value(over.insert_data)?,
            }),
            _ => Ok(WriteRequest::Rows(Batch::from_value(value)?)),
        }
    }

    pub fn batch(&self) -> &Batch {
        match self {
            WriteRequest::Override { batch, .. } | WriteRequest::Rows(batch) => batch,
        }
    }

    /// Table named by an override, if any
    pub fn override_table(&self) -> Option<&str> {
        match self {
            WriteRequest::Override { table, .. } => Some(table),
            WriteRequest::Rows(_) => None,
        }
    }
}
