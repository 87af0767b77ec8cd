// ABOUTME: Change records captured from the source log and the batches that carry them
// ABOUTME: Defines table identifiers, primary-key tuples, and CDC operation codes

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::lsn::Lsn;
use crate::utils::validate_identifier;

/// Column name to value mapping. Schema enforcement is left to the mirror's storage.
pub type Columns = serde_json::Map<String, Value>;

/// Identifier of a mirrored table (the source table name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableId(String);

impl TableId {
    pub fn new(name: &str) -> SyncResult<Self> {
        validate_identifier(name)?;
        Ok(Self(name.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TableId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TableId::new(&value)
    }
}

impl From<TableId> for String {
    fn from(value: TableId) -> Self {
        value.0
    }
}

/// One primary-key column value. Only types with a total order are allowed in keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl KeyValue {
    /// Convert a JSON column value into a key value. Floats, arrays and objects
    /// cannot identify a row and yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(KeyValue::Null),
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => n.as_i64().map(KeyValue::Int),
            Value::String(s) => Some(KeyValue::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Null => Value::Null,
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        KeyValue::Bool(value)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => f.write_str("NULL"),
            KeyValue::Bool(b) => write!(f, "{b}"),
            KeyValue::Int(i) => write!(f, "{i}"),
            KeyValue::Text(s) => write!(f, "'{s}'"),
        }
    }
}

/// Ordered tuple of primary-key values identifying one logical row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Vec<KeyValue>);

impl RowKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<KeyValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    /// Split the primary-key columns out of a full row, leaving the non-key columns.
    pub fn extract(primary_key: &[String], row: &mut Columns) -> Result<Self, String> {
        if primary_key.is_empty() {
            return Err("table has no primary key columns".to_string());
        }
        let mut values = Vec::with_capacity(primary_key.len());
        for column in primary_key {
            let value = row
                .remove(column)
                .ok_or_else(|| format!("row is missing primary key column '{column}'"))?;
            let key = KeyValue::from_json(&value).ok_or_else(|| {
                format!("primary key column '{column}' has a non-key value: {value}")
            })?;
            values.push(key);
        }
        Ok(Self(values))
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

/// Kind of captured mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

impl Operation {
    /// Map a CDC `__$operation` code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Operation::Delete),
            2 => Some(Operation::Insert),
            3 => Some(Operation::UpdateBefore),
            4 => Some(Operation::UpdateAfter),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Operation::Delete => 1,
            Operation::Insert => 2,
            Operation::UpdateBefore => 3,
            Operation::UpdateAfter => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::UpdateBefore => "update_before",
            Operation::UpdateAfter => "update_after",
            Operation::Delete => "delete",
        }
    }
}

/// One captured mutation of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: RowKey,
    pub operation: Operation,
    /// Non-key columns. Ignored for deletes.
    pub payload: Option<Columns>,
    pub lsn: Lsn,
    /// Source-assigned tie-breaker among changes at the same LSN.
    pub sequence: u64,
}

impl ChangeRecord {
    pub fn insert(key: RowKey, payload: Columns, lsn: Lsn, sequence: u64) -> Self {
        Self {
            key,
            operation: Operation::Insert,
            payload: Some(payload),
            lsn,
            sequence,
        }
    }

    pub fn update_before(key: RowKey, payload: Columns, lsn: Lsn, sequence: u64) -> Self {
        Self {
            key,
            operation: Operation::UpdateBefore,
            payload: Some(payload),
            lsn,
            sequence,
        }
    }

    pub fn update_after(key: RowKey, payload: Columns, lsn: Lsn, sequence: u64) -> Self {
        Self {
            key,
            operation: Operation::UpdateAfter,
            payload: Some(payload),
            lsn,
            sequence,
        }
    }

    pub fn delete(key: RowKey, lsn: Lsn, sequence: u64) -> Self {
        Self {
            key,
            operation: Operation::Delete,
            payload: None,
            lsn,
            sequence,
        }
    }
}

/// Change records for one table covering `[from_lsn, to_lsn)`.
///
/// `to_lsn` becomes the table's checkpoint once the batch is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub table: TableId,
    pub from_lsn: Lsn,
    pub to_lsn: Lsn,
    pub records: Vec<ChangeRecord>,
}

impl ChangeBatch {
    pub fn new(table: TableId, from_lsn: Lsn, to_lsn: Lsn, records: Vec<ChangeRecord>) -> Self {
        Self {
            table,
            from_lsn,
            to_lsn,
            records,
        }
    }

    pub fn empty(table: TableId, from_lsn: Lsn, to_lsn: Lsn) -> Self {
        Self::new(table, from_lsn, to_lsn, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check that the range is well-formed and every record lies inside it.
    pub fn validate(&self) -> SyncResult<()> {
        if self.to_lsn < self.from_lsn {
            return Err(SyncError::invariant(
                &self.table,
                format!(
                    "batch range is inverted: {} > {}",
                    self.from_lsn, self.to_lsn
                ),
            ));
        }
        for record in &self.records {
            if record.lsn.is_unset() || record.lsn < self.from_lsn || record.lsn >= self.to_lsn {
                return Err(SyncError::invariant(
                    &self.table,
                    format!(
                        "change for key {} at {} lies outside [{}, {})",
                        record.key, record.lsn, self.from_lsn, self.to_lsn
                    ),
                ));
            }
        }
        Ok(())
    }
}
