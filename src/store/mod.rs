//! Row-level interface to the underlying column store.
//!
//! PathStore never talks to a storage engine directly. Everything it needs is
//! expressed through the [`Store`] trait: keyspace lifecycle, upserting rows by
//! full primary key, equality-filtered scans in primary-key order and
//! deletes. [`memory::MemoryStore`] is the in-process implementation used by
//! nodes and tests.

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{KeyspaceSchema, TableSchema};

pub mod memory;

/// A single column value.
///
/// The derived ordering is the clustering order used by the store. UUIDs are
/// version 7 and therefore sort by creation time.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

/// A physical row keyed by column name. Absent columns read as [`Value::Null`].
pub type Row = BTreeMap<String, Value>;

static NULL: Value = Value::Null;

/// Read `column` from `row`, treating a missing column as null.
pub fn cell<'a>(row: &'a Row, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&NULL)
}

/// Equality predicate on a single column.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Clause {
    pub column: String,
    pub value: Value,
}

impl Clause {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        cell(row, &self.column) == &self.value
    }
}

/// Return true when every clause holds for `row`.
pub fn matches_all(clauses: &[Clause], row: &Row) -> bool {
    clauses.iter().all(|c| c.matches(row))
}

/// Compare two rows on the given columns only.
pub fn compare_on(columns: &[String], a: &Row, b: &Row) -> Ordering {
    for col in columns {
        match cell(a, col).cmp(cell(b, col)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Errors surfaced by a [`Store`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("keyspace {0} does not exist")]
    UnknownKeyspace(String),
    #[error("table {keyspace}.{table} does not exist")]
    UnknownTable { keyspace: String, table: String },
    #[error("column {column} is not defined on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("primary key column {column} of {table} is missing")]
    MissingPrimaryKey { table: String, column: String },
    #[error("{0}")]
    Other(String),
}

/// Capability surface of the collaborator column store.
///
/// Scans return rows ordered by primary key, with each clustering column in
/// its declared direction. Replicated tables cluster on `version`
/// descending, so the newest version of a key always comes first.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create every table of `keyspace`. Tables that already exist are kept.
    async fn create_keyspace(&self, keyspace: &KeyspaceSchema) -> Result<(), StoreError>;

    /// Drop a keyspace and all of its rows.
    async fn drop_keyspace(&self, keyspace: &str) -> Result<(), StoreError>;

    /// Names of every keyspace currently present.
    async fn keyspaces(&self) -> Vec<String>;

    /// Schema of a single table.
    async fn table(&self, keyspace: &str, table: &str) -> Option<TableSchema>;

    /// Upsert a row by its full primary key. Columns not present in `row`
    /// keep their previous value.
    async fn insert(&self, keyspace: &str, table: &str, row: Row) -> Result<(), StoreError>;

    /// Insert a row only if no row with the same primary key exists, setting
    /// `stamp_column` to a fresh UUIDv7 drawn while the write holds the
    /// table exclusively. Any scan that starts after a stamp was drawn sees
    /// the row carrying it. Returns the stamp when the row was written.
    async fn insert_stamped(
        &self,
        keyspace: &str,
        table: &str,
        row: Row,
        stamp_column: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Rows matching every clause, in primary-key order.
    async fn select(
        &self,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError>;

    /// Physically remove the rows matching every clause. Returns the count.
    async fn delete(
        &self,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
    ) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_order_by_variant_then_content() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::Int(3) < Value::Int(4));
        assert!(Value::Int(100) < Value::Text("a".into()));
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        assert!(Value::Uuid(first) < Value::Uuid(second));
    }

    #[test]
    fn clause_treats_missing_column_as_null() {
        let row = Row::from([("a".to_string(), Value::Int(1))]);
        assert!(Clause::new("a", 1i64).matches(&row));
        assert!(Clause::new("b", Value::Null).matches(&row));
        assert!(!Clause::new("b", 1i64).matches(&row));
    }
}
