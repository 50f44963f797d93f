use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Clause, Row, Store, StoreError, Value, cell, matches_all};
use crate::schema::{KeyspaceSchema, TableSchema};

/// One component of a sorted primary key.
#[derive(Clone, Debug, PartialEq, Eq)]
struct KeyPart {
    value: Value,
    descending: bool,
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = self.value.cmp(&other.value);
        if self.descending { ord.reverse() } else { ord }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TableData {
    schema: TableSchema,
    rows: BTreeMap<Vec<KeyPart>, Row>,
}

impl TableData {
    fn key_for(&self, row: &Row) -> Result<Vec<KeyPart>, StoreError> {
        let mut key = Vec::new();
        for col in self.schema.primary_key() {
            let value = cell(row, &col.name);
            if value.is_null() {
                return Err(StoreError::MissingPrimaryKey {
                    table: self.schema.name.clone(),
                    column: col.name.clone(),
                });
            }
            key.push(KeyPart {
                value: value.clone(),
                descending: col.descending,
            });
        }
        Ok(key)
    }

    fn check_columns(&self, row: &Row) -> Result<(), StoreError> {
        for name in row.keys() {
            if self.schema.column(name).is_none() {
                return Err(StoreError::UnknownColumn {
                    table: self.schema.name.clone(),
                    column: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Thread-safe in-memory column store.
///
/// Tables are ordered maps from the encoded primary key to the row, so scans
/// naturally come out in clustering order.
#[derive(Default)]
pub struct MemoryStore {
    keyspaces: RwLock<HashMap<String, HashMap<String, TableData>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of physical rows held for a table.
    pub async fn row_count(&self, keyspace: &str, table: &str) -> usize {
        self.keyspaces
            .read()
            .await
            .get(keyspace)
            .and_then(|tables| tables.get(table))
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

fn unknown_table(keyspace: &str, table: &str) -> StoreError {
    StoreError::UnknownTable {
        keyspace: keyspace.to_string(),
        table: table.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_keyspace(&self, keyspace: &KeyspaceSchema) -> Result<(), StoreError> {
        let mut map = self.keyspaces.write().await;
        let tables = map.entry(keyspace.name.clone()).or_default();
        for schema in &keyspace.tables {
            tables
                .entry(schema.name.clone())
                .or_insert_with(|| TableData {
                    schema: schema.clone(),
                    rows: BTreeMap::new(),
                });
        }
        Ok(())
    }

    async fn drop_keyspace(&self, keyspace: &str) -> Result<(), StoreError> {
        self.keyspaces.write().await.remove(keyspace);
        Ok(())
    }

    async fn keyspaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keyspaces.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn table(&self, keyspace: &str, table: &str) -> Option<TableSchema> {
        self.keyspaces
            .read()
            .await
            .get(keyspace)
            .and_then(|tables| tables.get(table))
            .map(|t| t.schema.clone())
    }

    async fn insert(&self, keyspace: &str, table: &str, row: Row) -> Result<(), StoreError> {
        let mut map = self.keyspaces.write().await;
        let data = map
            .get_mut(keyspace)
            .ok_or_else(|| StoreError::UnknownKeyspace(keyspace.to_string()))?
            .get_mut(table)
            .ok_or_else(|| unknown_table(keyspace, table))?;
        data.check_columns(&row)?;
        let key = data.key_for(&row)?;
        match data.rows.get_mut(&key) {
            Some(existing) => existing.extend(row),
            None => {
                data.rows.insert(key, row);
            }
        }
        Ok(())
    }

    async fn insert_stamped(
        &self,
        keyspace: &str,
        table: &str,
        mut row: Row,
        stamp_column: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut map = self.keyspaces.write().await;
        let data = map
            .get_mut(keyspace)
            .ok_or_else(|| StoreError::UnknownKeyspace(keyspace.to_string()))?
            .get_mut(table)
            .ok_or_else(|| unknown_table(keyspace, table))?;
        row.remove(stamp_column);
        data.check_columns(&row)?;
        if data.schema.column(stamp_column).is_none() {
            return Err(StoreError::UnknownColumn {
                table: table.to_string(),
                column: stamp_column.to_string(),
            });
        }
        let key = data.key_for(&row)?;
        if data.rows.contains_key(&key) {
            return Ok(None);
        }
        // drawn under the write lock, so stamp order is visibility order
        let stamp = Uuid::now_v7();
        row.insert(stamp_column.to_string(), Value::Uuid(stamp));
        data.rows.insert(key, row);
        Ok(Some(stamp))
    }

    async fn select(
        &self,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError> {
        let map = self.keyspaces.read().await;
        let data = map
            .get(keyspace)
            .ok_or_else(|| StoreError::UnknownKeyspace(keyspace.to_string()))?
            .get(table)
            .ok_or_else(|| unknown_table(keyspace, table))?;
        for clause in clauses {
            if data.schema.column(&clause.column).is_none() {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: clause.column.clone(),
                });
            }
        }
        let rows = data
            .rows
            .values()
            .filter(|row| matches_all(clauses, row))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn delete(
        &self,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
    ) -> Result<usize, StoreError> {
        let mut map = self.keyspaces.write().await;
        let data = map
            .get_mut(keyspace)
            .ok_or_else(|| StoreError::UnknownKeyspace(keyspace.to_string()))?
            .get_mut(table)
            .ok_or_else(|| unknown_table(keyspace, table))?;
        let before = data.rows.len();
        data.rows.retain(|_, row| !matches_all(clauses, row));
        Ok(before - data.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{augment_keyspace, parse_keyspace};

    async fn store_with_users() -> MemoryStore {
        let ks = parse_keyspace(
            "app",
            "CREATE TABLE users (id TEXT, name TEXT, age INT, PRIMARY KEY (id))",
        )
        .unwrap();
        let store = MemoryStore::new();
        store.create_keyspace(&augment_keyspace(&ks)).await.unwrap();
        store
    }

    fn version_row(id: &str, version: Uuid, name: Option<&str>) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::from(id));
        row.insert("version".into(), Value::Uuid(version));
        if let Some(n) = name {
            row.insert("name".into(), Value::from(n));
        }
        row
    }

    #[tokio::test]
    async fn scans_return_newest_version_first() {
        let store = store_with_users().await;
        let v1 = Uuid::now_v7();
        let v2 = Uuid::now_v7();
        store
            .insert("app", "users", version_row("a", v1, Some("old")))
            .await
            .unwrap();
        store
            .insert("app", "users", version_row("a", v2, Some("new")))
            .await
            .unwrap();
        store
            .insert("app", "users", version_row("b", v1, Some("bee")))
            .await
            .unwrap();

        let rows = store.select("app", "users", &[], None).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| cell(r, "name").clone()).collect();
        assert_eq!(
            names,
            vec![Value::from("new"), Value::from("old"), Value::from("bee")]
        );
    }

    #[tokio::test]
    async fn insert_merges_and_stamped_insert_keeps_existing() {
        let store = store_with_users().await;
        let v = Uuid::now_v7();
        store
            .insert("app", "users", version_row("a", v, Some("x")))
            .await
            .unwrap();
        let mut partial = version_row("a", v, None);
        partial.insert("age".into(), Value::Int(4));
        store.insert("app", "users", partial).await.unwrap();
        assert!(
            !store
                .insert_stamped("app", "users", version_row("a", v, Some("y")), "parent_timestamp")
                .await
                .unwrap()
                .is_some()
        );

        let rows = store
            .select("app", "users", &[Clause::new("id", "a")], None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(cell(&rows[0], "name"), &Value::from("x"));
        assert_eq!(cell(&rows[0], "age"), &Value::Int(4));
    }

    #[tokio::test]
    async fn stamped_inserts_are_ordered_and_never_overwrite() {
        let store = store_with_users().await;
        let first = store
            .insert_stamped("app", "users", version_row("a", Uuid::now_v7(), None), "parent_timestamp")
            .await
            .unwrap()
            .expect("written");
        let v = Uuid::now_v7();
        let second = store
            .insert_stamped("app", "users", version_row("b", v, Some("x")), "parent_timestamp")
            .await
            .unwrap()
            .expect("written");
        assert!(second > first);
        assert!(
            store
                .insert_stamped("app", "users", version_row("b", v, Some("y")), "parent_timestamp")
                .await
                .unwrap()
                .is_none()
        );
        let rows = store
            .select("app", "users", &[Clause::new("id", "b")], None)
            .await
            .unwrap();
        assert_eq!(cell(&rows[0], "name"), &Value::from("x"));
        assert_eq!(cell(&rows[0], "parent_timestamp"), &Value::Uuid(second));
    }

    #[tokio::test]
    async fn rejects_rows_without_full_primary_key() {
        let store = store_with_users().await;
        let row = Row::from([("id".to_string(), Value::from("a"))]);
        let err = store.insert("app", "users", row).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingPrimaryKey { column, .. } if column == "version"));
    }

    #[tokio::test]
    async fn delete_removes_matching_rows() {
        let store = store_with_users().await;
        store
            .insert("app", "users", version_row("a", Uuid::now_v7(), None))
            .await
            .unwrap();
        store
            .insert("app", "users", version_row("b", Uuid::now_v7(), None))
            .await
            .unwrap();
        let removed = store
            .delete("app", "users", &[Clause::new("id", "a")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.row_count("app", "users").await, 1);
    }
}
