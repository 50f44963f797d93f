//! Versioned reads and writes on the local replica.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    cache::{CacheError, QueryCache},
    merge::{MergeError, MergedRows},
    schema::{DELETED, DIRTY, METADATA_COLUMNS, NODE, PARENT_TIMESTAMP, SchemaInfo, TableSchema, VERSION},
    store::{Clause, Row, Store, StoreError, Value, cell},
};

#[derive(thiserror::Error, Debug)]
pub enum AccessError {
    #[error("table {keyspace}.{table} is not known on this node")]
    UnknownTable { keyspace: String, table: String },
    #[error("key column {column} of {table} must be set")]
    MissingKey { table: String, column: String },
    #[error("column {0} is managed by the replication layer")]
    ReservedColumn(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Application-facing view of the local replica.
///
/// Writes append a new version stamped with this node's id. Reads on
/// replicated tables first bring the query cache up to date and then merge
/// the stored versions into one row per key.
pub struct DataAccess {
    store: Arc<dyn Store>,
    schemas: Arc<SchemaInfo>,
    cache: Arc<QueryCache>,
    node_id: i32,
    is_root: bool,
}

impl DataAccess {
    pub fn new(
        store: Arc<dyn Store>,
        schemas: Arc<SchemaInfo>,
        cache: Arc<QueryCache>,
        node_id: i32,
        is_root: bool,
    ) -> Self {
        Self {
            store,
            schemas,
            cache,
            node_id,
            is_root,
        }
    }

    pub fn node_id(&self) -> i32 {
        self.node_id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn schemas(&self) -> &Arc<SchemaInfo> {
        &self.schemas
    }

    async fn schema(&self, keyspace: &str, table: &str) -> Result<TableSchema, AccessError> {
        if let Some(schema) = self.schemas.table(keyspace, table) {
            return Ok(schema);
        }
        self.store
            .table(keyspace, table)
            .await
            .ok_or_else(|| AccessError::UnknownTable {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
            })
    }

    /// Read the current rows matching `clauses`. `limit` counts merged rows.
    pub async fn select(
        &self,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, AccessError> {
        let schema = self.schema(keyspace, table).await?;
        if !schema.is_replicated() {
            return Ok(self.store.select(keyspace, table, clauses, limit).await?);
        }
        self.cache
            .update_cache(keyspace, table, clauses, limit)
            .await?;
        self.merge_local(keyspace, &schema, clauses, limit).await
    }

    /// Read without consulting the parent.
    pub async fn select_local(
        &self,
        keyspace: &str,
        table: &str,
        clauses: &[Clause],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, AccessError> {
        let schema = self.schema(keyspace, table).await?;
        if !schema.is_replicated() {
            return Ok(self.store.select(keyspace, table, clauses, limit).await?);
        }
        self.merge_local(keyspace, &schema, clauses, limit).await
    }

    async fn merge_local(
        &self,
        keyspace: &str,
        schema: &TableSchema,
        clauses: &[Clause],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, AccessError> {
        // a filter on a non-key column can match an old version of a key
        // while skipping its newer ones
        let log_breaking = clauses.iter().any(|c| !schema.is_key_column(&c.column));
        let raw = self
            .store
            .select(keyspace, &schema.name, clauses, None)
            .await?;
        let merged = MergedRows::new(
            self.store.clone(),
            keyspace,
            schema,
            raw,
            Some(clauses),
            log_breaking,
        )?;
        Ok(merged.collect(limit).await?)
    }

    /// Write a new version carrying every column in `row`.
    pub async fn insert(&self, keyspace: &str, table: &str, row: Row) -> Result<Uuid, AccessError> {
        self.write_version(keyspace, table, row, false).await
    }

    /// Write a new version that only sets `changes` on the key in `key`.
    /// Columns left out keep their value through the merge.
    pub async fn update(
        &self,
        keyspace: &str,
        table: &str,
        key: Row,
        changes: Row,
    ) -> Result<Uuid, AccessError> {
        let mut row = changes;
        row.extend(key);
        self.write_version(keyspace, table, row, false).await
    }

    /// Write a tombstone for the key in `key`.
    pub async fn delete(&self, keyspace: &str, table: &str, key: Row) -> Result<Uuid, AccessError> {
        let schema = self.schema(keyspace, table).await?;
        let row_key = schema.row_key();
        let key: Row = key
            .into_iter()
            .filter(|(col, _)| row_key.contains(col))
            .collect();
        self.write_version(keyspace, table, key, true).await
    }

    async fn write_version(
        &self,
        keyspace: &str,
        table: &str,
        mut row: Row,
        deleted: bool,
    ) -> Result<Uuid, AccessError> {
        let schema = self.schema(keyspace, table).await?;
        if !schema.is_replicated() {
            self.store.insert(keyspace, table, row).await?;
            return Ok(Uuid::nil());
        }
        if let Some(col) = METADATA_COLUMNS.iter().find(|c| row.contains_key(**c)) {
            return Err(AccessError::ReservedColumn(col.to_string()));
        }
        for column in schema.row_key() {
            if cell(&row, &column).is_null() {
                return Err(AccessError::MissingKey {
                    table: schema.name.clone(),
                    column,
                });
            }
        }
        let version = Uuid::now_v7();
        row.insert(VERSION.into(), Value::Uuid(version));
        row.insert(DIRTY.into(), Value::Bool(!self.is_root));
        row.insert(DELETED.into(), Value::Bool(deleted));
        row.insert(NODE.into(), Value::Int(self.node_id as i64));
        self.store
            .insert_stamped(keyspace, table, row, PARENT_TIMESTAMP)
            .await?;
        Ok(version)
    }
}
