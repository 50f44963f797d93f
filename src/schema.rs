//! Keyspace and table schemas, and their augmentation with replication
//! metadata.

use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use sqlparser::ast::{ColumnOption, Expr, Statement, TableConstraint};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Time-ordered id of a row version; last clustering column, descending.
pub const VERSION: &str = "version";
/// Arrival stamp of a row at the replica holding it.
pub const PARENT_TIMESTAMP: &str = "parent_timestamp";
/// Set while the row still has to be pushed to the parent.
pub const DIRTY: &str = "dirty";
/// Tombstone marker.
pub const DELETED: &str = "deleted";
/// Node the version was written on.
pub const NODE: &str = "node";
/// Leading partition key of view tables.
pub const VIEW_ID: &str = "view_id";

/// Columns added to every replicated table, in declaration order.
pub const METADATA_COLUMNS: [&str; 5] = [VERSION, PARENT_TIMESTAMP, DIRTY, DELETED, NODE];

const INDEXED_METADATA: [&str; 4] = [DIRTY, DELETED, PARENT_TIMESTAMP, NODE];
const LOCAL_PREFIX: &str = "local";
const VIEW_PREFIX: &str = "view_";

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("parse: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),
    #[error("unsupported statement: {0}")]
    Unsupported(String),
    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),
    #[error("column {column} of table {table} uses a reserved name")]
    ReservedColumn { table: String, column: String },
    #[error("column {column} of table {table} has unsupported type {data_type}")]
    UnsupportedType {
        table: String,
        column: String,
        data_type: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CqlType {
    Text,
    Int,
    Boolean,
    Uuid,
    TimeUuid,
}

impl CqlType {
    fn from_sql(data_type: &str) -> Option<Self> {
        let lower = data_type.to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();
        match base {
            "text" | "varchar" | "string" | "char" | "character varying" | "ascii" => {
                Some(Self::Text)
            }
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "varint" | "counter" => {
                Some(Self::Int)
            }
            "bool" | "boolean" => Some(Self::Boolean),
            "uuid" => Some(Self::Uuid),
            "timeuuid" => Some(Self::TimeUuid),
            _ => None,
        }
    }

    pub fn as_cql(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Int => "bigint",
            Self::Boolean => "boolean",
            Self::Uuid => "uuid",
            Self::TimeUuid => "timeuuid",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    PartitionKey,
    Clustering,
    Regular,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: CqlType,
    pub kind: ColumnKind,
    /// Position within the partition key or clustering key. Zero for
    /// regular columns.
    pub position: usize,
    pub descending: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Columns carrying a secondary index.
    pub indexes: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn partition(mut self, name: &str, data_type: CqlType) -> Self {
        let position = self.count(ColumnKind::PartitionKey);
        self.push(name, data_type, ColumnKind::PartitionKey, position, false);
        self
    }

    pub fn clustering(mut self, name: &str, data_type: CqlType, descending: bool) -> Self {
        let position = self.count(ColumnKind::Clustering);
        self.push(name, data_type, ColumnKind::Clustering, position, descending);
        self
    }

    pub fn regular(mut self, name: &str, data_type: CqlType) -> Self {
        self.push(name, data_type, ColumnKind::Regular, 0, false);
        self
    }

    fn count(&self, kind: ColumnKind) -> usize {
        self.columns.iter().filter(|c| c.kind == kind).count()
    }

    fn push(
        &mut self,
        name: &str,
        data_type: CqlType,
        kind: ColumnKind,
        position: usize,
        descending: bool,
    ) {
        self.columns.push(ColumnSchema {
            name: name.to_string(),
            data_type,
            kind,
            position,
            descending,
        });
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn keys_of(&self, kind: ColumnKind) -> Vec<&ColumnSchema> {
        let mut cols: Vec<&ColumnSchema> = self.columns.iter().filter(|c| c.kind == kind).collect();
        cols.sort_by_key(|c| c.position);
        cols
    }

    pub fn partition_keys(&self) -> Vec<&ColumnSchema> {
        self.keys_of(ColumnKind::PartitionKey)
    }

    pub fn clustering_keys(&self) -> Vec<&ColumnSchema> {
        self.keys_of(ColumnKind::Clustering)
    }

    /// Partition key columns followed by clustering columns.
    pub fn primary_key(&self) -> Vec<&ColumnSchema> {
        let mut cols = self.partition_keys();
        cols.extend(self.clustering_keys());
        cols
    }

    /// Names of the primary key columns excluding `version`: the identity of
    /// a logical row across all of its versions.
    pub fn row_key(&self) -> Vec<String> {
        self.primary_key()
            .into_iter()
            .filter(|c| c.name != VERSION)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.column(name)
            .is_some_and(|c| c.kind != ColumnKind::Regular)
    }

    /// Whether rows of this table are versioned and replicated.
    pub fn is_replicated(&self) -> bool {
        self.column(VERSION).is_some()
    }

    /// Render a `CREATE TABLE` statement plus its secondary indexes.
    pub fn to_cql(&self, keyspace: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "CREATE TABLE IF NOT EXISTS {keyspace}.{} (", self.name);
        for col in &self.columns {
            let _ = writeln!(out, "    {} {},", col.name, col.data_type.as_cql());
        }
        let partition: Vec<&str> = self
            .partition_keys()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let clustering = self.clustering_keys();
        let mut key = format!("({})", partition.join(", "));
        for c in &clustering {
            key.push_str(", ");
            key.push_str(&c.name);
        }
        let _ = writeln!(out, "    PRIMARY KEY ({key})");
        out.push(')');
        if !clustering.is_empty() {
            let order: Vec<String> = clustering
                .iter()
                .map(|c| format!("{} {}", c.name, if c.descending { "DESC" } else { "ASC" }))
                .collect();
            let _ = write!(out, " WITH CLUSTERING ORDER BY ({})", order.join(", "));
        }
        out.push_str(";\n");
        for idx in &self.indexes {
            let _ = writeln!(out, "CREATE INDEX IF NOT EXISTS ON {keyspace}.{} ({idx});", self.name);
        }
        out
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceSchema {
    pub name: String,
    pub tables: Vec<TableSchema>,
}

impl KeyspaceSchema {
    pub fn new(name: impl Into<String>, tables: Vec<TableSchema>) -> Self {
        Self {
            name: name.into(),
            tables,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn to_cql(&self) -> String {
        let mut out = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': 1}};\n",
            self.name
        );
        for table in &self.tables {
            out.push_str(&table.to_cql(&self.name));
        }
        out
    }
}

fn strip_ident(raw: &str) -> String {
    raw.trim_matches(|c| c == '"' || c == '`')
        .to_lowercase()
}

/// Parse the `CREATE TABLE` statements of an application schema.
///
/// The first column of the primary key is the partition key and any further
/// key columns are clustering columns, ascending. Table names may be
/// qualified; only the last component is kept.
pub fn parse_keyspace(keyspace: &str, ddl: &str) -> Result<KeyspaceSchema, SchemaError> {
    let statements = Parser::parse_sql(&GenericDialect {}, ddl)?;
    let mut tables = Vec::new();
    for stmt in statements {
        let Statement::CreateTable(ct) = stmt else {
            return Err(SchemaError::Unsupported(stmt.to_string()));
        };
        let full_name = ct.name.to_string();
        let name = strip_ident(full_name.rsplit('.').next().unwrap_or(&full_name));

        let mut key: Vec<String> = Vec::new();
        for constr in &ct.constraints {
            if let TableConstraint::PrimaryKey { columns, .. } = constr {
                for ic in columns {
                    if let Expr::Identifier(id) = &ic.column.expr {
                        key.push(id.value.to_lowercase());
                    }
                }
            }
        }
        if key.is_empty() {
            for col in &ct.columns {
                for opt in &col.options {
                    if let ColumnOption::Unique {
                        is_primary: true, ..
                    } = opt.option
                    {
                        key.push(col.name.value.to_lowercase());
                    }
                }
            }
        }
        if key.is_empty() {
            return Err(SchemaError::NoPrimaryKey(name));
        }

        let mut table = TableSchema::new(name.clone());
        for col in &ct.columns {
            let col_name = col.name.value.to_lowercase();
            if METADATA_COLUMNS.contains(&col_name.as_str()) || col_name == VIEW_ID {
                return Err(SchemaError::ReservedColumn {
                    table: name.clone(),
                    column: col_name,
                });
            }
            let raw_type = col.data_type.to_string();
            let data_type =
                CqlType::from_sql(&raw_type).ok_or_else(|| SchemaError::UnsupportedType {
                    table: name.clone(),
                    column: col_name.clone(),
                    data_type: raw_type.clone(),
                })?;
            match key.iter().position(|k| k == &col_name) {
                Some(0) => table = table.partition(&col_name, data_type),
                Some(_) => {}
                None => table = table.regular(&col_name, data_type),
            }
        }
        // clustering columns are appended in primary key order, not column order
        for ck in key.iter().skip(1) {
            let Some(col) = ct.columns.iter().find(|c| &c.name.value.to_lowercase() == ck) else {
                return Err(SchemaError::NoPrimaryKey(name));
            };
            let raw_type = col.data_type.to_string();
            let data_type =
                CqlType::from_sql(&raw_type).ok_or_else(|| SchemaError::UnsupportedType {
                    table: name.clone(),
                    column: ck.clone(),
                    data_type: raw_type.clone(),
                })?;
            table = table.clustering(ck, data_type, false);
        }
        tables.push(table);
    }
    Ok(KeyspaceSchema::new(keyspace, tables))
}

fn is_local(table: &TableSchema) -> bool {
    table.name.starts_with(LOCAL_PREFIX)
}

fn with_metadata(mut table: TableSchema) -> TableSchema {
    table = table
        .clustering(VERSION, CqlType::TimeUuid, true)
        .regular(PARENT_TIMESTAMP, CqlType::TimeUuid)
        .regular(DIRTY, CqlType::Boolean)
        .regular(DELETED, CqlType::Boolean)
        .regular(NODE, CqlType::Int);
    table.indexes = INDEXED_METADATA.iter().map(|c| c.to_string()).collect();
    table
}

/// Augment a replicated table: metadata columns, `version` as the last
/// clustering column (descending) and indexes on the metadata.
pub fn augment_table(base: &TableSchema) -> TableSchema {
    with_metadata(base.clone())
}

/// Build the `view_` companion of a table. Its partition key is `view_id`
/// followed by the base partition key; clustering columns are the base
/// clustering columns. Key membership is decided by explicit column kind for
/// both the base and the view table.
pub fn view_table(base: &TableSchema) -> TableSchema {
    let mut view =
        TableSchema::new(format!("{VIEW_PREFIX}{}", base.name)).partition(VIEW_ID, CqlType::Uuid);
    for col in base.partition_keys() {
        view = view.partition(&col.name, col.data_type);
    }
    for col in base.clustering_keys() {
        view = view.clustering(&col.name, col.data_type, col.descending);
    }
    for col in base.columns.iter().filter(|c| c.kind == ColumnKind::Regular) {
        view = view.regular(&col.name, col.data_type);
    }
    with_metadata(view)
}

/// Augment every non-local table of a keyspace and add its view table.
/// Local tables are carried over untouched.
pub fn augment_keyspace(keyspace: &KeyspaceSchema) -> KeyspaceSchema {
    let mut tables = Vec::new();
    for table in &keyspace.tables {
        if is_local(table) {
            tables.push(table.clone());
            continue;
        }
        tables.push(augment_table(table));
        tables.push(view_table(table));
    }
    KeyspaceSchema::new(keyspace.name.clone(), tables)
}

/// Registry of the keyspaces loaded on this node.
#[derive(Default)]
pub struct SchemaInfo {
    keyspaces: RwLock<HashMap<String, Arc<KeyspaceSchema>>>,
}

impl SchemaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, keyspace: KeyspaceSchema) {
        if let Ok(mut map) = self.keyspaces.write() {
            map.insert(keyspace.name.clone(), Arc::new(keyspace));
        }
    }

    pub fn unregister(&self, keyspace: &str) {
        if let Ok(mut map) = self.keyspaces.write() {
            map.remove(keyspace);
        }
    }

    pub fn keyspace(&self, keyspace: &str) -> Option<Arc<KeyspaceSchema>> {
        self.keyspaces
            .read()
            .ok()
            .and_then(|map| map.get(keyspace).cloned())
    }

    pub fn table(&self, keyspace: &str, table: &str) -> Option<TableSchema> {
        self.keyspace(keyspace)
            .and_then(|ks| ks.table(table).cloned())
    }

    pub fn has_keyspace(&self, keyspace: &str) -> bool {
        self.keyspace(keyspace).is_some()
    }

    pub fn has_table(&self, keyspace: &str, table: &str) -> bool {
        self.table(keyspace, table).is_some()
    }

    pub fn keyspaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .keyspaces
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DDL: &str = "CREATE TABLE users (id TEXT, name TEXT, age INT, PRIMARY KEY (id));
        CREATE TABLE events (owner TEXT, at INT, body TEXT, PRIMARY KEY (owner, at));
        CREATE TABLE local_prefs (k TEXT PRIMARY KEY, v TEXT);";

    #[test]
    fn parses_partition_and_clustering_keys() {
        let ks = parse_keyspace("app", DDL).unwrap();
        let events = ks.table("events").unwrap();
        assert_eq!(events.partition_keys()[0].name, "owner");
        assert_eq!(events.clustering_keys()[0].name, "at");
        let prefs = ks.table("local_prefs").unwrap();
        assert_eq!(prefs.partition_keys()[0].name, "k");
    }

    #[test]
    fn augmentation_adds_metadata_and_version_clustering() {
        let ks = augment_keyspace(&parse_keyspace("app", DDL).unwrap());
        let events = ks.table("events").unwrap();
        for col in METADATA_COLUMNS {
            assert!(events.column(col).is_some(), "missing {col}");
        }
        let clustering = events.clustering_keys();
        let last = clustering.last().unwrap();
        assert_eq!(last.name, VERSION);
        assert!(last.descending);
        assert_eq!(events.row_key(), vec!["owner".to_string(), "at".to_string()]);
        assert_eq!(events.indexes.len(), 4);

        let cql = events.to_cql("app");
        assert!(cql.contains("PRIMARY KEY ((owner), at, version)"));
        assert!(cql.contains("version DESC"));
        let metadata_lines = cql
            .lines()
            .filter(|l| {
                let name = l.trim().split_whitespace().next().unwrap_or_default();
                METADATA_COLUMNS.contains(&name)
            })
            .count();
        assert_eq!(metadata_lines, 5);
        for original in ["owner", "at", "body"] {
            assert!(cql.contains(&format!("    {original} ")));
        }

        let script = ks.to_cql();
        assert!(script.starts_with("CREATE KEYSPACE IF NOT EXISTS app "));
        assert!(script.contains(&cql));
    }

    #[test]
    fn local_tables_are_not_augmented() {
        let ks = augment_keyspace(&parse_keyspace("app", DDL).unwrap());
        let prefs = ks.table("local_prefs").unwrap();
        assert!(!prefs.is_replicated());
        assert!(ks.table("view_local_prefs").is_none());
    }

    #[test]
    fn view_tables_lead_with_view_id() {
        let ks = augment_keyspace(&parse_keyspace("app", DDL).unwrap());
        let view = ks.table("view_events").unwrap();
        let partition: Vec<_> = view.partition_keys().iter().map(|c| c.name.clone()).collect();
        assert_eq!(partition, vec![VIEW_ID.to_string(), "owner".to_string()]);
        let clustering: Vec<_> = view.clustering_keys().iter().map(|c| c.name.clone()).collect();
        assert_eq!(clustering, vec!["at".to_string(), VERSION.to_string()]);
    }

    #[test]
    fn reserved_column_names_are_rejected() {
        let err = parse_keyspace("app", "CREATE TABLE t (id TEXT, dirty BOOLEAN, PRIMARY KEY (id))")
            .unwrap_err();
        assert!(matches!(err, SchemaError::ReservedColumn { column, .. } if column == "dirty"));
    }
}
