//! Coordination tables shared by every node of the tree.
//!
//! `pathstore_applications` is an ordinary replicated keyspace: it is read and
//! written through [`crate::access::DataAccess`] and travels between nodes with
//! the same push/pull machinery as application data. `pathstore_local` holds
//! node-private state and is never augmented.

use crate::{
    schema::{CqlType, KeyspaceSchema, SchemaInfo, TableSchema, augment_keyspace},
    store::{Store, StoreError},
};

pub const APPLICATIONS_KEYSPACE: &str = "pathstore_applications";
pub const LOCAL_KEYSPACE: &str = "pathstore_local";

pub const DEPLOYMENT: &str = "deployment";
pub const NODE_SCHEMAS: &str = "node_schemas";
pub const APPS: &str = "apps";
pub const SERVERS: &str = "servers";
pub const APPLICATION_CREDENTIALS: &str = "application_credentials";
pub const APPLICATION_LEASE_TIME: &str = "application_lease_time";
pub const LOCAL_AUTH: &str = "local_auth";

pub mod columns {
    pub const PARENT_NODE_ID: &str = "parent_node_id";
    pub const NEW_NODE_ID: &str = "new_node_id";
    pub const PROCESS_STATUS: &str = "process_status";
    pub const WAIT_FOR: &str = "wait_for";
    pub const SERVER_UUID: &str = "server_uuid";
    pub const NODE_ID: &str = "node_id";
    pub const KEYSPACE_NAME: &str = "keyspace_name";
    pub const AUGMENTED_SCHEMA: &str = "augmented_schema";
    pub const IP: &str = "ip";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const SSH_PORT: &str = "ssh_port";
    pub const GRPC_PORT: &str = "grpc_port";
    pub const NAME: &str = "name";
    pub const IS_SUPER_USER: &str = "is_super_user";
    pub const CLIENT_LEASE_TIME: &str = "client_lease_time";
    pub const SERVER_ADDITIONAL_TIME: &str = "server_additional_time";
    pub const ROLE: &str = "role";
    pub const SEARCHABLE: &str = "searchable";
}

use columns::*;

/// Augmented schema of the replicated coordination keyspace.
pub fn applications_keyspace() -> KeyspaceSchema {
    let tables = vec![
        TableSchema::new(DEPLOYMENT)
            .partition(PARENT_NODE_ID, CqlType::Int)
            .clustering(NEW_NODE_ID, CqlType::Int, false)
            .regular(PROCESS_STATUS, CqlType::Text)
            .regular(WAIT_FOR, CqlType::Text)
            .regular(SERVER_UUID, CqlType::Uuid),
        TableSchema::new(NODE_SCHEMAS)
            .partition(NODE_ID, CqlType::Int)
            .clustering(KEYSPACE_NAME, CqlType::Text, false)
            .regular(PROCESS_STATUS, CqlType::Text)
            .regular(WAIT_FOR, CqlType::Text),
        TableSchema::new(APPS)
            .partition(KEYSPACE_NAME, CqlType::Text)
            .regular(AUGMENTED_SCHEMA, CqlType::Text),
        TableSchema::new(SERVERS)
            .partition(SERVER_UUID, CqlType::Uuid)
            .regular(IP, CqlType::Text)
            .regular(USERNAME, CqlType::Text)
            .regular(PASSWORD, CqlType::Text)
            .regular(SSH_PORT, CqlType::Int)
            .regular(GRPC_PORT, CqlType::Int)
            .regular(NAME, CqlType::Text),
        TableSchema::new(APPLICATION_CREDENTIALS)
            .partition(KEYSPACE_NAME, CqlType::Text)
            .regular(PASSWORD, CqlType::Text)
            .regular(IS_SUPER_USER, CqlType::Boolean),
        TableSchema::new(APPLICATION_LEASE_TIME)
            .partition(KEYSPACE_NAME, CqlType::Text)
            .regular(CLIENT_LEASE_TIME, CqlType::Int)
            .regular(SERVER_ADDITIONAL_TIME, CqlType::Int),
    ];
    let mut keyspace = augment_keyspace(&KeyspaceSchema::new(APPLICATIONS_KEYSPACE, tables));
    // coordination tables are never queried through views
    keyspace.tables.retain(|t| !t.name.starts_with("view_"));
    keyspace
}

/// Node-private keyspace holding the credential write-through table.
pub fn local_keyspace() -> KeyspaceSchema {
    KeyspaceSchema::new(
        LOCAL_KEYSPACE,
        vec![
            TableSchema::new(LOCAL_AUTH)
                .partition(ROLE, CqlType::Text)
                .clustering(SEARCHABLE, CqlType::Text, false)
                .clustering(USERNAME, CqlType::Text, false)
                .regular(PASSWORD, CqlType::Text),
        ],
    )
}

/// Create both coordination keyspaces and register the replicated one so
/// that it is pushed and pulled like application data.
pub async fn install(store: &dyn Store, schemas: &SchemaInfo) -> Result<(), StoreError> {
    let applications = applications_keyspace();
    store.create_keyspace(&applications).await?;
    store.create_keyspace(&local_keyspace()).await?;
    schemas.register(applications);
    Ok(())
}

/// Encode a wait-for list as stored in the `wait_for` column.
pub fn encode_wait_for(ids: &[i32]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode a `wait_for` column. Malformed entries are skipped.
pub fn decode_wait_for(raw: &str) -> Vec<i32> {
    raw.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::VERSION;

    #[test]
    fn coordination_tables_are_versioned() {
        let ks = applications_keyspace();
        assert_eq!(ks.tables.len(), 6);
        for table in &ks.tables {
            assert!(table.column(VERSION).is_some(), "{} not augmented", table.name);
        }
        assert!(!local_keyspace().tables[0].is_replicated());
    }

    #[tokio::test]
    async fn install_registers_only_the_replicated_keyspace() {
        let store = crate::store::memory::MemoryStore::new();
        let schemas = SchemaInfo::new();
        install(&store, &schemas).await.unwrap();
        assert_eq!(schemas.keyspaces(), vec![APPLICATIONS_KEYSPACE.to_string()]);
        assert!(store.table(LOCAL_KEYSPACE, LOCAL_AUTH).await.is_some());
    }

    #[test]
    fn wait_for_round_trips_and_skips_garbage() {
        assert_eq!(decode_wait_for(&encode_wait_for(&[1, -1, 7])), vec![1, -1, 7]);
        assert_eq!(decode_wait_for("3,,x, 4"), vec![3, 4]);
        assert!(decode_wait_for("").is_empty());
    }
}
