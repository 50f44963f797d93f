//! Moving a client session between nodes.
//!
//! When a client shows up at a new node with a session token, everything the
//! session touched is first pushed from the old node up to the lowest common
//! ancestor of the two nodes, then pulled from there down to the new node.

use std::sync::Arc;

use crate::{
    access::DataAccess,
    cache::{CacheError, ParentLink},
    deployment::{self, DeploymentError, DeploymentProcessStatus},
    directory::{PeerError, Peers},
    metrics::SESSION_VALIDATIONS,
    push::push_dirty,
    session::{SessionError, SessionToken, SessionType},
};

#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("source node {0} is not deployed")]
    SourceNotDeployed(i32),
    #[error("{0} is not loaded on this node")]
    NotLoaded(String),
    #[error("nodes {source_node} and {destination} share no ancestor")]
    NoCommonAncestor { source_node: i32, destination: i32 },
    #[error("node {lca} is not an ancestor of node {node}")]
    NotAncestor { node: i32, lca: i32 },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// The node's half of the migration protocol.
pub struct Migrator {
    access: Arc<DataAccess>,
    peers: Arc<dyn Peers>,
    parent: Option<(i32, Arc<dyn ParentLink>)>,
}

impl Migrator {
    /// `parent` is the id of this node's parent and the link to it, `None`
    /// on the root.
    pub fn new(
        access: Arc<DataAccess>,
        peers: Arc<dyn Peers>,
        parent: Option<(i32, Arc<dyn ParentLink>)>,
    ) -> Self {
        Self {
            access,
            peers,
            parent,
        }
    }

    fn node_id(&self) -> i32 {
        self.access.node_id()
    }

    fn check_loaded(&self, token: &SessionToken) -> Result<(), MigrationError> {
        let schemas = self.access.schemas();
        for scope in token.scopes()? {
            let loaded = match (&scope.table, token.session_type) {
                (Some(table), SessionType::Table) => schemas.has_table(&scope.keyspace, table),
                _ => schemas.has_keyspace(&scope.keyspace),
            };
            if !loaded {
                let name = match scope.table {
                    Some(table) => format!("{}.{table}", scope.keyspace),
                    None => scope.keyspace,
                };
                return Err(MigrationError::NotLoaded(name));
            }
        }
        Ok(())
    }

    /// Make the session's data visible here and take ownership of the token.
    #[tracing::instrument(skip(self, token), fields(session = %token.session_name, source = token.source_node))]
    pub async fn validate_session(
        &self,
        mut token: SessionToken,
    ) -> Result<SessionToken, MigrationError> {
        let result = self.migrate(&token).await;
        let outcome = if result.is_ok() { "accepted" } else { "rejected" };
        SESSION_VALIDATIONS.with_label_values(&[outcome]).inc();
        result?;
        token.mark_validated(self.node_id());
        Ok(token)
    }

    async fn migrate(&self, token: &SessionToken) -> Result<(), MigrationError> {
        let source = token.source_node;
        let here = self.node_id();
        let source_deployed = deployment::find_entry(&self.access, source)
            .await?
            .is_some_and(|e| e.status == DeploymentProcessStatus::Deployed);
        if !source_deployed {
            return Err(MigrationError::SourceNotDeployed(source));
        }
        self.check_loaded(token)?;
        if source == here {
            return Ok(());
        }

        let tree = deployment::load_tree(&self.access).await?;
        let lca = tree
            .lca(source, here)
            .ok_or(MigrationError::NoCommonAncestor {
                source_node: source,
                destination: here,
            })?;
        tracing::info!(source, destination = here, lca, "migrating session");
        if source != lca {
            self.peers.force_push(source, token, lca).await?;
        }
        if here != lca {
            self.force_synchronize(token, lca).await?;
        }
        Ok(())
    }

    /// Push the session's dirty rows one hop up, and have the parent continue
    /// until `lca` holds them.
    #[tracing::instrument(skip(self, token), fields(session = %token.session_name))]
    pub async fn force_push(&self, token: &SessionToken, lca: i32) -> Result<usize, MigrationError> {
        if self.node_id() == lca {
            return Ok(0);
        }
        let Some((parent_id, parent)) = &self.parent else {
            return Err(MigrationError::NotAncestor {
                node: self.node_id(),
                lca,
            });
        };
        let mut pushed = 0;
        for (keyspace, tables) in token.tables_by_keyspace()? {
            if !self.access.schemas().has_keyspace(&keyspace) {
                continue;
            }
            pushed += push_dirty(&self.access, parent.as_ref(), &keyspace, &tables).await?;
        }
        tracing::debug!(pushed, parent = parent_id, "forced push");
        if *parent_id != lca {
            self.peers.force_push(*parent_id, token, lca).await?;
        }
        Ok(pushed)
    }

    /// Refresh the session's cached queries from `lca` down to this node,
    /// ancestors first.
    #[tracing::instrument(skip(self, token), fields(session = %token.session_name))]
    pub async fn force_synchronize(
        &self,
        token: &SessionToken,
        lca: i32,
    ) -> Result<usize, MigrationError> {
        if self.node_id() == lca {
            return Ok(0);
        }
        let Some((parent_id, _)) = &self.parent else {
            return Err(MigrationError::NotAncestor {
                node: self.node_id(),
                lca,
            });
        };
        if *parent_id != lca {
            self.peers.force_synchronize(*parent_id, token, lca).await?;
        }
        let cache = self.access.cache();
        let mut applied = 0;
        for (keyspace, tables) in token.tables_by_keyspace()? {
            applied += cache.refresh(&cache.entries_for(&keyspace, &tables)).await?;
        }
        tracing::debug!(applied, "forced synchronize");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{QueryCache, QueryKey},
        deployment::{DeploymentEntry, ServerRecord, bootstrap_root, write_entry},
        schema::{CqlType, KeyspaceSchema, SchemaInfo, TableSchema, augment_keyspace},
        store::{Row, Store, Value, memory::MemoryStore},
        tables,
    };
    use async_trait::async_trait;
    use std::{sync::Mutex, time::Duration};
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingPeers {
        calls: Mutex<Vec<(&'static str, i32, i32)>>,
    }

    impl RecordingPeers {
        fn calls(&self) -> Vec<(&'static str, i32, i32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Peers for RecordingPeers {
        async fn local_node_id(&self, _addr: &str) -> Result<i32, PeerError> {
            Ok(0)
        }

        async fn force_push(&self, node: i32, _token: &SessionToken, lca: i32) -> Result<(), PeerError> {
            self.calls.lock().unwrap().push(("push", node, lca));
            Ok(())
        }

        async fn force_synchronize(
            &self,
            node: i32,
            _token: &SessionToken,
            lca: i32,
        ) -> Result<(), PeerError> {
            self.calls.lock().unwrap().push(("sync", node, lca));
            Ok(())
        }
    }

    #[derive(Default)]
    struct SinkParent {
        pushed: Mutex<usize>,
    }

    #[async_trait]
    impl ParentLink for SinkParent {
        async fn add_query_entry(&self, _key: &QueryKey) -> Result<(), CacheError> {
            Ok(())
        }

        async fn create_query_delta(
            &self,
            _key: &QueryKey,
            _parent_timestamp: Option<Uuid>,
            _caller: i32,
        ) -> Result<Option<Uuid>, CacheError> {
            Ok(None)
        }

        async fn get_delta(&self, delta_id: Uuid) -> Result<Vec<Row>, CacheError> {
            Err(CacheError::DeltaMissing(delta_id))
        }

        async fn push_rows(&self, _ks: &str, _t: &str, rows: Vec<Row>) -> Result<usize, CacheError> {
            *self.pushed.lock().unwrap() += rows.len();
            Ok(rows.len())
        }
    }

    struct Fixture {
        migrator: Migrator,
        access: Arc<DataAccess>,
        peers: Arc<RecordingPeers>,
        parent: Arc<SinkParent>,
    }

    /// Node `node` (parent `parent`) of the tree 1 <- 2 <- 4, 1 <- 3, with
    /// the `shop` keyspace loaded.
    async fn node(node: i32, parent: Option<i32>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let schemas = Arc::new(SchemaInfo::new());
        tables::install(store.as_ref(), &schemas).await.unwrap();
        let shop = augment_keyspace(&KeyspaceSchema::new(
            "shop",
            vec![
                TableSchema::new("items")
                    .partition("sku", CqlType::Text)
                    .regular("price", CqlType::Int),
            ],
        ));
        store.create_keyspace(&shop).await.unwrap();
        schemas.register(shop);
        let cache = Arc::new(QueryCache::new(store.clone(), None, node, Duration::from_secs(30)));
        let access = Arc::new(DataAccess::new(store, schemas, cache, node, parent.is_none()));

        let server = ServerRecord {
            server_uuid: Uuid::new_v4(),
            ip: "127.0.0.1".into(),
            username: String::new(),
            password: String::new(),
            ssh_port: 22,
            grpc_port: 1099,
            name: "n".into(),
        };
        bootstrap_root(&access, 1, &server).await.unwrap();
        for (n, p) in [(2, 1), (3, 1), (4, 2)] {
            write_entry(
                &access,
                &DeploymentEntry {
                    new_node_id: n,
                    parent_node_id: p,
                    status: DeploymentProcessStatus::Deployed,
                    wait_for: vec![p],
                    server_uuid: server.server_uuid,
                },
            )
            .await
            .unwrap();
        }

        let peers = Arc::new(RecordingPeers::default());
        let sink = Arc::new(SinkParent::default());
        let link = parent.map(|p| (p, sink.clone() as Arc<dyn ParentLink>));
        Fixture {
            migrator: Migrator::new(access.clone(), peers.clone(), link),
            access,
            peers,
            parent: sink,
        }
    }

    fn token(source: i32) -> SessionToken {
        let mut token = SessionToken::new("s", SessionType::Table, source);
        token.add_entry("shop", "items");
        token.has_been_validated = false;
        token
    }

    #[tokio::test]
    async fn same_node_needs_no_migration() {
        let f = node(4, Some(2)).await;
        let validated = f.migrator.validate_session(token(4)).await.unwrap();
        assert!(validated.has_been_validated);
        assert!(f.peers.calls().is_empty());
    }

    #[tokio::test]
    async fn moving_down_from_an_ancestor_only_synchronizes() {
        let f = node(4, Some(2)).await;
        let validated = f.migrator.validate_session(token(2)).await.unwrap();
        assert_eq!(validated.source_node, 4);
        // the parent is the lca, so nothing is forwarded
        assert!(f.peers.calls().is_empty());
    }

    #[tokio::test]
    async fn moving_across_subtrees_goes_through_the_lca() {
        let f = node(4, Some(2)).await;
        let validated = f.migrator.validate_session(token(3)).await.unwrap();
        assert_eq!(validated.source_node, 4);
        assert_eq!(f.peers.calls(), vec![("push", 3, 1), ("sync", 2, 1)]);
    }

    #[tokio::test]
    async fn moving_up_only_pushes() {
        let f = node(1, None).await;
        f.migrator.validate_session(token(4)).await.unwrap();
        assert_eq!(f.peers.calls(), vec![("push", 4, 1)]);
    }

    #[tokio::test]
    async fn rejects_unknown_sources_and_unloaded_tables() {
        let f = node(4, Some(2)).await;
        assert!(matches!(
            f.migrator.validate_session(token(9)).await,
            Err(MigrationError::SourceNotDeployed(9))
        ));
        let mut other = token(2);
        other.add_entry("shop", "orders");
        assert!(matches!(
            f.migrator.validate_session(other).await,
            Err(MigrationError::NotLoaded(name)) if name == "shop.orders"
        ));
    }

    #[tokio::test]
    async fn force_push_drains_session_tables_and_forwards() {
        let f = node(4, Some(2)).await;
        f.access
            .insert(
                "shop",
                "items",
                Row::from([
                    ("sku".to_string(), Value::from("a")),
                    ("price".to_string(), Value::Int(3)),
                ]),
            )
            .await
            .unwrap();
        let pushed = f.migrator.force_push(&token(4), 1).await.unwrap();
        assert_eq!(pushed, 1);
        assert_eq!(*f.parent.pushed.lock().unwrap(), 1);
        assert_eq!(f.peers.calls(), vec![("push", 2, 1)]);

        // stopping at the parent does not forward
        f.migrator.force_push(&token(4), 2).await.unwrap();
        assert_eq!(f.peers.calls().len(), 1);
        assert_eq!(f.migrator.force_push(&token(4), 4).await.unwrap(), 0);
    }
}
