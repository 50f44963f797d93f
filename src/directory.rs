//! Reaching other nodes of the tree over gRPC.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tonic::{Code, Status};
use uuid::Uuid;

use crate::{
    AuthedClient,
    access::DataAccess,
    auth::AuthInterceptor,
    cache::{CacheError, ParentLink, QueryKey},
    config::{NodeCredential, RpcOptions},
    convert,
    deployment,
    rpc::{
        AddQueryEntryRequest, Empty, GetDeltaRequest, MigrationRequest, PushRowsRequest,
        QueryDeltaRequest, path_store_client::PathStoreClient,
    },
    session::SessionToken,
    store::Row,
};

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("no address known for node {0}")]
    UnknownNode(i32),
    #[error("node at {target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },
    #[error("node {node} rejected the call: {reason}")]
    Rejected { node: String, reason: String },
    #[error("address lookup failed: {0}")]
    Lookup(String),
}

/// Calls a node makes on arbitrary other nodes.
#[async_trait]
pub trait Peers: Send + Sync {
    /// Id reported by the node listening on `addr`.
    async fn local_node_id(&self, addr: &str) -> Result<i32, PeerError>;

    async fn force_push(&self, node: i32, token: &SessionToken, lca: i32) -> Result<(), PeerError>;

    async fn force_synchronize(
        &self,
        node: i32,
        token: &SessionToken,
        lca: i32,
    ) -> Result<(), PeerError>;
}

fn status_to_peer(target: &str, status: Status) -> PeerError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
            PeerError::Unreachable {
                target: target.to_string(),
                reason: status.message().to_string(),
            }
        }
        _ => PeerError::Rejected {
            node: target.to_string(),
            reason: status.message().to_string(),
        },
    }
}

/// [`Peers`] backed by the `deployment` and `servers` tables.
pub struct GrpcPeers {
    access: Arc<DataAccess>,
    credential: NodeCredential,
    node_id: i32,
    rpc: RpcOptions,
    known: RwLock<HashMap<i32, String>>,
    clients: RwLock<HashMap<String, AuthedClient>>,
}

impl GrpcPeers {
    pub fn new(
        access: Arc<DataAccess>,
        credential: NodeCredential,
        node_id: i32,
        rpc: RpcOptions,
    ) -> Self {
        Self {
            access,
            credential,
            node_id,
            rpc,
            known: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Pin the address of a node, bypassing the coordination tables.
    pub fn remember(&self, node: i32, addr: impl Into<String>) {
        if let Ok(mut known) = self.known.write() {
            known.insert(node, addr.into());
        }
    }

    pub async fn address_of(&self, node: i32) -> Result<String, PeerError> {
        if let Some(addr) = self.known.read().ok().and_then(|k| k.get(&node).cloned()) {
            return Ok(addr);
        }
        let entry = deployment::find_entry(&self.access, node)
            .await
            .map_err(|e| PeerError::Lookup(e.to_string()))?
            .ok_or(PeerError::UnknownNode(node))?;
        let server = deployment::load_server(&self.access, entry.server_uuid)
            .await
            .map_err(|e| PeerError::Lookup(e.to_string()))?
            .ok_or(PeerError::UnknownNode(node))?;
        Ok(server.grpc_addr())
    }

    fn client(&self, addr: &str) -> Result<AuthedClient, PeerError> {
        if let Some(client) = self.clients.read().ok().and_then(|c| c.get(addr).cloned()) {
            return Ok(client);
        }
        let interceptor =
            AuthInterceptor::fixed(&self.credential.username, &self.credential.password)
                .with_node_id(self.node_id);
        let client =
            PathStoreClient::connect_lazy_authenticated(addr.to_string(), interceptor, &self.rpc)
                .map_err(|e| PeerError::Unreachable {
                    target: addr.to_string(),
                    reason: e.to_string(),
                })?;
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(addr.to_string(), client.clone());
        }
        Ok(client)
    }

    async fn node_client(&self, node: i32) -> Result<(String, AuthedClient), PeerError> {
        let addr = self.address_of(node).await?;
        let client = self.client(&addr)?;
        Ok((addr, client))
    }
}

#[async_trait]
impl Peers for GrpcPeers {
    async fn local_node_id(&self, addr: &str) -> Result<i32, PeerError> {
        // unauthenticated endpoint, and the target may not know us yet
        let mut client = PathStoreClient::connect_authenticated(
            addr.to_string(),
            AuthInterceptor::anonymous(),
            &self.rpc,
        )
        .await
        .map_err(|e| PeerError::Unreachable {
            target: addr.to_string(),
            reason: e.to_string(),
        })?;
        let resp = client
            .get_local_node_id(Empty {})
            .await
            .map_err(|s| status_to_peer(addr, s))?;
        Ok(resp.into_inner().node_id)
    }

    async fn force_push(&self, node: i32, token: &SessionToken, lca: i32) -> Result<(), PeerError> {
        let (addr, mut client) = self.node_client(node).await?;
        client
            .force_push(MigrationRequest {
                token: Some(convert::token_to_proto(token)),
                lca,
            })
            .await
            .map_err(|s| status_to_peer(&addr, s))?;
        Ok(())
    }

    async fn force_synchronize(
        &self,
        node: i32,
        token: &SessionToken,
        lca: i32,
    ) -> Result<(), PeerError> {
        let (addr, mut client) = self.node_client(node).await?;
        client
            .force_synchronize(MigrationRequest {
                token: Some(convert::token_to_proto(token)),
                lca,
            })
            .await
            .map_err(|s| status_to_peer(&addr, s))?;
        Ok(())
    }
}

fn status_to_cache(status: Status) -> CacheError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
            CacheError::ParentUnavailable(status.message().to_string())
        }
        _ => CacheError::Rejected(status.message().to_string()),
    }
}

/// [`ParentLink`] speaking gRPC to the parent node.
pub struct GrpcParentLink {
    client: AuthedClient,
}

impl GrpcParentLink {
    pub fn connect(
        addr: &str,
        credential: &NodeCredential,
        node_id: i32,
        rpc: &RpcOptions,
    ) -> Result<Self, tonic::transport::Error> {
        let interceptor = AuthInterceptor::fixed(&credential.username, &credential.password)
            .with_node_id(node_id);
        let client = PathStoreClient::connect_lazy_authenticated(addr.to_string(), interceptor, rpc)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ParentLink for GrpcParentLink {
    async fn add_query_entry(&self, key: &QueryKey) -> Result<(), CacheError> {
        self.client
            .clone()
            .add_query_entry(AddQueryEntryRequest {
                keyspace: key.keyspace.clone(),
                table: key.table.clone(),
                clauses: convert::clauses_to_proto(&key.clauses),
                limit: convert::limit_to_proto(key.limit),
            })
            .await
            .map_err(status_to_cache)?;
        Ok(())
    }

    async fn create_query_delta(
        &self,
        key: &QueryKey,
        parent_timestamp: Option<Uuid>,
        caller: i32,
    ) -> Result<Option<Uuid>, CacheError> {
        let resp = self
            .client
            .clone()
            .create_query_delta(QueryDeltaRequest {
                keyspace: key.keyspace.clone(),
                table: key.table.clone(),
                clauses: convert::clauses_to_proto(&key.clauses),
                parent_timestamp: convert::optional_uuid_to_proto(parent_timestamp),
                caller_node_id: caller,
                limit: convert::limit_to_proto(key.limit),
            })
            .await
            .map_err(status_to_cache)?;
        convert::optional_uuid(&resp.into_inner().delta_id)
            .map_err(|s| CacheError::Rejected(s.message().to_string()))
    }

    async fn get_delta(&self, delta_id: Uuid) -> Result<Vec<Row>, CacheError> {
        let resp = self
            .client
            .clone()
            .get_delta(GetDeltaRequest {
                delta_id: delta_id.to_string(),
            })
            .await
            .map_err(|s| match s.code() {
                Code::NotFound => CacheError::DeltaMissing(delta_id),
                _ => status_to_cache(s),
            })?;
        convert::rows_from_proto(resp.into_inner().rows)
            .map_err(|s| CacheError::Rejected(s.message().to_string()))
    }

    async fn push_rows(
        &self,
        keyspace: &str,
        table: &str,
        rows: Vec<Row>,
    ) -> Result<usize, CacheError> {
        let resp = self
            .client
            .clone()
            .push_rows(PushRowsRequest {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
                rows: convert::rows_to_proto(&rows),
            })
            .await
            .map_err(status_to_cache)?;
        Ok(resp.into_inner().applied as usize)
    }
}
