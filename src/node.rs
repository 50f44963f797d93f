//! Wiring of a single PathStore node.

use std::{
    mem,
    sync::{Arc, Mutex},
};

use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use url::Url;
use uuid::Uuid;

use crate::{
    access::DataAccess,
    auth::{AuthError, AuthManager, CredentialCache, CredentialRole},
    cache::{ParentLink, QueryCache},
    config::NodeOptions,
    daemon::{shutdown_channel, spawn_periodic},
    delta::DeltaStore,
    deployment::{self, CommandProvisioner, DeploymentError, DeploymentSlave, Provisioner, ServerRecord},
    directory::{GrpcParentLink, GrpcPeers},
    migration::Migrator,
    push,
    rpc::path_store_server::PathStoreServer,
    schema::SchemaInfo,
    schema_fsm::{self, SchemaSlave},
    service::PathStoreService,
    store::{Store, StoreError},
    tables,
};

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("invalid node address {addr}: {reason}")]
    Address { addr: String, reason: String },
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
}

/// The record a root writes for the machine it runs on.
fn own_server(options: &NodeOptions) -> Result<ServerRecord, NodeError> {
    let bad = |reason: String| NodeError::Address {
        addr: options.node_addr.clone(),
        reason,
    };
    let url = Url::parse(&options.node_addr).map_err(|e| bad(e.to_string()))?;
    let ip = url
        .host_str()
        .ok_or_else(|| bad("no host".into()))?
        .to_string();
    let port = url.port_or_known_default().ok_or_else(|| bad("no port".into()))?;
    Ok(ServerRecord {
        server_uuid: Uuid::new_v4(),
        ip,
        username: String::new(),
        password: String::new(),
        ssh_port: 22,
        grpc_port: i32::from(port),
        name: format!("node-{}", options.node_id),
    })
}

/// Admit node calls from this node, its parent and every node recorded in
/// the deployment table.
async fn refresh_node_credentials(
    access: &DataAccess,
    auth: &AuthManager,
    options: &NodeOptions,
) -> Result<usize, NodeError> {
    let members = deployment::load_entries(access)
        .await?
        .into_iter()
        .map(|e| e.new_node_id)
        .chain(options.parent_id());
    Ok(auth
        .sync_node_credentials(&options.node_credential, options.node_id, members)
        .await?)
}

/// A running node: its services, background loops and gRPC endpoint.
pub struct PathStoreNode {
    options: NodeOptions,
    access: Arc<DataAccess>,
    auth: Arc<AuthManager>,
    peers: Arc<GrpcPeers>,
    service: PathStoreService,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PathStoreNode {
    /// Start a node provisioning children with the configured shell commands.
    pub async fn start(options: NodeOptions, store: Arc<dyn Store>) -> Result<Self, NodeError> {
        let provisioner = Arc::new(CommandProvisioner::new(&options.deployment));
        Self::start_with(options, store, provisioner).await
    }

    pub async fn start_with(
        options: NodeOptions,
        store: Arc<dyn Store>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self, NodeError> {
        let node_id = options.node_id;
        let schemas = Arc::new(SchemaInfo::new());
        tables::install(store.as_ref(), &schemas).await?;

        let parent: Option<Arc<dyn ParentLink>> = match &options.parent {
            Some(p) => Some(Arc::new(GrpcParentLink::connect(
                &p.addr,
                &options.node_credential,
                node_id,
                &options.rpc,
            )?)),
            None => None,
        };
        let default_lease = options.cache.default_client_lease + options.cache.default_server_additional;
        let cache = Arc::new(QueryCache::new(
            store.clone(),
            parent.clone(),
            node_id,
            default_lease,
        ));
        let access = Arc::new(DataAccess::new(
            store.clone(),
            schemas,
            cache.clone(),
            node_id,
            options.is_root(),
        ));

        let nodes: Arc<CredentialCache<i32>> =
            Arc::new(CredentialCache::new(CredentialRole::Node, Some(store.clone())));
        let clients: Arc<CredentialCache<String>> =
            Arc::new(CredentialCache::new(CredentialRole::Client, Some(store.clone())));
        let auxiliary: Arc<CredentialCache<String>> =
            Arc::new(CredentialCache::new(CredentialRole::Auxiliary, Some(store)));
        nodes.load().await?;
        clients.load().await?;
        auxiliary.load().await?;
        let auth = Arc::new(AuthManager::new(nodes, clients, auxiliary));
        auth.sync_node_credentials(&options.node_credential, node_id, options.parent_id())
            .await?;

        let peers = Arc::new(GrpcPeers::new(
            access.clone(),
            options.node_credential.clone(),
            node_id,
            options.rpc,
        ));
        peers.remember(node_id, options.node_addr.clone());
        if let Some(p) = &options.parent {
            peers.remember(p.node_id, p.addr.clone());
        }
        if options.is_root() {
            deployment::bootstrap_root(&access, node_id, &own_server(&options)?).await?;
            refresh_node_credentials(&access, &auth, &options).await?;
        }

        let upstream = options
            .parent
            .as_ref()
            .zip(parent.clone())
            .map(|(p, link)| (p.node_id, link));
        let migrator = Arc::new(Migrator::new(access.clone(), peers.clone(), upstream));
        let deltas = Arc::new(DeltaStore::new(options.cache.delta_retention));
        let service = PathStoreService::new(access.clone(), auth.clone(), deltas, migrator);

        let (shutdown, rx) = shutdown_channel();
        let loops = options.loops;
        let mut tasks = Vec::new();
        if let Some(parent) = parent {
            tasks.push(push::spawn_push_daemon(access.clone(), parent, loops, rx.clone()));
            tasks.push(push::spawn_pull_daemon(cache, loops, rx.clone()));
        }
        {
            let (access, auth, options) = (access.clone(), auth.clone(), options.clone());
            tasks.push(spawn_periodic(
                "node-credentials",
                loops.fsm_interval,
                loops.jitter,
                rx.clone(),
                move || {
                    let (access, auth, options) = (access.clone(), auth.clone(), options.clone());
                    async move {
                        if let Err(err) = refresh_node_credentials(&access, &auth, &options).await {
                            tracing::warn!(%err, "node credential refresh failed");
                        }
                    }
                },
            ));
        }
        if options.master {
            tasks.push(deployment::spawn_master(access.clone(), loops, rx.clone()));
            tasks.push(schema_fsm::spawn_master(access.clone(), loops, rx.clone()));
        }
        let deployer = Arc::new(DeploymentSlave::new(
            access.clone(),
            peers.clone(),
            provisioner,
            node_id,
            options.deployment.clone(),
        ));
        tasks.push(deployment::spawn_slave(deployer, loops, rx.clone()));
        let installer = Arc::new(SchemaSlave::new(
            access.clone(),
            default_lease,
            options.deployment.worker_pool,
        ));
        tasks.push(schema_fsm::spawn_slave(installer, loops, rx));

        tracing::info!(
            node_id,
            parent = ?options.parent_id(),
            master = options.master,
            addr = %options.node_addr,
            "node started"
        );
        Ok(Self {
            options,
            access,
            auth,
            peers,
            service,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn node_id(&self) -> i32 {
        self.options.node_id
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn access(&self) -> &Arc<DataAccess> {
        &self.access
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn peers(&self) -> &Arc<GrpcPeers> {
        &self.peers
    }

    /// The gRPC service, for callers that build their own server.
    pub fn grpc_service(&self) -> PathStoreServer<PathStoreService> {
        self.service.clone().into_server()
    }

    /// Serve gRPC on `listener` until [`Self::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NodeError> {
        let mut stop = self.shutdown.subscribe();
        Server::builder()
            .add_service(self.grpc_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                while !*stop.borrow_and_update() {
                    if stop.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Stop the background loops and the gRPC server and wait for the loops
    /// to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks = self
            .tasks
            .lock()
            .map(|mut t| mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(%err, "background loop ended abnormally");
            }
        }
        tracing::info!(node_id = self.node_id(), "node stopped");
    }
}
