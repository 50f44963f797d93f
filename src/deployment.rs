//! Tree-wide provisioning and decommissioning of nodes.
//!
//! Every node of the tree has one record in `pathstore_applications.deployment`.
//! The master loop (on the coordinator) releases records whose dependencies
//! are met; the slave loop on each parent claims the records of its children
//! and runs the actual work on a bounded worker pool.

use std::{
    collections::HashSet,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{sync::Semaphore, sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::{
    access::{AccessError, DataAccess},
    config::{DeploymentOptions, LoopOptions},
    daemon::spawn_periodic,
    directory::{PeerError, Peers},
    metrics::FSM_TRANSITIONS,
    schema_fsm,
    session::{SessionToken, SessionType},
    store::{Clause, Row, Value, cell},
    tables::{APPLICATIONS_KEYSPACE, DEPLOYMENT, SERVERS, columns, decode_wait_for, encode_wait_for},
    topology::{DeploymentTree, NO_PARENT},
};

#[derive(thiserror::Error, Debug)]
pub enum DeploymentError {
    #[error("invalid deployment plan: {0}")]
    InvalidPlan(String),
    #[error("node {0} has no deployment record")]
    UnknownNode(i32),
    #[error("node {node} is {status}, expected {expected}")]
    InvalidState {
        node: i32,
        status: DeploymentProcessStatus,
        expected: DeploymentProcessStatus,
    },
    #[error("server {0} is not registered")]
    UnknownServer(Uuid),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("provisioning failed: {0}")]
    Provision(String),
    #[error("node {node} did not come up within {waited:?}")]
    StartupTimeout { node: i32, waited: Duration },
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Access(#[from] AccessError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeploymentProcessStatus {
    WaitingDeployment,
    Deploying,
    ProcessingDeploying,
    Deployed,
    WaitingRemoval,
    Removing,
    ProcessingRemoving,
    Failed,
}

impl DeploymentProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingDeployment => "WAITING_DEPLOYMENT",
            Self::Deploying => "DEPLOYING",
            Self::ProcessingDeploying => "PROCESSING_DEPLOYING",
            Self::Deployed => "DEPLOYED",
            Self::WaitingRemoval => "WAITING_REMOVAL",
            Self::Removing => "REMOVING",
            Self::ProcessingRemoving => "PROCESSING_REMOVING",
            Self::Failed => "FAILED",
        }
    }

    /// Whether a node in this state is up and part of the tree.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Deployed | Self::WaitingRemoval | Self::Removing | Self::ProcessingRemoving
        )
    }
}

impl fmt::Display for DeploymentProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentProcessStatus {
    type Err = DeploymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "WAITING_DEPLOYMENT" => Self::WaitingDeployment,
            "DEPLOYING" => Self::Deploying,
            "PROCESSING_DEPLOYING" => Self::ProcessingDeploying,
            "DEPLOYED" => Self::Deployed,
            "WAITING_REMOVAL" => Self::WaitingRemoval,
            "REMOVING" => Self::Removing,
            "PROCESSING_REMOVING" => Self::ProcessingRemoving,
            "FAILED" => Self::Failed,
            other => return Err(DeploymentError::Malformed(format!("status {other}"))),
        })
    }
}

fn to_i32(col: &str, value: i64) -> Result<i32, DeploymentError> {
    i32::try_from(value).map_err(|_| DeploymentError::Malformed(format!("{col} out of range: {value}")))
}

fn int_col(row: &Row, col: &str) -> Result<i32, DeploymentError> {
    let value = cell(row, col)
        .as_int()
        .ok_or_else(|| DeploymentError::Malformed(format!("{col} missing")))?;
    to_i32(col, value)
}

fn text_col<'a>(row: &'a Row, col: &str) -> Result<&'a str, DeploymentError> {
    cell(row, col)
        .as_text()
        .ok_or_else(|| DeploymentError::Malformed(format!("{col} missing")))
}

/// One node of the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentEntry {
    pub new_node_id: i32,
    pub parent_node_id: i32,
    pub status: DeploymentProcessStatus,
    pub wait_for: Vec<i32>,
    pub server_uuid: Uuid,
}

impl DeploymentEntry {
    fn key(&self) -> Row {
        Row::from([
            (columns::PARENT_NODE_ID.to_string(), Value::from(self.parent_node_id)),
            (columns::NEW_NODE_ID.to_string(), Value::from(self.new_node_id)),
        ])
    }

    fn to_row(&self) -> Row {
        let mut row = self.key();
        row.insert(columns::PROCESS_STATUS.into(), Value::from(self.status.as_str()));
        row.insert(columns::WAIT_FOR.into(), Value::from(encode_wait_for(&self.wait_for)));
        row.insert(columns::SERVER_UUID.into(), Value::Uuid(self.server_uuid));
        row
    }

    fn from_row(row: &Row) -> Result<Self, DeploymentError> {
        Ok(Self {
            new_node_id: int_col(row, columns::NEW_NODE_ID)?,
            parent_node_id: int_col(row, columns::PARENT_NODE_ID)?,
            status: text_col(row, columns::PROCESS_STATUS)?.parse()?,
            wait_for: decode_wait_for(cell(row, columns::WAIT_FOR).as_text().unwrap_or_default()),
            server_uuid: cell(row, columns::SERVER_UUID)
                .as_uuid()
                .ok_or_else(|| DeploymentError::Malformed("server_uuid missing".into()))?,
        })
    }
}

/// Machine a node runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerRecord {
    pub server_uuid: Uuid,
    pub ip: String,
    pub username: String,
    pub password: String,
    pub ssh_port: i32,
    pub grpc_port: i32,
    pub name: String,
}

impl ServerRecord {
    pub fn grpc_addr(&self) -> String {
        format!("http://{}:{}", self.ip, self.grpc_port)
    }

    fn to_row(&self) -> Row {
        Row::from([
            (columns::SERVER_UUID.to_string(), Value::Uuid(self.server_uuid)),
            (columns::IP.to_string(), Value::from(self.ip.as_str())),
            (columns::USERNAME.to_string(), Value::from(self.username.as_str())),
            (columns::PASSWORD.to_string(), Value::from(self.password.as_str())),
            (columns::SSH_PORT.to_string(), Value::from(self.ssh_port)),
            (columns::GRPC_PORT.to_string(), Value::from(self.grpc_port)),
            (columns::NAME.to_string(), Value::from(self.name.as_str())),
        ])
    }

    fn from_row(row: &Row) -> Result<Self, DeploymentError> {
        Ok(Self {
            server_uuid: cell(row, columns::SERVER_UUID)
                .as_uuid()
                .ok_or_else(|| DeploymentError::Malformed("server_uuid missing".into()))?,
            ip: text_col(row, columns::IP)?.to_string(),
            username: text_col(row, columns::USERNAME).unwrap_or_default().to_string(),
            password: text_col(row, columns::PASSWORD).unwrap_or_default().to_string(),
            ssh_port: cell(row, columns::SSH_PORT)
                .as_int()
                .map(|v| to_i32(columns::SSH_PORT, v))
                .transpose()?
                .unwrap_or(22),
            grpc_port: int_col(row, columns::GRPC_PORT)?,
            name: text_col(row, columns::NAME).unwrap_or_default().to_string(),
        })
    }
}

/// A node to add to the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub new_node_id: i32,
    pub parent_node_id: i32,
    pub server_uuid: Uuid,
}

pub async fn load_entries(access: &DataAccess) -> Result<Vec<DeploymentEntry>, DeploymentError> {
    let rows = access
        .select(APPLICATIONS_KEYSPACE, DEPLOYMENT, &[], None)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        match DeploymentEntry::from_row(row) {
            Ok(entry) => out.push(entry),
            Err(err) => tracing::warn!(%err, "skipping deployment record"),
        }
    }
    Ok(out)
}

pub async fn find_entry(
    access: &DataAccess,
    node: i32,
) -> Result<Option<DeploymentEntry>, DeploymentError> {
    Ok(load_entries(access)
        .await?
        .into_iter()
        .find(|e| e.new_node_id == node))
}

/// Parent-pointer map of every live node.
pub async fn load_tree(access: &DataAccess) -> Result<DeploymentTree, DeploymentError> {
    let entries = load_entries(access).await?;
    Ok(DeploymentTree::new(
        entries
            .iter()
            .filter(|e| e.status.is_live())
            .map(|e| (e.new_node_id, e.parent_node_id)),
    ))
}

pub async fn write_entry(access: &DataAccess, entry: &DeploymentEntry) -> Result<(), DeploymentError> {
    access
        .insert(APPLICATIONS_KEYSPACE, DEPLOYMENT, entry.to_row())
        .await?;
    FSM_TRANSITIONS
        .with_label_values(&["deployment", entry.status.as_str()])
        .inc();
    tracing::info!(
        node = entry.new_node_id,
        parent = entry.parent_node_id,
        status = %entry.status,
        "deployment record updated"
    );
    Ok(())
}

async fn delete_entry(access: &DataAccess, entry: &DeploymentEntry) -> Result<(), DeploymentError> {
    access
        .delete(APPLICATIONS_KEYSPACE, DEPLOYMENT, entry.key())
        .await?;
    Ok(())
}

pub async fn add_server(access: &DataAccess, server: &ServerRecord) -> Result<(), DeploymentError> {
    access
        .insert(APPLICATIONS_KEYSPACE, SERVERS, server.to_row())
        .await?;
    Ok(())
}

pub async fn load_server(
    access: &DataAccess,
    server_uuid: Uuid,
) -> Result<Option<ServerRecord>, DeploymentError> {
    let rows = access
        .select(
            APPLICATIONS_KEYSPACE,
            SERVERS,
            &[Clause::new(columns::SERVER_UUID, server_uuid)],
            None,
        )
        .await?;
    rows.first().map(ServerRecord::from_row).transpose()
}

/// Record the root of the tree as deployed on `server`.
pub async fn bootstrap_root(
    access: &DataAccess,
    root: i32,
    server: &ServerRecord,
) -> Result<(), DeploymentError> {
    add_server(access, server).await?;
    if find_entry(access, root).await?.is_some() {
        return Ok(());
    }
    write_entry(
        access,
        &DeploymentEntry {
            new_node_id: root,
            parent_node_id: NO_PARENT,
            status: DeploymentProcessStatus::Deployed,
            wait_for: Vec::new(),
            server_uuid: server.server_uuid,
        },
    )
    .await
}

/// Validate a batch of new nodes and queue them for deployment.
///
/// Each new id must be unused, differ from its parent, and hang off a
/// deployed node or another node of the same batch.
pub async fn submit_deployment(
    access: &DataAccess,
    batch: &[DeploymentRequest],
) -> Result<Vec<DeploymentEntry>, DeploymentError> {
    let existing = load_entries(access).await?;
    let used: HashSet<i32> = existing.iter().map(|e| e.new_node_id).collect();
    let deployed: HashSet<i32> = existing
        .iter()
        .filter(|e| e.status == DeploymentProcessStatus::Deployed)
        .map(|e| e.new_node_id)
        .collect();

    let mut batch_ids = HashSet::new();
    for req in batch {
        if req.new_node_id == req.parent_node_id {
            return Err(DeploymentError::InvalidPlan(format!(
                "node {} cannot be its own parent",
                req.new_node_id
            )));
        }
        if used.contains(&req.new_node_id) || !batch_ids.insert(req.new_node_id) {
            return Err(DeploymentError::InvalidPlan(format!(
                "node id {} is already in use",
                req.new_node_id
            )));
        }
    }
    for req in batch {
        if !deployed.contains(&req.parent_node_id) && !batch_ids.contains(&req.parent_node_id) {
            return Err(DeploymentError::InvalidPlan(format!(
                "parent {} of node {} is neither deployed nor part of the plan",
                req.parent_node_id, req.new_node_id
            )));
        }
        if load_server(access, req.server_uuid).await?.is_none() {
            return Err(DeploymentError::UnknownServer(req.server_uuid));
        }
    }

    let mut written = Vec::with_capacity(batch.len());
    for req in batch {
        let entry = DeploymentEntry {
            new_node_id: req.new_node_id,
            parent_node_id: req.parent_node_id,
            status: DeploymentProcessStatus::WaitingDeployment,
            wait_for: vec![req.parent_node_id],
            server_uuid: req.server_uuid,
        };
        write_entry(access, &entry).await?;
        written.push(entry);
    }
    Ok(written)
}

/// Queue a deployed node for removal once all of its children are gone.
pub async fn request_removal(access: &DataAccess, node: i32) -> Result<DeploymentEntry, DeploymentError> {
    let entries = load_entries(access).await?;
    let mut entry = entries
        .iter()
        .find(|e| e.new_node_id == node)
        .cloned()
        .ok_or(DeploymentError::UnknownNode(node))?;
    if entry.parent_node_id == NO_PARENT {
        return Err(DeploymentError::InvalidPlan("the root cannot be removed".into()));
    }
    if entry.status != DeploymentProcessStatus::Deployed {
        return Err(DeploymentError::InvalidState {
            node,
            status: entry.status,
            expected: DeploymentProcessStatus::Deployed,
        });
    }
    entry.wait_for = entries
        .iter()
        .filter(|e| e.parent_node_id == node)
        .map(|e| e.new_node_id)
        .collect();
    entry.wait_for.sort_unstable();
    entry.status = DeploymentProcessStatus::WaitingRemoval;
    write_entry(access, &entry).await?;
    Ok(entry)
}

/// Send a failed deployment back to its parent for another attempt.
pub async fn retry(access: &DataAccess, node: i32) -> Result<DeploymentEntry, DeploymentError> {
    let mut entry = find_entry(access, node)
        .await?
        .ok_or(DeploymentError::UnknownNode(node))?;
    if entry.status != DeploymentProcessStatus::Failed {
        return Err(DeploymentError::InvalidState {
            node,
            status: entry.status,
            expected: DeploymentProcessStatus::Failed,
        });
    }
    entry.status = DeploymentProcessStatus::Deploying;
    write_entry(access, &entry).await?;
    Ok(entry)
}

/// One pass of the coordinator. Returns the number of records advanced.
pub async fn master_tick(access: &DataAccess) -> Result<usize, DeploymentError> {
    let entries = load_entries(access).await?;
    let deployed: HashSet<i32> = entries
        .iter()
        .filter(|e| e.status == DeploymentProcessStatus::Deployed)
        .map(|e| e.new_node_id)
        .collect();
    let present: HashSet<i32> = entries.iter().map(|e| e.new_node_id).collect();

    let mut advanced = 0;
    for entry in entries {
        let next = match entry.status {
            DeploymentProcessStatus::WaitingDeployment
                if entry.wait_for.iter().all(|id| deployed.contains(id)) =>
            {
                DeploymentProcessStatus::Deploying
            }
            DeploymentProcessStatus::WaitingRemoval
                if entry.wait_for.iter().all(|id| !present.contains(id)) =>
            {
                DeploymentProcessStatus::Removing
            }
            _ => continue,
        };
        let updated = DeploymentEntry {
            status: next,
            ..entry
        };
        if let Err(err) = write_entry(access, &updated).await {
            tracing::warn!(%err, node = updated.new_node_id, "failed to advance deployment record");
            continue;
        }
        advanced += 1;
    }
    Ok(advanced)
}

/// External collaborator that brings machines up and down.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        entry: &DeploymentEntry,
        server: &ServerRecord,
    ) -> Result<(), DeploymentError>;

    async fn decommission(
        &self,
        entry: &DeploymentEntry,
        server: &ServerRecord,
    ) -> Result<(), DeploymentError>;
}

/// Runs operator supplied shell commands with the record in the environment.
/// Without a command the step is left to the operator.
pub struct CommandProvisioner {
    deploy_command: Option<String>,
    remove_command: Option<String>,
}

impl CommandProvisioner {
    pub fn new(options: &DeploymentOptions) -> Self {
        Self {
            deploy_command: options.deploy_command.clone(),
            remove_command: options.remove_command.clone(),
        }
    }

    async fn run(
        &self,
        command: Option<&str>,
        entry: &DeploymentEntry,
        server: &ServerRecord,
    ) -> Result<(), DeploymentError> {
        let Some(command) = command else {
            tracing::info!(node = entry.new_node_id, "no provisioning command configured");
            return Ok(());
        };
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("PATHSTORE_NODE_ID", entry.new_node_id.to_string())
            .env("PATHSTORE_PARENT_NODE_ID", entry.parent_node_id.to_string())
            .env("PATHSTORE_SERVER_UUID", entry.server_uuid.to_string())
            .env("PATHSTORE_SERVER_IP", &server.ip)
            .env("PATHSTORE_SERVER_NAME", &server.name)
            .env("PATHSTORE_SSH_USER", &server.username)
            .env("PATHSTORE_SSH_PASSWORD", &server.password)
            .env("PATHSTORE_SSH_PORT", server.ssh_port.to_string())
            .env("PATHSTORE_GRPC_PORT", server.grpc_port.to_string())
            .status()
            .await
            .map_err(|e| DeploymentError::Provision(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(DeploymentError::Provision(format!(
                "`{command}` exited with {status}"
            )))
        }
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(
        &self,
        entry: &DeploymentEntry,
        server: &ServerRecord,
    ) -> Result<(), DeploymentError> {
        self.run(self.deploy_command.as_deref(), entry, server).await
    }

    async fn decommission(
        &self,
        entry: &DeploymentEntry,
        server: &ServerRecord,
    ) -> Result<(), DeploymentError> {
        self.run(self.remove_command.as_deref(), entry, server).await
    }
}

/// Poll `addr` until it reports `expected` as its id, giving up after `wait`.
pub async fn wait_for_node(
    peers: &dyn Peers,
    addr: &str,
    expected: i32,
    wait: Duration,
    poll: Duration,
) -> Result<(), DeploymentError> {
    let started = Instant::now();
    loop {
        match peers.local_node_id(addr).await {
            Ok(id) if id == expected => return Ok(()),
            Ok(id) => tracing::warn!(addr, expected, reported = id, "unexpected node id"),
            Err(err) => tracing::debug!(addr, %err, "node not up yet"),
        }
        if started.elapsed() + poll > wait {
            return Err(DeploymentError::StartupTimeout {
                node: expected,
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(poll).await;
    }
}

/// Parent-side executor of deployment records.
pub struct DeploymentSlave {
    access: Arc<DataAccess>,
    peers: Arc<dyn Peers>,
    provisioner: Arc<dyn Provisioner>,
    node_id: i32,
    options: DeploymentOptions,
    pool: Arc<Semaphore>,
    in_flight: Mutex<HashSet<i32>>,
}

impl DeploymentSlave {
    pub fn new(
        access: Arc<DataAccess>,
        peers: Arc<dyn Peers>,
        provisioner: Arc<dyn Provisioner>,
        node_id: i32,
        options: DeploymentOptions,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(options.worker_pool.max(1)));
        Self {
            access,
            peers,
            provisioner,
            node_id,
            options,
            pool,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, node: i32) -> bool {
        self.in_flight
            .lock()
            .map(|mut f| f.insert(node))
            .unwrap_or(false)
    }

    fn release(&self, node: i32) {
        if let Ok(mut f) = self.in_flight.lock() {
            f.remove(&node);
        }
    }

    /// Claim the released records of this node's children and start a worker
    /// for each. Returns the number of workers started.
    pub async fn tick(self: &Arc<Self>) -> Result<usize, DeploymentError> {
        let entries = load_entries(&self.access).await?;
        let mut started = 0;
        for entry in entries.into_iter().filter(|e| e.parent_node_id == self.node_id) {
            let processing = match entry.status {
                DeploymentProcessStatus::Deploying => DeploymentProcessStatus::ProcessingDeploying,
                DeploymentProcessStatus::Removing => DeploymentProcessStatus::ProcessingRemoving,
                _ => continue,
            };
            if !self.claim(entry.new_node_id) {
                continue;
            }
            let claimed = DeploymentEntry {
                status: processing,
                ..entry
            };
            if let Err(err) = write_entry(&self.access, &claimed).await {
                tracing::warn!(%err, node = claimed.new_node_id, "failed to claim record");
                self.release(claimed.new_node_id);
                continue;
            }
            let slave = self.clone();
            tokio::spawn(async move {
                let Ok(_permit) = slave.pool.clone().acquire_owned().await else {
                    slave.release(claimed.new_node_id);
                    return;
                };
                slave.work(claimed.clone()).await;
                slave.release(claimed.new_node_id);
            });
            started += 1;
        }
        Ok(started)
    }

    async fn work(&self, entry: DeploymentEntry) {
        let node = entry.new_node_id;
        match entry.status {
            DeploymentProcessStatus::ProcessingDeploying => {
                let status = match self.deploy(&entry).await {
                    Ok(()) => DeploymentProcessStatus::Deployed,
                    Err(err) => {
                        tracing::error!(%err, node, "deployment failed");
                        DeploymentProcessStatus::Failed
                    }
                };
                let done = DeploymentEntry { status, ..entry };
                if let Err(err) = write_entry(&self.access, &done).await {
                    tracing::error!(%err, node, "failed to record deployment outcome");
                }
            }
            DeploymentProcessStatus::ProcessingRemoving => {
                if let Err(err) = self.remove(&entry).await {
                    tracing::error!(%err, node, "removal failed, keeping node deployed");
                    let back = DeploymentEntry {
                        status: DeploymentProcessStatus::Deployed,
                        wait_for: Vec::new(),
                        ..entry
                    };
                    if let Err(err) = write_entry(&self.access, &back).await {
                        tracing::error!(%err, node, "failed to restore deployment record");
                    }
                }
            }
            _ => {}
        }
    }

    async fn server_for(&self, entry: &DeploymentEntry) -> Result<ServerRecord, DeploymentError> {
        load_server(&self.access, entry.server_uuid)
            .await?
            .ok_or(DeploymentError::UnknownServer(entry.server_uuid))
    }

    async fn deploy(&self, entry: &DeploymentEntry) -> Result<(), DeploymentError> {
        let server = self.server_for(entry).await?;
        self.provisioner.provision(entry, &server).await?;
        wait_for_node(
            self.peers.as_ref(),
            &server.grpc_addr(),
            entry.new_node_id,
            self.options.startup_wait,
            self.options.startup_poll,
        )
        .await
    }

    async fn remove(&self, entry: &DeploymentEntry) -> Result<(), DeploymentError> {
        let server = self.server_for(entry).await?;
        // drain the child's unpushed writes into this node first
        let mut token = SessionToken::new(
            format!("decommission-{}", entry.new_node_id),
            SessionType::Keyspace,
            entry.new_node_id,
        );
        token.data = self.access.schemas().keyspaces().into_iter().collect();
        self.peers
            .force_push(entry.new_node_id, &token, self.node_id)
            .await?;
        self.provisioner.decommission(entry, &server).await?;
        delete_entry(&self.access, entry).await?;
        if let Err(err) = schema_fsm::forget_node(&self.access, entry.new_node_id).await {
            tracing::warn!(%err, node = entry.new_node_id, "failed to clear schema history");
        }
        tracing::info!(node = entry.new_node_id, "node removed");
        Ok(())
    }
}

pub fn spawn_master(
    access: Arc<DataAccess>,
    loops: LoopOptions,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic(
        "deployment-master",
        loops.fsm_interval,
        loops.jitter,
        shutdown,
        move || {
            let access = access.clone();
            async move {
                if let Err(err) = master_tick(&access).await {
                    tracing::warn!(%err, "deployment master pass failed");
                }
            }
        },
    )
}

pub fn spawn_slave(
    slave: Arc<DeploymentSlave>,
    loops: LoopOptions,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic(
        "deployment-slave",
        loops.fsm_interval,
        loops.jitter,
        shutdown,
        move || {
            let slave = slave.clone();
            async move {
                if let Err(err) = slave.tick().await {
                    tracing::warn!(%err, "deployment slave pass failed");
                }
            }
        },
    )
}
