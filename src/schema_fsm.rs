//! Per-node installation and removal of application keyspaces.
//!
//! An application is registered once on the root, which augments its schema
//! and stores it in `apps`. Installing it writes one `node_schemas` record
//! per deployed node; a node's record is released only after its parent has
//! the keyspace, so schemas roll out top-down and are removed bottom-up.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
};

use crate::{
    access::{AccessError, DataAccess},
    auth::{AuthError, AuthManager, Credential, issue_client_credential},
    config::LoopOptions,
    daemon::spawn_periodic,
    deployment::{self, DeploymentError, DeploymentProcessStatus},
    metrics::FSM_TRANSITIONS,
    schema::{KeyspaceSchema, SchemaError, augment_keyspace, parse_keyspace},
    store::{Clause, Row, StoreError, Value, cell},
    tables::{
        APPLICATION_CREDENTIALS, APPLICATION_LEASE_TIME, APPLICATIONS_KEYSPACE, APPS, LOCAL_KEYSPACE,
        NODE_SCHEMAS, columns, decode_wait_for, encode_wait_for,
    },
    topology::{DeploymentTree, NO_PARENT},
};

#[derive(thiserror::Error, Debug)]
pub enum SchemaFsmError {
    #[error("application {0} is not registered")]
    UnknownApplication(String),
    #[error("application {0} is already registered")]
    AlreadyRegistered(String),
    #[error("keyspace name {0} is reserved")]
    ReservedKeyspace(String),
    #[error("application {keyspace} is not installed on node {node}")]
    NotInstalled { keyspace: String, node: i32 },
    #[error("wrong password for application {0}")]
    InvalidPassword(String),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeSchemaProcessStatus {
    WaitingInstall,
    Installing,
    ProcessingInstalling,
    Installed,
    WaitingRemove,
    Removing,
    ProcessingRemoving,
    Removed,
}

impl NodeSchemaProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingInstall => "WAITING_INSTALL",
            Self::Installing => "INSTALLING",
            Self::ProcessingInstalling => "PROCESSING_INSTALLING",
            Self::Installed => "INSTALLED",
            Self::WaitingRemove => "WAITING_REMOVE",
            Self::Removing => "REMOVING",
            Self::ProcessingRemoving => "PROCESSING_REMOVING",
            Self::Removed => "REMOVED",
        }
    }

    fn is_install_phase(self) -> bool {
        matches!(
            self,
            Self::WaitingInstall | Self::Installing | Self::ProcessingInstalling | Self::Installed
        )
    }
}

impl fmt::Display for NodeSchemaProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeSchemaProcessStatus {
    type Err = SchemaFsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "WAITING_INSTALL" => Self::WaitingInstall,
            "INSTALLING" => Self::Installing,
            "PROCESSING_INSTALLING" => Self::ProcessingInstalling,
            "INSTALLED" => Self::Installed,
            "WAITING_REMOVE" => Self::WaitingRemove,
            "REMOVING" => Self::Removing,
            "PROCESSING_REMOVING" => Self::ProcessingRemoving,
            "REMOVED" => Self::Removed,
            other => return Err(SchemaFsmError::Malformed(format!("status {other}"))),
        })
    }
}

/// State of one keyspace on one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSchemaEntry {
    pub node_id: i32,
    pub keyspace: String,
    pub status: NodeSchemaProcessStatus,
    pub wait_for: Vec<i32>,
}

impl NodeSchemaEntry {
    fn key(&self) -> Row {
        Row::from([
            (columns::NODE_ID.to_string(), Value::from(self.node_id)),
            (columns::KEYSPACE_NAME.to_string(), Value::from(self.keyspace.as_str())),
        ])
    }

    fn to_row(&self) -> Row {
        let mut row = self.key();
        row.insert(columns::PROCESS_STATUS.into(), Value::from(self.status.as_str()));
        row.insert(columns::WAIT_FOR.into(), Value::from(encode_wait_for(&self.wait_for)));
        row
    }

    fn from_row(row: &Row) -> Result<Self, SchemaFsmError> {
        let malformed = |col: &str| SchemaFsmError::Malformed(format!("{col} missing"));
        let node_id = cell(row, columns::NODE_ID)
            .as_int()
            .ok_or_else(|| malformed(columns::NODE_ID))?;
        Ok(Self {
            node_id: i32::try_from(node_id).map_err(|_| {
                SchemaFsmError::Malformed(format!("{} out of range: {node_id}", columns::NODE_ID))
            })?,
            keyspace: cell(row, columns::KEYSPACE_NAME)
                .as_text()
                .ok_or_else(|| malformed(columns::KEYSPACE_NAME))?
                .to_string(),
            status: cell(row, columns::PROCESS_STATUS)
                .as_text()
                .ok_or_else(|| malformed(columns::PROCESS_STATUS))?
                .parse()?,
            wait_for: decode_wait_for(cell(row, columns::WAIT_FOR).as_text().unwrap_or_default()),
        })
    }

    fn with_status(&self, status: NodeSchemaProcessStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Lease settings of an application, in milliseconds on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationLease {
    pub client_lease: Duration,
    pub server_additional: Duration,
}

impl ApplicationLease {
    pub fn total(&self) -> Duration {
        self.client_lease + self.server_additional
    }
}

pub async fn load_entries(access: &DataAccess) -> Result<Vec<NodeSchemaEntry>, SchemaFsmError> {
    let rows = access
        .select(APPLICATIONS_KEYSPACE, NODE_SCHEMAS, &[], None)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        match NodeSchemaEntry::from_row(row) {
            Ok(entry) => out.push(entry),
            Err(err) => tracing::warn!(%err, "skipping node schema record"),
        }
    }
    Ok(out)
}

pub async fn find_entry(
    access: &DataAccess,
    node: i32,
    keyspace: &str,
) -> Result<Option<NodeSchemaEntry>, SchemaFsmError> {
    let rows = access
        .select(
            APPLICATIONS_KEYSPACE,
            NODE_SCHEMAS,
            &[
                Clause::new(columns::NODE_ID, node),
                Clause::new(columns::KEYSPACE_NAME, keyspace),
            ],
            None,
        )
        .await?;
    rows.first().map(NodeSchemaEntry::from_row).transpose()
}

pub async fn write_entry(access: &DataAccess, entry: &NodeSchemaEntry) -> Result<(), SchemaFsmError> {
    access
        .insert(APPLICATIONS_KEYSPACE, NODE_SCHEMAS, entry.to_row())
        .await?;
    FSM_TRANSITIONS
        .with_label_values(&["schema", entry.status.as_str()])
        .inc();
    tracing::info!(
        node = entry.node_id,
        keyspace = %entry.keyspace,
        status = %entry.status,
        "node schema record updated"
    );
    Ok(())
}

/// Drop the schema history of a node that left the tree.
pub async fn forget_node(access: &DataAccess, node: i32) -> Result<usize, SchemaFsmError> {
    let rows = access
        .select(
            APPLICATIONS_KEYSPACE,
            NODE_SCHEMAS,
            &[Clause::new(columns::NODE_ID, node)],
            None,
        )
        .await?;
    for row in &rows {
        let entry = NodeSchemaEntry::from_row(row)?;
        access
            .delete(APPLICATIONS_KEYSPACE, NODE_SCHEMAS, entry.key())
            .await?;
    }
    Ok(rows.len())
}

/// Augmented schema of a registered application.
pub async fn load_application(
    access: &DataAccess,
    keyspace: &str,
) -> Result<Option<KeyspaceSchema>, SchemaFsmError> {
    let rows = access
        .select(
            APPLICATIONS_KEYSPACE,
            APPS,
            &[Clause::new(columns::KEYSPACE_NAME, keyspace)],
            None,
        )
        .await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let raw = cell(row, columns::AUGMENTED_SCHEMA)
        .as_text()
        .ok_or_else(|| SchemaFsmError::Malformed(format!("schema of {keyspace}")))?;
    Ok(Some(serde_json::from_str(raw)?))
}

pub async fn load_lease(
    access: &DataAccess,
    keyspace: &str,
) -> Result<Option<ApplicationLease>, SchemaFsmError> {
    let rows = access
        .select(
            APPLICATIONS_KEYSPACE,
            APPLICATION_LEASE_TIME,
            &[Clause::new(columns::KEYSPACE_NAME, keyspace)],
            None,
        )
        .await?;
    Ok(rows.first().map(|row| {
        let millis = |col| cell(row, col).as_int().unwrap_or(0).max(0) as u64;
        ApplicationLease {
            client_lease: Duration::from_millis(millis(columns::CLIENT_LEASE_TIME)),
            server_additional: Duration::from_millis(millis(columns::SERVER_ADDITIONAL_TIME)),
        }
    }))
}

/// Parse, augment and store a new application. Returns the augmented schema.
pub async fn register_application(
    access: &DataAccess,
    keyspace: &str,
    ddl: &str,
    password: &str,
    lease: ApplicationLease,
) -> Result<KeyspaceSchema, SchemaFsmError> {
    if keyspace.starts_with("pathstore") || keyspace == LOCAL_KEYSPACE {
        return Err(SchemaFsmError::ReservedKeyspace(keyspace.to_string()));
    }
    if load_application(access, keyspace).await?.is_some() {
        return Err(SchemaFsmError::AlreadyRegistered(keyspace.to_string()));
    }
    let augmented = augment_keyspace(&parse_keyspace(keyspace, ddl)?);
    let name = Value::from(keyspace);

    access
        .insert(
            APPLICATIONS_KEYSPACE,
            APPS,
            Row::from([
                (columns::KEYSPACE_NAME.to_string(), name.clone()),
                (
                    columns::AUGMENTED_SCHEMA.to_string(),
                    Value::from(serde_json::to_string(&augmented)?),
                ),
            ]),
        )
        .await?;
    access
        .insert(
            APPLICATIONS_KEYSPACE,
            APPLICATION_CREDENTIALS,
            Row::from([
                (columns::KEYSPACE_NAME.to_string(), name.clone()),
                (columns::PASSWORD.to_string(), Value::from(password)),
                (columns::IS_SUPER_USER.to_string(), Value::Bool(false)),
            ]),
        )
        .await?;
    access
        .insert(
            APPLICATIONS_KEYSPACE,
            APPLICATION_LEASE_TIME,
            Row::from([
                (columns::KEYSPACE_NAME.to_string(), name),
                (
                    columns::CLIENT_LEASE_TIME.to_string(),
                    Value::Int(lease.client_lease.as_millis() as i64),
                ),
                (
                    columns::SERVER_ADDITIONAL_TIME.to_string(),
                    Value::Int(lease.server_additional.as_millis() as i64),
                ),
            ]),
        )
        .await?;
    tracing::info!(keyspace, tables = augmented.tables.len(), "application registered");
    Ok(augmented)
}

fn deployed_parents(entries: &[deployment::DeploymentEntry]) -> HashMap<i32, i32> {
    entries
        .iter()
        .filter(|e| e.status == DeploymentProcessStatus::Deployed)
        .map(|e| (e.new_node_id, e.parent_node_id))
        .collect()
}

fn install_entry(node: i32, parent: i32, keyspace: &str) -> NodeSchemaEntry {
    NodeSchemaEntry {
        node_id: node,
        keyspace: keyspace.to_string(),
        status: NodeSchemaProcessStatus::WaitingInstall,
        // the root's parent is NO_PARENT, which never blocks
        wait_for: vec![parent],
    }
}

/// Queue `keyspace` for installation on every deployed node that does not
/// have it yet. Returns the records written.
pub async fn install_application(
    access: &DataAccess,
    keyspace: &str,
) -> Result<Vec<NodeSchemaEntry>, SchemaFsmError> {
    if load_application(access, keyspace).await?.is_none() {
        return Err(SchemaFsmError::UnknownApplication(keyspace.to_string()));
    }
    let parents = deployed_parents(&deployment::load_entries(access).await?);
    let current: HashMap<i32, NodeSchemaProcessStatus> = load_entries(access)
        .await?
        .into_iter()
        .filter(|e| e.keyspace == keyspace)
        .map(|e| (e.node_id, e.status))
        .collect();

    let mut nodes: Vec<_> = parents.into_iter().collect();
    nodes.sort_unstable();
    let mut written = Vec::new();
    for (node, parent) in nodes {
        if current
            .get(&node)
            .is_some_and(|s| *s != NodeSchemaProcessStatus::Removed)
        {
            continue;
        }
        let entry = install_entry(node, parent, keyspace);
        write_entry(access, &entry).await?;
        written.push(entry);
    }
    Ok(written)
}

/// Queue `keyspace` for removal on every node that has it installed. A node
/// waits for each of its children to drop the keyspace first.
pub async fn remove_application(
    access: &DataAccess,
    keyspace: &str,
) -> Result<Vec<NodeSchemaEntry>, SchemaFsmError> {
    // every recorded child counts, including ones still being provisioned
    let tree = DeploymentTree::new(
        deployment::load_entries(access)
            .await?
            .iter()
            .map(|d| (d.new_node_id, d.parent_node_id)),
    );
    let mut written = Vec::new();
    for entry in load_entries(access).await? {
        if entry.keyspace != keyspace || entry.status != NodeSchemaProcessStatus::Installed {
            continue;
        }
        let updated = NodeSchemaEntry {
            status: NodeSchemaProcessStatus::WaitingRemove,
            wait_for: tree.children(entry.node_id),
            ..entry
        };
        write_entry(access, &updated).await?;
        written.push(updated);
    }
    Ok(written)
}

/// One pass of the coordinator. Returns the number of records written.
pub async fn master_tick(access: &DataAccess) -> Result<usize, SchemaFsmError> {
    let entries = load_entries(access).await?;
    let status: HashMap<(i32, &str), NodeSchemaProcessStatus> = entries
        .iter()
        .map(|e| ((e.node_id, e.keyspace.as_str()), e.status))
        .collect();
    let installed =
        |node: i32, ks: &str| status.get(&(node, ks)) == Some(&NodeSchemaProcessStatus::Installed);
    let gone = |node: i32, ks: &str| {
        status
            .get(&(node, ks))
            .is_none_or(|s| *s == NodeSchemaProcessStatus::Removed)
    };

    let mut advanced = 0;
    for entry in &entries {
        let ks = entry.keyspace.as_str();
        let next = match entry.status {
            NodeSchemaProcessStatus::WaitingInstall
                if entry
                    .wait_for
                    .iter()
                    .all(|id| *id == NO_PARENT || installed(*id, ks)) =>
            {
                NodeSchemaProcessStatus::Installing
            }
            NodeSchemaProcessStatus::WaitingRemove if entry.wait_for.iter().all(|id| gone(*id, ks)) => {
                NodeSchemaProcessStatus::Removing
            }
            _ => continue,
        };
        match write_entry(access, &entry.with_status(next)).await {
            Ok(()) => advanced += 1,
            Err(err) => tracing::warn!(%err, node = entry.node_id, keyspace = ks, "failed to advance schema record"),
        }
    }

    // nodes deployed after an install started still need the keyspace
    let installing: HashSet<&str> = entries
        .iter()
        .filter(|e| e.status.is_install_phase())
        .map(|e| e.keyspace.as_str())
        .collect();
    if installing.is_empty() {
        return Ok(advanced);
    }
    let parents = deployed_parents(&deployment::load_entries(access).await?);
    for keyspace in installing {
        for (node, parent) in &parents {
            if status.contains_key(&(*node, keyspace)) {
                continue;
            }
            write_entry(access, &install_entry(*node, *parent, keyspace)).await?;
            advanced += 1;
        }
    }
    Ok(advanced)
}

/// Hand out client credentials for an application installed on this node.
pub async fn register_application_client(
    access: &DataAccess,
    auth: &AuthManager,
    application: &str,
    password: &str,
) -> Result<Credential<String>, SchemaFsmError> {
    let installed = find_entry(access, access.node_id(), application)
        .await?
        .is_some_and(|e| e.status == NodeSchemaProcessStatus::Installed);
    if !installed || !access.schemas().has_keyspace(application) {
        return Err(SchemaFsmError::NotInstalled {
            keyspace: application.to_string(),
            node: access.node_id(),
        });
    }
    let rows = access
        .select(
            APPLICATIONS_KEYSPACE,
            APPLICATION_CREDENTIALS,
            &[Clause::new(columns::KEYSPACE_NAME, application)],
            None,
        )
        .await?;
    let expected = rows
        .first()
        .and_then(|r| cell(r, columns::PASSWORD).as_text().map(str::to_string))
        .ok_or_else(|| SchemaFsmError::UnknownApplication(application.to_string()))?;
    if expected != password {
        return Err(SchemaFsmError::InvalidPassword(application.to_string()));
    }
    let credential = issue_client_credential(application);
    auth.clients().add(credential.clone()).await?;
    tracing::info!(application, username = %credential.username, "issued client credential");
    Ok(credential)
}

/// Node-side executor of this node's schema records.
pub struct SchemaSlave {
    access: Arc<DataAccess>,
    default_lease: Duration,
    pool: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
}

impl SchemaSlave {
    pub fn new(access: Arc<DataAccess>, default_lease: Duration, workers: usize) -> Self {
        Self {
            access,
            default_lease,
            pool: Arc::new(Semaphore::new(workers.max(1))),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, keyspace: &str) -> bool {
        self.in_flight
            .lock()
            .map(|mut f| f.insert(keyspace.to_string()))
            .unwrap_or(false)
    }

    fn release(&self, keyspace: &str) {
        if let Ok(mut f) = self.in_flight.lock() {
            f.remove(keyspace);
        }
    }

    /// Claim this node's released records and start a worker for each.
    pub async fn tick(self: &Arc<Self>) -> Result<usize, SchemaFsmError> {
        let node = self.access.node_id();
        let entries = load_entries(&self.access).await?;
        let mut started = 0;
        for entry in entries.into_iter().filter(|e| e.node_id == node) {
            let processing = match entry.status {
                NodeSchemaProcessStatus::Installing => NodeSchemaProcessStatus::ProcessingInstalling,
                NodeSchemaProcessStatus::Removing => NodeSchemaProcessStatus::ProcessingRemoving,
                _ => continue,
            };
            if !self.claim(&entry.keyspace) {
                continue;
            }
            let claimed = entry.with_status(processing);
            if let Err(err) = write_entry(&self.access, &claimed).await {
                tracing::warn!(%err, keyspace = %claimed.keyspace, "failed to claim schema record");
                self.release(&claimed.keyspace);
                continue;
            }
            let slave = self.clone();
            tokio::spawn(async move {
                if let Ok(_permit) = slave.pool.clone().acquire_owned().await {
                    slave.work(&claimed).await;
                }
                slave.release(&claimed.keyspace);
            });
            started += 1;
        }
        Ok(started)
    }

    async fn work(&self, entry: &NodeSchemaEntry) {
        let (result, done, retry) = match entry.status {
            NodeSchemaProcessStatus::ProcessingInstalling => (
                self.install(&entry.keyspace).await,
                NodeSchemaProcessStatus::Installed,
                NodeSchemaProcessStatus::Installing,
            ),
            NodeSchemaProcessStatus::ProcessingRemoving => (
                self.remove(&entry.keyspace).await,
                NodeSchemaProcessStatus::Removed,
                NodeSchemaProcessStatus::Removing,
            ),
            _ => return,
        };
        let next = match result {
            Ok(()) => done,
            Err(err) => {
                tracing::error!(%err, keyspace = %entry.keyspace, "schema worker failed");
                retry
            }
        };
        if let Err(err) = write_entry(&self.access, &entry.with_status(next)).await {
            tracing::error!(%err, keyspace = %entry.keyspace, "failed to record schema outcome");
        }
    }

    async fn install(&self, keyspace: &str) -> Result<(), SchemaFsmError> {
        let schema = load_application(&self.access, keyspace)
            .await?
            .ok_or_else(|| SchemaFsmError::UnknownApplication(keyspace.to_string()))?;
        tracing::debug!(keyspace, cql = %schema.to_cql(), "creating keyspace");
        self.access.store().create_keyspace(&schema).await?;
        self.access.schemas().register(schema);
        let lease = load_lease(&self.access, keyspace)
            .await?
            .map(|l| l.total())
            .unwrap_or(self.default_lease);
        self.access.cache().set_lease(keyspace, lease);
        tracing::info!(keyspace, ?lease, "keyspace installed");
        Ok(())
    }

    async fn remove(&self, keyspace: &str) -> Result<(), SchemaFsmError> {
        self.access.store().drop_keyspace(keyspace).await?;
        self.access.schemas().unregister(keyspace);
        self.access.cache().remove_keyspace(keyspace);
        tracing::info!(keyspace, "keyspace removed");
        Ok(())
    }
}

pub fn spawn_master(
    access: Arc<DataAccess>,
    loops: LoopOptions,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("schema-master", loops.fsm_interval, loops.jitter, shutdown, move || {
        let access = access.clone();
        async move {
            if let Err(err) = master_tick(&access).await {
                tracing::warn!(%err, "schema master pass failed");
            }
        }
    })
}

pub fn spawn_slave(
    slave: Arc<SchemaSlave>,
    loops: LoopOptions,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("schema-slave", loops.fsm_interval, loops.jitter, shutdown, move || {
        let slave = slave.clone();
        async move {
            if let Err(err) = slave.tick().await {
                tracing::warn!(%err, "schema slave pass failed");
            }
        }
    })
}
