use std::time::Duration;

/// Identity and address of the node this node replicates from.
#[derive(Clone, Debug)]
pub struct ParentOptions {
    pub node_id: i32,
    /// Base gRPC address, e.g. `http://10.0.0.1:1099`.
    pub addr: String,
}

/// Credential every node of the tree presents on node-to-node calls.
#[derive(Clone, Debug)]
pub struct NodeCredential {
    pub username: String,
    pub password: String,
}

impl Default for NodeCredential {
    fn default() -> Self {
        Self {
            username: "pathstore_node".into(),
            password: "pathstore_node".into(),
        }
    }
}

/// Intervals of the background loops.
#[derive(Clone, Copy, Debug)]
pub struct LoopOptions {
    /// Period of the deployment and schema state machines.
    pub fsm_interval: Duration,
    /// Period of the push and pull daemons.
    pub sync_interval: Duration,
    /// Fraction of the interval added as random jitter, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            fsm_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(1),
            jitter: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    /// Client lease used when a keyspace has no `application_lease_time` row.
    pub default_client_lease: Duration,
    /// Server grace period added on top of the client lease.
    pub default_server_additional: Duration,
    /// How long an unclaimed delta is kept on the parent.
    pub delta_retention: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            default_client_lease: Duration::from_secs(30),
            default_server_additional: Duration::from_secs(5),
            delta_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeploymentOptions {
    /// Maximum number of provisioning workers running at once.
    pub worker_pool: usize,
    /// Upper bound on waiting for a freshly provisioned node to answer.
    pub startup_wait: Duration,
    pub startup_poll: Duration,
    /// Shell command run to provision a node. `None` leaves provisioning to
    /// the operator.
    pub deploy_command: Option<String>,
    /// Shell command run to decommission a node.
    pub remove_command: Option<String>,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            worker_pool: 4,
            startup_wait: Duration::from_secs(300),
            startup_poll: Duration::from_secs(2),
            deploy_command: None,
            remove_command: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RpcOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Complete configuration of a PathStore node.
#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub node_id: i32,
    /// `None` for the root of the tree.
    pub parent: Option<ParentOptions>,
    /// Address this node's gRPC server is reachable at.
    pub node_addr: String,
    pub node_credential: NodeCredential,
    /// Run the master halves of the state machines. Defaults to the root.
    pub master: bool,
    pub loops: LoopOptions,
    pub cache: CacheOptions,
    pub deployment: DeploymentOptions,
    pub rpc: RpcOptions,
}

impl NodeOptions {
    pub fn root(node_id: i32, node_addr: impl Into<String>) -> Self {
        Self {
            node_id,
            parent: None,
            node_addr: node_addr.into(),
            node_credential: NodeCredential::default(),
            master: true,
            loops: LoopOptions::default(),
            cache: CacheOptions::default(),
            deployment: DeploymentOptions::default(),
            rpc: RpcOptions::default(),
        }
    }

    pub fn child(
        node_id: i32,
        node_addr: impl Into<String>,
        parent_id: i32,
        parent_addr: impl Into<String>,
    ) -> Self {
        Self {
            parent: Some(ParentOptions {
                node_id: parent_id,
                addr: parent_addr.into(),
            }),
            master: false,
            ..Self::root(node_id, node_addr)
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent_id(&self) -> Option<i32> {
        self.parent.as_ref().map(|p| p.node_id)
    }
}
