#![allow(dead_code)]

use std::{
    collections::HashMap,
    ffi::OsStr,
    future::Future,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use pathstore::{
    PathStoreNode,
    access::DataAccess,
    config::{LoopOptions, NodeOptions},
    deployment::{
        self, DeploymentEntry, DeploymentError, DeploymentProcessStatus, Provisioner,
        ServerRecord,
    },
    schema_fsm::{self, ApplicationLease, NodeSchemaProcessStatus},
    store::memory::MemoryStore,
};
use tokio::{net::TcpListener, task::JoinHandle};
use uuid::Uuid;

pub const SHOP_DDL: &str = "CREATE TABLE items (sku TEXT, price INT, name TEXT, PRIMARY KEY (sku));";
pub const SHOP_PASSWORD: &str = "shop-secret";

/// Node options with loops fast enough for tests.
pub fn fast(mut options: NodeOptions) -> NodeOptions {
    options.loops = LoopOptions {
        fsm_interval: Duration::from_millis(50),
        sync_interval: Duration::from_millis(50),
        jitter: 0.0,
    };
    options.deployment.startup_poll = Duration::from_millis(50);
    options.deployment.startup_wait = Duration::from_secs(10);
    options.rpc.request_timeout = Duration::from_secs(5);
    options
}

/// Bind an ephemeral loopback port.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind 127.0.0.1:0");
    let addr = format!("http://{}", listener.local_addr().expect("local_addr"));
    (listener, addr)
}

/// An in-process node serving gRPC on a loopback port.
pub struct TestNode {
    pub node: Arc<PathStoreNode>,
    pub addr: String,
    server: JoinHandle<()>,
}

impl TestNode {
    pub async fn start(options: NodeOptions, listener: TcpListener) -> Self {
        let provisioner = Arc::new(deployment::CommandProvisioner::new(&options.deployment));
        Self::start_with(options, listener, provisioner).await
    }

    pub async fn start_with(
        options: NodeOptions,
        listener: TcpListener,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        let addr = options.node_addr.clone();
        let node = Arc::new(
            PathStoreNode::start_with(options, Arc::new(MemoryStore::new()), provisioner)
                .await
                .expect("start node"),
        );
        let serving = node.clone();
        let server = tokio::spawn(async move {
            if let Err(err) = serving.serve(listener).await {
                eprintln!("node {} stopped serving: {err}", serving.node_id());
            }
        });
        Self { node, addr, server }
    }

    pub async fn root(node_id: i32) -> Self {
        let (listener, addr) = bind().await;
        Self::start(fast(NodeOptions::root(node_id, addr)), listener).await
    }

    pub async fn child(node_id: i32, parent: &TestNode) -> Self {
        let (listener, addr) = bind().await;
        let options = fast(NodeOptions::child(
            node_id,
            addr,
            parent.node.node_id(),
            parent.addr.clone(),
        ));
        Self::start(options, listener).await
    }

    pub fn access(&self) -> Arc<DataAccess> {
        self.node.access().clone()
    }

    pub async fn stop(&self) {
        self.node.shutdown().await;
        self.server.abort();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Poll `check` until it holds, failing the test after 20 seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn server_for(addr: &str) -> ServerRecord {
    let url = url::Url::parse(addr).expect("node address");
    ServerRecord {
        server_uuid: Uuid::new_v4(),
        ip: url.host_str().expect("host").to_string(),
        username: String::new(),
        password: String::new(),
        ssh_port: 22,
        grpc_port: i32::from(url.port().expect("port")),
        name: addr.to_string(),
    }
}

/// Record an already running `child` as deployed under `parent`, as the
/// deployment workers would after provisioning it.
pub async fn record_deployed(root: &TestNode, child: &TestNode, parent: i32) {
    let access = root.access();
    let server = server_for(&child.addr);
    deployment::add_server(&access, &server).await.expect("add server");
    deployment::write_entry(
        &access,
        &DeploymentEntry {
            new_node_id: child.node.node_id(),
            parent_node_id: parent,
            status: DeploymentProcessStatus::Deployed,
            wait_for: Vec::new(),
            server_uuid: server.server_uuid,
        },
    )
    .await
    .expect("write deployment record");
}

pub async fn schema_status(
    access: &DataAccess,
    node: i32,
    keyspace: &str,
) -> Option<NodeSchemaProcessStatus> {
    schema_fsm::find_entry(access, node, keyspace)
        .await
        .ok()
        .flatten()
        .map(|e| e.status)
}

pub async fn deployment_status(access: &DataAccess, node: i32) -> Option<DeploymentProcessStatus> {
    deployment::find_entry(access, node)
        .await
        .ok()
        .flatten()
        .map(|e| e.status)
}

/// Register the shop application on `root` and wait until every node in
/// `nodes` reports it installed.
pub async fn install_shop(root: &TestNode, nodes: &[&TestNode]) {
    let access = root.access();
    schema_fsm::register_application(
        &access,
        "shop",
        SHOP_DDL,
        SHOP_PASSWORD,
        ApplicationLease {
            client_lease: Duration::from_secs(30),
            server_additional: Duration::from_secs(5),
        },
    )
    .await
    .expect("register shop");
    schema_fsm::install_application(&access, "shop")
        .await
        .expect("install shop");
    for node in nodes {
        let id = node.node.node_id();
        let local = node.access();
        let on_root = access.clone();
        eventually(&format!("shop installed on node {id}"), move || {
            let local = local.clone();
            let on_root = on_root.clone();
            async move {
                local.schemas().has_keyspace("shop")
                    && schema_status(&on_root, id, "shop").await
                        == Some(NodeSchemaProcessStatus::Installed)
            }
        })
        .await;
    }
}

/// Provisioner starting nodes inside the test process.
pub struct InProcessProvisioner {
    addrs: Mutex<HashMap<i32, String>>,
    running: Mutex<HashMap<i32, Arc<TestNode>>>,
    listeners: Mutex<HashMap<Uuid, TcpListener>>,
    this: Mutex<Option<Arc<InProcessProvisioner>>>,
}

impl InProcessProvisioner {
    pub fn new() -> Arc<Self> {
        let provisioner = Arc::new(Self {
            addrs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            this: Mutex::new(None),
        });
        *provisioner.this.lock().unwrap() = Some(provisioner.clone());
        provisioner
    }

    pub fn known(&self, node: i32, addr: &str) {
        self.addrs.lock().unwrap().insert(node, addr.to_string());
    }

    /// Reserve a loopback port and return the server record for it.
    pub async fn reserve(&self) -> ServerRecord {
        let (listener, addr) = bind().await;
        let server = server_for(&addr);
        self.listeners
            .lock()
            .unwrap()
            .insert(server.server_uuid, listener);
        server
    }

    pub fn node(&self, id: i32) -> Option<Arc<TestNode>> {
        self.running.lock().unwrap().get(&id).cloned()
    }

    pub async fn stop_all(&self) {
        let nodes: Vec<_> = self.running.lock().unwrap().drain().map(|(_, n)| n).collect();
        for node in nodes {
            node.stop().await;
        }
        self.this.lock().unwrap().take();
    }
}

#[async_trait]
impl Provisioner for InProcessProvisioner {
    async fn provision(
        &self,
        entry: &DeploymentEntry,
        server: &ServerRecord,
    ) -> Result<(), DeploymentError> {
        let listener = self
            .listeners
            .lock()
            .unwrap()
            .remove(&server.server_uuid)
            .ok_or_else(|| DeploymentError::Provision("no reserved port".into()))?;
        let parent_addr = self
            .addrs
            .lock()
            .unwrap()
            .get(&entry.parent_node_id)
            .cloned()
            .ok_or_else(|| DeploymentError::Provision("unknown parent".into()))?;
        let this: Arc<dyn Provisioner> = self
            .this
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DeploymentError::Provision("provisioner stopped".into()))?;
        let options = fast(NodeOptions::child(
            entry.new_node_id,
            server.grpc_addr(),
            entry.parent_node_id,
            parent_addr,
        ));
        let node = TestNode::start_with(options, listener, this).await;
        self.known(entry.new_node_id, &node.addr);
        self.running
            .lock()
            .unwrap()
            .insert(entry.new_node_id, Arc::new(node));
        Ok(())
    }

    async fn decommission(
        &self,
        entry: &DeploymentEntry,
        _server: &ServerRecord,
    ) -> Result<(), DeploymentError> {
        let node = self.running.lock().unwrap().remove(&entry.new_node_id);
        if let Some(node) = node {
            node.stop().await;
        }
        Ok(())
    }
}

/// A `pathstore` binary running as a child process.
pub struct PathStoreProcess {
    child: Child,
}

impl PathStoreProcess {
    pub fn spawn<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(env!("CARGO_BIN_EXE_pathstore"))
            .args(args)
            .env("PATHSTORE_DISABLE_TRACING", "1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server");
        Self { child }
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for PathStoreProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Allocate a free loopback HTTP address like "http://127.0.0.1:<ephemeral>".
pub fn free_http_addr() -> String {
    use std::net::TcpListener;
    let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).expect("bind 127.0.0.1:0");
    let port = listener.local_addr().expect("local_addr").port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}
