mod common;

use std::sync::Arc;

use common::{InProcessProvisioner, TestNode, bind, deployment_status, eventually, fast};
use pathstore::{
    client::local_node_id,
    config::{NodeOptions, RpcOptions},
    deployment::{self, DeploymentProcessStatus, DeploymentRequest},
};

async fn root_with(provisioner: &Arc<InProcessProvisioner>) -> TestNode {
    let (listener, addr) = bind().await;
    let root = TestNode::start_with(
        fast(NodeOptions::root(1, addr)),
        listener,
        provisioner.clone(),
    )
    .await;
    provisioner.known(1, &root.addr);
    root
}

#[tokio::test]
async fn chained_plan_deploys_parents_first() {
    let provisioner = InProcessProvisioner::new();
    let root = root_with(&provisioner).await;
    let access = root.access();

    let mut batch = Vec::new();
    for (node, parent) in [(3, 2), (2, 1)] {
        let server = provisioner.reserve().await;
        deployment::add_server(&access, &server).await.unwrap();
        batch.push(DeploymentRequest {
            new_node_id: node,
            parent_node_id: parent,
            server_uuid: server.server_uuid,
        });
    }
    deployment::submit_deployment(&access, &batch).await.unwrap();

    let waiting = deployment::find_entry(&access, 3).await.unwrap().unwrap();
    assert_eq!(waiting.wait_for, vec![2]);

    // node 3 is provisioned by node 2, so it can only come up after it
    for node in [2, 3] {
        let access = access.clone();
        eventually(&format!("node {node} deployed"), move || {
            let access = access.clone();
            async move { deployment_status(&access, node).await == Some(DeploymentProcessStatus::Deployed) }
        })
        .await;
    }
    let leaf = provisioner.node(3).unwrap();
    assert_eq!(local_node_id(&leaf.addr, &RpcOptions::default()).await.unwrap(), 3);

    let tree = deployment::load_tree(&access).await.unwrap();
    assert_eq!(tree.parent(3), Some(2));
    assert_eq!(tree.lca(3, 1), Some(1));

    provisioner.stop_all().await;
    root.stop().await;
}

#[tokio::test]
async fn removal_waits_for_children() {
    let provisioner = InProcessProvisioner::new();
    let root = root_with(&provisioner).await;
    let access = root.access();

    let mut batch = Vec::new();
    for (node, parent) in [(2, 1), (3, 2)] {
        let server = provisioner.reserve().await;
        deployment::add_server(&access, &server).await.unwrap();
        batch.push(DeploymentRequest {
            new_node_id: node,
            parent_node_id: parent,
            server_uuid: server.server_uuid,
        });
    }
    deployment::submit_deployment(&access, &batch).await.unwrap();
    for node in [2, 3] {
        let access = access.clone();
        eventually(&format!("node {node} deployed"), move || {
            let access = access.clone();
            async move { deployment_status(&access, node).await == Some(DeploymentProcessStatus::Deployed) }
        })
        .await;
    }

    let parent = deployment::request_removal(&access, 2).await.unwrap();
    assert_eq!(parent.status, DeploymentProcessStatus::WaitingRemoval);
    assert_eq!(parent.wait_for, vec![3]);
    assert!(matches!(
        deployment::request_removal(&access, 1).await,
        Err(deployment::DeploymentError::InvalidPlan(_))
    ));
    deployment::request_removal(&access, 3).await.unwrap();

    for node in [3, 2] {
        let access = access.clone();
        eventually(&format!("node {node} removed"), move || {
            let access = access.clone();
            async move { deployment_status(&access, node).await.is_none() }
        })
        .await;
    }
    assert!(provisioner.node(2).is_none());
    assert!(provisioner.node(3).is_none());
    assert_eq!(deployment::load_tree(&access).await.unwrap().nodes(), vec![1]);

    provisioner.stop_all().await;
    root.stop().await;
}
