mod common;

use common::{SHOP_PASSWORD, TestNode, install_shop, record_deployed};
use pathstore::{
    ApplicationClient,
    deployment,
    client::{ClientError, ClientOptions},
    session::{SessionManager, SessionToken, SessionType},
    store::{Clause, Row, Value, cell},
};

fn item(sku: &str, price: i64) -> Row {
    Row::from([
        ("sku".to_string(), Value::from(sku)),
        ("price".to_string(), Value::Int(price)),
    ])
}

/// Root 1 with two leaves, 2 and 3, all running the shop application.
async fn siblings() -> (TestNode, TestNode, TestNode) {
    let root = TestNode::root(1).await;
    let left = TestNode::child(2, &root).await;
    let right = TestNode::child(3, &root).await;
    record_deployed(&root, &left, 1).await;
    record_deployed(&root, &right, 1).await;
    install_shop(&root, &[&root, &left, &right]).await;
    (root, left, right)
}

#[tokio::test]
async fn lca_comes_from_the_deployment_records() {
    let (root, left, right) = siblings().await;
    let tree = deployment::load_tree(&right.access()).await.unwrap();
    assert_eq!(tree.nodes(), vec![1, 2, 3]);
    assert_eq!(tree.lca(2, 3), Some(1));
    assert_eq!(tree.lca(2, 1), Some(1));
    assert_eq!(tree.lca(3, 3), Some(3));
    assert_eq!(tree.lca(2, 99), None);

    for node in [&root, &left, &right] {
        node.stop().await;
    }
}

#[tokio::test]
async fn swapping_nodes_carries_the_session_data() {
    let (root, left, right) = siblings().await;
    let client = ApplicationClient::connect(
        &left.addr,
        "shop",
        SHOP_PASSWORD,
        ClientOptions::default(),
    )
    .await
    .unwrap();
    client.insert("cart", "shop", "items", &item("a", 10)).await.unwrap();
    client.insert("cart", "shop", "items", &item("b", 20)).await.unwrap();

    client.swap_node(&right.addr).await.unwrap();
    assert_eq!(client.node_id(), 3);
    let token = client.sessions().get("cart").unwrap();
    assert_eq!(token.source_node, 3);
    assert!(token.has_been_validated);

    // visible right away, without waiting for the push daemon
    let rows = client
        .select("cart", "shop", "items", &[Clause::new("sku", "b")], None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(cell(&rows[0], "price"), &Value::Int(20));

    for node in [&root, &left, &right] {
        node.stop().await;
    }
}

#[tokio::test]
async fn moving_down_a_branch_synchronizes_the_destination() {
    let (root, left, right) = siblings().await;
    let client = ApplicationClient::connect(
        &root.addr,
        "shop",
        SHOP_PASSWORD,
        ClientOptions::default(),
    )
    .await
    .unwrap();
    client.insert("s", "shop", "items", &item("a", 1)).await.unwrap();
    // seed a cached query on the destination before the data changes
    let before = right
        .access()
        .select("shop", "items", &[], None)
        .await
        .unwrap();
    assert_eq!(before.len(), 1);
    client
        .update(
            "s",
            "shop",
            "items",
            &Row::from([
                ("sku".to_string(), Value::from("a")),
                ("price".to_string(), Value::Int(2)),
            ]),
        )
        .await
        .unwrap();

    client.swap_node(&right.addr).await.unwrap();
    let rows = right
        .access()
        .select_local("shop", "items", &[], None)
        .await
        .unwrap();
    assert_eq!(cell(&rows[0], "price"), &Value::Int(2));

    for node in [&root, &left, &right] {
        node.stop().await;
    }
}

#[tokio::test]
async fn saved_sessions_are_revalidated_on_connect() {
    let (root, left, right) = siblings().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.jsonl");
    let options = ClientOptions {
        session_file: Some(path.clone()),
        ..ClientOptions::default()
    };

    let client = ApplicationClient::connect(&left.addr, "shop", SHOP_PASSWORD, options.clone())
        .await
        .unwrap();
    client.insert("cart", "shop", "items", &item("a", 5)).await.unwrap();
    client.save_sessions().unwrap();
    drop(client);

    let client = ApplicationClient::connect(&right.addr, "shop", SHOP_PASSWORD, options)
        .await
        .unwrap();
    let token = client.sessions().get("cart").unwrap();
    assert_eq!(token.source_node, 3);
    assert!(token.has_been_validated);
    let rows = client.select("cart", "shop", "items", &[], None).await.unwrap();
    assert_eq!(rows.len(), 1);

    for node in [&root, &left, &right] {
        node.stop().await;
    }
}

#[tokio::test]
async fn sessions_from_unknown_nodes_are_rejected() {
    let (root, left, right) = siblings().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.jsonl");
    let saved = SessionManager::new();
    let mut token = SessionToken::new("stale", SessionType::Table, 42);
    token.add_entry("shop", "items");
    saved.put(token);
    saved.save(&path).unwrap();

    let err = ApplicationClient::connect(
        &left.addr,
        "shop",
        SHOP_PASSWORD,
        ClientOptions {
            session_file: Some(path),
            ..ClientOptions::default()
        },
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, ClientError::SessionRejected(name) if name == "stale"));

    for node in [&root, &left, &right] {
        node.stop().await;
    }
}
