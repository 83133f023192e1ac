//! Two-node join and eventual state propagation.

mod common;

use common::{node_addr, spawn_node, wait_until};
use std::time::Duration;

#[tokio::test]
async fn two_nodes_converge_after_join() {
    let a = spawn_node("a").await;
    let b = spawn_node("b").await;

    let joined = b.join(&[node_addr(&a)]).await.expect("join should succeed");
    assert_eq!(joined, 1);

    let converged = wait_until(Duration::from_secs(2), || {
        a.num_members() == 2 && b.num_members() == 2
    })
    .await;
    assert!(converged, "both nodes should see each other after join + gossip");

    let a_names: Vec<_> = a.members().into_iter().map(|n| n.name).collect();
    let b_names: Vec<_> = b.members().into_iter().map(|n| n.name).collect();
    assert!(a_names.contains(b.local_name()));
    assert!(b_names.contains(a.local_name()));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn three_node_chain_converges_to_full_mesh_view() {
    let a = spawn_node("a").await;
    let b = spawn_node("b").await;
    let c = spawn_node("c").await;

    b.join(&[node_addr(&a)]).await.unwrap();
    c.join(&[node_addr(&b)]).await.unwrap();

    let converged = wait_until(Duration::from_secs(3), || {
        a.num_members() == 3 && b.num_members() == 3 && c.num_members() == 3
    })
    .await;
    assert!(
        converged,
        "gossip should propagate c's existence to a even though c only joined via b"
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}
