//! Voluntary leave propagates as a `dead` record the rest of the cluster
//! converges on.

mod common;

use common::{node_addr, spawn_node, wait_until};
use std::time::Duration;

#[tokio::test]
async fn leave_is_observed_by_the_remaining_peer() {
    let a = spawn_node("a").await;
    let b = spawn_node("b").await;
    b.join(&[node_addr(&a)]).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || a.num_members() == 2).await);

    b.leave(Duration::from_millis(500)).await.unwrap();

    let saw_leave = wait_until(Duration::from_secs(2), || a.num_members() == 1).await;
    assert!(saw_leave, "a should stop counting b as live once b leaves");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
