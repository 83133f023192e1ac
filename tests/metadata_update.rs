//! `UpdateNode` refreshes the local node's metadata and bumps its
//! incarnation so the new metadata out-races any stale copy in gossip.

mod common;

use common::{node_addr, spawn_node, wait_until};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use swim_membership::app::Core;
use swim_membership::delegate::{ConflictDelegate, Delegate, MergeDelegate, NoopEventDelegate};
use std::time::Duration;

struct CounterDelegate {
    value: AtomicU8,
}

impl Delegate for CounterDelegate {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        vec![self.value.load(Ordering::SeqCst)]
    }
}
impl MergeDelegate for CounterDelegate {}
impl ConflictDelegate for CounterDelegate {}

#[tokio::test]
async fn update_node_propagates_new_metadata() {
    let delegate = Arc::new(CounterDelegate {
        value: AtomicU8::new(1),
    });
    let a = Core::create(
        common::test_config("a"),
        delegate.clone() as Arc<dyn Delegate>,
        delegate.clone() as Arc<dyn MergeDelegate>,
        delegate.clone() as Arc<dyn ConflictDelegate>,
        Arc::new(NoopEventDelegate),
    )
    .await
    .unwrap();
    let b = spawn_node("b").await;

    b.join(&[node_addr(&a)]).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || b.num_members() == 2).await);

    delegate.value.store(42, Ordering::SeqCst);
    a.update_node().unwrap();

    let updated = wait_until(Duration::from_secs(2), || {
        b.members()
            .into_iter()
            .find(|n| &n.name == a.local_name())
            .map(|n| n.meta == vec![42])
            .unwrap_or(false)
    })
    .await;
    assert!(updated, "b should observe a's refreshed metadata via gossip");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
