//! tests/common/mod.rs
//!
//! Spawns real `Core` instances on ephemeral loopback ports for end-to-end
//! coverage over raw UDP/TCP sockets.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use swim_membership::app::Core;
use swim_membership::config::Config;
use swim_membership::delegate::{ConflictDelegate, Delegate, MergeDelegate, NoopDelegate, NoopEventDelegate};
use swim_membership::node::NodeName;

/// A fast-timed config suitable for tests: short probe/gossip/suspicion
/// windows so scenarios converge in well under a second, binding to an
/// OS-assigned loopback port.
pub fn test_config(name: &str) -> Config {
    Config {
        name: NodeName::new(name),
        bind_addr: Ipv4Addr::LOCALHOST.into(),
        bind_port: 0,
        advertise_addr: None,
        advertise_port: None,
        probe_interval_ms: 50,
        probe_timeout_ms: 75,
        indirect_checks: 2,
        suspicion_mult: 2,
        gossip_interval_ms: 20,
        gossip_nodes: 3,
        push_pull_interval_ms: 200,
        tcp_timeout_ms: 150,
        dead_node_reclaim_ms: 500,
        ..Config::default()
    }
}

pub async fn spawn_node(name: &str) -> Arc<Core> {
    spawn_node_with(name, Arc::new(NoopDelegate)).await
}

pub async fn spawn_node_with(name: &str, delegate: Arc<NoopDelegate>) -> Arc<Core> {
    Core::create(
        test_config(name),
        delegate.clone() as Arc<dyn Delegate>,
        delegate.clone() as Arc<dyn MergeDelegate>,
        delegate as Arc<dyn ConflictDelegate>,
        Arc::new(NoopEventDelegate),
    )
    .await
    .expect("Core::create should succeed on a loopback ephemeral port")
}

pub fn node_addr(core: &Core) -> String {
    let node = core
        .members()
        .into_iter()
        .find(|n| &n.name == core.local_name())
        .expect("local node registers itself on Create");
    format!("{}:{}", node.addr, node.port)
}

/// Polls `predicate` until it's true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
