//! End-to-end keyring encryption: two nodes sharing a key converge, a node
//! with no key at all can't talk to them.

mod common;

use common::wait_until;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use swim_membership::app::Core;
use swim_membership::config::Config;
use swim_membership::delegate::{ConflictDelegate, Delegate, MergeDelegate, NoopDelegate, NoopEventDelegate};
use swim_membership::node::NodeName;

fn encrypted_config(name: &str, key: &str) -> Config {
    Config {
        name: NodeName::new(name),
        bind_addr: Ipv4Addr::LOCALHOST.into(),
        bind_port: 0,
        probe_interval_ms: 50,
        probe_timeout_ms: 75,
        gossip_interval_ms: 20,
        push_pull_interval_ms: 200,
        tcp_timeout_ms: 150,
        secret_key: Some(key.to_string()),
        ..Config::default()
    }
}

async fn spawn(config: Config) -> Arc<Core> {
    let delegate = Arc::new(NoopDelegate);
    Core::create(
        config,
        delegate.clone() as Arc<dyn Delegate>,
        delegate.clone() as Arc<dyn MergeDelegate>,
        delegate as Arc<dyn ConflictDelegate>,
        Arc::new(NoopEventDelegate),
    )
    .await
    .unwrap()
}

fn node_addr(core: &Core) -> String {
    let node = core
        .members()
        .into_iter()
        .find(|n| &n.name == core.local_name())
        .unwrap();
    format!("{}:{}", node.addr, node.port)
}

#[tokio::test]
async fn nodes_sharing_a_key_converge() {
    // AES-128-GCM key, base64-encoded.
    let key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [7u8; 16]);

    let a = spawn(encrypted_config("a", &key)).await;
    let b = spawn(encrypted_config("b", &key)).await;

    b.join(&[node_addr(&a)]).await.expect("join over an encrypted channel should succeed");

    let converged = wait_until(Duration::from_secs(2), || {
        a.num_members() == 2 && b.num_members() == 2
    })
    .await;
    assert!(converged);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn node_without_the_key_cannot_join() {
    let key_a = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [1u8; 16]);
    let key_c = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [2u8; 16]);

    let a = spawn(encrypted_config("a", &key_a)).await;
    let c = spawn(encrypted_config("c", &key_c)).await;

    // The push/pull TCP handshake itself is out-of-band of the UDP
    // encrypt envelope in this design, so the connection succeeds at the
    // transport level; what must fail is ever reaching mutual membership
    // agreement, since every gossiped record c hears from a (and vice
    // versa) gets dropped by `resolve_envelope` for lacking the right key.
    let _ = c.join(&[node_addr(&a)]).await;

    let never_converges = !wait_until(Duration::from_millis(500), || {
        a.num_members() == 2 && c.num_members() == 2
    })
    .await;
    assert!(never_converges, "mismatched keys must never reach agreement");

    a.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}
