//! Overlay server integration tests: mesh formation over bootnodes,
//! discovery-driven transitive connects, and peer-update gossip.
//!
//! Everything runs on loopback TCP with OS-assigned ports.

use std::{sync::Arc, time::Duration};

use libp2p::PeerId;
use tokio::time::timeout;

use edgemesh_p2p::{NodeStatus, Server, ServerConfig, ServerHandle};

async fn spawn_node(bootnodes: Vec<String>) -> ServerHandle {
    let config = ServerConfig::new("/ip4/127.0.0.1/tcp/0".parse().unwrap(), bootnodes);
    let handle = Server::new(config, Arc::new(NodeStatus::new("test", "test")))
        .start()
        .expect("server starts");

    timeout(Duration::from_secs(5), async {
        loop {
            if !handle.listen_addrs().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("listen addr");
    handle
}

fn full_addr(handle: &ServerHandle) -> String {
    format!(
        "{}/p2p/{}",
        handle.listen_addrs()[0],
        handle.local_peer_id()
    )
}

async fn wait_until<F>(secs: u64, label: &str, cond: F)
where
    F: Fn() -> bool,
{
    timeout(Duration::from_secs(secs), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {label}"));
}

#[tokio::test]
async fn two_nodes_mesh_via_bootnode() {
    let a = spawn_node(vec![]).await;
    let b = spawn_node(vec![full_addr(&a)]).await;

    let (a_id, b_id) = (a.local_peer_id(), b.local_peer_id());
    wait_until(20, "a<->b mesh", || {
        a.is_connected(b_id) && b.is_connected(a_id)
    })
    .await;

    // The bootnode connection counter tracks the live connection.
    assert_eq!(b.bootnode_conn_count(), 1);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn bootnode_counter_drops_on_disconnect() {
    let a = spawn_node(vec![]).await;
    let b = spawn_node(vec![full_addr(&a)]).await;

    let a_id = a.local_peer_id();
    wait_until(20, "b connects a", || b.is_connected(a_id)).await;

    a.shutdown();
    wait_until(30, "counter drop", || b.bootnode_conn_count() == 0).await;
    assert!(!b.is_connected(a_id));

    b.shutdown();
}

#[tokio::test]
async fn discovery_connects_transitive_peers() {
    // Chain bootstrap: B boots from A, C boots from B. C should learn A
    // through B's discovery service and dial it.
    let a = spawn_node(vec![]).await;
    let b = spawn_node(vec![full_addr(&a)]).await;
    let c = spawn_node(vec![full_addr(&b)]).await;

    let a_id = a.local_peer_id();
    wait_until(45, "c discovers a", || c.is_connected(a_id)).await;

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn gossiped_addrs_reach_indirect_peers() {
    let a = spawn_node(vec![]).await;
    let b = spawn_node(vec![full_addr(&a)]).await;
    let c = spawn_node(vec![full_addr(&b)]).await;

    let (a_id, b_id) = (a.local_peer_id(), b.local_peer_id());
    wait_until(20, "a<->b", || a.is_connected(b_id)).await;
    wait_until(20, "b<->c", || c.is_connected(b_id)).await;

    // Publish a fresh record every second until one propagates to C; the
    // gossip mesh needs a few heartbeats to form, and a record publishes
    // only once.
    let mut published: Vec<PeerId> = Vec::new();
    let seen = timeout(Duration::from_secs(45), async {
        loop {
            let p = libp2p::identity::Keypair::generate_ed25519()
                .public()
                .to_peer_id();
            a.add_addr(p, "/ip4/1.2.3.4/tcp/9".parse().unwrap());
            published.push(p);

            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(found) = published
                .iter()
                .find(|p| !c.peer_info(**p).addrs.is_empty())
            {
                return *found;
            }
        }
    })
    .await
    .expect("gossiped record reached C");

    let addrs = c.peer_info(seen).addrs;
    assert!(addrs.contains(&"/ip4/1.2.3.4/tcp/9".parse().unwrap()));
    // A's own record never loops back into its own peer store.
    assert!(a.peer_info(a_id).addrs.is_empty());

    a.shutdown();
    b.shutdown();
    c.shutdown();
}
