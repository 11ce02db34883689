//! Relay rendezvous integration tests.
//!
//! All tests run on real loopback TCP with port 0: a relay server is
//! spawned in-process, a private node reserves a circuit on it, and the
//! alive protocol is exercised over the same pair.

use std::time::{Duration, Instant};

use tokio::time::timeout;

use edgemesh_p2p::{
    protocol::ALIVE_PROTO_NAME,
    RelayClient, RelayClientConfig, RelayClientEvent, RelayServer, RelayServerConfig,
    RelayServerHandle,
};

async fn spawn_relay() -> RelayServerHandle {
    let handle = RelayServer::new(RelayServerConfig::new(
        "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
    ))
    .start()
    .expect("relay server starts");

    timeout(Duration::from_secs(5), async {
        loop {
            if !handle.listen_addrs().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("relay listen addr");
    handle
}

async fn wait_for_event<F>(
    rx: &mut tokio::sync::broadcast::Receiver<RelayClientEvent>,
    matcher: F,
    secs: u64,
    label: &str,
) where
    F: Fn(&RelayClientEvent) -> bool,
{
    timeout(Duration::from_secs(secs), async {
        loop {
            match rx.recv().await {
                Ok(ev) if matcher(&ev) => return,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed waiting for {label}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {label}"));
}

#[tokio::test]
async fn private_node_reserves_then_survives_relay_churn() {
    let relay = spawn_relay().await;
    let relay_id = relay.local_peer_id();
    let relay_addr = relay.listen_addrs()[0].to_string();

    let client = RelayClient::new(RelayClientConfig::new(vec![relay_addr]))
        .start()
        .expect("relay client starts");
    let mut events = client.subscribe_events();

    // The first keep-alive tick fires after 5 s and reserves a circuit.
    wait_for_event(
        &mut events,
        |ev| matches!(ev, RelayClientEvent::Reserved { relay } if *relay == relay_id),
        20,
        "reservation",
    )
    .await;

    assert!(client.num_relay_peers() >= 1);
    let info = client.relay_peer(relay_id).expect("relay peer recorded");
    assert!(info.reservation.expiration > Instant::now());

    let advertised = client.advertised_addrs();
    assert!(!advertised.is_empty());
    let advertised = advertised[0].to_string();
    assert!(advertised.contains("p2p-circuit"));
    assert!(advertised.ends_with(&client.local_peer_id().to_string()));

    // Kill the relay: the disconnect notification must drop the record.
    relay.shutdown();
    wait_for_event(
        &mut events,
        |ev| matches!(ev, RelayClientEvent::RelayLost { relay } if *relay == relay_id),
        20,
        "relay loss",
    )
    .await;
    assert!(!client.has_relay_peer(relay_id));
    assert_eq!(client.num_relay_peers(), 0);

    client.shutdown();
}

#[tokio::test]
async fn hello_round_trip_closes_the_alive_channel() {
    let relay = spawn_relay().await;
    let relay_id = relay.local_peer_id();
    let relay_addr = relay.listen_addrs()[0].to_string();

    let client = RelayClient::new(RelayClientConfig::new(vec![relay_addr]))
        .start()
        .expect("relay client starts");

    let success = timeout(Duration::from_secs(15), client.hello(relay_id))
        .await
        .expect("hello did not complete")
        .expect("hello failed");
    assert!(success);
    assert!(!client.has_protocol_channel(relay_id, ALIVE_PROTO_NAME));

    // The channel is re-established lazily on the next call.
    let again = timeout(Duration::from_secs(15), client.hello(relay_id))
        .await
        .expect("second hello did not complete")
        .expect("second hello failed");
    assert!(again);

    client.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn shutdown_stops_background_work() {
    let relay = spawn_relay().await;
    let relay_addr = relay.listen_addrs()[0].to_string();
    let relay_id = relay.local_peer_id();

    let client = RelayClient::new(RelayClientConfig::new(vec![relay_addr]))
        .start()
        .expect("relay client starts");

    client.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The event loop is gone: no new network operation can start.
    assert!(client.hello(relay_id).await.is_err());
    relay.shutdown();
}
