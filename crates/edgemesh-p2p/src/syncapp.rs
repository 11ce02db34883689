//! SyncApp transport seam.
//!
//! The overlay carries `PostAppStatus` / `GetData` / `GetStatus` between
//! peers without interpreting the payloads. The node wires in a
//! [`SyncAppHandler`]; the default [`NodeStatus`] implementation only keeps
//! the local status record current.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use crate::protocol::wire::{
    AppStatus, Data, GetDataRequest, PostPeerStatusRequest, StatusResult,
};

/// Application-side handler for inbound SyncApp calls.
///
/// Handlers run on the swarm event loop and must not block.
pub trait SyncAppHandler: Send + Sync + 'static {
    fn post_app_status(&self, req: PostPeerStatusRequest) -> Vec<StatusResult>;
    fn get_data(&self, req: GetDataRequest) -> Vec<Data>;
    fn get_status(&self) -> AppStatus;
}

/// Default handler: answers `GetStatus` from a live local record and leaves
/// the data-plane calls empty.
pub struct NodeStatus {
    name: String,
    node_id: String,
    startup_time: u64,
    guage_height: AtomicU64,
    guage_max: AtomicU64,
    relay: Mutex<String>,
}

impl NodeStatus {
    pub fn new(name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_id: node_id.into(),
            startup_time: chrono::Utc::now().timestamp() as u64,
            guage_height: AtomicU64::new(0),
            guage_max: AtomicU64::new(0),
            relay: Mutex::new(String::new()),
        }
    }

    /// Record the advertised relay circuit address once a reservation is live.
    pub fn set_relay_addr(&self, addr: impl Into<String>) {
        *self.relay.lock().unwrap() = addr.into();
    }

    pub fn set_gauge(&self, height: u64, max: u64) {
        self.guage_height.store(height, Ordering::Relaxed);
        self.guage_max.store(max, Ordering::Relaxed);
    }

    pub fn status(&self) -> AppStatus {
        let now = chrono::Utc::now().timestamp() as u64;
        AppStatus {
            name: self.name.clone(),
            startup_time: self.startup_time,
            uptime: now.saturating_sub(self.startup_time),
            guage_height: self.guage_height.load(Ordering::Relaxed),
            guage_max: self.guage_max.load(Ordering::Relaxed),
            relay: self.relay.lock().unwrap().clone(),
            node_id: self.node_id.clone(),
        }
    }
}

impl SyncAppHandler for NodeStatus {
    fn post_app_status(&self, _req: PostPeerStatusRequest) -> Vec<StatusResult> {
        Vec::new()
    }

    fn get_data(&self, _req: GetDataRequest) -> Vec<Data> {
        Vec::new()
    }

    fn get_status(&self) -> AppStatus {
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reflects_gauge_and_relay() {
        let status = NodeStatus::new("node-a", "16Uiu2HAm");
        status.set_gauge(3, 8);
        status.set_relay_addr("/ip4/1.2.3.4/tcp/4/p2p/relay/p2p-circuit/p2p/self");

        let s = status.status();
        assert_eq!(s.name, "node-a");
        assert_eq!(s.node_id, "16Uiu2HAm");
        assert_eq!(s.guage_height, 3);
        assert_eq!(s.guage_max, 8);
        assert!(s.relay.contains("p2p-circuit"));
        assert!(s.startup_time > 0);
    }
}
