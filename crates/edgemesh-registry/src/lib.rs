//! Client for the on-chain node registry.
//!
//! Nodes register their identity, role and current address in an external
//! canister-style key-value service so that clients can locate suitable
//! workers. The overlay only *consumes* this service; [`NodeRegistry`] is
//! the seam, with an HTTP gateway client for production and an in-memory
//! implementation for tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("http error: {0}")]
    Http(String),

    #[error("gateway rejected call: {0}")]
    Rejected(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Role a node advertises to the registry.
///
/// The numeric values are the canister's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Router,
    Validator,
    Computing,
}

impl NodeRole {
    pub fn as_u64(self) -> u64 {
        match self {
            NodeRole::Router => 0,
            NodeRole::Validator => 1,
            NodeRole::Computing => 2,
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "router" => Ok(NodeRole::Router),
            "validator" => Ok(NodeRole::Validator),
            "computing" => Ok(NodeRole::Computing),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

/// One registered node as reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Base58 peer id the node is dialable under.
    pub node_id: String,
    /// Principal that owns the registration.
    pub principal: String,
    pub role: NodeRole,
    /// Current advertised multiaddr (relayed form for private nodes).
    #[serde(default)]
    pub addr: String,
}

/// Seam to the on-chain registry.
#[async_trait]
pub trait NodeRegistry: Send + Sync + 'static {
    /// Register (or re-register) this node under `principal`.
    async fn register_node(&self, record: NodeRecord) -> Result<(), RegistryError>;

    /// Every registered node.
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, RegistryError>;

    /// Only nodes registered with the computing role.
    async fn list_computing_nodes(&self) -> Result<Vec<NodeRecord>, RegistryError>;
}

// ── HTTP gateway client ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CallBody<'a, T: Serialize> {
    method: &'a str,
    args: T,
}

#[derive(Debug, Deserialize)]
struct CallReply<T> {
    #[serde(default)]
    error: Option<String>,
    result: Option<T>,
}

/// Registry client speaking JSON to a canister HTTP gateway.
pub struct HttpRegistry {
    base_url: String,
    canister_id: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, canister_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            canister_id: canister_id.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn call<A: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        args: A,
    ) -> Result<R, RegistryError> {
        let url = format!(
            "{}/api/v1/canister/{}/call",
            self.base_url.trim_end_matches('/'),
            self.canister_id
        );
        let reply: CallReply<R> = self
            .client
            .post(&url)
            .json(&CallBody { method, args })
            .send()
            .await
            .map_err(|e| RegistryError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| RegistryError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        if let Some(err) = reply.error {
            return Err(RegistryError::Rejected(err));
        }
        reply
            .result
            .ok_or_else(|| RegistryError::Decode("reply carries no result".into()))
    }
}

#[derive(Debug, Serialize)]
struct RegisterArgs<'a> {
    node_type: u64,
    node_id: &'a str,
    principal: &'a str,
    addr: &'a str,
}

#[async_trait]
impl NodeRegistry for HttpRegistry {
    async fn register_node(&self, record: NodeRecord) -> Result<(), RegistryError> {
        let _: serde_json::Value = self
            .call(
                "registerNode",
                RegisterArgs {
                    node_type: record.role.as_u64(),
                    node_id: &record.node_id,
                    principal: &record.principal,
                    addr: &record.addr,
                },
            )
            .await?;
        tracing::info!("registered node {} as {:?}", record.node_id, record.role);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, RegistryError> {
        self.call("listNodes", serde_json::json!({})).await
    }

    async fn list_computing_nodes(&self) -> Result<Vec<NodeRecord>, RegistryError> {
        self.call("listComputingNodes", serde_json::json!({})).await
    }
}

// ── In-memory registry ────────────────────────────────────────────────────────

/// In-process registry, shared between nodes of one test via `Arc`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    nodes: Arc<Mutex<HashMap<String, NodeRecord>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRegistry for InMemoryRegistry {
    async fn register_node(&self, record: NodeRecord) -> Result<(), RegistryError> {
        self.nodes
            .lock()
            .unwrap()
            .insert(record.node_id.clone(), record);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, RegistryError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn list_computing_nodes(&self) -> Result<Vec<NodeRecord>, RegistryError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.role == NodeRole::Computing)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, role: NodeRole) -> NodeRecord {
        NodeRecord {
            node_id: id.into(),
            principal: "aaaaa-aa".into(),
            role,
            addr: String::new(),
        }
    }

    #[test]
    fn role_values_match_the_canister_contract() {
        assert_eq!(NodeRole::Router.as_u64(), 0);
        assert_eq!(NodeRole::Validator.as_u64(), 1);
        assert_eq!(NodeRole::Computing.as_u64(), 2);
    }

    #[tokio::test]
    async fn memory_registry_reregisters_in_place() {
        let reg = InMemoryRegistry::new();
        reg.register_node(record("a", NodeRole::Router)).await.unwrap();
        reg.register_node(record("a", NodeRole::Computing)).await.unwrap();

        let nodes = reg.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].role, NodeRole::Computing);
    }

    #[tokio::test]
    async fn computing_filter_excludes_other_roles() {
        let reg = InMemoryRegistry::new();
        reg.register_node(record("a", NodeRole::Router)).await.unwrap();
        reg.register_node(record("b", NodeRole::Computing)).await.unwrap();

        let computing = reg.list_computing_nodes().await.unwrap();
        assert_eq!(computing.len(), 1);
        assert_eq!(computing[0].node_id, "b");
    }
}
