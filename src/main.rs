mod cli;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use edgemesh_p2p::{
    NodeStatus, RelayClient, RelayClientConfig, RelayClientEvent, RelayServer,
    RelayServerConfig, Server, ServerConfig,
};
use edgemesh_registry::{HttpRegistry, NodeRecord, NodeRegistry, NodeRole};

/// Optional YAML config file; CLI flags win when both are given.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    bootnodes: Vec<String>,
    #[serde(default)]
    relaynodes: Vec<String>,
}

fn load_file_config(path: Option<&PathBuf>) -> anyhow::Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edgemesh")
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default.parse().unwrap()),
        )
        .init();
}

fn registry_client(url: &Option<String>, canister: &str) -> Option<Arc<dyn NodeRegistry>> {
    url.as_ref()
        .map(|u| Arc::new(HttpRegistry::new(u.clone(), canister)) as Arc<dyn NodeRegistry>)
}

async fn register(
    registry: &Arc<dyn NodeRegistry>,
    role: NodeRole,
    node_id: String,
    principal: String,
    addr: String,
) {
    let record = NodeRecord {
        node_id,
        principal,
        role,
        addr,
    };
    if let Err(e) = registry.register_node(record).await {
        tracing::warn!("node registration failed: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let file = load_file_config(cli.config.as_ref())?;
    let keypair_path = data_dir(&cli).join("network-key");

    match cli.command {
        Commands::Node {
            listen,
            bootnodes,
            role,
            name,
            registry_url,
            canister,
            principal,
        } => {
            let bootnodes = if bootnodes.is_empty() {
                file.bootnodes
            } else {
                bootnodes
            };

            let mut config = ServerConfig::new(listen, bootnodes);
            config.keypair_path = Some(keypair_path.clone());
            if let Some(name) = name {
                config.node_name = name;
            }

            // Resolve the identity up front so the status record carries it.
            let key = edgemesh_p2p::identity::load_or_create_keypair(&keypair_path)?;
            let node_id = key.public().to_peer_id().to_string();

            let status = Arc::new(NodeStatus::new(config.node_name.clone(), node_id.clone()));
            let handle = Server::new(config, status).start()?;

            if let Some(registry) = registry_client(&registry_url, &canister) {
                // Register once the first listen address is known.
                let principal = principal.unwrap_or_else(|| node_id.clone());
                let node_id = node_id.clone();
                let server = handle.clone();
                tokio::spawn(async move {
                    let addr = loop {
                        if let Some(addr) = server.listen_addrs().into_iter().next() {
                            break addr;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    };
                    let full = format!("{addr}/p2p/{node_id}");
                    register(&registry, role, node_id.clone(), principal.clone(), full).await;
                });
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            handle.shutdown();
        }

        Commands::Edge {
            relaynodes,
            min_relay_connections,
            role,
            registry_url,
            canister,
            principal,
        } => {
            let relaynodes = if relaynodes.is_empty() {
                file.relaynodes
            } else {
                relaynodes
            };

            let mut config = RelayClientConfig::new(relaynodes);
            config.minimum_relay_connections = min_relay_connections;
            config.keypair_path = Some(keypair_path);

            let handle = RelayClient::new(config).start()?;
            let node_id = handle.local_peer_id().to_string();
            let status = Arc::new(NodeStatus::new("edge", node_id.clone()));

            // Every new reservation updates the advertised relay address
            // and re-registers the node under its relayed form.
            let registry = registry_client(&registry_url, &canister);
            let principal = principal.unwrap_or_else(|| node_id.clone());
            {
                let handle = handle.clone();
                let status = Arc::clone(&status);
                let node_id = node_id.clone();
                let mut events = handle.subscribe_events();
                tokio::spawn(async move {
                    while let Ok(event) = events.recv().await {
                        if let RelayClientEvent::Reserved { relay } = event {
                            let Some(addr) = handle.advertised_addrs().into_iter().next()
                            else {
                                continue;
                            };
                            tracing::info!("reachable via relay {relay} at {addr}");
                            status.set_relay_addr(addr.to_string());
                            if let Some(registry) = &registry {
                                register(
                                    registry,
                                    role,
                                    node_id.clone(),
                                    principal.clone(),
                                    addr.to_string(),
                                )
                                .await;
                            }
                        }
                    }
                });
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            handle.shutdown();
        }

        Commands::Relay { listen } => {
            let mut config = RelayServerConfig::new(listen);
            config.keypair_path = Some(keypair_path);

            let handle = RelayServer::new(config).start()?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            handle.shutdown();
        }
    }

    Ok(())
}
