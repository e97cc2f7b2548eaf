//! Command implementations.

use crate::sys::{self, Ping, Pong, SYS_SVC};
use anyhow::{bail, Context};
use hive_node::{
    run_discovery, AgentOptions, Listener, Node, PeerInfo, StaticDiscovery, TcpConnector,
};
use hive_types::config::default_config_path;
use hive_types::id::now_millis;
use hive_types::{codes, HiveConfig, NodeId, Supervisor};
use hive_wire::{Codec, Head};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Run a node from `config` until Ctrl+C, then drain it.
pub async fn start(config: HiveConfig) -> anyhow::Result<()> {
    let supervisor = Supervisor::new();
    let codec = Codec::new();
    sys::register(&codec)?;

    let options = AgentOptions::from_config(&config);
    let connector = Arc::new(TcpConnector::new(options, supervisor.subscribe()));
    let node = Node::new(config.clone(), codec, connector, supervisor.subscribe())?;
    sys::bind(node.router())?;
    node.on_service_connected(|svc, node_id| info!(svc, node_id, "Service up"));
    node.on_service_disconnected(|svc, node_id| warn!(svc, node_id, "Service down"));

    let listener = Listener::bind(&config.listen_addr, options, supervisor.subscribe())
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(
        node_id = config.node_id,
        addr = %listener.local_addr(),
        services = ?config.services,
        "Node listening"
    );
    let accept = listener.run(node.acceptor());

    let (tx, rx) = mpsc::channel(64);
    let discovery = run_discovery(Arc::clone(&node), rx, supervisor.subscribe());
    StaticDiscovery::from_config(&config).announce(&tx).await;

    supervisor.register("listener", move || async move {
        let _ = accept.await;
    });
    supervisor.register("discovery", move || async move {
        drop(tx);
        let _ = discovery.await;
    });
    let draining = Arc::clone(&node);
    supervisor.register("node", move || async move {
        draining.close().await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("Ctrl+C received, shutting down");
    let reports = supervisor.exit(config.shutdown_timeout()).await;
    let stuck: Vec<&str> = reports
        .iter()
        .filter(|r| r.timed_out)
        .map(|r| r.name.as_str())
        .collect();
    if !stuck.is_empty() {
        warn!(?stuck, "Some subsystems did not drain in time");
    }
    Ok(())
}

/// Ping node `target` at `addr` `count` times from a short-lived node.
pub async fn ping(config: HiveConfig, addr: String, target: NodeId, count: u32) -> anyhow::Result<()> {
    if target == config.node_id {
        bail!("target node id {target} equals this node's id; set a different node_id");
    }
    let supervisor = Supervisor::new();
    let codec = Codec::new();
    sys::register(&codec)?;
    let options = AgentOptions::from_config(&config);
    let connector = Arc::new(TcpConnector::new(options, supervisor.subscribe()));
    let timeout = config.response_timeout();
    let node = Node::new(config, codec, connector, supervisor.subscribe())?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    node.on_service_connected(move |_, node_id| {
        let _ = tx.send(node_id);
    });
    node.connect(PeerInfo::new(SYS_SVC, target, addr.clone()))?;
    if tokio::time::timeout(timeout, rx.recv()).await.is_err() {
        node.close().await;
        bail!("no connection to node {target} at {addr}");
    }

    let mut failures = 0;
    for seq in 1..=count {
        let mut pong = Pong::default();
        let ping = Ping {
            seq,
            sent_ms: now_millis(),
        };
        let code = node.call_node(target, Head::new(), ping, &mut pong).await;
        if code == codes::SUCCESS {
            println!(
                "pong from node {} seq={} time={}ms",
                pong.node_id,
                pong.seq,
                now_millis() - pong.sent_ms
            );
        } else {
            failures += 1;
            println!("seq={seq} failed with code {code}");
        }
    }
    node.close().await;
    if failures > 0 {
        bail!("{failures} of {count} pings failed");
    }
    Ok(())
}

/// Print the effective configuration as TOML.
pub fn config_show(config: &HiveConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Write a default config to `path` (or `hive.toml`). Returns the path written.
pub fn config_init(path: Option<&Path>, force: bool) -> anyhow::Result<PathBuf> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let contents = HiveConfig::default().to_toml()?;
    std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Wrote default config");
    Ok(path)
}
