//! Feeding service announcements into a node.
//!
//! Discovery backends are anything that can produce a stream of
//! [`DiscoveryEvent`]s. [`run_discovery`] applies them to a [`Node`];
//! [`StaticDiscovery`] announces the peers listed in the config file.

use crate::dialer::PeerInfo;
use crate::node::Node;
use hive_types::{HiveConfig, HiveResult, NodeId, Shutdown};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A change in the set of reachable service instances.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// An instance appeared or re-announced itself.
    Put(PeerInfo),
    /// An instance went away.
    Delete { svc: u16, node_id: NodeId },
}

/// What this node announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRegistration {
    pub node_id: NodeId,
    pub addr: String,
    pub services: Vec<u16>,
}

impl LocalRegistration {
    pub fn from_config(config: &HiveConfig) -> Self {
        Self {
            node_id: config.node_id,
            addr: config.listen_addr.clone(),
            services: config.services.clone(),
        }
    }

    /// One `Put` per hosted service.
    pub fn events(&self) -> Vec<DiscoveryEvent> {
        self.services
            .iter()
            .map(|svc| DiscoveryEvent::Put(PeerInfo::new(*svc, self.node_id, self.addr.clone())))
            .collect()
    }
}

/// Apply discovery events to `node` until the channel closes or shutdown.
pub fn run_discovery(
    node: Arc<Node>,
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = shutdown.wait() => None,
            };
            let Some(event) = event else {
                break;
            };
            if let Err(e) = apply(&node, event) {
                warn!(error = %e, "Discovery event not applied, stopping");
                break;
            }
        }
        debug!(node_id = node.node_id(), "Discovery loop stopped");
    })
}

fn apply(node: &Node, event: DiscoveryEvent) -> HiveResult<()> {
    match event {
        DiscoveryEvent::Put(peer) => {
            debug!(svc = peer.svc, node_id = peer.node_id, addr = %peer.addr, "Service announced");
            node.connect(peer)
        }
        DiscoveryEvent::Delete { svc, node_id } => {
            debug!(svc, node_id, "Service withdrawn");
            node.disconnect(svc, node_id)
        }
    }
}

/// Peers fixed in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<PeerInfo>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers }
    }

    pub fn from_config(config: &HiveConfig) -> Self {
        Self::new(config.peers.iter().cloned().map(PeerInfo::from).collect())
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    /// Send a `Put` for every configured peer.
    pub async fn announce(&self, tx: &mpsc::Sender<DiscoveryEvent>) -> usize {
        let mut sent = 0;
        for peer in &self.peers {
            if tx.send(DiscoveryEvent::Put(peer.clone())).await.is_err() {
                warn!("Discovery channel closed during static announce");
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            info!(peers = sent, "Announced static peers");
        }
        sent
    }
}
