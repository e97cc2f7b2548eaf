//! Process-wide tunables, loaded from a TOML file with defaults.
//!
//! A missing or malformed file is never fatal: the loader logs a warning and
//! falls back to [`HiveConfig::default`].

use crate::error::{HiveError, HiveResult};
use crate::id::{NodeId, MAX_NODE_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// A statically configured remote service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Service hosted by the peer.
    pub svc: u16,
    /// The peer's node id.
    pub node_id: NodeId,
    /// `ip:port` of the peer's listener.
    pub addr: String,
    /// Protocol version the peer speaks.
    #[serde(default)]
    pub ver: u32,
}

/// Runtime configuration shared by every component of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// This node's id (also baked into every tid it generates).
    pub node_id: NodeId,
    /// Services hosted by this node.
    pub services: Vec<u16>,
    /// Listener address.
    pub listen_addr: String,
    /// Width of the transport length prefix: 2 or 4 bytes.
    pub length_prefix: u8,
    /// Largest accepted frame body.
    pub max_frame_size: u32,
    /// Consecutive connect failures before a dialer gives up.
    pub max_reconnect: u32,
    /// Delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Retries of a send that failed on a closed transport.
    pub max_send_retry: u32,
    /// Delay between send retries.
    pub send_retry_ms: u64,
    /// Window after which an unanswered request fails with a timeout.
    pub response_timeout_ms: u64,
    /// Heartbeat period of connected dialers.
    pub heartbeat_secs: u64,
    /// Debug mode disables heartbeats.
    pub debug: bool,
    /// Encode outbound payloads as JSON instead of MessagePack.
    pub json: bool,
    /// Active-worker idle check period; idle workers are evicted after twice this.
    pub worker_check_interval_secs: u64,
    /// Initial capacity of each work-queue buffer.
    pub worker_capacity: usize,
    /// Number of shared workers; 0 means CPU parallelism.
    pub share_workers: usize,
    /// High-watermark of an agent's outbound queue; 0 means unbounded.
    pub max_pending_frames: usize,
    /// Upper bound for each subsystem drain on graceful exit.
    pub shutdown_timeout_secs: u64,
    /// Statically known peers, used when no discovery backend is wired in.
    pub peers: Vec<PeerConfig>,
    /// Metadata advertised with this node's watch subscriptions.
    pub watch_meta: BTreeMap<String, String>,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            services: Vec::new(),
            listen_addr: "127.0.0.1:0".to_string(),
            length_prefix: 4,
            max_frame_size: 16 * 1024 * 1024,
            max_reconnect: 5,
            reconnect_delay_ms: 1_000,
            max_send_retry: 3,
            send_retry_ms: 200,
            response_timeout_ms: 5_000,
            heartbeat_secs: 10,
            debug: false,
            json: false,
            worker_check_interval_secs: 32,
            worker_capacity: 64,
            share_workers: 0,
            max_pending_frames: 65_536,
            shutdown_timeout_secs: 10,
            peers: Vec::new(),
            watch_meta: BTreeMap::new(),
        }
    }
}

impl HiveConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> HiveResult<()> {
        if self.length_prefix != 2 && self.length_prefix != 4 {
            return Err(HiveError::Config(format!(
                "length_prefix must be 2 or 4, got {}",
                self.length_prefix
            )));
        }
        if !(0..=MAX_NODE_ID).contains(&self.node_id) {
            return Err(HiveError::Config(format!(
                "node_id {} outside 0..={MAX_NODE_ID}",
                self.node_id
            )));
        }
        if self.length_prefix == 2 && self.max_frame_size > u16::MAX as u32 {
            return Err(HiveError::Config(format!(
                "max_frame_size {} does not fit a 2-byte length prefix",
                self.max_frame_size
            )));
        }
        if self.worker_check_interval_secs == 0 {
            return Err(HiveError::Config(
                "worker_check_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn worker_check_interval(&self) -> Duration {
        Duration::from_secs(self.worker_check_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Effective number of shared workers.
    pub fn share_worker_count(&self) -> usize {
        if self.share_workers > 0 {
            return self.share_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> HiveResult<String> {
        toml::to_string_pretty(self).map_err(|e| HiveError::Config(e.to_string()))
    }
}

/// Load configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> HiveConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return HiveConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return HiveConfig::default();
        }
    };

    match toml::from_str::<HiveConfig>(&contents) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Invalid config, using defaults"
                );
                HiveConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            HiveConfig::default()
        }
    }
}

/// `hive.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("hive.toml")
}
