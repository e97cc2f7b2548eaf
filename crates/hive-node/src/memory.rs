//! In-process connections for tests and embedded meshes.
//!
//! A [`MemoryAgent`] pair moves frame bodies between two cores without any
//! framing. Closing either side closes the other. [`MemoryNetwork`] plays
//! the part of the address space: listeners register under a name and
//! connectors dial them.

use crate::agent::{
    Agent, AgentCore, AgentOptions, ConnectedHook, Connector, DisconnectedHook, FrameReceiver,
};
use crate::tcp::Acceptor;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hive_types::{HiveError, HiveResult, Shutdown};
use hive_wire::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One end of an in-memory connection.
pub struct MemoryAgent {
    core: Arc<AgentCore>,
    peer: Arc<AgentCore>,
    started: Mutex<bool>,
    shutdown: Shutdown,
}

impl MemoryAgent {
    /// Two connected ends, both unstarted.
    pub fn pair(options: AgentOptions, shutdown: Shutdown) -> (Arc<Self>, Arc<Self>) {
        Self::pair_named("memory-a", "memory-b", options, shutdown)
    }

    fn pair_named(
        a: &str,
        b: &str,
        options: AgentOptions,
        shutdown: Shutdown,
    ) -> (Arc<Self>, Arc<Self>) {
        // Each side reports the other's name as its remote address.
        let left = Arc::new(AgentCore::new(b, &options));
        let right = Arc::new(AgentCore::new(a, &options));
        let a = Arc::new(Self {
            core: Arc::clone(&left),
            peer: Arc::clone(&right),
            started: Mutex::new(false),
            shutdown: shutdown.clone(),
        });
        let b = Arc::new(Self {
            core: right,
            peer: left,
            started: Mutex::new(false),
            shutdown,
        });
        (a, b)
    }
}

impl Agent for MemoryAgent {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn send(&self, frame: Bytes) -> HiveResult<()> {
        self.core.enqueue(frame)
    }

    fn start(&self) {
        {
            let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
            if *started {
                return;
            }
            *started = true;
        }
        tokio::spawn(pump(
            Arc::clone(&self.core),
            Arc::clone(&self.peer),
            self.shutdown.clone(),
        ));
        self.core.connected();
    }

    fn bind_connected(&self, hook: ConnectedHook) {
        self.core.bind_connected(hook);
    }

    fn bind_disconnected(&self, hook: DisconnectedHook) {
        self.core.bind_disconnected(hook);
    }

    fn bind_receiver(&self, receiver: FrameReceiver) {
        self.core.bind_receiver(receiver);
    }

    fn head(&self, key: &str) -> Option<Value> {
        self.core.head(key)
    }

    fn set_head(&self, key: &str, value: Value) {
        self.core.set_head(key, value);
    }

    fn remote_addr(&self) -> String {
        self.core.addr().to_string()
    }

    fn is_closed(&self) -> bool {
        !self.core.is_enabled()
    }

    fn dispose(&self) {
        self.core.close(None);
        if !*self.started.lock().unwrap_or_else(|e| e.into_inner()) {
            self.peer.close(None);
        }
    }
}

/// Move frames from `core` to `peer` until either side closes.
async fn pump(core: Arc<AgentCore>, peer: Arc<AgentCore>, mut shutdown: Shutdown) {
    let mut batch = VecDeque::new();
    loop {
        core.take_outbound(&mut batch);
        if batch.is_empty() {
            if !core.is_enabled() || peer.is_ended() {
                break;
            }
            tokio::select! {
                _ = core.wake.notified() => {}
                _ = shutdown.wait() => {
                    core.close(None);
                }
            }
            continue;
        }
        for frame in batch.drain(..) {
            if peer.is_ended() {
                break;
            }
            peer.deliver(frame);
        }
    }
    core.close(None);
    peer.close(None);
    debug!(agent = core.id(), "Memory pump finished");
}

/// An in-process address space.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: DashMap<String, Acceptor>,
    attempts: DashMap<String, u32>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept connections to `addr`. Replaces an earlier listener.
    pub fn listen(&self, addr: impl Into<String>, acceptor: Acceptor) {
        self.listeners.insert(addr.into(), acceptor);
    }

    pub fn unlisten(&self, addr: &str) -> bool {
        self.listeners.remove(addr).is_some()
    }

    /// Connect attempts made to `addr` so far.
    pub fn attempts(&self, addr: &str) -> u32 {
        self.attempts.get(addr).map(|n| *n).unwrap_or(0)
    }

    pub fn connector(self: &Arc<Self>, options: AgentOptions, shutdown: Shutdown) -> MemoryConnector {
        MemoryConnector {
            network: Arc::clone(self),
            options,
            shutdown,
        }
    }
}

/// Dials listeners of a [`MemoryNetwork`].
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
    options: AgentOptions,
    shutdown: Shutdown,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: &str) -> HiveResult<Arc<dyn Agent>> {
        *self.network.attempts.entry(addr.to_string()).or_insert(0) += 1;
        let acceptor = self
            .network
            .listeners
            .get(addr)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| HiveError::Connect {
                addr: addr.to_string(),
                reason: "connection refused".to_string(),
            })?;
        let (client, server) =
            MemoryAgent::pair_named("client", addr, self.options, self.shutdown.clone());
        acceptor(server as Arc<dyn Agent>);
        Ok(client as Arc<dyn Agent>)
    }
}
