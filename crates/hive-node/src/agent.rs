//! The connection contract every transport implements.
//!
//! An agent carries whole frame bodies; the transport adds and strips its
//! own framing. Sends are queued and flushed by the agent's write task. A
//! disabled agent refuses sends with `Closed` instead of blocking.

use async_trait::async_trait;
use bytes::Bytes;
use hive_types::{HiveConfig, HiveError, HiveResult};
use hive_wire::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

pub type ConnectedHook = Box<dyn Fn() + Send + Sync>;
pub type DisconnectedHook = Box<dyn Fn(Option<&HiveError>) + Send + Sync>;
pub type FrameReceiver = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A live connection to a remote node or client.
pub trait Agent: Send + Sync {
    /// Process-unique id of this connection.
    fn id(&self) -> u64;

    /// Queue a frame body for sending.
    fn send(&self, frame: Bytes) -> HiveResult<()>;

    /// Start the read and write tasks. Connected hooks fire here.
    fn start(&self);

    fn bind_connected(&self, hook: ConnectedHook);

    /// Fires once when the connection ends, with the error that ended it, if any.
    fn bind_disconnected(&self, hook: DisconnectedHook);

    /// Where inbound frames go. Frames that arrive before a receiver is
    /// bound are held and delivered on binding.
    fn bind_receiver(&self, receiver: FrameReceiver);

    /// Per-connection session value.
    fn head(&self, key: &str) -> Option<Value>;

    fn set_head(&self, key: &str, value: Value);

    fn remote_addr(&self) -> String;

    fn is_closed(&self) -> bool;

    /// Disable sends, flush what is queued and close the connection.
    fn dispose(&self);
}

/// Establishes outbound connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> HiveResult<Arc<dyn Agent>>;
}

/// Transport limits shared by every agent of a node.
#[derive(Debug, Clone, Copy)]
pub struct AgentOptions {
    pub length_prefix: u8,
    pub max_frame_size: u32,
    /// Outbound high-watermark; 0 disables it.
    pub max_pending_frames: usize,
}

impl AgentOptions {
    pub fn from_config(config: &HiveConfig) -> Self {
        Self {
            length_prefix: config.length_prefix,
            max_frame_size: config.max_frame_size,
            max_pending_frames: config.max_pending_frames,
        }
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self::from_config(&HiveConfig::default())
    }
}

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Inbound {
    receiver: Option<FrameReceiver>,
    early: Vec<Bytes>,
}

/// State shared by the transport implementations: outbound queue, hooks,
/// session head and inbound delivery.
pub(crate) struct AgentCore {
    id: u64,
    addr: String,
    max_pending: usize,
    enabled: AtomicBool,
    outbound: Mutex<VecDeque<Bytes>>,
    pub(crate) wake: Notify,
    inbound: Mutex<Inbound>,
    head: RwLock<HashMap<String, Value>>,
    on_connected: Mutex<Vec<ConnectedHook>>,
    on_disconnected: Mutex<Vec<DisconnectedHook>>,
    ended: AtomicBool,
}

impl AgentCore {
    pub(crate) fn new(addr: impl Into<String>, options: &AgentOptions) -> Self {
        Self {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.into(),
            max_pending: options.max_pending_frames,
            enabled: AtomicBool::new(true),
            outbound: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            inbound: Mutex::new(Inbound::default()),
            head: RwLock::new(HashMap::new()),
            on_connected: Mutex::new(Vec::new()),
            on_disconnected: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn enqueue(&self, frame: Bytes) -> HiveResult<()> {
        if !self.is_enabled() {
            return Err(HiveError::Closed);
        }
        {
            let mut queue = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            if self.max_pending > 0 && queue.len() >= self.max_pending {
                return Err(HiveError::Backpressure {
                    pending: queue.len(),
                    max: self.max_pending,
                });
            }
            queue.push_back(frame);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Move everything queued into `batch`.
    pub(crate) fn take_outbound(&self, batch: &mut VecDeque<Bytes>) {
        let mut queue = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::swap(&mut *queue, batch);
    }

    pub(crate) fn deliver(&self, frame: Bytes) {
        let receiver = {
            let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
            match &inbound.receiver {
                Some(receiver) => Arc::clone(receiver),
                None => {
                    inbound.early.push(frame);
                    return;
                }
            }
        };
        receiver(frame);
    }

    pub(crate) fn bind_receiver(&self, receiver: FrameReceiver) {
        let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        // Flush under the lock so held frames stay ahead of new ones.
        for frame in std::mem::take(&mut inbound.early) {
            receiver(frame);
        }
        inbound.receiver = Some(receiver);
    }

    pub(crate) fn bind_connected(&self, hook: ConnectedHook) {
        self.on_connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub(crate) fn bind_disconnected(&self, hook: DisconnectedHook) {
        self.on_disconnected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub(crate) fn connected(&self) {
        let hooks = self.on_connected.lock().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            hook();
        }
    }

    /// Disable the agent and fire the disconnected hooks, once.
    pub(crate) fn close(&self, error: Option<HiveError>) {
        self.enabled.store(false, Ordering::Release);
        self.wake.notify_one();
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        match &error {
            Some(e) => debug!(agent = self.id, addr = %self.addr, error = %e, "Agent disconnected"),
            None => debug!(agent = self.id, addr = %self.addr, "Agent closed"),
        }
        let hooks = std::mem::take(&mut *self.on_disconnected.lock().unwrap_or_else(|e| e.into_inner()));
        for hook in hooks {
            hook(error.as_ref());
        }
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub(crate) fn head(&self, key: &str) -> Option<Value> {
        self.head
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub(crate) fn set_head(&self, key: &str, value: Value) {
        self.head
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn core(max_pending: usize) -> AgentCore {
        AgentCore::new(
            "test",
            &AgentOptions {
                max_pending_frames: max_pending,
                ..AgentOptions::default()
            },
        )
    }

    #[test]
    fn test_backpressure_and_closed() {
        let core = core(2);
        core.enqueue(Bytes::from_static(b"a")).unwrap();
        core.enqueue(Bytes::from_static(b"b")).unwrap();
        assert!(matches!(
            core.enqueue(Bytes::from_static(b"c")),
            Err(HiveError::Backpressure { pending: 2, max: 2 })
        ));

        let mut batch = VecDeque::new();
        core.take_outbound(&mut batch);
        assert_eq!(batch.len(), 2);
        core.enqueue(Bytes::from_static(b"c")).unwrap();

        core.close(None);
        assert!(matches!(
            core.enqueue(Bytes::from_static(b"d")),
            Err(HiveError::Closed)
        ));
    }

    #[test]
    fn test_early_frames_are_held_in_order() {
        let core = core(0);
        core.deliver(Bytes::from_static(b"1"));
        core.deliver(Bytes::from_static(b"2"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        core.bind_receiver(Arc::new(move |f: Bytes| s.lock().unwrap().push(f)));
        core.deliver(Bytes::from_static(b"3"));
        let seen: Vec<_> = seen.lock().unwrap().iter().map(|b| b[0]).collect();
        assert_eq!(seen, b"123".to_vec());
    }

    #[test]
    fn test_disconnected_fires_once() {
        let core = core(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        core.bind_disconnected(Box::new(move |err: Option<&HiveError>| {
            assert!(err.is_some());
            h.fetch_add(1, Ordering::SeqCst);
        }));
        core.close(Some(HiveError::Closed));
        core.close(None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(core.is_ended());
    }

    #[test]
    fn test_head_values() {
        let core = core(0);
        assert!(core.head("uid").is_none());
        core.set_head("uid", Value::from(42i64));
        assert_eq!(core.head("uid"), Some(Value::I64(42)));
    }
}
