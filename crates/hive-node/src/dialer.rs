//! One outbound connection to one remote node hosting one service.
//!
//! State machine: `Connecting -> Connected -> Disconnected`. A failed connect
//! is retried after a fixed delay; after `max_reconnect` consecutive failures
//! the dialer gives up for good. A connected dialer that loses its link goes
//! back to `Connecting` with a fresh failure budget. `Disconnected` is final.

use crate::agent::{Agent, Connector};
use bytes::Bytes;
use hive_types::{HiveConfig, HiveError, HiveResult, NodeId, PeerConfig, Shutdown};
use hive_wire::packer::pack_heartbeat;
use hive_wire::Head;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for DialerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Retry and heartbeat tunables.
#[derive(Debug, Clone, Copy)]
pub struct DialerOptions {
    pub max_reconnect: u32,
    pub reconnect_delay: Duration,
    pub max_send_retry: u32,
    pub send_retry_delay: Duration,
    /// `None` disables heartbeats.
    pub heartbeat: Option<Duration>,
}

impl DialerOptions {
    pub fn from_config(config: &HiveConfig) -> Self {
        let heartbeat = (!config.debug && config.heartbeat_secs > 0)
            .then(|| config.heartbeat_interval());
        Self {
            max_reconnect: config.max_reconnect,
            reconnect_delay: config.reconnect_delay(),
            max_send_retry: config.max_send_retry,
            send_retry_delay: config.send_retry_delay(),
            heartbeat,
        }
    }
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self::from_config(&HiveConfig::default())
    }
}

/// Where a remote service instance lives.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub svc: u16,
    pub node_id: NodeId,
    pub addr: String,
    pub ver: u32,
    pub meta: Head,
}

impl PeerInfo {
    pub fn new(svc: u16, node_id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            svc,
            node_id,
            addr: addr.into(),
            ver: 0,
            meta: Head::new(),
        }
    }
}

impl From<PeerConfig> for PeerInfo {
    fn from(peer: PeerConfig) -> Self {
        Self {
            svc: peer.svc,
            node_id: peer.node_id,
            addr: peer.addr,
            ver: peer.ver,
            meta: Head::new(),
        }
    }
}

pub type DialerHook = Box<dyn Fn(&Arc<NodeDialer>) + Send + Sync>;
pub type FrameHook = Arc<dyn Fn(Bytes, Arc<dyn Agent>) + Send + Sync>;
pub type SendFailure = Box<dyn FnOnce(HiveError) + Send>;

/// Callbacks into the owner of a dialer.
pub struct DialerHooks {
    /// Fires after every successful connect, reconnects included.
    pub on_connected: DialerHook,
    /// Fires once, when the dialer reaches `Disconnected`.
    pub on_closed: DialerHook,
    /// Every inbound frame body and the agent it arrived on.
    pub on_frame: FrameHook,
}

impl Default for DialerHooks {
    fn default() -> Self {
        Self {
            on_connected: Box::new(|_: &Arc<NodeDialer>| {}),
            on_closed: Box::new(|_: &Arc<NodeDialer>| {}),
            on_frame: Arc::new(|_: Bytes, _: Arc<dyn Agent>| {}),
        }
    }
}

pub struct NodeDialer {
    info: PeerInfo,
    options: DialerOptions,
    connector: Arc<dyn Connector>,
    hooks: DialerHooks,
    state: RwLock<DialerState>,
    agent: RwLock<Option<Arc<dyn Agent>>>,
    attempts: AtomicU32,
    closing: AtomicBool,
    close_signal: Notify,
    closed_fired: AtomicBool,
    shutdown: Shutdown,
}

enum Link {
    Lost,
    Closed,
}

impl NodeDialer {
    pub fn new(
        info: PeerInfo,
        options: DialerOptions,
        connector: Arc<dyn Connector>,
        hooks: DialerHooks,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            options,
            connector,
            hooks,
            state: RwLock::new(DialerState::Connecting),
            agent: RwLock::new(None),
            attempts: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            close_signal: Notify::new(),
            closed_fired: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Spawn the connect loop.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(self).run());
    }

    /// Stop the dialer and drop its connection. The dialer ends `Disconnected`.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_signal.notify_one();
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn svc(&self) -> u16 {
        self.info.svc
    }

    pub fn node_id(&self) -> NodeId {
        self.info.node_id
    }

    pub fn state(&self) -> DialerState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == DialerState::Connected
    }

    /// Connect attempts made over the dialer's lifetime.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn set_state(&self, state: DialerState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Send a frame body. A send that hits a closed link is retried in the
    /// background up to `max_send_retry` times; if all retries fail,
    /// `on_fail` receives the last error. Any other error is returned
    /// immediately and `on_fail` is not called.
    pub fn send(self: &Arc<Self>, frame: Bytes, on_fail: Option<SendFailure>) -> HiveResult<()> {
        match self.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(e)
                if e.is_closed()
                    && self.options.max_send_retry > 0
                    && self.state() != DialerState::Disconnected =>
            {
                debug!(svc = self.info.svc, node_id = self.info.node_id, "Link closed, retrying send");
                tokio::spawn(Arc::clone(self).retry_send(frame, on_fail));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn try_send(&self, frame: Bytes) -> HiveResult<()> {
        let agent = self
            .agent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(HiveError::Closed)?;
        agent.send(frame)
    }

    async fn retry_send(self: Arc<Self>, frame: Bytes, on_fail: Option<SendFailure>) {
        let mut last = HiveError::Closed;
        for attempt in 1..=self.options.max_send_retry {
            tokio::time::sleep(self.options.send_retry_delay).await;
            if self.state() == DialerState::Disconnected {
                break;
            }
            match self.try_send(frame.clone()) {
                Ok(()) => {
                    debug!(svc = self.info.svc, node_id = self.info.node_id, attempt, "Send retry succeeded");
                    return;
                }
                Err(e) if e.is_closed() => {
                    warn!(svc = self.info.svc, node_id = self.info.node_id, attempt, "Send retry hit a closed link");
                    last = e;
                }
                Err(e) => {
                    last = e;
                    break;
                }
            }
        }
        error!(
            svc = self.info.svc,
            node_id = self.info.node_id,
            error = %last,
            "Send failed after retries"
        );
        if let Some(on_fail) = on_fail {
            on_fail(last);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            self.set_state(DialerState::Connecting);
            let Some(agent) = self.dial(&mut shutdown).await else {
                break;
            };

            let (lost_tx, lost_rx) = oneshot::channel::<Option<String>>();
            let lost_tx = Mutex::new(Some(lost_tx));
            agent.bind_disconnected(Box::new(move |err: Option<&HiveError>| {
                if let Some(tx) = lost_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(err.map(|e| e.to_string()));
                }
            }));
            let on_frame = Arc::clone(&self.hooks.on_frame);
            let weak = Arc::downgrade(&agent);
            agent.bind_receiver(Arc::new(move |frame: Bytes| {
                if let Some(agent) = weak.upgrade() {
                    on_frame(frame, agent);
                }
            }));

            *self.agent.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&agent));
            self.set_state(DialerState::Connected);
            agent.start();
            info!(
                svc = self.info.svc,
                node_id = self.info.node_id,
                addr = %self.info.addr,
                "Connected to node"
            );
            (self.hooks.on_connected)(&self);

            match self.hold(&agent, lost_rx, &mut shutdown).await {
                Link::Lost if !self.is_closing() && !shutdown.is_shutdown() => {
                    self.agent.write().unwrap_or_else(|e| e.into_inner()).take();
                    agent.dispose();
                }
                _ => break,
            }
        }
        self.finish();
    }

    /// Connect with retries. `None` when giving up or stopping.
    async fn dial(&self, shutdown: &mut Shutdown) -> Option<Arc<dyn Agent>> {
        let budget = self.options.max_reconnect.max(1);
        let mut failures = 0;
        loop {
            if self.is_closing() || shutdown.is_shutdown() {
                return None;
            }
            self.attempts.fetch_add(1, Ordering::AcqRel);
            let err = match self.connector.connect(&self.info.addr).await {
                Ok(agent) if self.is_closing() => {
                    agent.dispose();
                    return None;
                }
                Ok(agent) => return Some(agent),
                Err(e) => e,
            };

            failures += 1;
            if failures >= budget {
                error!(
                    svc = self.info.svc,
                    node_id = self.info.node_id,
                    addr = %self.info.addr,
                    failures,
                    error = %err,
                    "Giving up on node"
                );
                return None;
            }
            warn!(
                svc = self.info.svc,
                node_id = self.info.node_id,
                addr = %self.info.addr,
                failures,
                error = %err,
                delay = ?self.options.reconnect_delay,
                "Connect failed, will retry"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = self.close_signal.notified() => return None,
                _ = shutdown.wait() => return None,
            }
        }
    }

    /// Keep a live link: heartbeat it and wait for it to end.
    async fn hold(
        &self,
        agent: &Arc<dyn Agent>,
        lost: oneshot::Receiver<Option<String>>,
        shutdown: &mut Shutdown,
    ) -> Link {
        let mut heartbeat = self.options.heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        tokio::pin!(lost);
        loop {
            tokio::select! {
                reason = &mut lost => {
                    let reason = reason.ok().flatten().unwrap_or_else(|| "closed by peer".to_string());
                    warn!(svc = self.info.svc, node_id = self.info.node_id, %reason, "Link to node lost");
                    return Link::Lost;
                }
                _ = self.close_signal.notified() => return Link::Closed,
                _ = shutdown.wait() => return Link::Closed,
                _ = tick(&mut heartbeat) => {
                    if let Err(e) = agent.send(pack_heartbeat()) {
                        debug!(node_id = self.info.node_id, error = %e, "Heartbeat not sent");
                    }
                }
            }
        }
    }

    fn finish(self: &Arc<Self>) {
        self.set_state(DialerState::Disconnected);
        if let Some(agent) = self.agent.write().unwrap_or_else(|e| e.into_inner()).take() {
            agent.dispose();
        }
        if !self.closed_fired.swap(true, Ordering::AcqRel) {
            info!(svc = self.info.svc, node_id = self.info.node_id, "Dialer disconnected");
            (self.hooks.on_closed)(self);
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl fmt::Debug for NodeDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDialer")
            .field("svc", &self.info.svc)
            .field("node_id", &self.info.node_id)
            .field("addr", &self.info.addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOptions;
    use crate::memory::MemoryNetwork;
    use hive_wire::FrameType;
    use std::sync::atomic::AtomicUsize;

    fn options(max_reconnect: u32) -> DialerOptions {
        DialerOptions {
            max_reconnect,
            reconnect_delay: Duration::from_millis(10),
            max_send_retry: 3,
            send_retry_delay: Duration::from_millis(50),
            heartbeat: None,
        }
    }

    async fn wait_for(dialer: &NodeDialer, state: DialerState) {
        for _ in 0..1_000 {
            if dialer.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dialer never reached {state}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_reconnect() {
        let network = MemoryNetwork::new();
        let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
        let closed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        let hooks = DialerHooks {
            on_closed: Box::new(move |_: &Arc<NodeDialer>| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            ..DialerHooks::default()
        };
        let dialer = NodeDialer::new(
            PeerInfo::new(3, 7, "nowhere"),
            options(5),
            connector,
            hooks,
            Shutdown::never(),
        );
        dialer.start();
        wait_for(&dialer, DialerState::Disconnected).await;
        assert_eq!(dialer.attempts(), 5);
        assert_eq!(network.attempts("nowhere"), 5);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(network.attempts("nowhere"), 5, "no attempts after giving up");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_until_connected() {
        let network = MemoryNetwork::new();
        let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
        let dialer = NodeDialer::new(
            PeerInfo::new(3, 7, "late"),
            options(10),
            connector,
            DialerHooks::default(),
            Shutdown::never(),
        );
        dialer.start();
        dialer
            .send(Bytes::from_static(b"\x02hello"), Some(Box::new(|e: HiveError| panic!("send failed: {e}"))))
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        network.listen(
            "late",
            Arc::new(move |agent: Arc<dyn Agent>| {
                let tx = tx.clone();
                agent.bind_receiver(Arc::new(move |frame: Bytes| {
                    let _ = tx.send(frame);
                }));
                agent.start();
            }),
        );
        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame[..], b"\x02hello");
        assert!(dialer.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_callback_after_give_up() {
        let network = MemoryNetwork::new();
        let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
        let dialer = NodeDialer::new(
            PeerInfo::new(3, 7, "nowhere"),
            options(2),
            connector,
            DialerHooks::default(),
            Shutdown::never(),
        );
        dialer.start();
        let (tx, rx) = oneshot::channel();
        dialer
            .send(
                Bytes::from_static(b"\x02x"),
                Some(Box::new(move |e: HiveError| {
                    let _ = tx.send(e.code());
                })),
            )
            .unwrap();
        assert_eq!(rx.await.unwrap(), hive_types::codes::CLOSED);

        // Once disconnected, sends fail immediately.
        assert!(matches!(
            dialer.send(Bytes::from_static(b"\x02x"), None),
            Err(HiveError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_and_close() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        network.listen(
            "hb",
            Arc::new(move |agent: Arc<dyn Agent>| {
                let tx = tx.clone();
                agent.bind_receiver(Arc::new(move |frame: Bytes| {
                    let _ = tx.send(frame);
                }));
                agent.start();
            }),
        );
        let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
        let dialer = NodeDialer::new(
            PeerInfo::new(3, 7, "hb"),
            DialerOptions {
                heartbeat: Some(Duration::from_secs(10)),
                ..options(5)
            },
            connector,
            DialerHooks::default(),
            Shutdown::never(),
        );
        dialer.start();
        let frame = rx.recv().await.unwrap();
        assert_eq!(FrameType::of(&frame).unwrap(), FrameType::Heartbeat);

        dialer.close();
        wait_for(&dialer, DialerState::Disconnected).await;
        assert_eq!(network.attempts("hb"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let network = MemoryNetwork::new();
        let accepted: Arc<Mutex<Vec<Arc<dyn Agent>>>> = Arc::default();
        let a = Arc::clone(&accepted);
        network.listen(
            "flaky",
            Arc::new(move |agent: Arc<dyn Agent>| {
                agent.start();
                a.lock().unwrap().push(agent);
            }),
        );
        let connects = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connects);
        let hooks = DialerHooks {
            on_connected: Box::new(move |_: &Arc<NodeDialer>| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            ..DialerHooks::default()
        };
        let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
        let dialer = NodeDialer::new(
            PeerInfo::new(3, 7, "flaky"),
            options(5),
            connector,
            hooks,
            Shutdown::never(),
        );
        dialer.start();
        wait_for(&dialer, DialerState::Connected).await;

        let first = accepted.lock().unwrap()[0].clone();
        first.dispose();
        for _ in 0..1_000 {
            if connects.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(dialer.is_connected());
        assert_eq!(network.attempts("flaky"), 2);
    }
}
