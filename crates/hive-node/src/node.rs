//! The service mesh.
//!
//! A [`Node`] keeps one [`NodeDialer`] per remote node, indexed both by the
//! services the node hosts and by its node id, plus the watch tables that say
//! which remote nodes want which notifications. Both are written only by the
//! node's own work queue and read under a lock by concurrent senders.
//!
//! Traffic to a service hosted by this node short-circuits through the
//! router without serialization; everything else is packed and sent through
//! a dialer.

use crate::agent::{Agent, AgentOptions, Connector};
use crate::dialer::{DialerHooks, DialerOptions, NodeDialer, PeerInfo, SendFailure};
use crate::directory::ServiceDirectory;
use crate::selector::{candidates, RandomSelector, Selector};
use crate::tcp::Acceptor;
use bytes::Bytes;
use dashmap::DashMap;
use hive_router::{
    Completion, InboundRequest, NotifyPacket, PendingRequest, PushPacket, Response, ResponseSink,
    Router,
};
use hive_types::id::now_millis;
use hive_types::{
    codes, method_key, split_key, HiveConfig, HiveError, HiveResult, NodeId, Shutdown, Tid,
    TidGenerator,
};
use hive_wire::packer::{
    pack_notify, pack_push, pack_request, pack_response_fail, pack_response_ok, pack_watch,
    unpack_notify, unpack_push, unpack_request, unpack_response_fail, unpack_response_ok,
    unpack_watch,
};
use hive_wire::{Codec, FrameType, Head, Message, Value, WatchFrame};
use hive_worker::{Processor, WorkQueue};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Fired with `(svc, node_id)` when a remote service instance comes or goes.
pub type ServiceHook = Arc<dyn Fn(u16, NodeId) + Send + Sync>;

#[derive(Default)]
struct Mesh {
    services: HashMap<u16, Vec<Arc<NodeDialer>>>,
    nodes: HashMap<NodeId, Arc<NodeDialer>>,
}

impl Mesh {
    fn services_of(&self, dialer: &Arc<NodeDialer>) -> Vec<u16> {
        let mut svcs: Vec<u16> = self
            .services
            .iter()
            .filter(|(_, set)| set.iter().any(|d| Arc::ptr_eq(d, dialer)))
            .map(|(svc, _)| *svc)
            .collect();
        svcs.sort_unstable();
        svcs
    }

    fn is_current(&self, dialer: &Arc<NodeDialer>) -> bool {
        self.nodes
            .get(&dialer.node_id())
            .is_some_and(|d| Arc::ptr_eq(d, dialer))
    }
}

struct Watcher {
    meta: Head,
    agent: Arc<dyn Agent>,
}

/// Method key -> subscriber node -> subscription, and its inverse.
#[derive(Default)]
struct Watchers {
    by_key: HashMap<u16, HashMap<NodeId, Watcher>>,
    by_node: HashMap<NodeId, BTreeSet<u16>>,
}

impl Watchers {
    fn unsubscribe(&mut self, node: NodeId) -> usize {
        let Some(keys) = self.by_node.remove(&node) else {
            return 0;
        };
        for key in &keys {
            if let Some(subs) = self.by_key.get_mut(key) {
                subs.remove(&node);
                if subs.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys.len()
    }

    fn subscribe(&mut self, frame: WatchFrame, agent: Arc<dyn Agent>) {
        self.unsubscribe(frame.node);
        if frame.codes.is_empty() {
            return;
        }
        let keys: BTreeSet<u16> = frame.codes.iter().copied().collect();
        for key in &keys {
            self.by_key.entry(*key).or_default().insert(
                frame.node,
                Watcher {
                    meta: frame.meta.clone(),
                    agent: Arc::clone(&agent),
                },
            );
        }
        self.by_node.insert(frame.node, keys);
    }

    /// Drop every subscription made over `agent_id`.
    fn purge_agent(&mut self, agent_id: u64) -> Vec<NodeId> {
        let nodes: Vec<NodeId> = self
            .by_key
            .values()
            .flat_map(|subs| subs.iter())
            .filter(|(_, w)| w.agent.id() == agent_id)
            .map(|(node, _)| *node)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for node in &nodes {
            self.unsubscribe(*node);
        }
        nodes
    }
}

enum NodeJob {
    Connect(PeerInfo),
    Disconnect { svc: u16, node_id: NodeId },
    DialerConnected(Arc<NodeDialer>),
    DialerClosed(Arc<NodeDialer>),
    Watch { frame: WatchFrame, agent: Arc<dyn Agent> },
    AgentClosed(u64),
}

enum Target {
    Local,
    Remote(Arc<NodeDialer>),
}

/// Answers a remote request over the connection it arrived on.
struct AgentSink {
    agent: Arc<dyn Agent>,
}

impl ResponseSink for AgentSink {
    fn respond(&self, tid: Tid, _head: &Head, json: bool, response: Response) {
        let frame = match response {
            Response::Ok(msg) => match msg.encode(json) {
                Ok(payload) => pack_response_ok(tid, &payload),
                Err(e) => {
                    error!(tid, error = %e, "Failed to encode response, answering with failure");
                    pack_response_fail(tid, e.code())
                }
            },
            Response::Fail(code) => pack_response_fail(tid, code),
        };
        if let Err(e) = self.agent.send(frame) {
            warn!(tid, addr = %self.agent.remote_addr(), error = %e, "Response not sent");
        }
    }
}

pub struct Node {
    config: HiveConfig,
    node_id: NodeId,
    local: HashSet<u16>,
    codec: Codec,
    router: Arc<Router>,
    tids: TidGenerator,
    mesh: RwLock<Mesh>,
    watchers: RwLock<Watchers>,
    jobs: WorkQueue<NodeJob>,
    connector: Arc<dyn Connector>,
    selector: RwLock<Arc<dyn Selector>>,
    connected_hooks: RwLock<Vec<ServiceHook>>,
    disconnected_hooks: RwLock<Vec<ServiceHook>>,
    inbound: DashMap<u64, Arc<dyn Agent>>,
    directory: ServiceDirectory,
    dialer_options: DialerOptions,
    agent_options: AgentOptions,
    watch_meta: Head,
    shutdown: Shutdown,
    weak: Weak<Node>,
}

impl Node {
    /// Build a node and its router. Must run inside a tokio runtime.
    pub fn new(
        config: HiveConfig,
        codec: Codec,
        connector: Arc<dyn Connector>,
        shutdown: Shutdown,
    ) -> HiveResult<Arc<Self>> {
        config.validate()?;
        let tids = TidGenerator::new(config.node_id)?;
        let router = Arc::new(Router::new(&config, codec.clone(), shutdown.clone()));
        let watch_meta: Head = config
            .watch_meta
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();

        let node = Arc::new_cyclic(|weak: &Weak<Node>| {
            let w = weak.clone();
            let processor: Processor<NodeJob> = Arc::new(move |job: NodeJob| {
                if let Some(node) = w.upgrade() {
                    node.apply(job);
                }
            });
            Self {
                node_id: config.node_id,
                local: config.services.iter().copied().collect(),
                jobs: WorkQueue::spawn(
                    format!("node-{}", config.node_id),
                    config.worker_capacity,
                    processor,
                    shutdown.clone(),
                ),
                dialer_options: DialerOptions::from_config(&config),
                agent_options: AgentOptions::from_config(&config),
                config,
                codec,
                router,
                tids,
                mesh: RwLock::new(Mesh::default()),
                watchers: RwLock::new(Watchers::default()),
                connector,
                selector: RwLock::new(Arc::new(RandomSelector)),
                connected_hooks: RwLock::new(Vec::new()),
                disconnected_hooks: RwLock::new(Vec::new()),
                inbound: DashMap::new(),
                directory: ServiceDirectory::new(),
                watch_meta,
                shutdown,
                weak: weak.clone(),
            }
        });
        info!(
            node_id = node.node_id,
            services = ?node.config.services,
            "Node started"
        );
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn agent_options(&self) -> AgentOptions {
        self.agent_options
    }

    /// Whether this node hosts `svc` itself.
    pub fn is_local(&self, svc: u16) -> bool {
        self.local.contains(&svc)
    }

    pub fn set_selector(&self, selector: Arc<dyn Selector>) {
        *self.selector.write().unwrap_or_else(|e| e.into_inner()) = selector;
    }

    pub fn on_service_connected<F>(&self, hook: F)
    where
        F: Fn(u16, NodeId) + Send + Sync + 'static,
    {
        self.connected_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    pub fn on_service_disconnected<F>(&self, hook: F)
    where
        F: Fn(u16, NodeId) + Send + Sync + 'static,
    {
        self.disconnected_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    // ---- mesh management ------------------------------------------------

    /// Start dialing `peer`. Connecting to a known node id is a no-op.
    pub fn connect(&self, peer: PeerInfo) -> HiveResult<()> {
        self.enqueue(NodeJob::Connect(peer))
    }

    /// Drop `node_id` from `svc`. Unknown pairs are ignored.
    pub fn disconnect(&self, svc: u16, node_id: NodeId) -> HiveResult<()> {
        self.enqueue(NodeJob::Disconnect { svc, node_id })
    }

    /// Whether the dialer to `node_id` currently has a live link.
    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.dialer(node_id).is_some_and(|d| d.is_connected())
    }

    pub fn dialer(&self, node_id: NodeId) -> Option<Arc<NodeDialer>> {
        let mesh = self.mesh.read().unwrap_or_else(|e| e.into_inner());
        mesh.nodes.get(&node_id).cloned()
    }

    /// Remote nodes hosting `svc`, ascending.
    pub fn hosts(&self, svc: u16) -> Vec<NodeId> {
        let mesh = self.mesh.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<NodeId> = mesh
            .services
            .get(&svc)
            .map(|set| set.iter().map(|d| d.node_id()).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Remote subscribers of `(svc, code)` with their metadata, by node id.
    pub fn watchers(&self, svc: u16, code: u8) -> Vec<(NodeId, Head)> {
        let Ok(key) = method_key(svc, code) else {
            return Vec::new();
        };
        let watchers = self.watchers.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<(NodeId, Head)> = watchers
            .by_key
            .get(&key)
            .map(|subs| subs.iter().map(|(n, w)| (*n, w.meta.clone())).collect())
            .unwrap_or_default();
        found.sort_by_key(|(n, _)| *n);
        found
    }

    /// Method keys `node_id` is subscribed to on this node.
    pub fn watched_keys(&self, node_id: NodeId) -> Vec<u16> {
        let watchers = self.watchers.read().unwrap_or_else(|e| e.into_inner());
        watchers
            .by_node
            .get(&node_id)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Adopt an accepted inbound connection and start it.
    pub fn on_inbound(&self, agent: Arc<dyn Agent>) {
        let id = agent.id();
        let weak = self.weak.clone();
        agent.bind_disconnected(Box::new(move |_: Option<&HiveError>| {
            if let Some(node) = weak.upgrade() {
                node.inbound.remove(&id);
                let _ = node.enqueue(NodeJob::AgentClosed(id));
            }
        }));
        let weak = self.weak.clone();
        let weak_agent = Arc::downgrade(&agent);
        agent.bind_receiver(Arc::new(move |frame: Bytes| {
            if let (Some(node), Some(agent)) = (weak.upgrade(), weak_agent.upgrade()) {
                node.receive(frame, agent);
            }
        }));
        debug!(agent = id, addr = %agent.remote_addr(), "Inbound connection");
        self.inbound.insert(id, Arc::clone(&agent));
        agent.start();
    }

    /// An acceptor for [`Listener::run`](crate::tcp::Listener::run) or
    /// [`MemoryNetwork::listen`](crate::memory::MemoryNetwork::listen).
    pub fn acceptor(&self) -> Acceptor {
        let weak = self.weak.clone();
        Arc::new(move |agent: Arc<dyn Agent>| match weak.upgrade() {
            Some(node) => node.on_inbound(agent),
            None => agent.dispose(),
        })
    }

    fn enqueue(&self, job: NodeJob) -> HiveResult<()> {
        self.jobs.push(job).map_err(|e| {
            debug!(node_id = self.node_id, error = %e, "Node queue closed, job dropped");
            e
        })
    }

    fn apply(&self, job: NodeJob) {
        match job {
            NodeJob::Connect(peer) => self.apply_connect(peer),
            NodeJob::Disconnect { svc, node_id } => self.apply_disconnect(svc, node_id),
            NodeJob::DialerConnected(dialer) => self.apply_connected(&dialer),
            NodeJob::DialerClosed(dialer) => self.apply_closed(&dialer),
            NodeJob::Watch { frame, agent } => {
                let (node, count) = (frame.node, frame.codes.len());
                self.watchers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .subscribe(frame, agent);
                debug!(node_id = node, codes = count, "Watch subscription updated");
            }
            NodeJob::AgentClosed(agent_id) => {
                let nodes = self
                    .watchers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .purge_agent(agent_id);
                if !nodes.is_empty() {
                    debug!(agent = agent_id, ?nodes, "Dropped watch subscriptions of closed connection");
                }
            }
        }
    }

    fn apply_connect(&self, peer: PeerInfo) {
        if peer.node_id == self.node_id {
            debug!(svc = peer.svc, "Ignoring announcement of this node");
            return;
        }
        self.directory.add(&peer);
        let mut mesh = self.mesh.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = mesh.nodes.get(&peer.node_id).cloned() {
            let set = mesh.services.entry(peer.svc).or_default();
            if !set.iter().any(|d| Arc::ptr_eq(d, &existing)) {
                set.push(Arc::clone(&existing));
                debug!(svc = peer.svc, node_id = peer.node_id, "Known node now serves another service");
                if existing.is_connected() {
                    drop(mesh);
                    self.directory.mark_connected(peer.svc, peer.node_id);
                    self.fire(&self.connected_hooks, peer.svc, peer.node_id);
                }
            }
            return;
        }

        let (svc, node_id) = (peer.svc, peer.node_id);
        let dialer = NodeDialer::new(
            peer,
            self.dialer_options,
            Arc::clone(&self.connector),
            self.dialer_hooks(),
            self.shutdown.clone(),
        );
        mesh.services.entry(svc).or_default().push(Arc::clone(&dialer));
        mesh.nodes.insert(node_id, Arc::clone(&dialer));
        drop(mesh);
        info!(svc, node_id, addr = %dialer.info().addr, "Dialing node");
        dialer.start();
    }

    fn apply_disconnect(&self, svc: u16, node_id: NodeId) {
        let mut mesh = self.mesh.write().unwrap_or_else(|e| e.into_inner());
        let Some(dialer) = mesh.nodes.get(&node_id).cloned() else {
            debug!(svc, node_id, "Disconnect of unknown node ignored");
            return;
        };
        let Some(set) = mesh.services.get_mut(&svc) else {
            return;
        };
        let before = set.len();
        set.retain(|d| !Arc::ptr_eq(d, &dialer));
        if set.len() == before {
            return;
        }
        if set.is_empty() {
            mesh.services.remove(&svc);
        }
        let orphaned = mesh.services_of(&dialer).is_empty();
        if orphaned {
            mesh.nodes.remove(&node_id);
        }
        drop(mesh);

        self.directory.remove(svc, node_id);
        if orphaned {
            self.purge_watchers(node_id);
            dialer.close();
        }
        info!(svc, node_id, "Disconnected node");
        self.fire(&self.disconnected_hooks, svc, node_id);
    }

    fn apply_connected(&self, dialer: &Arc<NodeDialer>) {
        let svcs = {
            let mesh = self.mesh.read().unwrap_or_else(|e| e.into_inner());
            if !mesh.is_current(dialer) {
                return;
            }
            mesh.services_of(dialer)
        };
        let node_id = dialer.node_id();

        let mut keys: Vec<u16> = svcs
            .iter()
            .flat_map(|svc| self.router.notify_codes(*svc))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        if !keys.is_empty() {
            match pack_watch(self.node_id, &keys, &self.watch_meta) {
                Ok(frame) => {
                    if let Err(e) = dialer.send(frame, None) {
                        warn!(node_id, error = %e, "Watch subscription not sent");
                    } else {
                        debug!(node_id, ?keys, "Sent watch subscription");
                    }
                }
                Err(e) => error!(node_id, error = %e, "Failed to pack watch subscription"),
            }
        }

        for svc in svcs {
            self.directory.mark_connected(svc, node_id);
            self.fire(&self.connected_hooks, svc, node_id);
        }
    }

    fn apply_closed(&self, dialer: &Arc<NodeDialer>) {
        let node_id = dialer.node_id();
        let svcs = {
            let mut mesh = self.mesh.write().unwrap_or_else(|e| e.into_inner());
            if !mesh.is_current(dialer) {
                return;
            }
            let svcs = mesh.services_of(dialer);
            mesh.nodes.remove(&node_id);
            for svc in &svcs {
                if let Some(set) = mesh.services.get_mut(svc) {
                    set.retain(|d| !Arc::ptr_eq(d, dialer));
                    if set.is_empty() {
                        mesh.services.remove(svc);
                    }
                }
            }
            svcs
        };
        self.purge_watchers(node_id);
        warn!(node_id, services = ?svcs, "Lost node");
        for svc in svcs {
            self.directory.mark_disconnected(svc, node_id);
            self.fire(&self.disconnected_hooks, svc, node_id);
        }
    }

    fn purge_watchers(&self, node_id: NodeId) {
        let removed = self
            .watchers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .unsubscribe(node_id);
        if removed > 0 {
            debug!(node_id, removed, "Dropped watch subscriptions");
        }
    }

    fn fire(&self, hooks: &RwLock<Vec<ServiceHook>>, svc: u16, node_id: NodeId) {
        let hooks = hooks.read().unwrap_or_else(|e| e.into_inner()).clone();
        for hook in hooks {
            hook(svc, node_id);
        }
    }

    fn dialer_hooks(&self) -> DialerHooks {
        let (on_connected, on_closed, on_frame) =
            (self.weak.clone(), self.weak.clone(), self.weak.clone());
        DialerHooks {
            on_connected: Box::new(move |dialer: &Arc<NodeDialer>| {
                if let Some(node) = on_connected.upgrade() {
                    let _ = node.enqueue(NodeJob::DialerConnected(Arc::clone(dialer)));
                }
            }),
            on_closed: Box::new(move |dialer: &Arc<NodeDialer>| {
                if let Some(node) = on_closed.upgrade() {
                    let _ = node.enqueue(NodeJob::DialerClosed(Arc::clone(dialer)));
                }
            }),
            on_frame: Arc::new(move |frame: Bytes, agent: Arc<dyn Agent>| {
                if let Some(node) = on_frame.upgrade() {
                    node.receive(frame, agent);
                }
            }),
        }
    }

    // ---- inbound --------------------------------------------------------

    /// Demultiplex one inbound frame body by its type byte.
    pub fn receive(&self, frame: Bytes, agent: Arc<dyn Agent>) {
        let kind = match FrameType::of(&frame) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(addr = %agent.remote_addr(), error = %e, "Dropping unreadable frame");
                return;
            }
        };
        let result = match kind {
            FrameType::Heartbeat => {
                trace!(addr = %agent.remote_addr(), "Heartbeat");
                Ok(())
            }
            FrameType::Push => self.receive_push(&frame),
            FrameType::Notify => self.receive_notify(&frame),
            FrameType::Request => self.receive_request(&frame, agent),
            FrameType::ResponseOk => unpack_response_ok(&frame)
                .and_then(|f| self.router.on_response_ok_bytes(f.tid, f.payload)),
            FrameType::ResponseFail => unpack_response_fail(&frame)
                .and_then(|f| self.router.on_response_fail(f.tid, f.code)),
            FrameType::Watch => {
                unpack_watch(&frame).and_then(|f| self.enqueue(NodeJob::Watch { frame: f, agent }))
            }
        };
        if let Err(e) = result {
            debug!(%kind, error = %e, "Inbound frame dropped");
        }
    }

    fn receive_push(&self, frame: &Bytes) -> HiveResult<()> {
        let f = unpack_push(frame)?;
        let msg = self.decode_payload(f.tid, &f.head, &f.payload, f.json)?;
        self.router.on_push(PushPacket {
            tid: f.tid,
            head: f.head,
            json: f.json,
            msg,
        })
    }

    fn receive_notify(&self, frame: &Bytes) -> HiveResult<()> {
        let f = unpack_notify(frame)?;
        let msg = self.decode_payload(f.tid, &f.head, &f.payload, f.json)?;
        self.router
            .on_notify(NotifyPacket {
                tid: f.tid,
                head: f.head,
                json: f.json,
                msg: Arc::from(msg),
            })
            .map(|_| ())
    }

    fn receive_request(&self, frame: &Bytes, agent: Arc<dyn Agent>) -> HiveResult<()> {
        let f = unpack_request(frame)?;
        let sink: Arc<dyn ResponseSink> = Arc::new(AgentSink { agent });
        let mut head = f.head;
        if head.src().is_none() {
            head.set_src(f.src);
        }
        let msg = match self.decode_payload(f.tid, &head, &f.payload, f.json) {
            Ok(msg) => msg,
            Err(e) => {
                sink.respond(f.tid, &head, f.json, Response::Fail(e.code()));
                return Err(e);
            }
        };
        self.router.on_request(InboundRequest {
            tid: f.tid,
            head,
            json: f.json,
            msg,
            sink,
        })
    }

    fn decode_payload(
        &self,
        tid: Tid,
        head: &Head,
        payload: &[u8],
        json: bool,
    ) -> HiveResult<Box<dyn Message>> {
        let (Some(svc), Some(code)) = (head.svc(), head.code()) else {
            warn!(tid, "Frame head has no method");
            return Err(HiveError::NotExist("head has no svc/code".into()));
        };
        self.codec.decode(svc, code, payload, json).map_err(|e| {
            warn!(tid, svc, code, error = %e, "Failed to decode payload");
            e
        })
    }

    // ---- outbound -------------------------------------------------------

    fn method_of(&self, msg: &dyn Message) -> HiveResult<(u16, u8)> {
        self.codec.key_of(msg.type_name()).map(split_key)
    }

    fn outbound_head(&self, svc: u16, code: u8, mut head: Head) -> Head {
        head.set_svc(svc);
        head.set_code(code);
        head.set_src(self.node_id);
        head.set_ts(now_millis());
        head
    }

    fn route(&self, svc: u16, head: &Head) -> HiveResult<Target> {
        if self.is_local(svc) {
            return Ok(Target::Local);
        }
        let mesh = self.mesh.read().unwrap_or_else(|e| e.into_inner());
        let set = match mesh.services.get(&svc) {
            Some(set) if !set.is_empty() => set,
            _ => return Err(HiveError::NotExist(format!("no node hosts svc {svc}"))),
        };
        if set.len() == 1 {
            return Ok(Target::Remote(Arc::clone(&set[0])));
        }
        let pool = candidates(set);
        drop(mesh);
        let selector = Arc::clone(&*self.selector.read().unwrap_or_else(|e| e.into_inner()));
        selector
            .select(svc, head, &pool)
            .and_then(|i| pool.get(i).cloned())
            .map(Target::Remote)
            .ok_or_else(|| HiveError::NotExist(format!("no node selected for svc {svc}")))
    }

    fn route_node(&self, node_id: NodeId) -> HiveResult<Target> {
        if node_id == self.node_id {
            return Ok(Target::Local);
        }
        self.dialer(node_id)
            .map(Target::Remote)
            .ok_or_else(|| HiveError::NotExist(format!("node {node_id}")))
    }

    /// Fire-and-forget `msg` to a node hosting its service.
    pub fn push<M: Message>(&self, head: Head, msg: M) -> HiveResult<Tid> {
        let (svc, code) = self.method_of(&msg)?;
        let head = self.outbound_head(svc, code, head);
        let target = self.route(svc, &head)?;
        self.send_push(target, head, Box::new(msg))
    }

    /// Fire-and-forget `msg` to one specific node.
    pub fn push_node<M: Message>(&self, node_id: NodeId, head: Head, msg: M) -> HiveResult<Tid> {
        let (svc, code) = self.method_of(&msg)?;
        let head = self.outbound_head(svc, code, head);
        let target = self.route_node(node_id)?;
        self.send_push(target, head, Box::new(msg))
    }

    fn send_push(&self, target: Target, head: Head, msg: Box<dyn Message>) -> HiveResult<Tid> {
        let tid = self.tids.next();
        let json = self.config.json;
        let svc = head.svc();
        match target {
            Target::Local => self.router.on_push(PushPacket {
                tid,
                head,
                json,
                msg,
            })?,
            Target::Remote(dialer) => {
                let payload = msg.encode(json)?;
                let frame = pack_push(tid, &head, json, &payload)?;
                let node_id = dialer.node_id();
                let on_fail: SendFailure = Box::new(move |e: HiveError| {
                    warn!(tid, node_id, error = %e, "Push lost");
                });
                dialer.send(frame, Some(on_fail))?;
            }
        }
        trace!(tid, svc = ?svc, "Push sent");
        Ok(tid)
    }

    /// Send a request to a node hosting its service. `completion` runs
    /// exactly once, unless this call itself returns an error.
    pub fn request<M: Message>(&self, head: Head, req: M, completion: Completion) -> HiveResult<Tid> {
        let (svc, code) = self.method_of(&req)?;
        let head = self.request_head(svc, code, head);
        let target = self.route(svc, &head)?;
        self.send_request(target, svc, code, head, Box::new(req), completion)
    }

    /// Send a request to one specific node.
    pub fn request_node<M: Message>(
        &self,
        node_id: NodeId,
        head: Head,
        req: M,
        completion: Completion,
    ) -> HiveResult<Tid> {
        let (svc, code) = self.method_of(&req)?;
        let head = self.request_head(svc, code, head);
        let target = self.route_node(node_id)?;
        self.send_request(target, svc, code, head, Box::new(req), completion)
    }

    fn request_head(&self, svc: u16, code: u8, head: Head) -> Head {
        let mut head = self.outbound_head(svc, code, head);
        if let Ok(res) = self.codec.res_code(svc, code) {
            head.set_res(res);
        }
        head
    }

    fn send_request(
        &self,
        target: Target,
        svc: u16,
        code: u8,
        head: Head,
        msg: Box<dyn Message>,
        completion: Completion,
    ) -> HiveResult<Tid> {
        let tid = self.tids.next();
        let json = self.config.json;
        match target {
            Target::Local => {
                self.router
                    .add_request(PendingRequest::new(tid, svc, code, json, completion))?;
                let sink: Arc<dyn ResponseSink> = Arc::clone(&self.router) as Arc<dyn ResponseSink>;
                // A failed dispatch has already been answered through the sink.
                let _ = self.router.on_request(InboundRequest {
                    tid,
                    head,
                    json,
                    msg,
                    sink,
                });
            }
            Target::Remote(dialer) => {
                let payload = msg.encode(json)?;
                let frame = pack_request(self.node_id, tid, &head, json, &payload)?;
                self.router
                    .add_request(PendingRequest::new(tid, svc, code, json, completion))?;
                let router = Arc::downgrade(&self.router);
                let on_fail: SendFailure = Box::new(move |e: HiveError| {
                    if let Some(router) = router.upgrade() {
                        let _ = router.on_response_fail(tid, e.code());
                    }
                });
                if let Err(e) = dialer.send(frame, Some(on_fail)) {
                    self.router.del_request(tid);
                    warn!(tid, svc, code, node_id = dialer.node_id(), error = %e, "Request not sent");
                    return Err(e);
                }
            }
        }
        trace!(tid, svc, code, "Request sent");
        Ok(tid)
    }

    /// Request and wait. Returns `codes::SUCCESS` with `res` filled in, or
    /// the failure code with `res` untouched.
    pub async fn call<Req: Message, Res: Message>(&self, head: Head, req: Req, res: &mut Res) -> u16 {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.request(head, req, Completion::Channel(tx)) {
            return e.code();
        }
        wait_reply(rx, res).await
    }

    /// [`call`](Self::call) addressed to one specific node.
    pub async fn call_node<Req: Message, Res: Message>(
        &self,
        node_id: NodeId,
        head: Head,
        req: Req,
        res: &mut Res,
    ) -> u16 {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.request_node(node_id, head, req, Completion::Channel(tx)) {
            return e.code();
        }
        wait_reply(rx, res).await
    }

    /// Broadcast `msg` to local subscribers and every watching remote node.
    /// Returns how many subscribers it was handed to.
    pub fn notify<M: Message>(&self, head: Head, msg: M) -> HiveResult<usize> {
        self.notify_where(head, msg, |_| true)
    }

    /// [`notify`](Self::notify) restricted to remote subscribers whose
    /// watch metadata passes `filter`. Local subscribers always receive it.
    pub fn notify_where<M, F>(&self, head: Head, msg: M, filter: F) -> HiveResult<usize>
    where
        M: Message,
        F: Fn(&Head) -> bool,
    {
        let (svc, code) = self.method_of(&msg)?;
        let key = method_key(svc, code)?;
        let head = self.outbound_head(svc, code, head);
        let tid = self.tids.next();
        let json = self.config.json;
        let msg: Arc<dyn Message> = Arc::new(msg);

        let mut delivered = self.router.on_notify(NotifyPacket {
            tid,
            head: head.clone(),
            json,
            msg: Arc::clone(&msg),
        })?;

        let targets = self.remote_subscribers(key, &filter);
        if targets.is_empty() {
            return Ok(delivered);
        }
        let payload = msg.encode(json)?;
        let frame = pack_notify(tid, &head, json, &payload)?;
        for (node_id, agent) in targets {
            match agent.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(tid, svc, code, node_id, error = %e, "Notify not sent"),
            }
        }
        Ok(delivered)
    }

    /// Deliver `msg` to the first subscriber that takes it: local
    /// subscribers first, then remote ones passing `filter`.
    pub fn notify_one<M, F>(&self, head: Head, msg: M, filter: F) -> HiveResult<bool>
    where
        M: Message,
        F: Fn(&Head) -> bool,
    {
        let (svc, code) = self.method_of(&msg)?;
        let key = method_key(svc, code)?;
        let head = self.outbound_head(svc, code, head);
        let tid = self.tids.next();
        let json = self.config.json;
        let msg: Arc<dyn Message> = Arc::new(msg);

        if self.router.has_notify(svc, code) {
            let delivered = self.router.on_notify(NotifyPacket {
                tid,
                head: head.clone(),
                json,
                msg: Arc::clone(&msg),
            })?;
            if delivered > 0 {
                return Ok(true);
            }
        }

        let targets = self.remote_subscribers(key, &filter);
        if targets.is_empty() {
            return Ok(false);
        }
        let payload = msg.encode(json)?;
        let frame = pack_notify(tid, &head, json, &payload)?;
        for (node_id, agent) in targets {
            match agent.send(frame.clone()) {
                Ok(()) => return Ok(true),
                Err(e) => debug!(tid, node_id, error = %e, "Subscriber unavailable, trying next"),
            }
        }
        Ok(false)
    }

    fn remote_subscribers<F>(&self, key: u16, filter: &F) -> Vec<(NodeId, Arc<dyn Agent>)>
    where
        F: Fn(&Head) -> bool,
    {
        let watchers = self.watchers.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<(NodeId, Arc<dyn Agent>)> = watchers
            .by_key
            .get(&key)
            .map(|subs| {
                subs.iter()
                    .filter(|(_, w)| filter(&w.meta))
                    .map(|(node, w)| (*node, Arc::clone(&w.agent)))
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by_key(|(node, _)| *node);
        found
    }

    /// Stop the mesh: drain the node queue, close every dialer and inbound
    /// connection, then close the router.
    pub async fn close(&self) {
        self.jobs.close();
        self.jobs.join().await;

        let dialers: Vec<Arc<NodeDialer>> = {
            let mut mesh = self.mesh.write().unwrap_or_else(|e| e.into_inner());
            mesh.services.clear();
            mesh.nodes.drain().map(|(_, d)| d).collect()
        };
        for dialer in &dialers {
            dialer.close();
        }
        let inbound: Vec<Arc<dyn Agent>> = self.inbound.iter().map(|e| Arc::clone(e.value())).collect();
        self.inbound.clear();
        for agent in inbound {
            agent.dispose();
        }
        *self.watchers.write().unwrap_or_else(|e| e.into_inner()) = Watchers::default();

        self.router.close().await;
        info!(node_id = self.node_id, dialers = dialers.len(), "Node closed");
    }
}

async fn wait_reply<Res: Message>(
    rx: oneshot::Receiver<hive_router::Reply>,
    res: &mut Res,
) -> u16 {
    match rx.await {
        Ok(Ok(msg)) => match msg.downcast::<Res>() {
            Ok(msg) => {
                *res = msg;
                codes::SUCCESS
            }
            Err(e) => {
                warn!(error = %e, "Response of unexpected type");
                e.code()
            }
        },
        Ok(Err(code)) => code,
        Err(_) => codes::CLOSED,
    }
}
