//! Handler tables, request correlation and policy dispatch.

use crate::packet::{
    InboundRequest, NotifyPacket, PushPacket, RequestPacket, Response, ResponseSink,
};
use crate::pending::{Outcome, PendingRequest, PendingTable};
use bytes::Bytes;
use dashmap::DashMap;
use hive_types::{
    codes, method_key, split_key, HiveConfig, HiveError, HiveResult, NodeId, Shutdown, Tid,
};
use hive_wire::{Codec, Head, Message};
use hive_worker::{panic_message, DispatchOptions, Dispatcher, Policy, Processor};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

pub type PushHandler = Arc<dyn Fn(PushPacket) -> HiveResult<()> + Send + Sync>;
pub type RequestHandler = Arc<dyn Fn(RequestPacket) -> HiveResult<()> + Send + Sync>;
pub type NotifyHandler = Arc<dyn Fn(NotifyPacket) -> HiveResult<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindKind {
    Push,
    Request,
    Notify,
}

/// Returned by every `bind_*` call; pass it to [`Router::unbind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindHandle {
    pub kind: BindKind,
    pub key: u16,
    id: u64,
}

#[derive(Clone)]
struct Binding<H> {
    id: u64,
    policy: Policy,
    handler: H,
}

/// Unit of work handed to the dispatch pools.
enum Job {
    Push(PushHandler, PushPacket),
    Request(RequestHandler, RequestPacket),
    Notify(NotifyHandler, NotifyPacket),
}

/// Inbound dispatch and outbound request correlation for one node.
pub struct Router {
    node_id: NodeId,
    codec: Codec,
    pending: PendingTable,
    pushes: DashMap<u16, Binding<PushHandler>>,
    requests: DashMap<u16, Binding<RequestHandler>>,
    notifies: DashMap<u16, Vec<Binding<NotifyHandler>>>,
    dispatcher: Dispatcher<Job>,
    next_bind: AtomicU64,
    response_timeout: Duration,
}

impl Router {
    /// Build the router and start its dispatch pools. Must run inside a tokio runtime.
    pub fn new(config: &HiveConfig, codec: Codec, shutdown: Shutdown) -> Self {
        let processor: Processor<Job> = Arc::new(run_job);
        Self {
            node_id: config.node_id,
            codec,
            pending: PendingTable::new(),
            pushes: DashMap::new(),
            requests: DashMap::new(),
            notifies: DashMap::new(),
            dispatcher: Dispatcher::new(
                format!("router-{}", config.node_id),
                DispatchOptions::from_config(config),
                processor,
                shutdown,
            ),
            next_bind: AtomicU64::new(1),
            response_timeout: config.response_timeout(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    fn handle(&self, kind: BindKind, key: u16) -> BindHandle {
        BindHandle {
            kind,
            key,
            id: self.next_bind.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Bind the push handler for `(svc, code)`, replacing any previous one.
    pub fn bind_push<F>(
        &self,
        svc: u16,
        code: u8,
        policy: Policy,
        handler: F,
    ) -> HiveResult<BindHandle>
    where
        F: Fn(PushPacket) -> HiveResult<()> + Send + Sync + 'static,
    {
        let handle = self.handle(BindKind::Push, method_key(svc, code)?);
        let binding = Binding {
            id: handle.id,
            policy,
            handler: Arc::new(handler) as PushHandler,
        };
        if self.pushes.insert(handle.key, binding).is_some() {
            debug!(svc, code, "Push handler replaced");
        }
        Ok(handle)
    }

    /// Bind the request handler for `(svc, code)`, replacing any previous one.
    pub fn bind_request<F>(
        &self,
        svc: u16,
        code: u8,
        policy: Policy,
        handler: F,
    ) -> HiveResult<BindHandle>
    where
        F: Fn(RequestPacket) -> HiveResult<()> + Send + Sync + 'static,
    {
        let handle = self.handle(BindKind::Request, method_key(svc, code)?);
        let binding = Binding {
            id: handle.id,
            policy,
            handler: Arc::new(handler) as RequestHandler,
        };
        if self.requests.insert(handle.key, binding).is_some() {
            debug!(svc, code, "Request handler replaced");
        }
        Ok(handle)
    }

    /// Subscribe a local handler to notifications of `(svc, code)`. Several may coexist.
    pub fn bind_notify<F>(
        &self,
        svc: u16,
        code: u8,
        policy: Policy,
        handler: F,
    ) -> HiveResult<BindHandle>
    where
        F: Fn(NotifyPacket) -> HiveResult<()> + Send + Sync + 'static,
    {
        let handle = self.handle(BindKind::Notify, method_key(svc, code)?);
        self.notifies.entry(handle.key).or_default().push(Binding {
            id: handle.id,
            policy,
            handler: Arc::new(handler) as NotifyHandler,
        });
        Ok(handle)
    }

    /// Remove the binding `handle` refers to. A binding that has since been
    /// replaced is left alone. Returns whether anything was removed.
    pub fn unbind(&self, handle: BindHandle) -> bool {
        let BindHandle { kind, key, id } = handle;
        match kind {
            BindKind::Push => self.pushes.remove_if(&key, |_, b| b.id == id).is_some(),
            BindKind::Request => self.requests.remove_if(&key, |_, b| b.id == id).is_some(),
            BindKind::Notify => {
                let removed = match self.notifies.get_mut(&key) {
                    Some(mut list) => {
                        let before = list.len();
                        list.retain(|b| b.id != id);
                        list.len() != before
                    }
                    None => false,
                };
                self.notifies.remove_if(&key, |_, list| list.is_empty());
                removed
            }
        }
    }

    pub fn has_push(&self, svc: u16, code: u8) -> bool {
        method_key(svc, code).is_ok_and(|k| self.pushes.contains_key(&k))
    }

    pub fn has_request(&self, svc: u16, code: u8) -> bool {
        method_key(svc, code).is_ok_and(|k| self.requests.contains_key(&k))
    }

    pub fn has_notify(&self, svc: u16, code: u8) -> bool {
        method_key(svc, code).is_ok_and(|k| self.notifies.contains_key(&k))
    }

    /// Method keys this node has local notify subscribers for, ascending.
    pub fn notify_keys(&self) -> Vec<u16> {
        let mut keys: Vec<u16> = self.notifies.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        keys
    }

    /// [`notify_keys`](Self::notify_keys) restricted to service `svc`.
    pub fn notify_codes(&self, svc: u16) -> Vec<u16> {
        self.notify_keys()
            .into_iter()
            .filter(|k| split_key(*k).0 == svc)
            .collect()
    }

    /// Run the push handler bound for the packet's method.
    pub fn on_push(&self, pkt: PushPacket) -> HiveResult<()> {
        let tid = pkt.tid;
        let (svc, code, key) = method_of(&pkt.head).map_err(|e| {
            error!(tid, error = %e, "Dropping push without a valid method");
            e
        })?;
        let Some(binding) = self.pushes.get(&key).map(|b| b.clone()) else {
            error!(tid, svc, code, "No push handler bound, dropping");
            return Err(not_bound("push", svc, code));
        };
        let dispatch_key = dispatch_key(&pkt.head);
        trace!(tid, svc, code, policy = %binding.policy, "Dispatching push");
        self.dispatcher
            .dispatch(binding.policy, &dispatch_key, Job::Push(binding.handler, pkt))
            .map_err(|e| {
                warn!(tid, svc, code, error = %e, "Push dispatch failed");
                e
            })
    }

    /// Run the request handler bound for the request's method. Requests that
    /// cannot be dispatched are answered with a failure code.
    pub fn on_request(&self, mut req: InboundRequest) -> HiveResult<()> {
        let tid = req.tid;
        let (svc, code, key) = match method_of(&req.head) {
            Ok(method) => method,
            Err(e) => {
                error!(tid, error = %e, "Request without a valid method");
                RequestPacket::new(req).fail(e.code());
                return Err(e);
            }
        };
        let Some(binding) = self.requests.get(&key).map(|b| b.clone()) else {
            error!(tid, svc, code, "No request handler bound");
            RequestPacket::new(req).fail(codes::NOT_EXIST);
            return Err(not_bound("request", svc, code));
        };
        if let Ok(res) = self.codec.res_code(svc, code) {
            req.head.set_res(res);
        }
        let dispatch_key = dispatch_key(&req.head);
        trace!(tid, svc, code, policy = %binding.policy, "Dispatching request");
        // A job lost to a closed queue drops its packet, which answers NO_RESPONSE.
        self.dispatcher
            .dispatch(
                binding.policy,
                &dispatch_key,
                Job::Request(binding.handler, RequestPacket::new(req)),
            )
            .map_err(|e| {
                warn!(tid, svc, code, error = %e, "Request dispatch failed");
                e
            })
    }

    /// Deliver a notification to every local subscriber. Returns how many received it.
    pub fn on_notify(&self, pkt: NotifyPacket) -> HiveResult<usize> {
        let tid = pkt.tid;
        let (svc, code, key) = method_of(&pkt.head).map_err(|e| {
            error!(tid, error = %e, "Dropping notify without a valid method");
            e
        })?;
        let bindings = match self.notifies.get(&key) {
            Some(list) => list.clone(),
            None => {
                debug!(tid, svc, code, "No local notify subscribers");
                return Ok(0);
            }
        };
        let dispatch_key = dispatch_key(&pkt.head);
        let mut delivered = 0;
        for binding in bindings {
            match self.dispatcher.dispatch(
                binding.policy,
                &dispatch_key,
                Job::Notify(binding.handler, pkt.clone()),
            ) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(tid, svc, code, error = %e, "Notify dispatch failed"),
            }
        }
        Ok(delivered)
    }

    /// Register an outbound request with the configured response timeout.
    pub fn add_request(&self, req: PendingRequest) -> HiveResult<()> {
        self.pending.add(req, Some(self.response_timeout))
    }

    /// Register an outbound request with an explicit timeout (`None` waits forever).
    pub fn add_request_with_timeout(
        &self,
        req: PendingRequest,
        timeout: Option<Duration>,
    ) -> HiveResult<()> {
        self.pending.add(req, timeout)
    }

    /// Remove a pending request without completing it.
    pub fn del_request(&self, tid: Tid) -> Option<PendingRequest> {
        self.pending.remove(tid)
    }

    pub fn has_pending(&self, tid: Tid) -> bool {
        self.pending.contains(tid)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Complete `tid` with a typed answer. `head` is the head of the request
    /// being answered; the pending entry already carries the method used to
    /// check the reply, so the head only feeds tracing.
    pub fn on_response_ok(&self, tid: Tid, head: &Head, msg: Box<dyn Message>) -> HiveResult<()> {
        trace!(tid, src = ?head.src(), svc = ?head.svc(), "Local response");
        self.complete(tid, Outcome::Typed(msg))
    }

    pub fn on_response_ok_bytes(&self, tid: Tid, payload: Bytes) -> HiveResult<()> {
        self.complete(tid, Outcome::Bytes(payload))
    }

    pub fn on_response_fail(&self, tid: Tid, code: u16) -> HiveResult<()> {
        self.complete(tid, Outcome::Fail(code))
    }

    fn complete(&self, tid: Tid, outcome: Outcome) -> HiveResult<()> {
        let Some(req) = self.pending.remove(tid) else {
            warn!(tid, "Response for unknown or expired request dropped");
            return Err(HiveError::NotExist(format!("pending request {tid}")));
        };
        trace!(tid, svc = req.svc, code = req.code, "Completing request");
        req.complete(outcome, Some(&self.codec));
        Ok(())
    }

    /// Drain the dispatch pools and fail whatever is still pending with `CLOSED`.
    pub async fn close(&self) {
        self.dispatcher.close().await;
        let failed = self.pending.fail_all(codes::CLOSED);
        if failed > 0 {
            warn!(node_id = self.node_id, failed, "Failed pending requests on close");
        }
    }
}

impl ResponseSink for Router {
    fn respond(&self, tid: Tid, head: &Head, _json: bool, response: Response) {
        let _ = match response {
            Response::Ok(msg) => self.on_response_ok(tid, head, msg),
            Response::Fail(code) => self.on_response_fail(tid, code),
        };
    }
}

fn method_of(head: &Head) -> HiveResult<(u16, u8, u16)> {
    let svc = head
        .svc()
        .ok_or_else(|| HiveError::NotExist("head has no svc".into()))?;
    let code = head
        .code()
        .ok_or_else(|| HiveError::NotExist("head has no code".into()))?;
    Ok((svc, code, method_key(svc, code)?))
}

fn not_bound(kind: &str, svc: u16, code: u8) -> HiveError {
    HiveError::NotExist(format!("{kind} handler svc={svc} code={code}"))
}

/// Key used by the Active and Share policies: head `key`, else the sender node.
fn dispatch_key(head: &Head) -> String {
    head.key()
        .or_else(|| head.src().map(|src| src.to_string()))
        .unwrap_or_default()
}

fn run_job(job: Job) {
    match job {
        Job::Push(handler, pkt) => {
            let (tid, svc, code) = (pkt.tid, pkt.head.svc(), pkt.head.code());
            if let Err(e) = handler(pkt) {
                error!(tid, ?svc, ?code, error = %e, "Push handler failed");
            }
        }
        Job::Notify(handler, pkt) => {
            let (tid, svc, code) = (pkt.tid, pkt.head.svc(), pkt.head.code());
            if let Err(e) = handler(pkt) {
                error!(tid, ?svc, ?code, error = %e, "Notify handler failed");
            }
        }
        Job::Request(handler, pkt) => run_request(&handler, pkt),
    }
}

fn run_request(handler: &RequestHandler, pkt: RequestPacket) {
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| handler(pkt.clone())));
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let (tid, svc, code) = (pkt.tid(), pkt.head().svc(), pkt.head().code());
    match outcome {
        Ok(Ok(())) => trace!(tid, ?svc, ?code, elapsed_ms, "Request handled"),
        Ok(Err(HiveError::Fail(fail))) => {
            debug!(tid, ?svc, ?code, fail, elapsed_ms, "Request handler failed the request");
            pkt.fail(fail);
        }
        Ok(Err(e)) => {
            error!(
                tid,
                ?svc,
                ?code,
                msg = ?pkt.msg(),
                elapsed_ms,
                error = %e,
                "Request handler error"
            );
            pkt.fail(e.code());
        }
        Err(panic) => {
            error!(
                tid,
                ?svc,
                ?code,
                msg = ?pkt.msg(),
                elapsed_ms,
                panic = %panic_message(panic.as_ref()),
                "Request handler panicked"
            );
            pkt.fail(codes::SERVICE);
        }
    }
}
