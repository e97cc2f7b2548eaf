//! Outbound requests awaiting their response, keyed by tid.
//!
//! An entry is inserted at most once and removed exactly once: by the
//! response, by its timeout timer, or by an explicit delete, whichever comes
//! first. Whoever removes it owns the completion.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hive_types::{codes, HiveError, HiveResult, Tid};
use hive_wire::{Codec, Message};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// A typed reply: the response message or a failure code.
pub type Reply = Result<Box<dyn Message>, u16>;

/// A raw reply: the encoded response payload or a failure code.
pub type RawReply = Result<Bytes, u16>;

/// How the caller wants to hear back.
pub enum Completion {
    /// Receive the encoded payload.
    Bytes(Box<dyn FnOnce(RawReply) + Send + Sync>),
    /// Receive the decoded response message.
    Typed(Box<dyn FnOnce(Reply) + Send + Sync>),
    /// Wake an awaiting caller.
    Channel(tokio::sync::oneshot::Sender<Reply>),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Bytes(_) => "bytes",
            Self::Typed(_) => "typed",
            Self::Channel(_) => "channel",
        };
        f.write_str(kind)
    }
}

/// What arrived for a pending request.
pub(crate) enum Outcome {
    Typed(Box<dyn Message>),
    Bytes(Bytes),
    Fail(u16),
}

/// An outbound request registered for correlation.
#[derive(Debug)]
pub struct PendingRequest {
    pub tid: Tid,
    pub svc: u16,
    pub code: u8,
    pub json: bool,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    pub fn new(tid: Tid, svc: u16, code: u8, json: bool, completion: Completion) -> Self {
        Self {
            tid,
            svc,
            code,
            json,
            completion,
            timer: None,
        }
    }

    /// Run the completion, converting the outcome to the form it expects.
    /// Decoding raw bytes into a typed reply needs the `codec`.
    pub(crate) fn complete(self, outcome: Outcome, codec: Option<&Codec>) {
        let (tid, svc, code, json) = (self.tid, self.svc, self.code, self.json);
        match self.completion {
            Completion::Bytes(callback) => {
                let reply = match outcome {
                    Outcome::Bytes(bytes) => Ok(bytes),
                    Outcome::Typed(msg) => msg.encode(json).map(Bytes::from).map_err(|e| {
                        warn!(tid, error = %e, "Failed to encode response");
                        e.code()
                    }),
                    Outcome::Fail(code) => Err(code),
                };
                callback(reply);
            }
            Completion::Typed(callback) => callback(typed(tid, svc, code, json, outcome, codec)),
            Completion::Channel(tx) => {
                if tx.send(typed(tid, svc, code, json, outcome, codec)).is_err() {
                    debug!(tid, "Caller stopped waiting for the response");
                }
            }
        }
    }

    fn fail(self, code: u16) {
        self.complete(Outcome::Fail(code), None);
    }
}

fn typed(
    tid: Tid,
    svc: u16,
    code: u8,
    json: bool,
    outcome: Outcome,
    codec: Option<&Codec>,
) -> Reply {
    match outcome {
        Outcome::Typed(msg) => Ok(msg),
        Outcome::Fail(code) => Err(code),
        Outcome::Bytes(bytes) => {
            let Some(codec) = codec else {
                return Err(codes::NOT_EXIST);
            };
            let mut msg = codec.spawn_res(svc, code).map_err(|e| {
                warn!(tid, svc, code, error = %e, "No response type registered");
                e.code()
            })?;
            msg.decode_into(&bytes, json).map_err(|e| {
                warn!(tid, svc, code, error = %e, "Failed to decode response");
                e.code()
            })?;
            Ok(msg)
        }
    }
}

/// Sharded tid → pending request map with per-request timeout timers.
#[derive(Clone, Default)]
pub struct PendingTable {
    map: Arc<DashMap<Tid, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `req`. With a `timeout`, a timer removes it and fails it with
    /// `TIMEOUT` if no response arrives in time (needs a tokio runtime).
    pub fn add(&self, req: PendingRequest, timeout: Option<Duration>) -> HiveResult<()> {
        let tid = req.tid;
        match self.map.entry(tid) {
            Entry::Occupied(_) => {
                return Err(HiveError::Service(format!("tid {tid} is already pending")));
            }
            Entry::Vacant(slot) => {
                slot.insert(req);
            }
        }
        if let Some(timeout) = timeout {
            let map = Arc::downgrade(&self.map);
            let timer = tokio::spawn(expire(map, tid, timeout)).abort_handle();
            match self.map.get_mut(&tid) {
                Some(mut entry) => entry.timer = Some(timer),
                // Already answered.
                None => timer.abort(),
            }
        }
        Ok(())
    }

    /// Pop the entry for `tid`, cancelling its timer.
    pub fn remove(&self, tid: Tid) -> Option<PendingRequest> {
        let (_, mut req) = self.map.remove(&tid)?;
        if let Some(timer) = req.timer.take() {
            timer.abort();
        }
        Some(req)
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.map.contains_key(&tid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fail every pending request with `code` (used on shutdown).
    pub fn fail_all(&self, code: u16) -> usize {
        let tids: Vec<Tid> = self.map.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for tid in tids {
            if let Some(req) = self.remove(tid) {
                req.fail(code);
                failed += 1;
            }
        }
        failed
    }
}

async fn expire(map: Weak<DashMap<Tid, PendingRequest>>, tid: Tid, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(map) = map.upgrade() else {
        return;
    };
    if let Some((_, mut req)) = map.remove(&tid) {
        req.timer = None;
        warn!(tid, svc = req.svc, code = req.code, ?timeout, "Request timed out");
        req.fail(codes::TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn noop(tid: Tid) -> PendingRequest {
        PendingRequest::new(tid, 1, 1, true, Completion::Bytes(Box::new(|_| {})))
    }

    #[test]
    fn test_duplicate_tid_is_refused() {
        let table = PendingTable::new();
        table.add(noop(1), None).unwrap();
        assert!(table.add(noop(1), None).is_err());
        assert_eq!(table.len(), 1);
        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_and_remove_of_10k_tids() {
        let table = PendingTable::new();
        let adders: Vec<_> = (0..4)
            .map(|p| {
                let table = table.clone();
                tokio::spawn(async move {
                    for tid in (p * 2_500)..((p + 1) * 2_500) {
                        table.add(noop(tid), None).unwrap();
                    }
                })
            })
            .collect();
        for a in adders {
            a.await.unwrap();
        }
        assert_eq!(table.len(), 10_000);

        let popped = Arc::new(Mutex::new(Vec::new()));
        let removers: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let popped = Arc::clone(&popped);
                tokio::spawn(async move {
                    let mut mine = Vec::new();
                    for tid in 0..10_000 {
                        if let Some(req) = table.remove(tid) {
                            mine.push(req.tid);
                        }
                    }
                    popped.lock().unwrap().extend(mine);
                })
            })
            .collect();
        for r in removers {
            r.await.unwrap();
        }

        let popped = popped.lock().unwrap();
        assert_eq!(popped.len(), 10_000, "every tid popped exactly once");
        let unique: HashSet<_> = popped.iter().collect();
        assert_eq!(unique.len(), 10_000);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_and_fails_once() {
        let table = PendingTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let codes_seen = Arc::new(Mutex::new(Vec::new()));
        let (c, seen) = (Arc::clone(&calls), Arc::clone(&codes_seen));
        let req = PendingRequest::new(
            5,
            1,
            1,
            true,
            Completion::Bytes(Box::new(move |reply| {
                c.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(reply.err());
            })),
        );
        table.add(req, Some(Duration::from_millis(50))).unwrap();
        assert!(table.contains(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!table.contains(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*codes_seen.lock().unwrap(), vec![Some(codes::TIMEOUT)]);

        // A late response finds nothing to complete.
        assert!(table.remove(5).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_request_never_times_out() {
        let table = PendingTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let req = PendingRequest::new(
            6,
            1,
            1,
            true,
            Completion::Bytes(Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        table.add(req, Some(Duration::from_millis(50))).unwrap();
        let req = table.remove(6).unwrap();
        req.complete(Outcome::Bytes(Bytes::from_static(b"{}")), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_completion_decodes_bytes() {
        let codec = Codec::new();
        codec.register::<String, String>(4, 1, 2).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let req = PendingRequest::new(9, 4, 1, true, Completion::Channel(tx));
        req.complete(Outcome::Bytes(Bytes::from_static(b"\"pong\"")), Some(&codec));
        let msg = rx.await.unwrap().unwrap();
        assert_eq!(msg.downcast::<String>().unwrap(), "pong");
    }

    #[test]
    fn test_fail_all() {
        let table = PendingTable::new();
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        table
            .add(PendingRequest::new(1, 1, 1, false, Completion::Channel(tx)), None)
            .unwrap();
        table.add(noop(2), None).unwrap();
        assert_eq!(table.fail_all(codes::CLOSED), 2);
        assert!(matches!(rx.try_recv(), Ok(Err(codes::CLOSED))));
    }
}
