//! Inbound packets handed to handlers.

use hive_types::{codes, NodeId, Tid};
use hive_wire::{Head, Message};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// The answer to a request.
#[derive(Debug)]
pub enum Response {
    Ok(Box<dyn Message>),
    Fail(u16),
}

impl Response {
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok(_) => codes::SUCCESS,
            Self::Fail(code) => *code,
        }
    }
}

/// Where a completed request's response goes: back into the local router,
/// or out through the connection the request arrived on. `head` is the
/// head of the request being answered.
pub trait ResponseSink: Send + Sync {
    fn respond(&self, tid: Tid, head: &Head, json: bool, response: Response);
}

/// A one-way message.
#[derive(Debug)]
pub struct PushPacket {
    pub tid: Tid,
    pub head: Head,
    pub json: bool,
    pub msg: Box<dyn Message>,
}

impl PushPacket {
    pub fn msg_as<M: Message>(&self) -> Option<&M> {
        self.msg.downcast_ref::<M>()
    }

    pub fn src(&self) -> Option<NodeId> {
        self.head.src()
    }
}

/// A broadcast message. Every local subscriber receives a clone sharing one body.
#[derive(Debug, Clone)]
pub struct NotifyPacket {
    pub tid: Tid,
    pub head: Head,
    pub json: bool,
    pub msg: Arc<dyn Message>,
}

impl NotifyPacket {
    pub fn msg_as<M: Message>(&self) -> Option<&M> {
        self.msg.as_any().downcast_ref::<M>()
    }
}

/// A decoded request on its way into the router.
pub struct InboundRequest {
    pub tid: Tid,
    pub head: Head,
    pub json: bool,
    pub msg: Box<dyn Message>,
    pub sink: Arc<dyn ResponseSink>,
}

struct RequestInner {
    tid: Tid,
    head: Head,
    json: bool,
    msg: Box<dyn Message>,
    sink: Arc<dyn ResponseSink>,
    completed: AtomicBool,
}

impl RequestInner {
    fn complete(&self, response: Response) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(tid = self.tid, code = response.code(), "Request already completed, response dropped");
            return false;
        }
        self.sink.respond(self.tid, &self.head, self.json, response);
        true
    }
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        if !self.completed.load(Ordering::Acquire) {
            warn!(
                tid = self.tid,
                svc = ?self.head.svc(),
                code = ?self.head.code(),
                "Request dropped without a response"
            );
            self.complete(Response::Fail(codes::NO_RESPONSE));
        }
    }
}

/// A request awaiting exactly one answer.
///
/// Clones share one completion state, so a handler may move a clone into a
/// task and answer later. The first `ok`/`fail` wins; if every clone is
/// dropped unanswered the caller receives `NO_RESPONSE`.
#[derive(Clone)]
pub struct RequestPacket {
    inner: Arc<RequestInner>,
}

impl RequestPacket {
    pub fn new(req: InboundRequest) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                tid: req.tid,
                head: req.head,
                json: req.json,
                msg: req.msg,
                sink: req.sink,
                completed: AtomicBool::new(false),
            }),
        }
    }

    pub fn tid(&self) -> Tid {
        self.inner.tid
    }

    pub fn head(&self) -> &Head {
        &self.inner.head
    }

    pub fn json(&self) -> bool {
        self.inner.json
    }

    pub fn src(&self) -> Option<NodeId> {
        self.inner.head.src()
    }

    /// Response method code resolved by the router.
    pub fn res_code(&self) -> Option<u8> {
        self.inner.head.res()
    }

    pub fn msg(&self) -> &dyn Message {
        self.inner.msg.as_ref()
    }

    pub fn msg_as<M: Message>(&self) -> Option<&M> {
        self.inner.msg.downcast_ref::<M>()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Answer with `msg`. Returns `false` if the request was already answered.
    pub fn ok<M: Message>(&self, msg: M) -> bool {
        self.inner.complete(Response::Ok(Box::new(msg)))
    }

    pub fn ok_boxed(&self, msg: Box<dyn Message>) -> bool {
        self.inner.complete(Response::Ok(msg))
    }

    /// Answer with an error code. Returns `false` if the request was already answered.
    pub fn fail(&self, code: u16) -> bool {
        self.inner.complete(Response::Fail(code))
    }
}

impl fmt::Debug for RequestPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPacket")
            .field("tid", &self.inner.tid)
            .field("head", &self.inner.head)
            .field("msg", &self.inner.msg)
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every response it receives.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) responses: Mutex<Vec<(Tid, u16)>>,
    }

    impl ResponseSink for RecordingSink {
        fn respond(&self, tid: Tid, _head: &Head, _json: bool, response: Response) {
            self.responses.lock().unwrap().push((tid, response.code()));
        }
    }

    fn request(sink: &Arc<RecordingSink>) -> RequestPacket {
        RequestPacket::new(InboundRequest {
            tid: 11,
            head: Head::new(),
            json: true,
            msg: Box::new(String::from("hello")),
            sink: Arc::clone(sink) as Arc<dyn ResponseSink>,
        })
    }

    #[test]
    fn test_first_completion_wins() {
        let sink = Arc::new(RecordingSink::default());
        let pkt = request(&sink);
        let clone = pkt.clone();
        assert!(pkt.ok(String::from("world")));
        assert!(!clone.fail(1234));
        assert!(!pkt.ok(String::from("again")));
        drop((pkt, clone));
        assert_eq!(*sink.responses.lock().unwrap(), vec![(11, codes::SUCCESS)]);
    }

    #[test]
    fn test_drop_without_answer_fails_once() {
        let sink = Arc::new(RecordingSink::default());
        let pkt = request(&sink);
        let clone = pkt.clone();
        drop(pkt);
        assert!(sink.responses.lock().unwrap().is_empty(), "a clone is still alive");
        drop(clone);
        assert_eq!(*sink.responses.lock().unwrap(), vec![(11, codes::NO_RESPONSE)]);
    }

    #[test]
    fn test_msg_access() {
        let sink = Arc::new(RecordingSink::default());
        let pkt = request(&sink);
        assert_eq!(pkt.msg_as::<String>().map(String::as_str), Some("hello"));
        assert!(pkt.msg_as::<u32>().is_none());
        pkt.fail(7);
    }
}
