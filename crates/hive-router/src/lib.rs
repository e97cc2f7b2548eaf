//! Hive router.
//!
//! Correlates outbound requests with their responses through the
//! [`PendingTable`], and runs inbound pushes, requests and notifications on
//! the handler bound for their method under the handler's dispatch
//! [`Policy`](hive_worker::Policy).

pub mod packet;
pub mod pending;
pub mod router;

pub use packet::{
    InboundRequest, NotifyPacket, PushPacket, RequestPacket, Response, ResponseSink,
};
pub use pending::{Completion, PendingRequest, PendingTable, RawReply, Reply};
pub use router::{
    BindHandle, BindKind, NotifyHandler, PushHandler, RequestHandler, Router,
};
