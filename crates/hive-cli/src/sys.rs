//! The built-in `sys` service every node answers.

use hive_router::Router;
use hive_types::{HiveResult, NodeId};
use hive_wire::Codec;
use hive_worker::Policy;
use serde::{Deserialize, Serialize};

pub const SYS_SVC: u16 = 0;
pub const PING: u8 = 1;
pub const PONG: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u32,
    pub sent_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u32,
    pub sent_ms: i64,
    pub node_id: NodeId,
}

pub fn register(codec: &Codec) -> HiveResult<()> {
    codec.register::<Ping, Pong>(SYS_SVC, PING, PONG)
}

/// Answer pings inline with this node's id.
pub fn bind(router: &Router) -> HiveResult<()> {
    let node_id = router.node_id();
    router.bind_request(SYS_SVC, PING, Policy::Inline, move |pkt| {
        let ping = pkt.msg_as::<Ping>().cloned().unwrap_or_default();
        pkt.ok(Pong {
            seq: ping.seq,
            sent_ms: ping.sent_ms,
            node_id,
        });
        Ok(())
    })?;
    Ok(())
}
