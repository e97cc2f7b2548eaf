//! Identifiers: transaction ids, node ids and method keys.
//!
//! A transaction id (tid) is a snowflake: milliseconds since [`TID_EPOCH_MS`]
//! in the high 41 bits, the generating node in the next 10 bits and a
//! per-millisecond sequence in the low 12 bits.

use crate::error::{HiveError, HiveResult};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction id correlating a request with its response and its log lines.
pub type Tid = i64;

/// Identifies one node (one hosted service instance) in the mesh.
pub type NodeId = i64;

/// 2024-01-01T00:00:00Z in unix milliseconds.
pub const TID_EPOCH_MS: i64 = 1_704_067_200_000;

const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

/// Largest node id that fits the tid node bits.
pub const MAX_NODE_ID: NodeId = (1 << NODE_BITS) - 1;

/// Method codes per service must stay below this.
pub const METHODS_PER_SERVICE: u32 = 1000;

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lock-free snowflake generator for one node.
#[derive(Debug)]
pub struct TidGenerator {
    node: u64,
    /// `(last_ms << SEQ_BITS) | seq`, advanced with compare-and-swap.
    state: AtomicU64,
}

impl TidGenerator {
    /// Create a generator for `node_id`, which must be within `0..=MAX_NODE_ID`.
    pub fn new(node_id: NodeId) -> HiveResult<Self> {
        if !(0..=MAX_NODE_ID).contains(&node_id) {
            return Err(HiveError::Config(format!(
                "node_id {node_id} outside 0..={MAX_NODE_ID}"
            )));
        }
        Ok(Self {
            node: node_id as u64,
            state: AtomicU64::new(0),
        })
    }

    /// The node id baked into every generated tid.
    pub fn node_id(&self) -> NodeId {
        self.node as NodeId
    }

    /// Generate the next tid. Never returns the same value twice.
    ///
    /// When a millisecond's sequence is used up this waits for the clock to
    /// reach the next millisecond, so tids never run ahead of wall time.
    pub fn next(&self) -> Tid {
        let mut now = elapsed_millis();
        let mut prev = self.state.load(Ordering::Relaxed);
        loop {
            let last = prev >> SEQ_BITS;
            let seq = prev & SEQ_MASK;
            // A clock that moved backwards keeps the last timestamp.
            let (ms, next_seq) = if now > last {
                (now, 0)
            } else if seq < SEQ_MASK {
                (last, seq + 1)
            } else {
                std::thread::yield_now();
                now = elapsed_millis();
                prev = self.state.load(Ordering::Relaxed);
                continue;
            };
            let next = (ms << SEQ_BITS) | next_seq;
            match self
                .state
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return ((ms << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS) | next_seq)
                        as Tid
                }
                Err(actual) => prev = actual,
            }
        }
    }
}

fn elapsed_millis() -> u64 {
    (now_millis() - TID_EPOCH_MS).max(0) as u64
}

/// Extract the generating node from a tid.
pub fn tid_node(tid: Tid) -> NodeId {
    ((tid as u64 >> SEQ_BITS) & MAX_NODE_ID as u64) as NodeId
}

/// Extract the unix millisecond timestamp from a tid.
pub fn tid_millis(tid: Tid) -> i64 {
    (tid as u64 >> (NODE_BITS + SEQ_BITS)) as i64 + TID_EPOCH_MS
}

/// Pack a service id and method code into one 16-bit lookup key (`svc*1000+code`).
pub fn method_key(svc: u16, code: u8) -> HiveResult<u16> {
    let key = svc as u32 * METHODS_PER_SERVICE + code as u32;
    u16::try_from(key).map_err(|_| HiveError::MethodOutOfRange { svc, code })
}

/// Split a method key back into `(svc, code)`.
pub fn split_key(key: u16) -> (u16, u8) {
    let key = key as u32;
    (
        (key / METHODS_PER_SERVICE) as u16,
        (key % METHODS_PER_SERVICE) as u8,
    )
}
