//! Picks one dialer when several nodes host the target service.

use crate::dialer::NodeDialer;
use hive_wire::Head;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub trait Selector: Send + Sync {
    /// Index into `candidates`, or `None` to refuse the send.
    /// `candidates` is never empty.
    fn select(&self, svc: u16, head: &Head, candidates: &[Arc<NodeDialer>]) -> Option<usize>;
}

/// Uniform random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn select(&self, _svc: u16, _head: &Head, candidates: &[Arc<NodeDialer>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

/// Sticky choice by the head `key`, so one key keeps reaching one node while
/// the candidate set is stable. Falls back to random without a key.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn select(&self, svc: u16, head: &Head, candidates: &[Arc<NodeDialer>]) -> Option<usize> {
        let Some(key) = head.key() else {
            return RandomSelector.select(svc, head, candidates);
        };
        if candidates.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Some((hasher.finish() % candidates.len() as u64) as usize)
    }
}

/// Dialers worth sending to: the connected ones, or all of them when none is
/// connected yet (their sends retry until the link comes up).
pub(crate) fn candidates(dialers: &[Arc<NodeDialer>]) -> Vec<Arc<NodeDialer>> {
    let connected: Vec<_> = dialers.iter().filter(|d| d.is_connected()).cloned().collect();
    if connected.is_empty() {
        dialers.to_vec()
    } else {
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOptions;
    use crate::dialer::{DialerHooks, DialerOptions, PeerInfo};
    use crate::memory::MemoryNetwork;
    use hive_types::Shutdown;

    fn dialers(n: i64) -> Vec<Arc<NodeDialer>> {
        let network = MemoryNetwork::new();
        let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
        (0..n)
            .map(|id| {
                NodeDialer::new(
                    PeerInfo::new(1, id, format!("n{id}")),
                    DialerOptions::default(),
                    connector.clone(),
                    DialerHooks::default(),
                    Shutdown::never(),
                )
            })
            .collect()
    }

    #[test]
    fn test_random_stays_in_range() {
        let set = dialers(3);
        for _ in 0..100 {
            let i = RandomSelector.select(1, &Head::new(), &set).unwrap();
            assert!(i < 3);
        }
        assert!(RandomSelector.select(1, &Head::new(), &[]).is_none());
    }

    #[test]
    fn test_hash_is_sticky() {
        let set = dialers(4);
        let head = Head::new().with("key", "room-9");
        let first = HashSelector.select(1, &head, &set).unwrap();
        for _ in 0..20 {
            assert_eq!(HashSelector.select(1, &head, &set), Some(first));
        }
    }

    #[test]
    fn test_candidates_fall_back_to_all() {
        let set = dialers(2);
        assert_eq!(candidates(&set).len(), 2);
    }
}
