//! A fixed set of queues selected by key hash.

use crate::queue::{Processor, WorkQueue};
use hive_types::{HiveResult, Shutdown};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// `N` single-consumer queues; a key always lands on the same shard, so
/// ordering holds within a shard only.
pub struct SharePool<T> {
    shards: Vec<WorkQueue<T>>,
}

impl<T: Send + 'static> SharePool<T> {
    pub fn new(
        name: &str,
        shards: usize,
        capacity: usize,
        processor: Processor<T>,
        shutdown: Shutdown,
    ) -> Self {
        let shards = (0..shards.max(1))
            .map(|i| {
                WorkQueue::spawn(
                    format!("{name}:share-{i}"),
                    capacity,
                    Arc::clone(&processor),
                    shutdown.clone(),
                )
            })
            .collect();
        Self { shards }
    }

    pub fn push(&self, key: &str, item: T) -> HiveResult<()> {
        self.shards[self.shard_for(key)].push(item)
    }

    /// Close every shard and wait for them to drain.
    pub async fn close(&self) {
        for shard in &self.shards {
            shard.close();
        }
        for shard in &self.shards {
            shard.join().await;
        }
    }
}

impl<T> SharePool<T> {
    /// Index of the shard serving `key`.
    pub fn shard_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
