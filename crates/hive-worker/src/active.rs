//! Keyed workers: one lazily created queue per free-form key.
//!
//! Items pushed with the same key run strictly in order and never overlap;
//! different keys run independently. A background sweep evicts workers that
//! have seen no push for twice the check interval and have nothing queued
//! or running.

use crate::queue::{Processor, WorkQueue};
use dashmap::DashMap;
use hive_types::{HiveResult, Shutdown};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct ActiveWorker<T> {
    queue: WorkQueue<T>,
    /// Milliseconds since the pool epoch of the last push.
    last_push: AtomicU64,
    /// Items pushed but not yet finished, the running one included.
    outstanding: Arc<AtomicUsize>,
}

impl<T> ActiveWorker<T> {
    fn is_drained(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }
}

/// Decrements the owning worker's outstanding count when an item finishes,
/// panicking or not.
struct Finished(Arc<AtomicUsize>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lazily created, idle-evicted per-key queues.
pub struct ActivePool<T> {
    name: String,
    workers: Arc<DashMap<String, Arc<ActiveWorker<T>>>>,
    processor: Processor<T>,
    capacity: usize,
    epoch: Instant,
    shutdown: Shutdown,
    sweeper: JoinHandle<()>,
}

impl<T: Send + 'static> ActivePool<T> {
    /// Create the pool and start its idle sweep.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        check_interval: Duration,
        processor: Processor<T>,
        shutdown: Shutdown,
    ) -> Self {
        let name = name.into();
        let workers: Arc<DashMap<String, Arc<ActiveWorker<T>>>> = Arc::new(DashMap::new());
        let epoch = Instant::now();
        let sweeper = tokio::spawn(sweep(
            name.clone(),
            Arc::clone(&workers),
            epoch,
            check_interval,
            shutdown.clone(),
        ));
        Self {
            name,
            workers,
            processor,
            capacity,
            epoch,
            shutdown,
            sweeper,
        }
    }

    /// Queue `item` on the worker for `key`, creating it if needed.
    pub fn push(&self, key: &str, item: T) -> HiveResult<()> {
        let now = self.now_ms();
        // Holding the map guard while pushing keeps the sweep from evicting
        // the worker between lookup and push.
        if let Some(worker) = self.workers.get(key) {
            return Self::enqueue(&worker, now, item);
        }
        let worker = self
            .workers
            .entry(key.to_owned())
            .or_insert_with(|| self.spawn_worker(key, now));
        Self::enqueue(&worker, now, item)
    }

    fn enqueue(worker: &ActiveWorker<T>, now: u64, item: T) -> HiveResult<()> {
        worker.last_push.store(now, Ordering::Relaxed);
        worker.outstanding.fetch_add(1, Ordering::AcqRel);
        worker.queue.push(item).map_err(|e| {
            worker.outstanding.fetch_sub(1, Ordering::AcqRel);
            e
        })
    }

    fn spawn_worker(&self, key: &str, now: u64) -> Arc<ActiveWorker<T>> {
        debug!(pool = %self.name, key = %key, "Spawning active worker");
        let outstanding = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&outstanding);
        let inner = Arc::clone(&self.processor);
        let processor: Processor<T> = Arc::new(move |item: T| {
            let _done = Finished(Arc::clone(&counter));
            inner(item);
        });
        Arc::new(ActiveWorker {
            queue: WorkQueue::spawn(
                format!("{}:{key}", self.name),
                self.capacity,
                processor,
                self.shutdown.clone(),
            ),
            last_push: AtomicU64::new(now),
            outstanding,
        })
    }

    /// Number of live keyed workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Close every worker and wait for them to drain.
    pub async fn close(&self) {
        self.sweeper.abort();
        let workers: Vec<_> = self
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.workers.clear();
        for worker in &workers {
            worker.queue.close();
        }
        for worker in &workers {
            worker.queue.join().await;
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl<T> Drop for ActivePool<T> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep<T: Send + 'static>(
    name: String,
    workers: Arc<DashMap<String, Arc<ActiveWorker<T>>>>,
    epoch: Instant,
    check_interval: Duration,
    mut shutdown: Shutdown,
) {
    let idle_after = (check_interval * 2).as_millis() as u64;
    let mut ticker = tokio::time::interval(check_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        let now = epoch.elapsed().as_millis() as u64;
        workers.retain(|key, worker| {
            let quiet = now.saturating_sub(worker.last_push.load(Ordering::Relaxed)) >= idle_after;
            // A worker still running or draining keeps its key; evicting it
            // would let a fresh worker overlap with it.
            let idle = quiet && worker.is_drained();
            if idle {
                debug!(pool = %name, key = %key, "Evicting idle active worker");
                worker.queue.close();
            }
            !idle
        });
    }
}
