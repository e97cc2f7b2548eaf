//! Double-buffered single-consumer work queue.
//!
//! Producers append to the back buffer under a short lock and wake the
//! consumer. The consumer task swaps the buffers under the same lock, releases
//! it, then drains the front buffer without holding it, so producers keep
//! appending while a batch is processed. Buffers are swapped, never
//! reallocated, so their capacity is recycled between batches.
//!
//! A panicking item is caught at the queue boundary: it is logged, counted and
//! dropped, and the consumer carries on with the next item.

use hive_types::{HiveError, HiveResult, Shutdown};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The function a queue applies to every item.
pub type Processor<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Counters exposed for health checks and tests.
#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    processed: AtomicU64,
    panics: AtomicU64,
}

impl QueueStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Items lost to a panicking processor.
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

struct Buffers<T> {
    back: Vec<T>,
    closed: bool,
}

struct Inner<T> {
    name: String,
    buffers: Mutex<Buffers<T>>,
    wake: Notify,
    stats: QueueStats,
}

impl<T> Inner<T> {
    fn close(&self) {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed = true;
        self.wake.notify_one();
    }
}

/// A FIFO drained by exactly one consumer task.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawn the consumer task and return the producer handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        capacity: usize,
        processor: Processor<T>,
        shutdown: Shutdown,
    ) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            buffers: Mutex::new(Buffers {
                back: Vec::with_capacity(capacity),
                closed: false,
            }),
            wake: Notify::new(),
            stats: QueueStats::default(),
        });
        let task = tokio::spawn(consume(Arc::clone(&inner), processor, shutdown, capacity));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Append an item. Safe from any thread; fails with `Closed` after [`close`](Self::close).
    pub fn push(&self, item: T) -> HiveResult<()> {
        {
            let mut buffers = self
                .inner
                .buffers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if buffers.closed {
                return Err(HiveError::Closed);
            }
            buffers.back.push(item);
        }
        self.inner.stats.pushed.fetch_add(1, Ordering::Relaxed);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Stop accepting items. Items already queued are still processed.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Wait for the consumer to finish after [`close`](Self::close) or shutdown.
    pub async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }

    /// Items waiting in the back buffer (not yet picked up by the consumer).
    pub fn pending(&self) -> usize {
        self.inner
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back
            .len()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.inner.stats
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // Let the consumer drain what is left and exit on its own.
        self.inner.close();
    }
}

async fn consume<T>(
    inner: Arc<Inner<T>>,
    processor: Processor<T>,
    mut shutdown: Shutdown,
    capacity: usize,
) {
    let mut front: Vec<T> = Vec::with_capacity(capacity);
    loop {
        let closed = {
            let mut buffers = inner.buffers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::swap(&mut front, &mut buffers.back);
            buffers.closed
        };

        if front.is_empty() {
            if closed {
                break;
            }
            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = shutdown.wait() => inner.close(),
            }
            continue;
        }

        for item in front.drain(..) {
            if run_guarded(&inner.name, &processor, item) {
                inner.stats.processed.fetch_add(1, Ordering::Relaxed);
            } else {
                inner.stats.panics.fetch_add(1, Ordering::Relaxed);
            }
        }
        tokio::task::yield_now().await;
    }
    debug!(queue = %inner.name, "Work queue consumer stopped");
}

/// Apply `processor` to `item`, containing a panic. Returns `false` if it panicked.
pub fn run_guarded<T>(name: &str, processor: &Processor<T>, item: T) -> bool {
    match catch_unwind(AssertUnwindSafe(|| processor(item))) {
        Ok(()) => true,
        Err(panic) => {
            error!(
                queue = %name,
                panic = %panic_message(panic.as_ref()),
                "Work item panicked, item dropped and consumer restarted"
            );
            false
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
