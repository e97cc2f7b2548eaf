//! Cancellation and graceful exit.
//!
//! [`Shutdown`] is the cascading cancellation token handed to every
//! background loop at construction. [`Supervisor`] owns the sending side and
//! runs the ordered graceful-exit sequence: each registered subsystem drain is
//! awaited in registration order, bounded by a timeout.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Receiving side of the process-wide shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

impl Shutdown {
    /// A token that never fires (for tests and detached components).
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once shutdown is requested (or the supervisor is dropped).
    pub async fn wait(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return futures::future::pending().await;
        };
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

type Drain = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Outcome of one subsystem drain during graceful exit.
#[derive(Debug, Clone)]
pub struct DrainReport {
    pub name: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Shutdown signal owner and graceful-exit coordinator.
pub struct Supervisor {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    drains: Mutex<Vec<(String, Drain)>>,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx,
            rx,
            drains: Mutex::new(Vec::new()),
        }
    }

    /// Get a token that fires on shutdown.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: Some(self.rx.clone()),
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Register a subsystem drain, run during [`exit`](Self::exit) in registration order.
    pub fn register<F, Fut>(&self, name: impl Into<String>, drain: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let drain: Drain = Box::new(move || Box::pin(drain()));
        self.drains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), drain));
    }

    /// Fire the cancellation token without draining.
    pub fn shutdown(&self) {
        if !self.tx.send_replace(true) {
            info!("Supervisor: shutdown signalled");
        }
    }

    /// Signal shutdown, then drain every registered subsystem, each bounded by `timeout`.
    pub async fn exit(&self, timeout: Duration) -> Vec<DrainReport> {
        self.shutdown();
        let drains = std::mem::take(&mut *self.drains.lock().unwrap_or_else(|e| e.into_inner()));
        let mut reports = Vec::with_capacity(drains.len());

        for (name, drain) in drains {
            let started = Instant::now();
            let timed_out = tokio::time::timeout(timeout, drain()).await.is_err();
            let duration_ms = started.elapsed().as_millis() as u64;
            if timed_out {
                warn!(subsystem = %name, duration_ms, "Drain timed out, continuing");
            } else {
                info!(subsystem = %name, duration_ms, "Subsystem drained");
            }
            reports.push(DrainReport {
                name,
                duration_ms,
                timed_out,
            });
        }
        info!(subsystems = reports.len(), "Graceful exit complete");
        reports
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
