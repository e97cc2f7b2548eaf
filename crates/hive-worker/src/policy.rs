//! Dispatch policies and the dispatcher that applies them.

use crate::active::ActivePool;
use crate::queue::{run_guarded, Processor, WorkQueue};
use crate::share::SharePool;
use hive_types::{HiveConfig, HiveResult, Shutdown};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Concurrency discipline applied to an inbound handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// One queue per dispatch key: strict per-key ordering.
    Active,
    /// A fixed pool of queues selected by key hash.
    Share,
    /// One queue for everything bound with this policy: total ordering.
    Global,
    /// A fresh task per item: no ordering, maximum parallelism.
    Go,
    /// Run synchronously on the calling task.
    Inline,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Share => write!(f, "share"),
            Self::Global => write!(f, "global"),
            Self::Go => write!(f, "go"),
            Self::Inline => write!(f, "inline"),
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "share" => Ok(Self::Share),
            "global" => Ok(Self::Global),
            "go" => Ok(Self::Go),
            "inline" | "self" => Ok(Self::Inline),
            other => Err(format!("unknown dispatch policy '{other}'")),
        }
    }
}

/// Sizing of a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub capacity: usize,
    pub check_interval: Duration,
    pub share_workers: usize,
}

impl DispatchOptions {
    pub fn from_config(config: &HiveConfig) -> Self {
        Self {
            capacity: config.worker_capacity,
            check_interval: config.worker_check_interval(),
            share_workers: config.share_worker_count(),
        }
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from_config(&HiveConfig::default())
    }
}

/// Routes items of one job type to the pool matching their policy.
pub struct Dispatcher<T> {
    name: String,
    processor: Processor<T>,
    global: WorkQueue<T>,
    share: SharePool<T>,
    active: ActivePool<T>,
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new(
        name: impl Into<String>,
        options: DispatchOptions,
        processor: Processor<T>,
        shutdown: Shutdown,
    ) -> Self {
        let name = name.into();
        Self {
            global: WorkQueue::spawn(
                format!("{name}:global"),
                options.capacity,
                Arc::clone(&processor),
                shutdown.clone(),
            ),
            share: SharePool::new(
                &name,
                options.share_workers,
                options.capacity,
                Arc::clone(&processor),
                shutdown.clone(),
            ),
            active: ActivePool::new(
                format!("{name}:active"),
                options.capacity,
                options.check_interval,
                Arc::clone(&processor),
                shutdown,
            ),
            processor,
            name,
        }
    }

    /// Run `item` under `policy`. `key` selects the worker for Active and Share.
    pub fn dispatch(&self, policy: Policy, key: &str, item: T) -> HiveResult<()> {
        match policy {
            Policy::Active => self.active.push(key, item),
            Policy::Share => self.share.push(key, item),
            Policy::Global => self.global.push(item),
            Policy::Go => {
                let name = self.name.clone();
                let processor = Arc::clone(&self.processor);
                tokio::spawn(async move {
                    run_guarded(&name, &processor, item);
                });
                Ok(())
            }
            Policy::Inline => {
                run_guarded(&self.name, &self.processor, item);
                Ok(())
            }
        }
    }

    /// Live keyed workers (Active policy).
    pub fn active_workers(&self) -> usize {
        self.active.len()
    }

    /// Close every pool and wait for queued items to drain.
    pub async fn close(&self) {
        self.global.close();
        self.global.join().await;
        self.share.close().await;
        self.active.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_policy_parse_and_display() {
        for policy in [
            Policy::Active,
            Policy::Share,
            Policy::Global,
            Policy::Go,
            Policy::Inline,
        ] {
            assert_eq!(policy.to_string().parse::<Policy>().unwrap(), policy);
        }
        assert_eq!("SELF".parse::<Policy>().unwrap(), Policy::Inline);
        assert!("fifo".parse::<Policy>().is_err());
    }

    #[tokio::test]
    async fn test_every_policy_runs_the_item() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let processor: Processor<()> = Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let options = DispatchOptions {
            capacity: 4,
            check_interval: Duration::from_secs(32),
            share_workers: 2,
        };
        let dispatcher = Dispatcher::new("test", options, processor, Shutdown::never());

        dispatcher.dispatch(Policy::Inline, "k", ()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1, "inline runs on the caller");

        for policy in [Policy::Active, Policy::Share, Policy::Global, Policy::Go] {
            dispatcher.dispatch(policy, "k", ()).unwrap();
        }
        assert_eq!(dispatcher.active_workers(), 1);
        dispatcher.close().await;
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_inline_panic_is_contained() {
        let processor: Processor<()> = Arc::new(|_| panic!("handler blew up"));
        let dispatcher =
            Dispatcher::new("panics", DispatchOptions::default(), processor, Shutdown::never());
        assert!(dispatcher.dispatch(Policy::Inline, "k", ()).is_ok());
        dispatcher.close().await;
    }
}
