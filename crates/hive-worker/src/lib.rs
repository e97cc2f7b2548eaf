//! Work queues and dispatch policies for the hive runtime.
//!
//! [`WorkQueue`] is the double-buffered single-consumer primitive every other
//! piece is built on. [`ActivePool`] and [`SharePool`] layer keyed and sharded
//! routing on top of it, and [`Dispatcher`] selects among them by [`Policy`].

pub mod active;
pub mod policy;
pub mod queue;
pub mod share;

pub use active::ActivePool;
pub use policy::{DispatchOptions, Dispatcher, Policy};
pub use queue::{panic_message, run_guarded, Processor, QueueStats, WorkQueue};
pub use share::SharePool;
