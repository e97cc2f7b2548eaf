//! Core types for the hive messaging runtime.
//!
//! This crate defines the error taxonomy, transaction and method identifiers,
//! the process-wide configuration and the shutdown token shared by every
//! other hive crate.

pub mod config;
pub mod error;
pub mod id;
pub mod shutdown;

pub use config::{load_config, HiveConfig, PeerConfig};
pub use error::{codes, HiveError, HiveResult};
pub use id::{method_key, split_key, NodeId, Tid, TidGenerator};
pub use shutdown::{DrainReport, Shutdown, Supervisor};
