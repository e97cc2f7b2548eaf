//! Hive node.
//!
//! Connections ([`Agent`]), the reconnecting [`NodeDialer`], and the
//! [`Node`] that ties them to a [`Router`](hive_router::Router): it tracks
//! which remote nodes host which services, routes pushes, requests and
//! notifications to them, and answers the requests and watch subscriptions
//! remote nodes send in.

pub mod agent;
pub mod dialer;
pub mod directory;
pub mod discovery;
pub mod memory;
pub mod node;
pub mod selector;
pub mod tcp;

pub use agent::{Agent, AgentOptions, Connector};
pub use dialer::{DialerHooks, DialerOptions, DialerState, NodeDialer, PeerInfo};
pub use directory::{RecordState, ServiceDirectory, ServiceRecord};
pub use discovery::{run_discovery, DiscoveryEvent, LocalRegistration, StaticDiscovery};
pub use memory::{MemoryAgent, MemoryConnector, MemoryNetwork};
pub use node::{Node, ServiceHook};
pub use selector::{HashSelector, RandomSelector, Selector};
pub use tcp::{Acceptor, Listener, TcpAgent, TcpConnector};
