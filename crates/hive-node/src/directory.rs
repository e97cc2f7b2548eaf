//! Service directory: every remote service instance this node knows about.
//!
//! The directory is bookkeeping for introspection. Routing decisions read
//! the node's mesh, never this table.

use crate::dialer::PeerInfo;
use chrono::{DateTime, Utc};
use hive_types::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Connection state of a known instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Announced, no link yet.
    Pending,
    Connected,
    /// Link lost or given up.
    Disconnected,
}

/// A known remote service instance.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub svc: u16,
    pub node_id: NodeId,
    pub addr: String,
    pub ver: u32,
    pub state: RecordState,
    pub discovered_at: DateTime<Utc>,
    /// When the current link came up.
    pub connected_at: Option<DateTime<Utc>>,
}

/// Thread-safe table of service records keyed by `(svc, node_id)`.
#[derive(Debug, Clone, Default)]
pub struct ServiceDirectory {
    records: Arc<RwLock<HashMap<(u16, NodeId), ServiceRecord>>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered instance. A re-announcement keeps the existing state.
    pub fn add(&self, peer: &PeerInfo) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry((peer.svc, peer.node_id))
            .and_modify(|r| {
                r.addr = peer.addr.clone();
                r.ver = peer.ver;
            })
            .or_insert_with(|| ServiceRecord {
                svc: peer.svc,
                node_id: peer.node_id,
                addr: peer.addr.clone(),
                ver: peer.ver,
                state: RecordState::Pending,
                discovered_at: Utc::now(),
                connected_at: None,
            });
    }

    pub fn remove(&self, svc: u16, node_id: NodeId) -> Option<ServiceRecord> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(&(svc, node_id))
    }

    pub fn mark_connected(&self, svc: u16, node_id: NodeId) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(&(svc, node_id)) {
            record.state = RecordState::Connected;
            record.connected_at = Some(Utc::now());
        }
    }

    pub fn mark_disconnected(&self, svc: u16, node_id: NodeId) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(&(svc, node_id)) {
            record.state = RecordState::Disconnected;
        }
    }

    pub fn get(&self, svc: u16, node_id: NodeId) -> Option<ServiceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(&(svc, node_id)).cloned()
    }

    /// Instances of `svc`, ordered by node id.
    pub fn service(&self, svc: u16) -> Vec<ServiceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<_> = records.values().filter(|r| r.svc == svc).cloned().collect();
        found.sort_by_key(|r| r.node_id);
        found
    }

    pub fn connected(&self) -> Vec<ServiceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .values()
            .filter(|r| r.state == RecordState::Connected)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<ServiceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
