//! Storage node and the links connecting them.

use crate::disk::VirtualDisk;
use crate::ids::{ClusterId, FlowId, LinkId, NodeId};
use crate::os::VirtualOS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Up,
    Down,
}

/// An undirected link between two nodes. Mutated only by the transfer
/// engine (flow membership) and the failure helpers (state).
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub endpoints: (NodeId, NodeId),
    pub bandwidth_bps: u64,
    pub latency_ms: f64,
    pub state: LinkState,
    pub active_flows: BTreeSet<FlowId>,
}

impl Link {
    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if self.endpoints.0 == node {
            Some(self.endpoints.1)
        } else if self.endpoints.1 == node {
            Some(self.endpoints.0)
        } else {
            None
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == LinkState::Up
    }

    pub fn weight(&self, metric: crate::config::RoutingMetric) -> f64 {
        match metric {
            crate::config::RoutingMetric::LatencyMs => self.latency_ms.max(0.001),
            crate::config::RoutingMetric::InverseBandwidth => 1.0 / self.bandwidth_bps.max(1) as f64,
        }
    }
}

/// A storage node: composes [`VirtualDisk`] + [`VirtualOS`] and holds link
/// and replica-cluster metadata.
pub struct StorageNode {
    pub id: NodeId,
    pub name: String,
    pub ip: Ipv4Addr,
    pub zone: String,
    pub nic_bandwidth_bps: u64,
    pub state: NodeState,
    pub disk: VirtualDisk,
    pub os: VirtualOS,
    pub neighbors: BTreeSet<NodeId>,
    pub cluster: Option<ClusterId>,
    pub replica_parent: Option<NodeId>,
    pub replica_children: BTreeSet<NodeId>,
    /// Consecutive demand-scaling policy checks each threshold has been
    /// seen exceeded, keyed by threshold name; reset once a replica spawns
    /// or the threshold is no longer exceeded.
    pub(crate) sustained_breaches: std::collections::HashMap<&'static str, u32>,
}

impl StorageNode {
    pub fn is_online(&self) -> bool {
        self.state == NodeState::Online
    }
}
