//! The public facade consumed by external collaborators (CLI, tests,
//! embedding code): wraps a [`Simulator`] and exposes the operation list
//! from spec.md §6, translating module errors into the fixed external
//! error-code taxonomy from spec.md §6/§7.
//!
//! Grounded in the teacher's `TransferCoordinator` public methods
//! (`send_file`, inspection accessors) for the method surface, and in
//! `api::error::ApiError`'s `into_response` match for the `code()`
//! error-code mapping pattern.

use crate::cluster::{self, ClusterError};
use crate::disk::DiskError;
use crate::event::RunSummary;
use crate::ids::{ClusterId, FileId, LinkId, NodeId, TransferId};
use crate::node::LinkState;
use crate::os::OsError;
use crate::routing::RoutingError;
use crate::sim::{EventLogEntry, Simulator};
use crate::snapshot::{self, SnapshotError};
use crate::transfer::{self, TransferError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    #[error("duplicate_node: {0}")]
    DuplicateNode(String),
    #[error("unknown_node")]
    UnknownNode,
    #[error("unknown_link")]
    UnknownLink,
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Os(#[from] OsError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

impl ControllerError {
    /// Maps any variant to one of the fixed external error codes.
    pub fn code(&self) -> &'static str {
        match self {
            ControllerError::DuplicateNode(_) => "duplicate_node",
            ControllerError::UnknownNode => "unknown_node",
            ControllerError::UnknownLink => "invalid_argument",
            ControllerError::InvalidArgument(_) => "invalid_argument",
            ControllerError::Disk(e) => disk_code(e),
            ControllerError::Os(e) => os_code(e),
            ControllerError::Routing(e) => routing_code(e),
            ControllerError::Transfer(e) => transfer_code(e),
            ControllerError::Cluster(_) => "invalid_argument",
            ControllerError::Snapshot(_) => "invalid_argument",
        }
    }
}

fn disk_code(e: &DiskError) -> &'static str {
    match e {
        DiskError::NoSpace => "no_space",
        DiskError::DiskOffline => "disk_offline",
        DiskError::ChecksumMismatch => "checksum_mismatch",
        DiskError::UnknownReservation | DiskError::UnknownChunk { .. } => "invalid_argument",
    }
}

fn os_code(e: &OsError) -> &'static str {
    match e {
        OsError::Oom => "oom",
        OsError::NodeOffline => "node_offline",
        OsError::Disk(d) => disk_code(d),
    }
}

fn routing_code(e: &RoutingError) -> &'static str {
    match e {
        RoutingError::Unreachable => "no_route",
        RoutingError::UnknownNode => "unknown_node",
    }
}

fn transfer_code(e: &TransferError) -> &'static str {
    match e {
        TransferError::NoRoute => "no_route",
        TransferError::RouteLost => "route_lost",
        TransferError::NodeOffline => "node_offline",
        TransferError::Os(os) => os_code(os),
        TransferError::UnknownTransfer => "invalid_argument",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub ip: String,
    pub zone: String,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub id: LinkId,
    pub a: NodeId,
    pub b: NodeId,
    pub bandwidth_bps: u64,
    pub latency_ms: f64,
    pub up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInspection {
    pub online: bool,
    pub zone: String,
    pub bandwidth_bps: u64,
    pub replica_parent: Option<NodeId>,
    pub replica_children: Vec<NodeId>,
    pub neighbors: Vec<NodeId>,
    pub stored_files: Vec<String>,
    pub active_transfers: usize,
    pub disk_utilization: f64,
    pub ram_utilization: f64,
    pub nic_utilization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub duration: f64,
    pub events_processed: u64,
    pub now: f64,
}

/// Thin public surface wrapping the [`Simulator`]. Holds no state of its
/// own beyond the set of names already handed to `add_node` (for the
/// `duplicate_node` admission check).
pub struct ControllerAPI {
    sim: Simulator,
    names: HashSet<String>,
}

impl ControllerAPI {
    pub fn new(config: crate::config::SimulatorConfig) -> Self {
        Self {
            sim: Simulator::new(config),
            names: HashSet::new(),
        }
    }

    pub fn simulator(&self) -> &Simulator {
        &self.sim
    }

    pub fn simulator_mut(&mut self) -> &mut Simulator {
        &mut self.sim
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_node(
        &mut self,
        name: String,
        zone: String,
        storage_capacity_bytes: u64,
        nic_bandwidth_bps: u64,
        cpu_cores: usize,
        ram_bytes: u64,
    ) -> ControllerResult<NodeInfo> {
        if !self.names.insert(name.clone()) {
            return Err(ControllerError::DuplicateNode(name));
        }
        let id = self.sim.add_node(name, zone, storage_capacity_bytes, nic_bandwidth_bps, cpu_cores, ram_bytes);
        Ok(self.node_info(id).unwrap())
    }

    pub fn remove_node(&mut self, id: NodeId) -> ControllerResult<()> {
        let name = self.sim.nodes.get(&id).map(|n| n.name.clone());
        if !self.sim.remove_node(id) {
            return Err(ControllerError::UnknownNode);
        }
        if let Some(name) = name {
            self.names.remove(&name);
        }
        Ok(())
    }

    /// Chains adjacent pairs in `ids` into links, matching spec.md §6's
    /// `connect(id_a, id_b, ...id_n)` chaining semantics.
    pub fn connect(
        &mut self,
        ids: &[NodeId],
        bandwidth_bps: u64,
        latency_ms: f64,
    ) -> ControllerResult<Vec<LinkInfo>> {
        if ids.len() < 2 {
            return Err(ControllerError::InvalidArgument(
                "connect requires at least two node ids".to_string(),
            ));
        }
        for id in ids {
            if !self.sim.nodes.contains_key(id) {
                return Err(ControllerError::UnknownNode);
            }
        }
        let mut out = Vec::new();
        for pair in ids.windows(2) {
            let id = self.sim.link_nodes(pair[0], pair[1], bandwidth_bps, latency_ms);
            out.push(self.link_info(id).unwrap());
        }
        Ok(out)
    }

    pub fn disconnect(&mut self, a: NodeId, b: NodeId) -> ControllerResult<()> {
        let id = self.sim.link_id_between(a, b).ok_or(ControllerError::UnknownLink)?;
        self.sim.remove_link(id);
        Ok(())
    }

    pub fn fail_node(&mut self, id: NodeId) -> ControllerResult<()> {
        let node = self.sim.nodes.get_mut(&id).ok_or(ControllerError::UnknownNode)?;
        node.state = crate::node::NodeState::Offline;
        node.disk.set_online(false);
        node.os.set_online(false);
        self.sim.recompute_routing_if_link_state();
        self.sim.log_event("node_failed", "controller".to_string(), Some(id), vec![]);
        Ok(())
    }

    pub fn restore_node(&mut self, id: NodeId) -> ControllerResult<()> {
        let node = self.sim.nodes.get_mut(&id).ok_or(ControllerError::UnknownNode)?;
        node.state = crate::node::NodeState::Online;
        node.disk.set_online(true);
        node.os.set_online(true);
        self.sim.recompute_routing_if_link_state();
        self.sim.log_event("node_restored", "controller".to_string(), Some(id), vec![]);
        Ok(())
    }

    pub fn fail_link(&mut self, a: NodeId, b: NodeId) -> ControllerResult<()> {
        let id = self.sim.link_id_between(a, b).ok_or(ControllerError::UnknownLink)?;
        self.sim.log_event("link_failed", "controller".to_string(), Some(a), vec![b.to_string()]);
        transfer::set_link_down(&mut self.sim, id);
        self.sim.recompute_routing_if_link_state();
        transfer::reroute_flows_on_down_link(&mut self.sim, id);
        Ok(())
    }

    pub fn restore_link(&mut self, a: NodeId, b: NodeId) -> ControllerResult<()> {
        let id = self.sim.link_id_between(a, b).ok_or(ControllerError::UnknownLink)?;
        transfer::set_link_up(&mut self.sim, id);
        self.sim.recompute_routing_if_link_state();
        self.sim.log_event("link_restored", "controller".to_string(), Some(a), vec![b.to_string()]);
        Ok(())
    }

    pub fn initiate_file_transfer(
        &mut self,
        src: NodeId,
        dst: NodeId,
        file_id: FileId,
        size_bytes: u64,
        chunk_size: Option<u64>,
    ) -> ControllerResult<TransferId> {
        let route = self.sim.routing.get_route(src, dst)?;
        let chunk_size = chunk_size.unwrap_or_else(|| transfer::derive_chunk_size(&self.sim, &route));
        let id = transfer::start_file_transfer(&mut self.sim, file_id.clone(), size_bytes, chunk_size, src, dst, move |sim, result| {
            let kind = if result.is_ok() { "transfer_completed" } else { "transfer_failed" };
            sim.log_event(kind, "controller".to_string(), Some(dst), vec![file_id]);
        })?;
        Ok(id)
    }

    /// Replicates chunk 0 of `file_id` from `owner` to `target`, reading it
    /// off `owner`'s disk through its VirtualOS rather than peeking at the
    /// disk's internal chunk record directly.
    pub fn initiate_replica_transfer(&mut self, owner: NodeId, target: NodeId, file_id: FileId) -> ControllerResult<()> {
        let length = self
            .sim
            .nodes
            .get(&owner)
            .and_then(|n| n.disk.chunk(&file_id, 0))
            .map(|r| r.length)
            .ok_or_else(|| ControllerError::InvalidArgument(format!("{owner} does not hold {file_id}")))?;
        let log_file_id = file_id.clone();
        transfer::start_replica_read(&mut self.sim, owner, target, file_id, 0, length, move |sim, result| {
            let kind = if result.is_ok() { "transfer_completed" } else { "transfer_failed" };
            sim.log_event(kind, "controller".to_string(), Some(target), vec![log_file_id]);
        })?;
        Ok(())
    }

    /// Cancels an in-flight transfer: drops its current network flow (if
    /// any), releases whatever destination reservation it still holds, and
    /// marks it aborted. A no-op on a transfer that already reached a
    /// terminal state.
    pub fn abort(&mut self, id: TransferId) -> ControllerResult<()> {
        transfer::abort(&mut self.sim, id)?;
        Ok(())
    }

    /// Forms a new replica cluster rooted at `primary`, the only way to
    /// reach spec.md's default R=3 clustering through the public facade.
    pub fn form_cluster(&mut self, primary: NodeId, replica_candidates: &[NodeId], bandwidth_bps: u64, latency_ms: f64) -> ClusterId {
        cluster::form_cluster(&mut self.sim, primary, replica_candidates, bandwidth_bps, latency_ms)
    }

    /// Starts the recurring demand-scaling policy check. Idempotent.
    pub fn start_scaling_policy(&mut self) {
        cluster::start_scaling_policy(&mut self.sim)
    }

    /// Writes `size_bytes` of `file_id` to `src`'s own disk, then (unless
    /// `local`) fans it out across `src`'s replica cluster.
    pub fn push(&mut self, src: NodeId, file_id: FileId, size_bytes: u64, local: bool) -> ControllerResult<()> {
        let reservation = self
            .sim
            .nodes
            .get_mut(&src)
            .ok_or(ControllerError::UnknownNode)?
            .disk
            .reserve(size_bytes)?;
        let checksum = blake3::hash(file_id.as_bytes()).into();
        let cluster = self.sim.nodes[&src].cluster;
        let file_id_commit = file_id.clone();
        crate::disk::write_chunk(&mut self.sim, src, reservation, file_id.clone(), 0, 0, size_bytes, checksum, move |sim, result| {
            match &result {
                Ok(()) => sim.log_event("transfer_completed", "controller".to_string(), Some(src), vec![file_id_commit.clone()]),
                Err(err) => sim.log_event("transfer_failed", "controller".to_string(), Some(src), vec![file_id_commit.clone(), err.to_string()]),
            }
            if result.is_ok() && !local {
                if let Some(cluster_id) = cluster {
                    let _ = cluster::replicate_chunk(sim, cluster_id, file_id_commit, 0, size_bytes);
                }
            }
        })?;
        Ok(())
    }

    pub fn fetch(&mut self, target: NodeId, file_id: FileId) -> ControllerResult<()> {
        let owner = self
            .sim
            .nodes
            .iter()
            .find(|(id, n)| **id != target && n.disk.has_file(&file_id))
            .map(|(id, _)| *id)
            .ok_or_else(|| ControllerError::InvalidArgument(format!("no node holds {file_id}")))?;
        self.initiate_replica_transfer(owner, target, file_id)
    }

    pub fn inspect(&self, id: NodeId) -> ControllerResult<NodeInspection> {
        let node = self.sim.nodes.get(&id).ok_or(ControllerError::UnknownNode)?;
        Ok(NodeInspection {
            online: node.is_online(),
            zone: node.zone.clone(),
            bandwidth_bps: node.nic_bandwidth_bps,
            replica_parent: node.replica_parent,
            replica_children: node.replica_children.iter().copied().collect(),
            neighbors: node.neighbors.iter().copied().collect(),
            stored_files: node.disk.files().cloned().collect(),
            active_transfers: self.sim.transfers.active_count(),
            disk_utilization: node.disk.utilization(),
            ram_utilization: node.os.ram_utilization(),
            nic_utilization: node.os.nic_utilization(),
        })
    }

    pub fn events(&self, tail: usize) -> Vec<EventLogEntry> {
        self.sim.events(tail)
    }

    pub fn step(&mut self, seconds: f64) -> StepResult {
        let before = self.sim.now();
        let summary: RunSummary = self.sim.step(seconds);
        StepResult {
            duration: summary.now - before,
            events_processed: summary.events_processed,
            now: summary.now,
        }
    }

    pub fn run_to_idle(&mut self) -> StepResult {
        let before = self.sim.now();
        let summary = self.sim.run_to_idle(None);
        StepResult {
            duration: summary.now - before,
            events_processed: summary.events_processed,
            now: summary.now,
        }
    }

    pub fn snapshot(&self) -> ControllerResult<Vec<u8>> {
        Ok(snapshot::take(&self.sim)?)
    }

    pub fn restore(&mut self, blob: &[u8]) -> ControllerResult<()> {
        snapshot::restore(&mut self.sim, blob)?;
        self.names = self.sim.nodes.values().map(|n| n.name.clone()).collect();
        Ok(())
    }

    fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        let node = self.sim.nodes.get(&id)?;
        Some(NodeInfo {
            id,
            name: node.name.clone(),
            ip: node.ip.to_string(),
            zone: node.zone.clone(),
            online: node.is_online(),
        })
    }

    fn link_info(&self, id: LinkId) -> Option<LinkInfo> {
        let link = self.sim.links.get(&id)?;
        Some(LinkInfo {
            id,
            a: link.endpoints.0,
            b: link.endpoints.1,
            bandwidth_bps: link.bandwidth_bps,
            latency_ms: link.latency_ms,
            up: link.state == LinkState::Up,
        })
    }
}

pub use crate::transfer::TransferState as TransferStatus;
