//! The `Simulator`: owns the event queue, current time, every node/link
//! arena, and the routing/transfer/cluster subsystems. Passed by `&mut`
//! to every free-function "op" rather than shared via `Arc`, since a
//! single logical executor owns all state (spec.md §9's "no global
//! mutable state" note, generalizing the teacher's `Arc<...>`-shared
//! style into ordinary ownership).

use crate::cluster::ClusterManager;
use crate::config::{RoutingStrategy, SimulatorConfig};
use crate::disk::VirtualDisk;
use crate::event::{RunSummary, Scheduler, SimTime};
use crate::ids::{IdGen, LinkId, NodeId};
use crate::node::{Link, LinkState, NodeState, StorageNode};
use crate::os::VirtualOS;
use crate::routing::RoutingFabric;
use crate::transfer::TransferEngine;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;

/// One entry in the append-only event log, capped at
/// `config.event_log_capacity` (oldest entries drop first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub seq: u64,
    pub time: SimTime,
    pub kind: String,
    pub actor: String,
    pub node: Option<NodeId>,
    pub details: Vec<String>,
}

pub struct Simulator {
    pub scheduler: Scheduler,
    pub config: SimulatorConfig,
    pub nodes: HashMap<NodeId, StorageNode>,
    pub links: HashMap<LinkId, Link>,
    pub routing: RoutingFabric,
    pub transfers: TransferEngine,
    pub clusters: ClusterManager,
    pub rng: StdRng,
    event_log: VecDeque<EventLogEntry>,
    next_event_seq: u64,
    node_ids: IdGen,
    link_ids: IdGen,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.rng_seed);
        let routing_strategy = config.routing_strategy;
        let mut sim = Self {
            scheduler: Scheduler::new(),
            config,
            nodes: HashMap::new(),
            links: HashMap::new(),
            routing: RoutingFabric::new(),
            transfers: TransferEngine::new(),
            clusters: ClusterManager::new(),
            rng,
            event_log: VecDeque::new(),
            next_event_seq: 0,
            node_ids: IdGen::default(),
            link_ids: IdGen::default(),
        };
        if routing_strategy == RoutingStrategy::DistanceVector {
            crate::routing::start_distance_vector(&mut sim);
        }
        sim
    }

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Registers a node with a deterministically allocated `10.0.x.y`
    /// address.
    #[allow(clippy::too_many_arguments)]
    pub fn add_node(
        &mut self,
        name: String,
        zone: String,
        storage_capacity_bytes: u64,
        nic_bandwidth_bps: u64,
        cpu_cores: usize,
        ram_bytes: u64,
    ) -> NodeId {
        let id = NodeId(self.node_ids.next_u64());
        let ip = self.routing.allocate_ip();
        let node = StorageNode {
            id,
            name,
            ip,
            zone,
            nic_bandwidth_bps,
            state: NodeState::Online,
            disk: VirtualDisk::new(storage_capacity_bytes),
            os: VirtualOS::new(cpu_cores, ram_bytes, self.config.disk_concurrency, self.config.nic_concurrency),
            neighbors: BTreeSet::new(),
            cluster: None,
            replica_parent: None,
            replica_children: BTreeSet::new(),
            sustained_breaches: HashMap::new(),
        };
        self.nodes.insert(id, node);
        self.log_event("node_added", "controller".to_string(), Some(id), vec![]);
        id
    }

    /// Removes a node and every link touching it. Leaves cluster
    /// membership bookkeeping on surviving nodes intact.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        let dangling: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, l)| l.endpoints.0 == id || l.endpoints.1 == id)
            .map(|(lid, _)| *lid)
            .collect();
        for lid in dangling {
            self.remove_link(lid);
        }
        for neighbor in node.neighbors {
            if let Some(n) = self.nodes.get_mut(&neighbor) {
                n.neighbors.remove(&id);
            }
        }
        self.recompute_routing_if_link_state();
        self.log_event("node_removed", "controller".to_string(), Some(id), vec![]);
        true
    }

    /// Creates a bidirectional link. Grows both endpoints' neighbor sets.
    pub fn link_nodes(&mut self, a: NodeId, b: NodeId, bandwidth_bps: u64, latency_ms: f64) -> LinkId {
        let id = LinkId(self.link_ids.next_u64());
        self.links.insert(
            id,
            Link {
                id,
                endpoints: (a, b),
                bandwidth_bps,
                latency_ms,
                state: LinkState::Up,
                active_flows: BTreeSet::new(),
            },
        );
        if let Some(node) = self.nodes.get_mut(&a) {
            node.neighbors.insert(b);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.neighbors.insert(a);
        }
        self.recompute_routing_if_link_state();
        self.log_event(
            "link_added",
            "controller".to_string(),
            Some(a),
            vec![b.to_string()],
        );
        id
    }

    pub fn remove_link(&mut self, id: LinkId) -> bool {
        let Some(link) = self.links.remove(&id) else {
            return false;
        };
        let (a, b) = link.endpoints;
        if let Some(node) = self.nodes.get_mut(&a) {
            node.neighbors.remove(&b);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.neighbors.remove(&a);
        }
        self.recompute_routing_if_link_state();
        true
    }

    pub fn link_id_between(&self, a: NodeId, b: NodeId) -> Option<LinkId> {
        self.links
            .values()
            .find(|l| (l.endpoints.0 == a && l.endpoints.1 == b) || (l.endpoints.0 == b && l.endpoints.1 == a))
            .map(|l| l.id)
    }

    pub fn link_between(&self, a: NodeId, b: NodeId) -> Option<&Link> {
        self.link_id_between(a, b).map(|id| &self.links[&id])
    }

    pub(crate) fn recompute_routing_if_link_state(&mut self) {
        if self.config.routing_strategy == RoutingStrategy::LinkState {
            crate::routing::recompute_link_state(self);
        }
    }

    /// Any online node not yet assigned to a cluster; used by the
    /// demand-scaling policy to find a fresh replica candidate.
    pub fn spare_node_for_cluster(&self, _cluster_id: crate::ids::ClusterId) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.is_online() && n.cluster.is_none())
            .map(|n| n.id)
    }

    pub fn log_event(&mut self, kind: &str, actor: String, node: Option<NodeId>, details: Vec<String>) {
        let entry = EventLogEntry {
            seq: self.next_event_seq,
            time: self.scheduler.now(),
            kind: kind.to_string(),
            actor,
            node,
            details,
        };
        self.next_event_seq += 1;
        self.event_log.push_back(entry);
        if self.event_log.len() > self.config.event_log_capacity {
            self.event_log.pop_front();
        }
    }

    /// Re-appends an event log entry restored from a snapshot, raising the
    /// sequence counter so new entries sort after it.
    pub(crate) fn restore_event_log_entry(&mut self, entry: EventLogEntry) {
        self.next_event_seq = self.next_event_seq.max(entry.seq + 1);
        self.event_log.push_back(entry);
        if self.event_log.len() > self.config.event_log_capacity {
            self.event_log.pop_front();
        }
    }

    /// Raises the node/link id generator floors past ids restored from a
    /// snapshot.
    pub(crate) fn ensure_id_floors(&mut self, max_node: Option<u64>, max_link: Option<u64>) {
        if let Some(n) = max_node {
            self.node_ids.ensure_above(n);
        }
        if let Some(l) = max_link {
            self.link_ids.ensure_above(l);
        }
    }

    pub fn events(&self, tail: usize) -> Vec<EventLogEntry> {
        let len = self.event_log.len();
        let skip = len.saturating_sub(tail);
        self.event_log.iter().skip(skip).cloned().collect()
    }

    pub fn allocate_ip(&mut self) -> Ipv4Addr {
        self.routing.allocate_ip()
    }

    /// Advances the simulation by running every event up to `now + seconds`.
    pub fn step(&mut self, seconds: f64) -> RunSummary {
        let until = self.scheduler.now() + seconds;
        Scheduler::run(self, Some(until), None)
    }

    /// Runs every scheduled event to exhaustion (or until `max_events`).
    pub fn run_to_idle(&mut self, max_events: Option<u64>) -> RunSummary {
        Scheduler::run(self, None, max_events)
    }
}
