//! IP allocation and route computation: link-state (global Dijkstra
//! recompute on topology change) or distance-vector (periodic neighbor
//! exchange with split-horizon-poisoned-reverse).
//!
//! Grounded in the teacher's `network::multipath::MultiPathManager` (path
//! selection and failover across multiple network paths), generalized from
//! per-socket path selection to graph-wide multi-hop routing.

use crate::event::priority;
use crate::ids::NodeId;
use crate::sim::Simulator;
use std::collections::{BinaryHeap, HashMap};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("unreachable")]
    Unreachable,
    #[error("unknown_node")]
    UnknownNode,
}

pub type RoutingResult<T> = Result<T, RoutingError>;

const INFINITY: f64 = f64::INFINITY;

#[derive(Debug, Default)]
pub struct RoutingFabric {
    next_octet3: u16,
    next_octet4: u16,
    /// dst -> next_hop, per node.
    tables: HashMap<NodeId, HashMap<NodeId, NodeId>>,
    /// Distance-vector cost estimates, per node: dst -> cost.
    dv_costs: HashMap<NodeId, HashMap<NodeId, f64>>,
    dv_scheduled: bool,
}

impl RoutingFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next `10.0.x.y` address deterministically.
    pub fn allocate_ip(&mut self) -> Ipv4Addr {
        let ip = Ipv4Addr::new(10, 0, (self.next_octet3 % 256) as u8, (self.next_octet4 % 256) as u8);
        self.next_octet4 += 1;
        if self.next_octet4 >= 256 {
            self.next_octet4 = 0;
            self.next_octet3 += 1;
        }
        ip
    }

    pub fn next_hop_table(&self, node: NodeId) -> Option<&HashMap<NodeId, NodeId>> {
        self.tables.get(&node)
    }

    /// Reconstructs the full hop sequence from `src` to `dst` by walking
    /// next-hop tables.
    pub fn get_route(&self, src: NodeId, dst: NodeId) -> RoutingResult<Vec<NodeId>> {
        if src == dst {
            return Ok(vec![src]);
        }
        let mut route = vec![src];
        let mut current = src;
        let max_hops = self.tables.len().max(1) + 1;
        for _ in 0..max_hops {
            let table = self.tables.get(&current).ok_or(RoutingError::Unreachable)?;
            let next = *table.get(&dst).ok_or(RoutingError::Unreachable)?;
            route.push(next);
            if next == dst {
                return Ok(route);
            }
            current = next;
        }
        Err(RoutingError::Unreachable)
    }
}

fn weight(sim: &Simulator, a: NodeId, b: NodeId) -> Option<f64> {
    sim.link_between(a, b)
        .filter(|l| l.is_up())
        .map(|l| l.weight(sim.config.routing_metric))
}

fn online_neighbors(sim: &Simulator, node: NodeId) -> Vec<NodeId> {
    sim.nodes[&node]
        .neighbors
        .iter()
        .copied()
        .filter(|n| sim.nodes.get(n).is_some_and(|n| n.is_online()))
        .filter(|n| weight(sim, node, *n).is_some())
        .collect()
}

/// Recomputes all-pairs shortest paths via Dijkstra from every online node.
/// Called on any topology change when `routing_strategy` is `LinkState`.
pub fn recompute_link_state(sim: &mut Simulator) {
    let node_ids: Vec<NodeId> = sim.nodes.keys().copied().collect();
    let mut tables = HashMap::new();
    for &src in &node_ids {
        if !sim.nodes[&src].is_online() {
            continue;
        }
        tables.insert(src, dijkstra_next_hops(sim, src, &node_ids));
    }
    sim.routing.tables = tables;
    sim.log_event("routing_recomputed", src_actor(), None, vec![]);
}

fn src_actor() -> String {
    "routing_fabric".to_string()
}

fn dijkstra_next_hops(sim: &Simulator, src: NodeId, all_nodes: &[NodeId]) -> HashMap<NodeId, NodeId> {
    #[derive(PartialEq)]
    struct HeapEntry(f64, NodeId);
    impl Eq for HeapEntry {}
    impl Ord for HeapEntry {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            other.0.total_cmp(&self.0).then(other.1.cmp(&self.1))
        }
    }
    impl PartialOrd for HeapEntry {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    let mut dist: HashMap<NodeId, f64> = all_nodes.iter().map(|&n| (n, INFINITY)).collect();
    let mut first_hop: HashMap<NodeId, NodeId> = HashMap::new();
    dist.insert(src, 0.0);
    let mut heap = BinaryHeap::new();
    heap.push(HeapEntry(0.0, src));

    while let Some(HeapEntry(d, u)) = heap.pop() {
        if d > dist[&u] {
            continue;
        }
        if !sim.nodes[&u].is_online() {
            continue;
        }
        for v in online_neighbors(sim, u) {
            let w = weight(sim, u, v).unwrap_or(INFINITY);
            let candidate = d + w;
            if candidate < *dist.get(&v).unwrap_or(&INFINITY) {
                dist.insert(v, candidate);
                let hop = if u == src { v } else { *first_hop.get(&u).unwrap() };
                first_hop.insert(v, hop);
                heap.push(HeapEntry(candidate, v));
            }
        }
    }
    first_hop
}

/// Schedules the recurring distance-vector neighbor exchange. Idempotent:
/// a second call is a no-op once scheduling has started.
pub fn start_distance_vector(sim: &mut Simulator) {
    if sim.routing.dv_scheduled {
        return;
    }
    sim.routing.dv_scheduled = true;
    for &n in sim.nodes.keys().collect::<Vec<_>>() {
        sim.routing
            .dv_costs
            .entry(n)
            .or_default()
            .insert(n, 0.0);
    }
    schedule_dv_round(sim);
}

fn schedule_dv_round(sim: &mut Simulator) {
    let interval = sim.config.dv_interval_secs;
    sim.scheduler
        .schedule_in(interval, priority::ROUTING_RECOMPUTE, move |sim| {
            dv_round(sim);
            schedule_dv_round(sim);
        })
        .expect("dv round scheduled in the future");
}

/// One synchronous round of distance-vector neighbor exchange: every node's
/// new vector is computed from the *previous* round's vectors so updates
/// are order-independent, with split-horizon-poisoned-reverse applied to
/// the advertisement each node sends to each neighbor.
fn dv_round(sim: &mut Simulator) {
    let node_ids: Vec<NodeId> = sim.nodes.keys().copied().collect();
    let old_costs = sim.routing.dv_costs.clone();
    let old_tables = sim.routing.tables.clone();

    let mut new_costs: HashMap<NodeId, HashMap<NodeId, f64>> = HashMap::new();
    let mut new_tables: HashMap<NodeId, HashMap<NodeId, NodeId>> = HashMap::new();

    for &n in &node_ids {
        if !sim.nodes[&n].is_online() {
            continue;
        }
        let mut costs: HashMap<NodeId, f64> = HashMap::new();
        let mut table: HashMap<NodeId, NodeId> = HashMap::new();
        costs.insert(n, 0.0);

        for m in online_neighbors(sim, n) {
            let w = weight(sim, n, m).unwrap_or(INFINITY);
            let advertised = advertise(&old_costs, &old_tables, m, n);
            for (&dst, &cost) in &advertised {
                if dst == n {
                    continue;
                }
                let candidate = w + cost;
                if candidate < *costs.get(&dst).unwrap_or(&INFINITY) {
                    costs.insert(dst, candidate);
                    table.insert(dst, m);
                }
            }
        }
        new_costs.insert(n, costs);
        new_tables.insert(n, table);
    }

    sim.routing.dv_costs = new_costs;
    sim.routing.tables = new_tables;
}

/// The vector node `from` advertises to neighbor `to`: routes whose
/// next-hop is `to` are poisoned (advertised as infinite cost) so `to`
/// never tries to route back through `from` for them.
fn advertise(
    costs: &HashMap<NodeId, HashMap<NodeId, f64>>,
    tables: &HashMap<NodeId, HashMap<NodeId, NodeId>>,
    from: NodeId,
    to: NodeId,
) -> HashMap<NodeId, f64> {
    let mut out = HashMap::new();
    let Some(from_costs) = costs.get(&from) else {
        return out;
    };
    let from_table = tables.get(&from);
    for (&dst, &cost) in from_costs {
        let poisoned = from_table.and_then(|t| t.get(&dst)).is_some_and(|&h| h == to);
        out.insert(dst, if poisoned { INFINITY } else { cost });
    }
    out
}
