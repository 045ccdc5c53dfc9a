//! Replica cluster management: fixed-size clusters of mirrored storage
//! nodes, fan-out replication on ingest, and demand-driven scaling.
//!
//! Grounded in the teacher's `coordinator::TransferCoordinator` (owns a
//! set of active transfers and drives them to completion) generalized
//! from per-file transfer orchestration to per-cluster replica
//! orchestration, and in `relay::node::RelayNode`'s peer bookkeeping for
//! the cluster's member-node tracking.

use crate::event::priority;
use crate::ids::{ChunkId, ClusterId, FileId, IdGen, NodeId};
use crate::sim::Simulator;
use crate::transfer;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("unknown_cluster")]
    UnknownCluster,
    #[error("unknown_node")]
    UnknownNode,
    #[error("max_replicas_reached")]
    MaxReplicasReached,
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// One of the thresholds the demand-scaling policy watches, in the fixed
/// tie-break order storage -> bandwidth -> os failures -> ram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingSignal {
    Storage,
    Bandwidth,
    OsFailures,
    Ram,
}

const SIGNAL_ORDER: [ScalingSignal; 4] = [
    ScalingSignal::Storage,
    ScalingSignal::Bandwidth,
    ScalingSignal::OsFailures,
    ScalingSignal::Ram,
];

pub struct ReplicaCluster {
    pub id: ClusterId,
    pub primary: NodeId,
    pub replicas: BTreeSet<NodeId>,
}

impl ReplicaCluster {
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(self.primary).chain(self.replicas.iter().copied())
    }
}

#[derive(Default)]
pub struct ClusterManager {
    clusters: std::collections::HashMap<ClusterId, ReplicaCluster>,
    cluster_ids: IdGen,
    policy_scheduled: bool,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ClusterId) -> Option<&ReplicaCluster> {
        self.clusters.get(&id)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ReplicaCluster> {
        self.clusters.values()
    }

    /// Re-inserts a cluster restored from a snapshot, raising the id
    /// generator floor so new clusters never collide with it.
    pub fn insert_restored(&mut self, cluster: ReplicaCluster) {
        self.cluster_ids.ensure_above(cluster.id.0);
        self.clusters.insert(cluster.id, cluster);
    }
}

/// Forms a new replica cluster rooted at `primary`, auto-wiring a mirrored
/// link to each of `replica_candidates` (up to `default_cluster_size - 1`)
/// and marking membership on every node.
pub fn form_cluster(
    sim: &mut Simulator,
    primary: NodeId,
    replica_candidates: &[NodeId],
    bandwidth_bps: u64,
    latency_ms: f64,
) -> ClusterId {
    let id = ClusterId(sim.clusters.cluster_ids.next_u64());
    let want = sim.config.default_cluster_size.saturating_sub(1);
    let mut replicas = BTreeSet::new();
    for &candidate in replica_candidates.iter().take(want) {
        sim.link_nodes(primary, candidate, bandwidth_bps, latency_ms);
        let node = sim.nodes.get_mut(&candidate).unwrap();
        node.cluster = Some(id);
        node.replica_parent = Some(primary);
        replicas.insert(candidate);
    }
    {
        let primary_node = sim.nodes.get_mut(&primary).unwrap();
        primary_node.cluster = Some(id);
        primary_node.replica_children = replicas.clone();
    }
    sim.clusters.clusters.insert(
        id,
        ReplicaCluster {
            id,
            primary,
            replicas,
        },
    );
    if let crate::config::RoutingStrategy::LinkState = sim.config.routing_strategy {
        crate::routing::recompute_link_state(sim);
    }
    id
}

/// Fans a chunk already committed on `primary` out to every replica in its
/// cluster, equally sharing each destination link (handled by the
/// transfer engine's fair-share model, not here).
pub fn replicate_chunk(
    sim: &mut Simulator,
    cluster_id: ClusterId,
    file_id: FileId,
    chunk_id: ChunkId,
    size_bytes: u64,
) -> ClusterResult<()> {
    let cluster = sim
        .clusters
        .clusters
        .get(&cluster_id)
        .ok_or(ClusterError::UnknownCluster)?;
    let primary = cluster.primary;
    let targets: Vec<NodeId> = cluster.replicas.iter().copied().collect();

    for dst in targets {
        let file_id = file_id.clone();
        let log_file_id = file_id.clone();
        let started = transfer::start_replica_read(sim, primary, dst, file_id, chunk_id, size_bytes, move |sim, result| match result {
            Ok(()) => {
                sim.log_event("transfer_completed", "cluster_manager".to_string(), Some(dst), vec![log_file_id]);
            }
            Err(err) => {
                sim.log_event(
                    "replica_sync_failed",
                    "cluster_manager".to_string(),
                    Some(dst),
                    vec![format!("{err}")],
                );
            }
        });
        if let Err(err) = started {
            sim.log_event(
                "replica_sync_failed",
                "cluster_manager".to_string(),
                None,
                vec![format!("{err}")],
            );
        }
    }
    Ok(())
}

/// Adds one more replica to an existing cluster, backfilling it from the
/// primary by re-running the fan-out for every chunk the primary holds.
pub fn add_replica(
    sim: &mut Simulator,
    cluster_id: ClusterId,
    candidate: NodeId,
    bandwidth_bps: u64,
    latency_ms: f64,
) -> ClusterResult<()> {
    {
        let cluster = sim
            .clusters
            .clusters
            .get(&cluster_id)
            .ok_or(ClusterError::UnknownCluster)?;
        if cluster.replicas.len() + 1 >= sim.config.max_replicas_per_cluster {
            return Err(ClusterError::MaxReplicasReached);
        }
    }
    let primary = sim.clusters.clusters[&cluster_id].primary;
    sim.link_nodes(primary, candidate, bandwidth_bps, latency_ms);
    {
        let node = sim.nodes.get_mut(&candidate).unwrap();
        node.cluster = Some(cluster_id);
        node.replica_parent = Some(primary);
    }
    sim.clusters
        .clusters
        .get_mut(&cluster_id)
        .unwrap()
        .replicas
        .insert(candidate);
    sim.nodes
        .get_mut(&primary)
        .unwrap()
        .replica_children
        .insert(candidate);

    let backfill: Vec<(FileId, ChunkId, u64)> = sim.nodes[&primary]
        .disk
        .files()
        .flat_map(|file_id| {
            let disk = &sim.nodes[&primary].disk;
            (0..disk.chunk_count(file_id) as ChunkId)
                .filter_map(|cid| disk.chunk(file_id, cid).map(|r| (file_id.clone(), cid, r.length)))
                .collect::<Vec<_>>()
        })
        .collect();
    for (file_id, chunk_id, length) in backfill {
        let _ = transfer::start_replica_read(sim, primary, candidate, file_id, chunk_id, length, |_, _| {});
    }
    if let crate::config::RoutingStrategy::LinkState = sim.config.routing_strategy {
        crate::routing::recompute_link_state(sim);
    }
    Ok(())
}

/// Schedules the recurring demand-scaling policy check. Idempotent.
pub fn start_scaling_policy(sim: &mut Simulator) {
    if sim.clusters.policy_scheduled {
        return;
    }
    sim.clusters.policy_scheduled = true;
    schedule_policy_check(sim);
}

fn schedule_policy_check(sim: &mut Simulator) {
    let interval = sim.config.scaling_policy_interval_secs;
    sim.scheduler
        .schedule_in(interval, priority::CLUSTER_POLICY, move |sim| {
            run_policy_check(sim);
            schedule_policy_check(sim);
        })
        .expect("policy check scheduled in the future");
}

/// One round of the demand-scaling policy: for every cluster primary,
/// checks each threshold in the fixed order storage -> bandwidth -> os
/// failures -> ram, and spawns a replica once a threshold has stayed
/// breached for `scaling_sustain_checks` consecutive rounds.
fn run_policy_check(sim: &mut Simulator) {
    let cluster_ids: Vec<ClusterId> = sim.clusters.clusters.keys().copied().collect();
    for cluster_id in cluster_ids {
        let primary = sim.clusters.clusters[&cluster_id].primary;
        if sim.clusters.clusters[&cluster_id].replicas.len() + 1 >= sim.config.max_replicas_per_cluster {
            continue;
        }
        for signal in SIGNAL_ORDER {
            let breached = signal_breached(sim, primary, signal);
            let key = signal_key(signal);
            let node = sim.nodes.get_mut(&primary).unwrap();
            let count = node.sustained_breaches.entry(key).or_insert(0);
            if breached {
                *count += 1;
            } else {
                *count = 0;
            }
            let sustained = *count >= sim.config.scaling_sustain_checks;
            if sustained {
                sim.nodes.get_mut(&primary).unwrap().sustained_breaches.insert(key, 0);
                spawn_demand_replica(sim, cluster_id, primary);
                break;
            }
        }
    }
}

fn signal_key(signal: ScalingSignal) -> &'static str {
    match signal {
        ScalingSignal::Storage => "storage",
        ScalingSignal::Bandwidth => "bandwidth",
        ScalingSignal::OsFailures => "os_failures",
        ScalingSignal::Ram => "ram",
    }
}

fn signal_breached(sim: &Simulator, primary: NodeId, signal: ScalingSignal) -> bool {
    let node = &sim.nodes[&primary];
    match signal {
        ScalingSignal::Storage => node.disk.utilization() >= sim.config.storage_threshold,
        ScalingSignal::Bandwidth => {
            node.os.nic_utilization() >= sim.config.bandwidth_threshold
        }
        ScalingSignal::OsFailures => node.os.process_failures() >= sim.config.os_failure_threshold,
        ScalingSignal::Ram => node.os.ram_utilization() >= sim.config.os_memory_utilization_threshold,
    }
}

fn spawn_demand_replica(sim: &mut Simulator, cluster_id: ClusterId, primary: NodeId) {
    let candidate = match sim.spare_node_for_cluster(cluster_id) {
        Some(n) => n,
        None => return,
    };
    let bandwidth_bps = sim.nodes[&primary].nic_bandwidth_bps;
    let _ = add_replica(sim, cluster_id, candidate, bandwidth_bps, 1.0);
    sim.log_event(
        "demand_replica_spawned",
        "cluster_manager".to_string(),
        Some(primary),
        vec![candidate.to_string()],
    );
}
