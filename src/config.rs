//! Simulator-wide configuration.
//!
//! A plain struct with a `Default` impl, following the teacher's
//! `ConnectionConfig`/`RelayConfig` style, rather than a file-backed config
//! layer: `Simulator` is a library entry point embedded by callers, not a
//! standalone server with its own config file to load.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoutingStrategy {
    LinkState,
    DistanceVector,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoutingMetric {
    LatencyMs,
    InverseBandwidth,
}

#[derive(Debug, Clone, Copy)]
pub struct SimulatorConfig {
    pub routing_strategy: RoutingStrategy,
    pub routing_metric: RoutingMetric,
    /// Distance-vector neighbor exchange interval, in simulated seconds.
    pub dv_interval_secs: f64,

    pub chunk_min_bytes: u64,
    pub chunk_max_bytes: u64,

    pub disk_seek_latency_secs: f64,
    pub disk_throughput_bps: u64,

    pub nic_concurrency: usize,
    pub disk_concurrency: usize,

    pub default_cluster_size: usize,
    pub max_replicas_per_cluster: usize,
    pub storage_threshold: f64,
    pub bandwidth_threshold: f64,
    pub os_failure_threshold: u64,
    pub os_memory_utilization_threshold: f64,
    /// Consecutive policy checks a threshold must stay exceeded before a
    /// replica is spawned ("sustained" per the spec's demand-scaling rule).
    pub scaling_sustain_checks: u32,
    pub scaling_policy_interval_secs: f64,

    pub event_log_capacity: usize,

    /// Seed for the simulator's single seeded RNG (corruption sampling,
    /// scaling jitter tie-breaks). Never used for event ordering.
    pub rng_seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            routing_strategy: RoutingStrategy::LinkState,
            routing_metric: RoutingMetric::LatencyMs,
            dv_interval_secs: 5.0,

            chunk_min_bytes: 64 * 1024,
            chunk_max_bytes: 64 * 1024 * 1024,

            disk_seek_latency_secs: 0.002,
            disk_throughput_bps: 500_000_000 * 8,

            nic_concurrency: 4,
            disk_concurrency: 1,

            default_cluster_size: 3,
            max_replicas_per_cluster: 8,
            storage_threshold: 0.85,
            bandwidth_threshold: 0.80,
            os_failure_threshold: 3,
            os_memory_utilization_threshold: 0.90,
            scaling_sustain_checks: 2,
            scaling_policy_interval_secs: 1.0,

            event_log_capacity: 4096,

            rng_seed: 0x636c6f75_64736d31,
        }
    }
}
