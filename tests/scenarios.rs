//! End-to-end scenario tests, one per named scenario from spec.md §8
//! (S1-S6), plus a handful of the invariant/round-trip/boundary properties
//! listed alongside them. Structured the way the teacher's
//! `integration_test.rs` names one `#[test]` per scenario with a short
//! narrated trace, minus the async/network plumbing the simulator has no
//! use for.

use cloudsim::config::{RoutingStrategy, SimulatorConfig};
use cloudsim::controller::ControllerAPI;

const GBPS: u64 = 1_000_000_000;

fn small_node(ctl: &mut ControllerAPI, name: &str, zone: &str, storage: u64) -> cloudsim::ids::NodeId {
    ctl.add_node(name.to_string(), zone.to_string(), storage, GBPS, 4, 4_000_000_000)
        .unwrap()
        .id
}

#[test]
fn s1_single_hop_transfer_timing() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
    let b = small_node(&mut ctl, "B", "z1", 2_000_000_000);
    ctl.connect(&[a, b], GBPS, 10.0).unwrap();

    ctl.initiate_file_transfer(a, b, "file1".to_string(), 1_000_000_000, Some(8 * 1024 * 1024))
        .unwrap();
    let result = ctl.run_to_idle();

    assert!(
        (result.now - 8.01).abs() / 8.01 < 0.05,
        "expected ~8.01s, got {}",
        result.now
    );
    let inspection = ctl.inspect(b).unwrap();
    assert!((inspection.disk_utilization - 0.5).abs() < 0.01, "destination should hold 1GB of 2GB capacity");
    assert_eq!(ctl.simulator().nodes[&b].os.process_failures(), 0);
}

#[test]
fn s2_fair_sharing() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
    let b = small_node(&mut ctl, "B", "z1", 2_000_000_000);
    ctl.connect(&[a, b], GBPS, 1.0).unwrap();

    ctl.initiate_file_transfer(a, b, "f1".to_string(), 500_000_000, Some(4 * 1024 * 1024)).unwrap();
    ctl.initiate_file_transfer(a, b, "f2".to_string(), 500_000_000, Some(4 * 1024 * 1024)).unwrap();
    let shared = ctl.run_to_idle();

    let mut solo = ControllerAPI::new(SimulatorConfig::default());
    let sa = small_node(&mut solo, "A", "z1", 2_000_000_000);
    let sb = small_node(&mut solo, "B", "z1", 2_000_000_000);
    solo.connect(&[sa, sb], GBPS, 1.0).unwrap();
    solo.initiate_file_transfer(sa, sb, "f1".to_string(), 500_000_000, Some(4 * 1024 * 1024)).unwrap();
    let solo_result = solo.run_to_idle();

    assert!(
        shared.now >= 1.8 * solo_result.now,
        "two competing transfers should each take noticeably longer than a solo transfer: shared={} solo={}",
        shared.now,
        solo_result.now
    );
}

#[test]
fn s3_multi_hop_with_failover() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
    let b = small_node(&mut ctl, "B", "z1", 2_000_000_000);
    let c = small_node(&mut ctl, "C", "z1", 2_000_000_000);
    let d = small_node(&mut ctl, "D", "z1", 2_000_000_000);
    let e = small_node(&mut ctl, "E", "z1", 2_000_000_000);
    ctl.connect(&[a, b], GBPS, 10.0).unwrap();
    ctl.connect(&[b, c], GBPS, 10.0).unwrap();
    ctl.connect(&[c, d], GBPS, 10.0).unwrap();
    ctl.connect(&[a, e], GBPS, 10.0).unwrap();
    ctl.connect(&[e, c], GBPS, 10.0).unwrap();

    ctl.initiate_file_transfer(a, d, "big".to_string(), 100_000_000, Some(1024 * 1024)).unwrap();
    ctl.step(0.5);
    ctl.fail_link(b, c).unwrap();
    let result = ctl.run_to_idle();
    assert!(result.events_processed > 0);

    let events = ctl.events(4096);
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    let failed_at = kinds.iter().position(|k| *k == "link_failed").expect("link_failed logged");
    let recomputed_at = kinds.iter().position(|k| *k == "route_recomputed").expect("route_recomputed logged");
    let completed_at = kinds.iter().rposition(|k| *k == "transfer_completed").expect("transfer_completed logged");
    assert!(failed_at < recomputed_at, "link_failed must precede route_recomputed");
    assert!(recomputed_at < completed_at, "route_recomputed must precede transfer_completed");
}

#[test]
fn s4_replica_fan_out() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let a1 = small_node(&mut ctl, "A1", "z1", 2_000_000_000);
    let a2 = small_node(&mut ctl, "A2", "z1", 2_000_000_000);
    let a3 = small_node(&mut ctl, "A3", "z1", 2_000_000_000);
    ctl.connect(&[a2, a3], GBPS, 5.0).unwrap();
    ctl.form_cluster(a1, &[a2, a3], GBPS, 5.0);

    ctl.push(a1, "replicated.bin".to_string(), 10_000_000, false).unwrap();
    ctl.run_to_idle();

    let a2_inspection = ctl.inspect(a2).unwrap();
    let a3_inspection = ctl.inspect(a3).unwrap();
    assert!(a2_inspection.stored_files.contains(&"replicated.bin".to_string()));
    assert!(a3_inspection.stored_files.contains(&"replicated.bin".to_string()));

    let completed = ctl
        .events(4096)
        .iter()
        .filter(|e| e.kind == "transfer_completed")
        .count();
    assert_eq!(completed, 3, "one primary write + two replica fan-outs");
}

#[test]
fn s5_disk_pressure_triggers_replica_spawn() {
    let config = SimulatorConfig {
        default_cluster_size: 1,
        scaling_sustain_checks: 1,
        ..SimulatorConfig::default()
    };
    let mut ctl = ControllerAPI::new(config);
    let n = small_node(&mut ctl, "N", "z1", 100_000_000);
    let spare = small_node(&mut ctl, "spare", "z1", 100_000_000);
    ctl.connect(&[n, spare], GBPS, 5.0).unwrap();

    ctl.form_cluster(n, &[], GBPS, 5.0);
    ctl.start_scaling_policy();

    ctl.push(n, "pressure.bin".to_string(), 90_000_000, true).unwrap();
    ctl.step(1.0);
    ctl.step(10.0);

    let cluster = ctl
        .simulator()
        .clusters
        .clusters()
        .find(|c| c.primary == n)
        .expect("cluster exists");
    assert_eq!(cluster.replicas.len(), 1, "one demand replica should have spawned");
    assert!(cluster.replicas.contains(&spare));
}

#[test]
fn s6_os_backpressure() {
    let config = SimulatorConfig {
        nic_concurrency: 2,
        ..SimulatorConfig::default()
    };
    let mut ctl = ControllerAPI::new(config);
    let s = small_node(&mut ctl, "S", "z1", 100_000_000);
    let t = small_node(&mut ctl, "T", "z1", 100_000_000);
    ctl.connect(&[s, t], GBPS, 5.0).unwrap();

    for i in 0..4 {
        ctl.initiate_file_transfer(s, t, format!("chunk{i}"), 1_000_000, Some(1_000_000)).unwrap();
    }
    let result = ctl.run_to_idle();
    assert!(result.events_processed > 0);

    let completed = ctl.events(4096).iter().filter(|e| e.kind == "transfer_completed").count();
    assert_eq!(completed, 4, "all four transfers should eventually complete");
}

#[test]
fn deterministic_event_log_for_equal_seed_and_inputs() {
    fn run() -> Vec<String> {
        let mut ctl = ControllerAPI::new(SimulatorConfig::default());
        let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
        let b = small_node(&mut ctl, "B", "z1", 2_000_000_000);
        ctl.connect(&[a, b], GBPS, 10.0).unwrap();
        ctl.initiate_file_transfer(a, b, "f".to_string(), 20_000_000, Some(1_000_000)).unwrap();
        ctl.run_to_idle();
        ctl.events(4096).iter().map(|e| format!("{}:{}:{}", e.seq, e.kind, e.time)).collect()
    }
    assert_eq!(run(), run(), "equal seed and inputs must produce bit-identical event logs");
}

#[test]
fn snapshot_restore_round_trip_preserves_state() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
    let b = small_node(&mut ctl, "B", "z1", 2_000_000_000);
    ctl.connect(&[a, b], GBPS, 10.0).unwrap();
    ctl.initiate_file_transfer(a, b, "f".to_string(), 5_000_000, Some(1_000_000)).unwrap();
    ctl.run_to_idle();

    let blob = ctl.snapshot().unwrap();
    ctl.restore(&blob).unwrap();
    let second_blob = ctl.snapshot().unwrap();

    let first: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    let second: serde_json::Value = serde_json::from_slice(&second_blob).unwrap();
    assert_eq!(first["nodes"], second["nodes"]);
    assert_eq!(first["links"], second["links"]);
    assert_eq!(first["clusters"], second["clusters"]);
}

#[test]
fn add_then_remove_node_is_transparent() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let before = ctl.events(4096).len();
    let x = small_node(&mut ctl, "X", "z1", 1_000_000_000);
    ctl.remove_node(x).unwrap();
    assert!(!ctl.simulator().nodes.contains_key(&x));
    let _ = before;
}

#[test]
fn failing_link_with_no_alternate_route_yields_route_lost() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
    let b = small_node(&mut ctl, "B", "z1", 2_000_000_000);
    ctl.connect(&[a, b], GBPS, 10.0).unwrap();

    ctl.initiate_file_transfer(a, b, "f".to_string(), 100_000_000, Some(1_000_000)).unwrap();
    ctl.step(0.01);
    ctl.fail_link(a, b).unwrap();
    ctl.run_to_idle();

    let failed = ctl.events(4096).iter().any(|e| e.kind == "transfer_failed");
    assert!(failed, "transfer with no alternate route must fail after the link goes down");
}

#[test]
fn distance_vector_routing_converges_and_carries_multi_hop_transfers() {
    let config = SimulatorConfig {
        routing_strategy: RoutingStrategy::DistanceVector,
        ..SimulatorConfig::default()
    };
    let mut ctl = ControllerAPI::new(config);
    let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
    let b = small_node(&mut ctl, "B", "z1", 2_000_000_000);
    let c = small_node(&mut ctl, "C", "z1", 2_000_000_000);
    ctl.connect(&[a, b], GBPS, 10.0).unwrap();
    ctl.connect(&[b, c], GBPS, 10.0).unwrap();

    // Distance-vector routes propagate one hop per exchange round (the
    // first round only seeds self-cost, so a 2-hop route needs three
    // rounds to converge); run enough rounds for A to learn a route to C
    // via B before a transfer is attempted.
    ctl.step(21.0);

    ctl.initiate_file_transfer(a, c, "f".to_string(), 10_000_000, Some(1_000_000)).unwrap();
    // DistanceVector's recurring neighbor exchange means the scheduler
    // never idles on its own (unlike LinkState, a fixed bounded step is
    // needed rather than run_to_idle).
    ctl.step(5.0);

    let completed = ctl.events(4096).iter().any(|e| e.kind == "transfer_completed");
    assert!(completed, "distance-vector routing should carry a multi-hop transfer once converged");
    assert!(ctl.inspect(c).unwrap().stored_files.contains(&"f".to_string()));
}

#[test]
fn abort_cancels_in_flight_transfer_and_releases_its_reservation() {
    let mut ctl = ControllerAPI::new(SimulatorConfig::default());
    let a = small_node(&mut ctl, "A", "z1", 2_000_000_000);
    let b = small_node(&mut ctl, "B", "z1", 1_200_000_000);
    ctl.connect(&[a, b], GBPS, 10.0).unwrap();

    let id = ctl.initiate_file_transfer(a, b, "f".to_string(), 1_000_000_000, Some(1_000_000)).unwrap();
    ctl.step(0.01);
    ctl.abort(id).unwrap();
    ctl.run_to_idle();

    let completed = ctl.events(4096).iter().any(|e| e.kind == "transfer_completed");
    assert!(!completed, "an aborted transfer must never complete");
    assert!(!ctl.inspect(b).unwrap().stored_files.contains(&"f".to_string()));

    // The destination's reservation for the aborted file must have been
    // released: a second, equally large transfer now fits.
    ctl.initiate_file_transfer(a, b, "g".to_string(), 1_000_000_000, Some(1_000_000)).unwrap();
    let result = ctl.run_to_idle();
    assert!(result.events_processed > 0);
    assert!(ctl.inspect(b).unwrap().stored_files.contains(&"g".to_string()));

    // Aborting an already-terminal transfer is a harmless no-op.
    assert!(ctl.abort(id).is_ok());
}
