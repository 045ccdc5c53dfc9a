//! Per-node virtual kernel: CPU/RAM accounting, device backpressure and the
//! four-syscall surface `StorageNode` drives transfers through.
//!
//! Grounded in the teacher's priority-lane dispatch
//! (`priority::queue::PriorityQueue::dequeue`) generalized from a 3-lane
//! FIFO into a bounded-concurrency ready queue per device, and in
//! `relay::node::RelayNode`'s peer/forwarding concurrency bookkeeping for
//! the device-slot abstraction.

use crate::disk::{self, DiskError};
use crate::event::priority;
use crate::ids::NodeId;
use crate::sim::Simulator;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OsError {
    #[error("oom: insufficient RAM to admit process")]
    Oom,
    #[error("node_offline")]
    NodeOffline,
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),
}

pub type OsResult<T> = Result<T, OsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Ingest,
    Egress,
    DiskRead,
    DiskWrite,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Process {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub cpu_ticks_remaining: u32,
    pub ram_reserved: u64,
    pub state: ProcessState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Disk,
    Nic,
    Maintenance,
}

#[derive(Debug)]
struct Device {
    concurrency: usize,
    in_use: usize,
    waiters: VecDeque<ProcessId>,
}

impl Device {
    fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            in_use: 0,
            waiters: VecDeque::new(),
        }
    }

    fn try_acquire(&mut self, pid: ProcessId) -> bool {
        if self.in_use < self.concurrency {
            self.in_use += 1;
            true
        } else {
            self.waiters.push_back(pid);
            false
        }
    }

    fn release(&mut self) -> Option<ProcessId> {
        self.in_use = self.in_use.saturating_sub(1);
        if let Some(next) = self.waiters.pop_front() {
            self.in_use += 1;
            Some(next)
        } else {
            None
        }
    }

    fn utilization(&self) -> f64 {
        self.in_use as f64 / self.concurrency as f64
    }
}

pub(crate) type OsCallback = Box<dyn FnOnce(&mut Simulator, OsResult<()>) + 'static>;
type ReadCallback = Box<dyn FnOnce(&mut Simulator, OsResult<([u8; 32], u64)>) + 'static>;
type DeviceOp = Box<dyn FnOnce(&mut Simulator, NodeId, ProcessId) + 'static>;

/// Per-node kernel. Owned by [`crate::node::StorageNode`].
pub struct VirtualOS {
    pub cpu_cores: usize,
    pub ram_bytes: u64,
    ram_used: u64,
    disk_device: Device,
    nic_device: Device,
    maintenance_device: Device,
    processes: HashMap<ProcessId, Process>,
    callbacks: HashMap<ProcessId, OsCallback>,
    read_callbacks: HashMap<ProcessId, ReadCallback>,
    device_ops: HashMap<ProcessId, DeviceOp>,
    next_process: u64,
    process_failures: u64,
    online: bool,
    /// Simulated seconds a single CPU tick occupies, a deliberate
    /// simplification of literal per-tick round robin (see DESIGN.md):
    /// since ticks are event-to-event steps rather than a fixed wall
    /// duration, round robin collapses to FCFS under bounded concurrency,
    /// which still preserves the RAM/core admission invariants.
    cpu_tick_secs: f64,
}

impl VirtualOS {
    pub fn new(cpu_cores: usize, ram_bytes: u64, disk_concurrency: usize, nic_concurrency: usize) -> Self {
        Self {
            cpu_cores: cpu_cores.max(1),
            ram_bytes,
            ram_used: 0,
            disk_device: Device::new(disk_concurrency),
            nic_device: Device::new(nic_concurrency),
            maintenance_device: Device::new(1),
            processes: HashMap::new(),
            callbacks: HashMap::new(),
            read_callbacks: HashMap::new(),
            device_ops: HashMap::new(),
            next_process: 0,
            process_failures: 0,
            online: true,
            cpu_tick_secs: 0.001,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn ram_used(&self) -> u64 {
        self.ram_used
    }

    pub fn ram_utilization(&self) -> f64 {
        if self.ram_bytes == 0 {
            0.0
        } else {
            self.ram_used as f64 / self.ram_bytes as f64
        }
    }

    pub fn nic_utilization(&self) -> f64 {
        self.nic_device.utilization()
    }

    pub fn process_failures(&self) -> u64 {
        self.process_failures
    }

    pub fn active_process_count(&self) -> usize {
        self.processes
            .values()
            .filter(|p| matches!(p.state, ProcessState::Ready | ProcessState::Running | ProcessState::Blocked))
            .count()
    }

    fn device_mut(&mut self, kind: DeviceKind) -> &mut Device {
        match kind {
            DeviceKind::Disk => &mut self.disk_device,
            DeviceKind::Nic => &mut self.nic_device,
            DeviceKind::Maintenance => &mut self.maintenance_device,
        }
    }

    fn spawn(&mut self, kind: ProcessKind, cpu_ticks: u32, ram: u64) -> OsResult<ProcessId> {
        if !self.online {
            return Err(OsError::NodeOffline);
        }
        if self.ram_used + ram > self.ram_bytes {
            return Err(OsError::Oom);
        }
        let id = ProcessId(self.next_process);
        self.next_process += 1;
        self.ram_used += ram;
        self.processes.insert(
            id,
            Process {
                id,
                kind,
                cpu_ticks_remaining: cpu_ticks,
                ram_reserved: ram,
                state: ProcessState::Ready,
            },
        );
        Ok(id)
    }

    fn finish(&mut self, pid: ProcessId, failed: bool) {
        if let Some(p) = self.processes.get_mut(&pid) {
            p.state = if failed {
                ProcessState::Failed
            } else {
                ProcessState::Done
            };
            self.ram_used = self.ram_used.saturating_sub(p.ram_reserved);
            if failed {
                self.process_failures += 1;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn admit(
    sim: &mut Simulator,
    node: NodeId,
    kind: ProcessKind,
    device_kind: DeviceKind,
    cpu_ticks: u32,
    ram: u64,
    callback: OsCallback,
    run_on_device: impl FnOnce(&mut Simulator, NodeId, ProcessId) + 'static,
) -> OsResult<ProcessId> {
    let os = &mut sim.nodes.get_mut(&node).unwrap().os;
    let pid = os.spawn(kind, cpu_ticks, ram)?;
    os.callbacks.insert(pid, callback);
    os.device_ops.insert(pid, Box::new(run_on_device));

    let device = os.device_mut(device_kind);
    let acquired = device.try_acquire(pid);
    if acquired {
        start_running(sim, node, pid, cpu_ticks);
    } else {
        sim.nodes.get_mut(&node).unwrap().os.processes.get_mut(&pid).unwrap().state = ProcessState::Blocked;
    }
    Ok(pid)
}

/// Runs the CPU phase, then hands off to the process's stored device op
/// (disk commit, network egress, maintenance) once it finishes.
fn start_running(sim: &mut Simulator, node: NodeId, pid: ProcessId, cpu_ticks: u32) {
    {
        let os = &mut sim.nodes.get_mut(&node).unwrap().os;
        if let Some(p) = os.processes.get_mut(&pid) {
            p.state = ProcessState::Running;
        }
    }
    let cpu_secs = {
        let os = &sim.nodes[&node].os;
        cpu_ticks as f64 * os.cpu_tick_secs
    };
    sim.scheduler
        .schedule_in(cpu_secs, priority::DEVICE_INTERRUPT, move |sim| {
            let op = sim.nodes.get_mut(&node).unwrap().os.device_ops.remove(&pid);
            if let Some(op) = op {
                op(sim, node, pid);
            }
        })
        .expect("cpu phase scheduled in the future");
}

/// Frees a device slot and, if a process was waiting for it, starts its CPU
/// phase using its own stored device op (not a generic one) so admission
/// that happens after blocking still resolves through the right syscall.
fn release_device_and_advance(sim: &mut Simulator, node: NodeId, device_kind: DeviceKind) {
    let next = {
        let os = &mut sim.nodes.get_mut(&node).unwrap().os;
        os.device_mut(device_kind).release()
    };
    if let Some(next_pid) = next {
        let cpu_ticks = sim.nodes[&node]
            .os
            .processes
            .get(&next_pid)
            .map(|p| p.cpu_ticks_remaining)
            .unwrap_or(0);
        start_running(sim, node, next_pid, cpu_ticks);
    }
}

fn finish_ok(sim: &mut Simulator, node: NodeId, pid: ProcessId) {
    let cb = sim.nodes.get_mut(&node).unwrap().os.callbacks.remove(&pid);
    sim.nodes.get_mut(&node).unwrap().os.finish(pid, false);
    if let Some(cb) = cb {
        cb(sim, Ok(()));
    }
}

fn finish_err(sim: &mut Simulator, node: NodeId, pid: ProcessId, err: OsError) {
    let cb = sim.nodes.get_mut(&node).unwrap().os.callbacks.remove(&pid);
    sim.nodes.get_mut(&node).unwrap().os.finish(pid, true);
    if let Some(cb) = cb {
        cb(sim, Err(err));
    }
}

/// `network_send` syscall: admits a process that represents handing a chunk
/// to the NIC, bounded by `nic_concurrency` parallel transmissions.
pub fn network_send(
    sim: &mut Simulator,
    node: NodeId,
    cpu_ticks: u32,
    ram: u64,
    on_complete: impl FnOnce(&mut Simulator, OsResult<()>) + 'static,
) -> OsResult<ProcessId> {
    admit(
        sim,
        node,
        ProcessKind::Egress,
        DeviceKind::Nic,
        cpu_ticks,
        ram,
        Box::new(on_complete),
        |sim, node, pid| {
            finish_ok(sim, node, pid);
            release_device_and_advance(sim, node, DeviceKind::Nic);
        },
    )
}

/// `maintenance_hook` syscall: lightweight periodic policy evaluation work
/// (used by `ClusterManager`'s demand-scaling check).
pub fn maintenance_hook(
    sim: &mut Simulator,
    node: NodeId,
    cpu_ticks: u32,
    on_complete: impl FnOnce(&mut Simulator, OsResult<()>) + 'static,
) -> OsResult<ProcessId> {
    admit(
        sim,
        node,
        ProcessKind::Maintenance,
        DeviceKind::Maintenance,
        cpu_ticks,
        0,
        Box::new(on_complete),
        |sim, node, pid| {
            finish_ok(sim, node, pid);
            release_device_and_advance(sim, node, DeviceKind::Maintenance);
        },
    )
}

/// `disk_write` syscall: admits a process, then once its CPU phase and a
/// disk device slot are both available, commits the chunk through
/// [`crate::disk::write_chunk`].
#[allow(clippy::too_many_arguments)]
pub fn disk_write(
    sim: &mut Simulator,
    node: NodeId,
    cpu_ticks: u32,
    ram: u64,
    reservation: crate::ids::ReservationId,
    file_id: crate::ids::FileId,
    chunk_id: crate::ids::ChunkId,
    offset: u64,
    bytes: u64,
    checksum: [u8; 32],
    on_complete: impl FnOnce(&mut Simulator, OsResult<()>) + 'static,
) -> OsResult<ProcessId> {
    admit(
        sim,
        node,
        ProcessKind::DiskWrite,
        DeviceKind::Disk,
        cpu_ticks,
        ram,
        Box::new(on_complete),
        move |sim, node, pid| {
            let result = disk::write_chunk(
                sim,
                node,
                reservation,
                file_id,
                chunk_id,
                offset,
                bytes,
                checksum,
                move |sim, result| match result {
                    Ok(()) => {
                        finish_ok(sim, node, pid);
                        release_device_and_advance(sim, node, DeviceKind::Disk);
                    }
                    Err(e) => {
                        finish_err(sim, node, pid, OsError::Disk(e));
                        release_device_and_advance(sim, node, DeviceKind::Disk);
                    }
                },
            );
            if let Err(e) = result {
                finish_err(sim, node, pid, OsError::Disk(e));
                release_device_and_advance(sim, node, DeviceKind::Disk);
            }
        },
    )
}

/// `disk_read` syscall: mirrors `disk_write`, surfacing
/// `checksum_mismatch` through `on_complete` when the stored chunk was
/// corrupted.
pub fn disk_read(
    sim: &mut Simulator,
    node: NodeId,
    cpu_ticks: u32,
    ram: u64,
    file_id: crate::ids::FileId,
    chunk_id: crate::ids::ChunkId,
    on_complete: impl FnOnce(&mut Simulator, OsResult<([u8; 32], u64)>) + 'static,
) -> OsResult<ProcessId> {
    let pid = admit(
        sim,
        node,
        ProcessKind::DiskRead,
        DeviceKind::Disk,
        cpu_ticks,
        ram,
        Box::new(|_sim, _result| {}),
        move |sim, node, pid| {
            let result = disk::read_chunk(sim, node, file_id, chunk_id, move |sim, result| {
                let failed = result.is_err();
                sim.nodes.get_mut(&node).unwrap().os.callbacks.remove(&pid);
                sim.nodes.get_mut(&node).unwrap().os.finish(pid, failed);
                release_device_and_advance(sim, node, DeviceKind::Disk);
                let cb = sim.nodes.get_mut(&node).unwrap().os.read_callbacks.remove(&pid);
                if let Some(cb) = cb {
                    cb(sim, result.map_err(OsError::Disk));
                }
            });
            if let Err(e) = result {
                let cb = sim.nodes.get_mut(&node).unwrap().os.read_callbacks.remove(&pid);
                finish_err(sim, node, pid, OsError::Disk(e.clone()));
                release_device_and_advance(sim, node, DeviceKind::Disk);
                if let Some(cb) = cb {
                    cb(sim, Err(OsError::Disk(e)));
                }
            }
        },
    )?;
    sim.nodes
        .get_mut(&node)
        .unwrap()
        .os
        .read_callbacks
        .insert(pid, Box::new(on_complete));
    Ok(pid)
}
