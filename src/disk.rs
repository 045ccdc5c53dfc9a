//! Virtual disk: reservation-first block storage with asynchronous commits.
//!
//! Grounded in the teacher's `relay::storage::RelayStorage` (capacity
//! accounting, stored-chunk bookkeeping) generalized to the reservation ->
//! commit lifecycle from spec.md §4.2, and in the event-driven disk
//! scheduler shape from `dslab-storage`'s `scheduler.rs` (submit now,
//! complete later via a scheduled event rather than an awaited future).

use crate::event::priority;
use crate::ids::{ChunkId, FileId, NodeId, ReservationId};
use crate::sim::Simulator;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiskError {
    #[error("no_space: disk capacity exceeded")]
    NoSpace,
    #[error("disk_offline")]
    DiskOffline,
    #[error("unknown reservation")]
    UnknownReservation,
    #[error("unknown chunk {file_id}/{chunk_id}")]
    UnknownChunk { file_id: FileId, chunk_id: ChunkId },
    #[error("checksum_mismatch")]
    ChecksumMismatch,
}

pub type DiskResult<T> = Result<T, DiskError>;

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    pub offset: u64,
    pub length: u64,
    pub checksum: [u8; 32],
    pub corrupt: bool,
    pub committed_at: f64,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    bytes: u64,
}

/// Block-level store backing one [`crate::node::StorageNode`].
#[derive(Debug)]
pub struct VirtualDisk {
    pub capacity: u64,
    committed_bytes: u64,
    reserved_bytes: u64,
    blocks: HashMap<FileId, HashMap<ChunkId, ChunkRecord>>,
    reservations: HashMap<ReservationId, Reservation>,
    next_reservation: u64,
    online: bool,
}

impl VirtualDisk {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            committed_bytes: 0,
            reserved_bytes: 0,
            blocks: HashMap::new(),
            reservations: HashMap::new(),
            next_reservation: 0,
            online: true,
        }
    }

    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.committed_bytes + self.reserved_bytes) as f64 / self.capacity as f64
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &FileId> {
        self.blocks.keys()
    }

    pub fn chunk(&self, file_id: &str, chunk_id: ChunkId) -> Option<&ChunkRecord> {
        self.blocks.get(file_id).and_then(|m| m.get(&chunk_id))
    }

    pub fn has_file(&self, file_id: &str) -> bool {
        self.blocks.contains_key(file_id)
    }

    pub fn chunk_count(&self, file_id: &str) -> usize {
        self.blocks.get(file_id).map(|m| m.len()).unwrap_or(0)
    }

    /// Reserves `bytes` capacity for `file_id`. Invariant: committed +
    /// reserved <= capacity.
    pub fn reserve(&mut self, bytes: u64) -> DiskResult<ReservationId> {
        if !self.online {
            return Err(DiskError::DiskOffline);
        }
        if self.committed_bytes + self.reserved_bytes + bytes > self.capacity {
            return Err(DiskError::NoSpace);
        }
        let id = ReservationId(self.next_reservation);
        self.next_reservation += 1;
        self.reserved_bytes += bytes;
        self.reservations.insert(id, Reservation { bytes });
        Ok(id)
    }

    /// Releases a reservation's bytes back to free space.
    pub fn release_reservation(&mut self, reservation: ReservationId) -> DiskResult<()> {
        let r = self
            .reservations
            .remove(&reservation)
            .ok_or(DiskError::UnknownReservation)?;
        self.reserved_bytes = self.reserved_bytes.saturating_sub(r.bytes);
        Ok(())
    }

    /// Converts `bytes` of a reservation into committed storage and stores
    /// the chunk record. Called once a scheduled commit event fires.
    fn commit(
        &mut self,
        reservation: ReservationId,
        record: ChunkRecord,
        bytes: u64,
    ) -> DiskResult<()> {
        let r = self
            .reservations
            .get_mut(&reservation)
            .ok_or(DiskError::UnknownReservation)?;
        r.bytes = r.bytes.saturating_sub(bytes);
        let exhausted = r.bytes == 0;
        self.reserved_bytes = self.reserved_bytes.saturating_sub(bytes);
        self.committed_bytes += bytes;
        if exhausted {
            self.reservations.remove(&reservation);
        }
        self.blocks
            .entry(record.file_id.clone())
            .or_default()
            .insert(record.chunk_id, record);
        Ok(())
    }

    /// Re-inserts an already-committed chunk record directly, bypassing
    /// the reservation lifecycle. Used only by snapshot restore.
    pub fn restore_chunk(&mut self, record: ChunkRecord) {
        self.committed_bytes += record.length;
        self.blocks
            .entry(record.file_id.clone())
            .or_default()
            .insert(record.chunk_id, record);
    }

    pub fn inject_corruption(&mut self, file_id: &str, chunk_id: ChunkId) -> DiskResult<()> {
        let record = self
            .blocks
            .get_mut(file_id)
            .and_then(|m| m.get_mut(&chunk_id))
            .ok_or_else(|| DiskError::UnknownChunk {
                file_id: file_id.to_string(),
                chunk_id,
            })?;
        record.corrupt = true;
        Ok(())
    }

    pub fn recover_chunk(
        &mut self,
        file_id: &str,
        chunk_id: ChunkId,
        trusted_checksum: [u8; 32],
    ) -> DiskResult<()> {
        let record = self
            .blocks
            .get_mut(file_id)
            .and_then(|m| m.get_mut(&chunk_id))
            .ok_or_else(|| DiskError::UnknownChunk {
                file_id: file_id.to_string(),
                chunk_id,
            })?;
        record.corrupt = false;
        record.checksum = trusted_checksum;
        Ok(())
    }
}

fn seek_and_transfer_secs(sim: &Simulator, bytes: u64) -> f64 {
    let cfg = &sim.config;
    let throughput_bytes_per_sec = (cfg.disk_throughput_bps / 8).max(1);
    cfg.disk_seek_latency_secs + bytes as f64 / throughput_bytes_per_sec as f64
}

/// Schedules a chunk write commit. Fails synchronously with `disk_offline`
/// or `no_space`-adjacent reservation errors; the commit itself (and the
/// resulting `on_commit` callback) happens later via the scheduler.
#[allow(clippy::too_many_arguments)]
pub fn write_chunk(
    sim: &mut Simulator,
    node: NodeId,
    reservation: ReservationId,
    file_id: FileId,
    chunk_id: ChunkId,
    offset: u64,
    bytes: u64,
    checksum: [u8; 32],
    on_commit: impl FnOnce(&mut Simulator, DiskResult<()>) + 'static,
) -> DiskResult<()> {
    {
        let disk = &sim.nodes[&node].disk;
        if !disk.is_online() {
            return Err(DiskError::DiskOffline);
        }
        if !disk.reservations.contains_key(&reservation) {
            return Err(DiskError::UnknownReservation);
        }
    }
    let delay = seek_and_transfer_secs(sim, bytes);
    sim.scheduler
        .schedule_in(delay, priority::DISK_COMMIT, move |sim| {
            let now = sim.scheduler.now();
            let record = ChunkRecord {
                file_id,
                chunk_id,
                offset,
                length: bytes,
                checksum,
                corrupt: false,
                committed_at: now,
            };
            let disk = &mut sim.nodes.get_mut(&node).unwrap().disk;
            let result = disk.commit(reservation, record, bytes);
            on_commit(sim, result);
        })
        .expect("disk commit scheduled in the future");
    Ok(())
}

/// Schedules a chunk read. Fails synchronously on `disk_offline` or an
/// unknown chunk; `checksum_mismatch` surfaces asynchronously through
/// `on_read` once the scheduled read completes, mirroring a corrupted
/// sector only being discovered when actually read.
pub fn read_chunk(
    sim: &mut Simulator,
    node: NodeId,
    file_id: FileId,
    chunk_id: ChunkId,
    on_read: impl FnOnce(&mut Simulator, DiskResult<([u8; 32], u64)>) + 'static,
) -> DiskResult<()> {
    let (bytes, corrupt, checksum) = {
        let disk = &sim.nodes[&node].disk;
        if !disk.is_online() {
            return Err(DiskError::DiskOffline);
        }
        let record = disk
            .chunk(&file_id, chunk_id)
            .ok_or_else(|| DiskError::UnknownChunk {
                file_id: file_id.clone(),
                chunk_id,
            })?;
        (record.length, record.corrupt, record.checksum)
    };
    let delay = seek_and_transfer_secs(sim, bytes);
    sim.scheduler
        .schedule_in(delay, priority::DISK_COMMIT, move |sim| {
            let result = if corrupt {
                Err(DiskError::ChecksumMismatch)
            } else {
                Ok((checksum, bytes))
            };
            on_read(sim, result);
        })
        .expect("disk read scheduled in the future");
    Ok(())
}
