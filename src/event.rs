//! Deterministic event scheduler.
//!
//! A single-threaded min-heap dispatcher ordered by `(time, priority,
//! sequence)`, generalized from the teacher's three-lane `BinaryHeap`
//! priority queue (`priority::queue::PriorityQueue`) into the spec's total
//! order over simulated time. Callbacks are plain closures over `&mut
//! Simulator` rather than a typed event enum: this keeps each subsystem's
//! scheduling code next to the state it mutates instead of routed through a
//! central dispatch match, and avoids a second "event payload" type per
//! subsystem.

use crate::ids::EventHandle;
use crate::sim::Simulator;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use thiserror::Error;

pub type SimTime = f64;
pub type Priority = i32;

/// Well-known priority lanes. Lower value runs first at equal time.
pub mod priority {
    use super::Priority;

    pub const LINK_FAILURE: Priority = 0;
    pub const ROUTING_RECOMPUTE: Priority = 10;
    pub const FLOW_COMPLETION: Priority = 20;
    pub const DEVICE_INTERRUPT: Priority = 30;
    pub const DISK_COMMIT: Priority = 40;
    pub const CLUSTER_POLICY: Priority = 50;
    pub const MAINTENANCE: Priority = 60;
}

pub type Callback = Box<dyn FnOnce(&mut Simulator) + 'static>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cannot schedule an event in the past: now={now}, requested={requested}", now = f64::from_bits(*now_bits), requested = f64::from_bits(*requested_bits))]
    TimeTravel { now_bits: u64, requested_bits: u64 },
}

impl SchedulerError {
    pub fn time_travel(now: SimTime, requested: SimTime) -> Self {
        SchedulerError::TimeTravel {
            now_bits: now.to_bits(),
            requested_bits: requested.to_bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderKey {
    time: SimTime,
    priority: Priority,
    sequence: u64,
    handle: EventHandle,
}

impl Eq for OrderKey {}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.priority.cmp(&other.priority))
            .then(self.sequence.cmp(&other.sequence))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub processed: u64,
    pub cancelled: u64,
}

/// Outcome of a `run()` call.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub events_processed: u64,
    pub now: SimTime,
}

pub struct Scheduler {
    now: SimTime,
    next_sequence: u64,
    next_handle: u64,
    heap: BinaryHeap<Reverse<OrderKey>>,
    callbacks: HashMap<EventHandle, Callback>,
    cancelled: HashSet<EventHandle>,
    stats: SchedulerStats,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            now: 0.0,
            next_sequence: 0,
            next_handle: 0,
            heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            cancelled: HashSet::new(),
            stats: SchedulerStats::default(),
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Fast-forwards the clock with no pending events, for restoring a
    /// snapshot's `now` into a fresh scheduler.
    pub fn set_now(&mut self, now: SimTime) {
        debug_assert!(self.heap.is_empty(), "set_now on a scheduler with pending events");
        self.now = now;
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn pending(&self) -> usize {
        self.callbacks.len()
    }

    /// Schedules `callback` to run at `time`. Fails if `time < now`.
    pub fn schedule_at(
        &mut self,
        time: SimTime,
        priority: Priority,
        callback: impl FnOnce(&mut Simulator) + 'static,
    ) -> Result<EventHandle, SchedulerError> {
        if time < self.now {
            return Err(SchedulerError::time_travel(self.now, time));
        }
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.heap.push(Reverse(OrderKey {
            time,
            priority,
            sequence,
            handle,
        }));
        self.callbacks.insert(handle, Box::new(callback));
        self.stats.scheduled += 1;
        Ok(handle)
    }

    pub fn schedule_in(
        &mut self,
        delta: SimTime,
        priority: Priority,
        callback: impl FnOnce(&mut Simulator) + 'static,
    ) -> Result<EventHandle, SchedulerError> {
        self.schedule_at(self.now + delta, priority, callback)
    }

    /// Tombstones a pending event. Returns `true` if it was still pending.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        if self.callbacks.remove(&handle).is_some() {
            self.cancelled.insert(handle);
            self.stats.cancelled += 1;
            true
        } else {
            false
        }
    }

    /// Pops and returns the next live callback, advancing `now` to its
    /// scheduled time. Tombstoned entries are skipped lazily.
    fn pop_next(&mut self) -> Option<(EventHandle, Callback)> {
        while let Some(Reverse(key)) = self.heap.pop() {
            if self.cancelled.remove(&key.handle) {
                continue;
            }
            if let Some(cb) = self.callbacks.remove(&key.handle) {
                self.now = key.time;
                return Some((key.handle, cb));
            }
        }
        None
    }

    fn peek_time(&mut self) -> Option<SimTime> {
        loop {
            match self.heap.peek() {
                None => return None,
                Some(Reverse(key)) => {
                    let handle = key.handle;
                    let time = key.time;
                    if self.cancelled.contains(&handle) {
                        self.heap.pop();
                        self.cancelled.remove(&handle);
                        continue;
                    }
                    return Some(time);
                }
            }
        }
    }

    /// Runs until the queue is empty, `until` is exceeded, or `max_events`
    /// callbacks have fired, whichever comes first.
    pub fn run(
        sim: &mut Simulator,
        until: Option<SimTime>,
        max_events: Option<u64>,
    ) -> RunSummary {
        let mut processed = 0u64;
        loop {
            if let Some(cap) = max_events {
                if processed >= cap {
                    break;
                }
            }
            let next_time = match sim.scheduler.peek_time() {
                Some(t) => t,
                None => break,
            };
            if let Some(limit) = until {
                if next_time > limit {
                    break;
                }
            }
            let Some((_, callback)) = sim.scheduler.pop_next() else {
                break;
            };
            callback(sim);
            sim.scheduler.stats.processed += 1;
            processed += 1;
        }
        RunSummary {
            events_processed: processed,
            now: sim.scheduler.now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_key_breaks_ties_by_priority_then_sequence() {
        let a = OrderKey {
            time: 1.0,
            priority: 5,
            sequence: 2,
            handle: EventHandle(0),
        };
        let b = OrderKey {
            time: 1.0,
            priority: 1,
            sequence: 99,
            handle: EventHandle(1),
        };
        assert!(b < a);

        let c = OrderKey {
            time: 1.0,
            priority: 1,
            sequence: 0,
            handle: EventHandle(2),
        };
        assert!(c < b);
    }

    #[test]
    fn cannot_schedule_in_the_past() {
        let mut s = Scheduler::new();
        s.now = 5.0;
        let err = s.schedule_at(4.0, 0, |_| {}).unwrap_err();
        assert_eq!(err, SchedulerError::time_travel(5.0, 4.0));
    }
}
