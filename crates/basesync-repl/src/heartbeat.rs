//! Heartbeat deadlines for owned leases, kept in one min-heap.
//!
//! Rescheduling or cancelling never searches the heap: each entry carries a
//! generation and stale generations are discarded when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

/// Min-heap of heartbeat deadlines keyed by resource ID.
#[derive(Debug, Default)]
pub struct HeartbeatSchedule {
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    live: HashMap<String, u64>,
    next_generation: u64,
}

impl HeartbeatSchedule {
    /// Create an empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule (or reschedule) the heartbeat for `resource_id` at `at`.
    pub fn schedule(&mut self, resource_id: &str, at: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(resource_id.to_string(), generation);
        self.heap
            .push(Reverse((at, generation, resource_id.to_string())));
    }

    /// Cancel the heartbeat for `resource_id`. Safe to repeat; returns true
    /// if one was scheduled.
    pub fn cancel(&mut self, resource_id: &str) -> bool {
        self.live.remove(resource_id).is_some()
    }

    /// Whether a heartbeat is scheduled for `resource_id`.
    pub fn contains(&self, resource_id: &str) -> bool {
        self.live.contains_key(resource_id)
    }

    /// Number of scheduled heartbeats.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_current(&self, generation: u64, resource_id: &str) -> bool {
        self.live.get(resource_id) == Some(&generation)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, generation, resource_id))) = self.heap.peek() {
            if self.is_current(*generation, resource_id) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every resource whose deadline is at or before `now`.
    /// Returned resources are no longer scheduled.
    pub fn pop_due(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, generation, resource_id))) = self.heap.pop() else {
                break;
            };
            if self.is_current(generation, &resource_id) {
                self.live.remove(&resource_id);
                due.push(resource_id);
            }
        }
        due
    }
}
