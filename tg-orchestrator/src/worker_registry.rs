//! Book-keeping for connected workers and their free capacity.
//!
//! Workers are grouped into buckets keyed by their exact free-slot count,
//! so picking the freest workers never sorts the whole registry. The
//! running total of free slots makes cohort admission checks O(1).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use common::{TaskId, WorkerId};

use crate::core::AssignmentSink;
use crate::task_queue::TaskRef;

/// A connected worker with an open assignment channel.
#[derive(Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub max_slots: usize,
    pub available_slots: usize,
    pub sender: AssignmentSink,
    /// Tasks currently running on this worker, keyed by task id.
    pub running: BTreeMap<TaskId, TaskRef>,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerRecord>,
    /// Worker ids by free-slot count. Ids are allocated monotonically, so
    /// iterating a bucket visits workers in registration order.
    buckets: BTreeMap<usize, BTreeSet<WorkerId>>,
    total_available: usize,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: WorkerRecord) {
        self.total_available += record.available_slots;
        self.buckets
            .entry(record.available_slots)
            .or_default()
            .insert(record.id);
        self.workers.insert(record.id, record);
    }

    pub fn remove(&mut self, worker_id: WorkerId) -> Option<WorkerRecord> {
        let record = self.workers.remove(&worker_id)?;
        self.unbucket(worker_id, record.available_slots);
        self.total_available -= record.available_slots;
        Some(record)
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&worker_id)
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.workers.contains_key(&worker_id)
    }

    /// Set a worker's free-slot count, clamped to its maximum. The bucket
    /// move and the running total update happen as one step.
    pub fn set_availability(&mut self, worker_id: WorkerId, slots: usize) -> bool {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        let previous = record.available_slots;
        let clamped = slots.min(record.max_slots);
        record.available_slots = clamped;

        self.rebucket(worker_id, previous, clamped);
        self.total_available -= previous;
        self.total_available += clamped;
        true
    }

    /// Record a task as running on the worker, consuming one slot.
    /// Returns false if the worker is unknown or has no free slot.
    pub fn assign(&mut self, worker_id: WorkerId, entry: TaskRef) -> bool {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        if record.available_slots == 0 {
            return false;
        }
        let next = record.available_slots - 1;
        record.running.insert(entry.task_id, entry);
        self.set_availability(worker_id, next)
    }

    /// Release the slot held by a finished task. Returns the task entry
    /// if the worker was indeed running it.
    pub fn complete(&mut self, worker_id: WorkerId, task_id: TaskId) -> Option<TaskRef> {
        let record = self.workers.get_mut(&worker_id)?;
        let entry = record.running.remove(&task_id)?;
        let next = record.available_slots + 1;
        self.set_availability(worker_id, next);
        Some(entry)
    }

    /// Up to `limit` workers with free capacity, freest first; ties go to
    /// the longest-registered worker. Fully busy workers never appear.
    pub fn best_workers(&self, limit: usize) -> Vec<WorkerId> {
        let mut picked = Vec::with_capacity(limit.min(self.workers.len()));
        for (&level, bucket) in self.buckets.iter().rev() {
            if level == 0 || picked.len() == limit {
                break;
            }
            for &worker_id in bucket {
                if picked.len() == limit {
                    break;
                }
                picked.push(worker_id);
            }
        }
        picked
    }

    pub fn total_available(&self) -> usize {
        self.total_available
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn rebucket(&mut self, worker_id: WorkerId, previous: usize, now: usize) {
        if previous == now {
            return;
        }
        self.unbucket(worker_id, previous);
        self.buckets.entry(now).or_default().insert(worker_id);
    }

    fn unbucket(&mut self, worker_id: WorkerId, level: usize) {
        if let Some(bucket) = self.buckets.get_mut(&level) {
            bucket.remove(&worker_id);
            if bucket.is_empty() {
                self.buckets.remove(&level);
            }
        }
    }
}
