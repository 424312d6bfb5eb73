use std::cmp::Ordering;
use std::collections::BinaryHeap;

use browserflow_core_types::TaskId;

use crate::error::SchedulerError;
use crate::model::TaskPriority;

#[derive(Clone, Debug)]
pub struct QueuedTask {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // max-heap: higher priority first, then the earlier submission
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue of pending task ids.
#[derive(Debug)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    capacity: usize,
    seq: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity: capacity.max(1),
            seq: 0,
        }
    }

    pub fn push(&mut self, id: TaskId, priority: TaskPriority) -> Result<u64, SchedulerError> {
        if self.heap.len() >= self.capacity {
            return Err(SchedulerError::QueueFull {
                capacity: self.capacity,
            });
        }
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(QueuedTask { id, priority, seq });
        Ok(seq)
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    /// Drops `id` from the queue; returns whether it was queued.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|queued| &queued.id != id);
        self.heap.len() != before
    }

    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.heap.drain().collect()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.heap.iter().any(|queued| &queued.id == id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn len_by_priority(&self) -> [usize; 4] {
        let mut lengths = [0usize; 4];
        for queued in self.heap.iter() {
            lengths[queued.priority as usize] += 1;
        }
        lengths
    }
}
