use std::collections::{HashMap, HashSet, VecDeque};

use browserflow_core_types::StepId;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::model::{LogEntry, LogLevel};

/// Counts of what fell out of the window, so summaries stay exact.
#[derive(Debug, Default)]
pub struct EvictionLedger {
    pub evicted: u64,
    pub levels: HashMap<LogLevel, u64>,
    pub steps: HashSet<StepId>,
}

impl EvictionLedger {
    fn absorb(&mut self, entry: &LogEntry) {
        self.evicted += 1;
        *self.levels.entry(entry.level).or_insert(0) += 1;
        if let Some(step_id) = &entry.step_id {
            self.steps.insert(step_id.clone());
        }
    }
}

#[derive(Debug)]
pub struct EntryWindow {
    capacity: usize,
    queue: VecDeque<LogEntry>,
    ledger: EvictionLedger,
}

impl EntryWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: VecDeque::with_capacity(capacity.min(4_096)),
            ledger: EvictionLedger::default(),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity > 0 && self.queue.len() >= self.capacity {
            if let Some(evicted) = self.queue.pop_front() {
                self.ledger.absorb(&evicted);
            }
        }
        self.queue.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.queue.iter()
    }

    pub fn ledger(&self) -> &EvictionLedger {
        &self.ledger
    }

    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let skip = self.queue.len().saturating_sub(limit);
        self.queue.iter().skip(skip).cloned().collect()
    }
}

/// Bounded per-step sub-logs
#[derive(Debug)]
pub struct StepRings {
    capacity: usize,
    rings: DashMap<StepId, Mutex<VecDeque<LogEntry>>>,
}

impl StepRings {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rings: DashMap::new(),
        }
    }

    pub fn push(&self, step_id: &StepId, entry: LogEntry) {
        let ring = self
            .rings
            .entry(step_id.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut guard = ring.lock();
        if self.capacity > 0 && guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry);
    }

    pub fn snapshot(&self, step_id: &StepId) -> Vec<LogEntry> {
        self.rings
            .get(step_id)
            .map(|ring| ring.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn steps(&self) -> Vec<StepId> {
        self.rings.iter().map(|item| item.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.rings.clear();
    }
}
