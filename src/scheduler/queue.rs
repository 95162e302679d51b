use std::collections::VecDeque;

use uuid::Uuid;

use crate::scheduler::job::ResourceClass;

/// A queued job id together with the class it waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub class: ResourceClass,
}

/// FIFO of jobs waiting for a resource, in arrival order.
#[derive(Debug, Default)]
pub struct WorkQueue {
    entries: VecDeque<QueueEntry>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail. Returns false if the id is already queued.
    pub fn enqueue(&mut self, job_id: Uuid, class: ResourceClass) -> bool {
        if self.contains(&job_id) {
            return false;
        }
        self.entries.push_back(QueueEntry { job_id, class });
        true
    }

    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Put an entry back at the head without disturbing the order behind it.
    pub fn push_front(&mut self, entry: QueueEntry) {
        self.entries.push_front(entry);
    }

    pub fn remove(&mut self, index: usize) -> Option<QueueEntry> {
        self.entries.remove(index)
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.entries.iter().any(|e| &e.job_id == job_id)
    }

    /// 1-indexed position of a job in arrival order.
    pub fn position(&self, job_id: &Uuid) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.job_id == job_id)
            .map(|idx| idx + 1)
    }

    /// All queued ids with their 1-indexed positions.
    pub fn positions(&self) -> impl Iterator<Item = (Uuid, usize)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.job_id, idx + 1))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
