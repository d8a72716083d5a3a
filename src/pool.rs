use crate::error::{ProviderError, Result};
use crate::pipeline::WorkerId;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Fixed set of worker ids handed out first-in, first-out.
#[derive(Debug)]
pub struct WorkerPool {
    idle: VecDeque<WorkerId>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: (0..capacity).collect(),
            capacity,
        }
    }

    pub fn lease(&mut self) -> Result<WorkerId> {
        self.idle.pop_front().ok_or(ProviderError::PoolExhausted)
    }

    /// Returns a worker to the back of the queue. Unknown or already idle
    /// workers are refused.
    pub fn release(&mut self, worker: WorkerId) -> bool {
        if worker >= self.capacity || self.idle.contains(&worker) {
            warn!(worker, "Refusing to release worker that is not leased");
            return false;
        }
        self.idle.push_back(worker);
        true
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn leased_count(&self) -> usize {
        self.capacity - self.idle.len()
    }

    pub fn is_busy(&self) -> bool {
        self.leased_count() > 0
    }
}

/// Maps client task ids to the worker serving them.
#[derive(Debug, Default)]
pub struct RequestTracker {
    by_request: HashMap<u64, WorkerId>,
    by_worker: HashMap<WorkerId, u64>,
}

impl RequestTracker {
    pub fn bind(&mut self, request: u64, worker: WorkerId) -> Result<()> {
        if self.by_request.contains_key(&request) {
            return Err(ProviderError::DuplicateRequest(request));
        }
        if let Some(previous) = self.by_worker.insert(worker, request) {
            warn!(worker, previous, "Worker rebound while still tracking a request");
            self.by_request.remove(&previous);
        }
        self.by_request.insert(request, worker);
        Ok(())
    }

    pub fn contains(&self, request: u64) -> bool {
        self.by_request.contains_key(&request)
    }

    pub fn route(&self, request: u64) -> Option<WorkerId> {
        self.by_request.get(&request).copied()
    }

    pub fn request_for(&self, worker: WorkerId) -> Option<u64> {
        self.by_worker.get(&worker).copied()
    }

    pub fn unbind_worker(&mut self, worker: WorkerId) -> Option<u64> {
        let request = self.by_worker.remove(&worker)?;
        self.by_request.remove(&request);
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_request.is_empty()
    }
}
