//! In-process transport for single-instance deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::LogTransport;
use crate::error::InfraError;
use crate::logging::record::Category;

/// Bounded per-category queues guarded by a mutex, with a [`Notify`] to
/// wake blocked consumers.
#[derive(Debug)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<Category, VecDeque<String>>>,
    capacity: usize,
    notify: Notify,
}

impl MemoryTransport {
    /// Creates a transport holding at most `capacity` items per category.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Number of queued items for a category.
    #[must_use]
    pub fn len(&self, category: Category) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .map_or(0, VecDeque::len)
    }

    /// Returns `true` if no category has queued items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(VecDeque::is_empty)
    }

    fn take(&self, category: Category, max_items: usize) -> Vec<String> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = queues.get_mut(&category) else {
            return Vec::new();
        };
        let n = max_items.min(queue.len());
        queue.drain(..n).collect()
    }
}

#[async_trait]
impl LogTransport for MemoryTransport {
    async fn push(&self, category: Category, payload: String) -> Result<(), InfraError> {
        {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = queues.entry(category).or_default();
            if queue.len() >= self.capacity {
                return Err(InfraError::QueueTransport(format!(
                    "{category} queue is full"
                )));
            }
            queue.push_back(payload);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_batch(
        &self,
        category: Category,
        max_items: usize,
        timeout: Duration,
    ) -> Result<Vec<String>, InfraError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let batch = self.take(category, max_items.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn requeue(&self, category: Category, items: Vec<String>) -> Result<(), InfraError> {
        {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = queues.entry(category).or_default();
            for item in items.into_iter().rev() {
                queue.push_front(item);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn ping(&self) -> Result<(), InfraError> {
        Ok(())
    }
}
