//! Producer-side transport that buffers in memory until the shared queue
//! is reachable.
//!
//! While no shared queue is attached nothing is consumed: records wait in
//! the bounded local buffer, and pushes beyond its capacity fail like any
//! other full queue. [`FailoverTransport::attach`] switches producers over
//! and forwards the backlog.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{LogTransport, MemoryTransport};
use crate::error::InfraError;
use crate::logging::FALLBACK_TARGET;
use crate::logging::record::Category;

const FORWARD_BATCH: usize = 100;

/// Local buffer in front of a shared queue that may not exist yet.
#[derive(Debug)]
pub struct FailoverTransport {
    local: MemoryTransport,
    shared: RwLock<Option<Arc<dyn LogTransport>>>,
}

impl FailoverTransport {
    /// Starts detached, buffering up to `capacity` records per category.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            local: MemoryTransport::new(capacity),
            shared: RwLock::new(None),
        }
    }

    /// Returns `true` once a shared queue is attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Records still waiting in the local buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        Category::ALL.iter().map(|c| self.local.len(*c)).sum()
    }

    fn active(&self) -> Option<Arc<dyn LogTransport>> {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }

    /// Routes all further traffic to `shared`, then forwards the local
    /// backlog to it. Returns how many buffered records were forwarded.
    ///
    /// Backlog records land behind anything pushed after the switch.
    pub async fn attach(&self, shared: Arc<dyn LogTransport>) -> usize {
        *self.shared.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&shared));

        let mut forwarded = 0;
        for category in Category::ALL {
            loop {
                let batch = match self.local.pop_batch(category, FORWARD_BATCH, Duration::ZERO).await {
                    Ok(batch) if !batch.is_empty() => batch,
                    _ => break,
                };
                for payload in batch {
                    match shared.push(category, payload).await {
                        Ok(()) => forwarded += 1,
                        Err(e) => {
                            tracing::warn!(target: FALLBACK_TARGET, %category, error = %e, "buffered log record dropped while forwarding");
                        }
                    }
                }
            }
        }
        forwarded
    }
}

#[async_trait]
impl LogTransport for FailoverTransport {
    async fn push(&self, category: Category, payload: String) -> Result<(), InfraError> {
        match self.active() {
            Some(shared) => shared.push(category, payload).await,
            None => self.local.push(category, payload).await,
        }
    }

    async fn pop_batch(
        &self,
        category: Category,
        max_items: usize,
        timeout: Duration,
    ) -> Result<Vec<String>, InfraError> {
        let Some(shared) = self.active() else {
            return Err(InfraError::QueueTransport(
                "shared log queue not connected".to_string(),
            ));
        };
        shared.pop_batch(category, max_items, timeout).await
    }

    async fn requeue(&self, category: Category, items: Vec<String>) -> Result<(), InfraError> {
        match self.active() {
            Some(shared) => shared.requeue(category, items).await,
            None => self.local.requeue(category, items).await,
        }
    }

    async fn ping(&self) -> Result<(), InfraError> {
        let Some(shared) = self.active() else {
            return Err(InfraError::QueueTransport(
                "shared log queue not connected".to_string(),
            ));
        };
        shared.ping().await
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_buffers_and_reports_down() {
        let failover = FailoverTransport::new(2);
        assert!(!failover.is_attached());
        assert!(failover.push(Category::Sql, "a".to_string()).await.is_ok());
        assert!(failover.push(Category::Sql, "b".to_string()).await.is_ok());
        assert!(failover.push(Category::Sql, "c".to_string()).await.is_err());
        assert_eq!(failover.buffered(), 2);
        assert!(failover.ping().await.is_err());
        assert!(
            failover
                .pop_batch(Category::Sql, 10, Duration::ZERO)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn attach_forwards_backlog_in_order() {
        let failover = FailoverTransport::new(10);
        for payload in ["first", "second"] {
            assert!(failover.push(Category::Access, payload.to_string()).await.is_ok());
        }
        assert!(failover.push(Category::Application, "app".to_string()).await.is_ok());

        let shared = Arc::new(MemoryTransport::new(10));
        let forwarded = failover.attach(Arc::clone(&shared) as Arc<dyn LogTransport>).await;
        assert_eq!(forwarded, 3);
        assert_eq!(failover.buffered(), 0);
        assert!(failover.is_attached());
        assert!(failover.ping().await.is_ok());

        assert!(failover.push(Category::Access, "third".to_string()).await.is_ok());
        let Ok(batch) = shared.pop_batch(Category::Access, 10, Duration::ZERO).await else {
            panic!("pop");
        };
        assert_eq!(batch, vec!["first", "second", "third"]);
        assert_eq!(shared.len(Category::Application), 1);
    }
}
