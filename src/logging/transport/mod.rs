//! Durable per-category FIFO carrying serialized log records.
//!
//! Producers push to one end, the elected consumer pops batches from the
//! other. Delivery is at-least-once: a batch the consumer cannot persist
//! is requeued at the consumer end and redelivered first.

mod failover;
mod memory;
mod redis_queue;

pub use self::failover::FailoverTransport;
pub use self::memory::MemoryTransport;
pub use self::redis_queue::RedisTransport;
pub(crate) use self::redis_queue::connection_config;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::FALLBACK_TARGET;
use super::record::{Category, LogRecord, QueueItem};
use crate::error::InfraError;

/// Queue backend for the log pipeline.
#[async_trait]
pub trait LogTransport: Send + Sync + std::fmt::Debug {
    /// Appends one serialized record. Single attempt.
    async fn push(&self, category: Category, payload: String) -> Result<(), InfraError>;

    /// Waits up to `timeout` for at least one item, then returns up to
    /// `max_items` of them in FIFO order. Returns an empty batch on
    /// timeout.
    async fn pop_batch(
        &self,
        category: Category,
        max_items: usize,
        timeout: Duration,
    ) -> Result<Vec<String>, InfraError>;

    /// Puts an unacknowledged batch back so it is popped next, in the
    /// same order.
    async fn requeue(&self, category: Category, items: Vec<String>) -> Result<(), InfraError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), InfraError>;
}

/// Delivery counters for the producer side.
#[derive(Debug, Default)]
pub struct ProducerStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl ProducerStats {
    /// Records handed to the transport.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Records dropped after exhausting retries.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Producer side of the transport: serializes, retries, then gives up
/// quietly.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    transport: Arc<dyn LogTransport>,
    attempts: u32,
    backoff: Duration,
    stats: Arc<ProducerStats>,
}

impl QueueProducer {
    /// Two attempts with a 50 ms pause in between.
    #[must_use]
    pub fn new(transport: Arc<dyn LogTransport>) -> Self {
        Self::with_retry(transport, 2, Duration::from_millis(50))
    }

    /// Custom retry policy. `attempts` is clamped to at least one.
    #[must_use]
    pub fn with_retry(transport: Arc<dyn LogTransport>, attempts: u32, backoff: Duration) -> Self {
        Self {
            transport,
            attempts: attempts.max(1),
            backoff,
            stats: Arc::new(ProducerStats::default()),
        }
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<ProducerStats> {
        &self.stats
    }

    /// Pushes a record. Never fails: after the last attempt the record is
    /// dropped and counted.
    pub async fn push(&self, record: LogRecord) {
        let category = record.category();
        let payload = match QueueItem::new(record).encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: FALLBACK_TARGET, error = %e, "unserializable log record dropped");
                return;
            }
        };

        for attempt in 1..=self.attempts {
            match self.transport.push(category, payload.clone()).await {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if attempt < self.attempts => {
                    tracing::debug!(target: FALLBACK_TARGET, attempt, error = %e, "log push failed; retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(target: FALLBACK_TARGET, %category, error = %e, "log record dropped after retries");
                }
            }
        }
    }
}


#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::test_support::FlakyTransport;
    use super::*;
    use crate::logging::record::{Context, Level};

    fn record(message: &str) -> LogRecord {
        LogRecord::new(Level::Info, Category::Application, "test", message, Context::new())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let transport = Arc::new(FlakyTransport::new(1));
        let producer = QueueProducer::new(Arc::clone(&transport) as Arc<dyn LogTransport>);

        producer.push(record("hello")).await;
        assert_eq!(producer.stats().delivered(), 1);
        assert_eq!(producer.stats().failed(), 0);
        assert_eq!(transport.inner.len(Category::Application), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_is_absorbed() {
        let transport = Arc::new(FlakyTransport::new(5));
        let producer = QueueProducer::new(Arc::clone(&transport) as Arc<dyn LogTransport>);

        producer.push(record("lost")).await;
        assert_eq!(producer.stats().delivered(), 0);
        assert_eq!(producer.stats().failed(), 1);
        assert_eq!(transport.inner.len(Category::Application), 0);
    }
}
