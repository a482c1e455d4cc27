//! Non-blocking log emission.
//!
//! [`LogEmitter::emit`] builds a [`LogRecord`] and `try_send`s it into a
//! bounded buffer. A single forwarding task drains the buffer into the
//! transport through a [`QueueProducer`], so records from one caller
//! reach the queue in emission order. When the buffer is full the record
//! is dropped and counted; the caller never waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::FALLBACK_TARGET;
use super::record::{Category, Context, Level, LogRecord};
use super::transport::{LogTransport, ProducerStats, QueueProducer};

/// Handle for emitting records. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LogEmitter {
    sender: mpsc::Sender<LogRecord>,
    logger_name: Arc<str>,
    dropped: Arc<AtomicU64>,
}

impl LogEmitter {
    /// Starts the forwarding task and returns an emitter plus the handle
    /// that stops it.
    #[must_use]
    pub fn spawn(transport: Arc<dyn LogTransport>, capacity: usize) -> (Self, EmitterTask) {
        Self::spawn_with_producer(QueueProducer::new(transport), capacity)
    }

    /// Like [`LogEmitter::spawn`] with a custom producer.
    #[must_use]
    pub fn spawn_with_producer(producer: QueueProducer, capacity: usize) -> (Self, EmitterTask) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(producer.stats());
        let task = tokio::spawn(forward(producer, receiver, shutdown_rx));
        let emitter = Self {
            sender,
            logger_name: Arc::from("app"),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (
            emitter,
            EmitterTask {
                shutdown: shutdown_tx,
                task,
                stats,
            },
        )
    }

    /// Returns an emitter that stamps records with a different logger
    /// name. Shares the buffer and drop counter.
    #[must_use]
    pub fn named(&self, logger_name: &str) -> Self {
        Self {
            sender: self.sender.clone(),
            logger_name: Arc::from(logger_name),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Logger name stamped on records from this handle.
    #[must_use]
    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    /// Builds and enqueues a record. Never blocks, never fails.
    pub fn emit(&self, level: Level, category: Category, message: impl Into<String>, context: Context) {
        let record = LogRecord::new(level, category, &*self.logger_name, message, context);
        self.emit_record(record);
    }

    /// Enqueues a pre-built record. Never blocks, never fails.
    pub fn emit_record(&self, record: LogRecord) {
        if self.sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records dropped because the buffer was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owner of the forwarding task.
#[derive(Debug)]
pub struct EmitterTask {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<ProducerStats>,
}

impl EmitterTask {
    /// Transport delivery counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<ProducerStats> {
        &self.stats
    }

    /// Forwards whatever is already buffered, then stops. Records emitted
    /// afterwards are counted as dropped.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(target: FALLBACK_TARGET, error = %e, "log forwarder ended abnormally");
        }
    }
}

async fn forward(
    producer: QueueProducer,
    mut receiver: mpsc::Receiver<LogRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            record = receiver.recv() => {
                match record {
                    Some(record) => producer.push(record).await,
                    None => return,
                }
            }
        }
    }

    receiver.close();
    while let Some(record) = receiver.recv().await {
        producer.push(record).await;
    }
}
