//! The log consumer worker.
//!
//! At most one worker cluster-wide is `Running`: the one holding the
//! consumer lease. Every other worker idles in `Stopped` and re-checks the
//! lease every `lease / 3`. The master drains each category's queue into
//! the [`RotatingFileSink`], requeues batches it fails to persist, and
//! sweeps expired files on start and then periodically.
//!
//! ```text
//! Stopped ──lease granted──▶ Starting ──sweep──▶ Running
//!    ▲                                             │
//!    └──────── Stopping ◀── lease lost / shutdown ─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::FALLBACK_TARGET;
use super::election::MasterElection;
use super::record::{Category, LogRecord, QueueItem};
use super::sink::RotatingFileSink;
use super::transport::LogTransport;
use crate::clock::Clock;
use crate::config::LogPipelineConfig;
use crate::error::InfraError;

const MIN_POLL: Duration = Duration::from_millis(100);

/// Lifecycle state of a [`ConsumerWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Not the master; polling the lease.
    Stopped,
    /// Lease granted; running the start-up sweep.
    Starting,
    /// Draining queues into files.
    Running,
    /// Flushing and releasing the lease.
    Stopping,
}

/// Tuning knobs for the worker.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Lease length; the poll and renewal interval is a third of it.
    pub lease: Duration,
    /// Maximum items popped per category per cycle.
    pub batch_size: usize,
    /// Time spent waiting on an empty queue per cycle, split across
    /// categories.
    pub pop_timeout: Duration,
    /// Time between retention sweeps.
    pub sweep_interval: Duration,
}

impl ConsumerSettings {
    /// Settings derived from pipeline configuration.
    #[must_use]
    pub fn from_config(config: &LogPipelineConfig) -> Self {
        Self {
            lease: config.lease_duration(),
            batch_size: config.batch_size,
            ..Self::default()
        }
    }

    /// Interval between lease checks.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        (self.lease / 3).max(MIN_POLL)
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(15),
            batch_size: 100,
            pop_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

enum MasterExit {
    Shutdown,
    LeaseLost,
}

/// Drains the transport into rotated files while holding the lease.
#[derive(Debug)]
pub struct ConsumerWorker {
    transport: Arc<dyn LogTransport>,
    election: MasterElection,
    sink: RotatingFileSink,
    settings: ConsumerSettings,
    clock: Arc<dyn Clock>,
}

impl ConsumerWorker {
    /// Creates a worker. Nothing runs until [`ConsumerWorker::spawn`].
    #[must_use]
    pub fn new(
        transport: Arc<dyn LogTransport>,
        election: MasterElection,
        sink: RotatingFileSink,
        settings: ConsumerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            election,
            sink,
            settings,
            clock,
        }
    }

    /// Starts the worker on the current runtime.
    #[must_use]
    pub fn spawn(self) -> ConsumerHandle {
        let (state_tx, state_rx) = watch::channel(WorkerState::Stopped);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(state_tx, shutdown_rx));
        ConsumerHandle {
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self, state: watch::Sender<WorkerState>, mut shutdown: watch::Receiver<bool>) {
        let poll = self.settings.poll_interval();
        tracing::debug!(holder = self.election.holder_id(), ?poll, "log consumer started");

        loop {
            if stop_requested(&shutdown) {
                break;
            }
            if self.election.try_acquire_or_renew(self.settings.lease).await {
                tracing::info!(holder = self.election.holder_id(), "log consumer elected master");
                state.send_replace(WorkerState::Starting);
                let exit = self.run_as_master(&state, &mut shutdown).await;

                state.send_replace(WorkerState::Stopping);
                if let Err(e) = self.sink.close().await {
                    tracing::warn!(target: FALLBACK_TARGET, error = %e, "failed to flush log files");
                }
                match exit {
                    MasterExit::Shutdown => {
                        self.election.release().await;
                        state.send_replace(WorkerState::Stopped);
                        break;
                    }
                    MasterExit::LeaseLost => {
                        tracing::warn!(holder = self.election.holder_id(), "log consumer lost the lease");
                        state.send_replace(WorkerState::Stopped);
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::debug!(holder = self.election.holder_id(), "log consumer stopped");
    }

    async fn run_as_master(
        &mut self,
        state: &watch::Sender<WorkerState>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MasterExit {
        let poll = self.settings.poll_interval();
        self.sweep().await;
        let mut last_sweep = self.clock.now();
        let mut next_renewal = Instant::now() + poll;
        state.send_replace(WorkerState::Running);

        loop {
            if stop_requested(shutdown) {
                return MasterExit::Shutdown;
            }
            if Instant::now() >= next_renewal {
                if !self.election.try_acquire_or_renew(self.settings.lease).await {
                    return MasterExit::LeaseLost;
                }
                next_renewal = Instant::now() + poll;
            }
            let since_sweep = (self.clock.now() - last_sweep).to_std().unwrap_or_default();
            if since_sweep >= self.settings.sweep_interval {
                self.sweep().await;
                last_sweep = self.clock.now();
            }

            if !self.drain_once().await {
                tokio::select! {
                    () = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// One pass over every category. Returns `false` if a batch could not
    /// be persisted, so the caller backs off before retrying.
    async fn drain_once(&mut self) -> bool {
        let wait = self.settings.pop_timeout / u32::try_from(Category::ALL.len()).unwrap_or(1);
        let mut healthy = true;
        for category in Category::ALL {
            let raw = match self
                .transport
                .pop_batch(category, self.settings.batch_size, wait)
                .await
            {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(target: FALLBACK_TARGET, %category, error = %e, "log queue pop failed");
                    healthy = false;
                    continue;
                }
            };
            if raw.is_empty() {
                continue;
            }

            let mut decoded = Vec::with_capacity(raw.len());
            for item in raw {
                match QueueItem::decode(&item) {
                    Ok(queued) => decoded.push((item, queued.record)),
                    Err(e) => {
                        tracing::warn!(target: FALLBACK_TARGET, %category, error = %e, payload = %item, "undecodable log item skipped");
                    }
                }
            }

            let written = self.persist(decoded.iter().map(|(_, record)| record)).await;
            if let Err(e) = written {
                tracing::error!(target: FALLBACK_TARGET, %category, items = decoded.len(), error = %e, "log write failed; batch requeued");
                self.sink.reset();
                let items = decoded.into_iter().map(|(item, _)| item).collect();
                if let Err(e) = self.transport.requeue(category, items).await {
                    tracing::error!(target: FALLBACK_TARGET, %category, error = %e, "requeue failed; batch lost");
                }
                healthy = false;
            }
        }
        healthy
    }

    async fn persist<'r>(
        &mut self,
        records: impl Iterator<Item = &'r LogRecord>,
    ) -> Result<(), InfraError> {
        for record in records {
            self.sink.append(record).await?;
        }
        self.sink.flush().await
    }

    async fn sweep(&self) {
        let today = self.sink.local_day(self.clock.now());
        if let Err(e) = self.sink.sweep(today).await {
            tracing::warn!(target: FALLBACK_TARGET, error = %e, "log retention sweep failed");
        }
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Control handle for a spawned [`ConsumerWorker`].
#[derive(Debug)]
pub struct ConsumerHandle {
    state: watch::Receiver<WorkerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Current worker state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Waits until the worker reaches `target`. Returns `false` if the
    /// worker exited first.
    pub async fn wait_for(&self, target: WorkerState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|s| *s == target).await.is_ok()
    }

    /// Stops the worker: the in-flight batch is finished, files are
    /// flushed and the lease is released.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(target: FALLBACK_TARGET, error = %e, "log consumer ended abnormally");
        }
    }
}
