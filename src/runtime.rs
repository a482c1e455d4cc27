//! Startup and shutdown wiring.
//!
//! [`Infrastructure`] owns the engine registry, the session provider and
//! the log pipeline of one process. It replaces process-wide globals:
//! callers receive it (or the pieces they need) explicitly.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt as _;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::{InfraConfig, LogPipelineConfig, RedisConfig};
use crate::db::{Connector, EngineRegistry, PgConnector, SessionProvider};
use crate::error::InfraError;
use crate::health::{HealthProbe, TransportProbe};
use crate::logging::{
    ConsumerHandle, ConsumerSettings, ConsumerWorker, EmitterTask, FALLBACK_TARGET,
    FailoverTransport, LOG_CONSUMER_LEASE, LeaseStore, LogEmitter, LogTransport, MasterElection,
    RedisLeaseStore, RedisTransport, RotatingFileSink, WorkerState,
};

/// Shared queue plus the lease store coordinating its consumers.
pub type SharedBackends = (Arc<dyn LogTransport>, Arc<dyn LeaseStore>);

async fn connect_redis(config: &RedisConfig, prefix: &str) -> Result<SharedBackends, InfraError> {
    let transport = RedisTransport::connect(config, prefix).await?;
    let leases = RedisLeaseStore::connect(config, prefix).await?;
    Ok((Arc::new(transport), Arc::new(leases)))
}

fn spawn_consumer(
    config: &LogPipelineConfig,
    transport: Arc<dyn LogTransport>,
    lease_store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
) -> ConsumerHandle {
    ConsumerWorker::new(
        transport,
        MasterElection::new(lease_store, LOG_CONSUMER_LEASE),
        RotatingFileSink::new(&config.log_dir, config.retention_days),
        ConsumerSettings::from_config(config),
        clock,
    )
    .spawn()
}

#[derive(Debug)]
struct ReconnectTask {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The running log pipeline: emitter, forwarder and consumer worker.
#[derive(Debug)]
pub struct LogPipeline {
    transport: Arc<dyn LogTransport>,
    failover: Option<Arc<FailoverTransport>>,
    emitter: LogEmitter,
    forwarder: EmitterTask,
    consumer: Arc<Mutex<Option<ConsumerHandle>>>,
    reconnect: Option<ReconnectTask>,
}

impl LogPipeline {
    /// Starts the emitter's forwarder and this process's consumer worker.
    /// The worker only becomes active if it wins the consumer lease.
    #[must_use]
    pub fn start(
        config: &LogPipelineConfig,
        transport: Arc<dyn LogTransport>,
        lease_store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (emitter, forwarder) = LogEmitter::spawn(Arc::clone(&transport), config.buffer_capacity);
        let consumer = spawn_consumer(config, Arc::clone(&transport), lease_store, clock);
        tracing::debug!(log_dir = %config.log_dir.display(), "log pipeline started");
        Self {
            transport,
            failover: None,
            emitter,
            forwarder,
            consumer: Arc::new(Mutex::new(Some(consumer))),
            reconnect: None,
        }
    }

    /// Starts without a shared queue. Records are buffered in memory and
    /// no consumer runs, so nothing reaches disk without the consumer
    /// lease. `connect` is retried every lease poll interval; once it
    /// succeeds the backlog is forwarded and the consumer starts.
    #[must_use]
    pub fn start_detached<F>(config: &LogPipelineConfig, clock: Arc<dyn Clock>, connect: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<SharedBackends, InfraError>> + Send + Sync + 'static,
    {
        let failover = Arc::new(FailoverTransport::new(config.buffer_capacity));
        let transport: Arc<dyn LogTransport> = Arc::clone(&failover) as Arc<dyn LogTransport>;
        let (emitter, forwarder) = LogEmitter::spawn(Arc::clone(&transport), config.buffer_capacity);
        let consumer = Arc::new(Mutex::new(None));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = ConsumerSettings::from_config(config).poll_interval();
        let task = tokio::spawn({
            let failover = Arc::clone(&failover);
            let slot = Arc::clone(&consumer);
            let config = config.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return,
                        () = tokio::time::sleep(interval) => {}
                    }
                    let attempt = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return,
                        attempt = connect() => attempt,
                    };
                    match attempt {
                        Ok((shared, leases)) => {
                            let forwarded = failover.attach(Arc::clone(&shared)).await;
                            let handle = spawn_consumer(&config, shared, leases, clock);
                            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                            tracing::info!(forwarded, "shared log queue connected; consumer started");
                            return;
                        }
                        Err(e) => {
                            tracing::debug!(target: FALLBACK_TARGET, error = %e, "shared log queue still unavailable");
                        }
                    }
                }
            }
        });

        Self {
            transport,
            failover: Some(failover),
            emitter,
            forwarder,
            consumer,
            reconnect: Some(ReconnectTask {
                shutdown: shutdown_tx,
                task,
            }),
        }
    }

    /// Emitter handle for application code.
    #[must_use]
    pub fn emitter(&self) -> &LogEmitter {
        &self.emitter
    }

    /// The transport producers push to.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn LogTransport> {
        &self.transport
    }

    /// `false` while records are only buffered locally.
    #[must_use]
    pub fn uses_shared_queue(&self) -> bool {
        self.failover.as_ref().is_none_or(|f| f.is_attached())
    }

    /// State of this process's consumer worker. `Stopped` while no
    /// consumer has been started.
    #[must_use]
    pub fn consumer_state(&self) -> WorkerState {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(WorkerState::Stopped, ConsumerHandle::state)
    }

    /// Stops reconnecting, flushes buffered records to the transport, then
    /// stops the consumer, which drains what it can and releases the
    /// lease.
    pub async fn shutdown(self) {
        if let Some(reconnect) = self.reconnect {
            let _ = reconnect.shutdown.send(true);
            if let Err(e) = reconnect.task.await {
                tracing::warn!(target: FALLBACK_TARGET, error = %e, "log queue reconnect task ended abnormally");
            }
        }
        self.forwarder.shutdown().await;
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            consumer.shutdown().await;
        }
    }
}

/// Everything one process needs to talk to the database and log.
#[derive(Debug)]
pub struct Infrastructure<C: Connector> {
    engines: Arc<EngineRegistry<C>>,
    sessions: SessionProvider<C>,
    pipeline: LogPipeline,
}

impl Infrastructure<PgConnector> {
    /// Production wiring: PostgreSQL engines plus a Redis-backed log
    /// pipeline.
    ///
    /// If Redis cannot be reached the pipeline starts detached (see
    /// [`LogPipeline::start_detached`]) and keeps retrying. See
    /// [`Infrastructure::uses_shared_queue`].
    pub async fn start(config: &InfraConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let prefix = config.logging.queue_prefix.clone();
        let pipeline = match connect_redis(&config.redis, &prefix).await {
            Ok((transport, leases)) => LogPipeline::start(&config.logging, transport, leases, clock),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable; buffering logs until it is reachable");
                let redis = config.redis.clone();
                LogPipeline::start_detached(&config.logging, clock, move || {
                    let redis = redis.clone();
                    let prefix = prefix.clone();
                    async move { connect_redis(&redis, &prefix).await }.boxed()
                })
            }
        };
        Self::new(EngineRegistry::postgres(&config.database), pipeline)
    }
}

impl<C: Connector> Infrastructure<C> {
    /// Bundles an engine registry with a started log pipeline. No
    /// database connection is opened until the first session.
    #[must_use]
    pub fn new(engines: EngineRegistry<C>, pipeline: LogPipeline) -> Self {
        let engines = Arc::new(engines);
        Self {
            sessions: SessionProvider::new(Arc::clone(&engines)),
            engines,
            pipeline,
        }
    }

    /// `false` while the log pipeline is waiting for the shared queue.
    #[must_use]
    pub fn uses_shared_queue(&self) -> bool {
        self.pipeline.uses_shared_queue()
    }

    /// Engine registry.
    #[must_use]
    pub fn engines(&self) -> &Arc<EngineRegistry<C>> {
        &self.engines
    }

    /// Session provider for request handlers and scheduled tasks.
    #[must_use]
    pub fn sessions(&self) -> &SessionProvider<C> {
        &self.sessions
    }

    /// Log pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &LogPipeline {
        &self.pipeline
    }

    /// Probes for the database and the log transport.
    #[must_use]
    pub fn health_probes(&self) -> Vec<Arc<dyn HealthProbe>> {
        vec![
            Arc::clone(&self.engines) as Arc<dyn HealthProbe>,
            Arc::new(TransportProbe(Arc::clone(self.pipeline.transport()))),
        ]
    }

    /// Stops the log pipeline and closes every pool.
    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
        self.engines.dispose().await;
        tracing::info!("infrastructure shut down");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::PoolConfig;
    use crate::db::Role;
    use crate::db::test_support::{Event, MockConnector};
    use crate::health;
    use crate::logging::{Category, Context, Level, MemoryLeaseStore, MemoryTransport};

    fn pipeline_config(dir: &std::path::Path) -> LogPipelineConfig {
        LogPipelineConfig {
            log_dir: dir.to_path_buf(),
            lease_secs: 1,
            ..LogPipelineConfig::default()
        }
    }

    fn application_logs(dir: &std::path::Path) -> String {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return String::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("application_"))
            .filter_map(|e| std::fs::read_to_string(e.path()).ok())
            .collect()
    }

    #[tokio::test]
    async fn emitted_records_reach_disk_and_shutdown_closes_pools() {
        let Ok(tmp) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let transport: Arc<dyn LogTransport> = Arc::new(MemoryTransport::new(1_000));
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new(Arc::clone(&clock)));
        let pipeline = LogPipeline::start(&pipeline_config(tmp.path()), transport, store, clock);

        let connector = MockConnector::new();
        let engines = EngineRegistry::new().with_role(Role::Primary, PoolConfig::default(), connector.clone());
        let infra = Infrastructure::new(engines, pipeline);

        {
            let Ok(mut session) = infra.sessions().open_session(Role::Primary).await else {
                panic!("open session");
            };
            let Ok(tx) = session.within_transaction().await else {
                panic!("begin");
            };
            let Ok(()) = tx.commit().await else {
                panic!("commit");
            };
        }

        infra
            .pipeline()
            .emitter()
            .emit(Level::Info, Category::Application, "order placed", Context::new());

        let report = health::check(&infra.health_probes()).await;
        assert!(report.healthy);

        let written = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let contents = application_logs(tmp.path());
                if contents.contains("order placed") {
                    break contents;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(written.is_ok(), "record never reached disk");
        assert_eq!(infra.pipeline().consumer_state(), WorkerState::Running);

        let engines = Arc::clone(infra.engines());
        assert!(engines.is_initialized(Role::Primary));
        infra.shutdown().await;
        assert!(!engines.is_initialized(Role::Primary));
        let closes = connector.events().iter().filter(|e| matches!(e, Event::Close(_))).count();
        assert_eq!(closes, connector.connect_count());
    }

    #[tokio::test]
    async fn detached_pipeline_writes_nothing_until_shared_queue_connects() {
        let Ok(tmp) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let available = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(MemoryTransport::new(1_000));
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new(Arc::clone(&clock)));
        let connect = {
            let available = Arc::clone(&available);
            let shared = Arc::clone(&shared);
            move || {
                let attempt: Result<SharedBackends, InfraError> = if available.load(Ordering::SeqCst) {
                    Ok((Arc::clone(&shared) as Arc<dyn LogTransport>, Arc::clone(&store)))
                } else {
                    Err(InfraError::Connectivity("connection refused".to_string()))
                };
                async move { attempt }.boxed()
            }
        };
        let pipeline = LogPipeline::start_detached(&pipeline_config(tmp.path()), clock, connect);
        assert!(!pipeline.uses_shared_queue());

        pipeline
            .emitter()
            .emit(Level::Info, Category::Application, "queued while offline", Context::new());
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(pipeline.consumer_state(), WorkerState::Stopped);
        assert!(application_logs(tmp.path()).is_empty());
        assert!(pipeline.transport().ping().await.is_err());

        available.store(true, Ordering::SeqCst);
        let written = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if application_logs(tmp.path()).contains("queued while offline") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(written.is_ok(), "buffered record never reached disk");
        assert!(pipeline.uses_shared_queue());
        assert!(pipeline.transport().ping().await.is_ok());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn detached_pipeline_shuts_down_while_still_offline() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let Ok(tmp) = tempfile::tempdir() else {
            panic!("tempdir");
        };
        let pipeline = LogPipeline::start_detached(&pipeline_config(tmp.path()), clock, || {
            async { Err(InfraError::Connectivity("connection refused".to_string())) }.boxed()
        });
        let stopped =
            tokio::time::timeout(Duration::from_secs(2), pipeline.shutdown()).await;
        assert!(stopped.is_ok());
    }
}
