//! Queue-backed structured logging.
//!
//! Producers in every process hand records to a [`LogEmitter`], which
//! forwards them to a [`LogTransport`] without ever blocking the caller.
//! Exactly one process, the holder of the [`MasterElection`] lease, runs
//! the [`ConsumerWorker`] that drains the queues into daily-rotated files.
//!
//! Failures inside the pipeline are reported as `tracing` events on
//! [`FALLBACK_TARGET`]. The fmt layer prints them to stderr and the
//! [`EmitterLayer`] skips them, so a broken pipeline cannot feed itself.

pub mod consumer;
pub mod election;
pub mod emitter;
pub mod layer;
pub mod record;
pub mod sink;
pub mod transport;

pub use self::consumer::{ConsumerHandle, ConsumerSettings, ConsumerWorker, WorkerState};
pub use self::election::{
    LOG_CONSUMER_LEASE, LeaseStore, MasterElection, MasterElectionState, MemoryLeaseStore,
    RedisLeaseStore,
};
pub use self::emitter::{EmitterTask, LogEmitter};
pub use self::layer::EmitterLayer;
pub use self::record::{Category, Context, ContextValue, Level, LogRecord, QueueItem};
pub use self::sink::RotatingFileSink;
pub use self::transport::{
    FailoverTransport, LogTransport, MemoryTransport, QueueProducer, RedisTransport,
};

use tracing_subscriber::{EnvFilter, fmt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::AppEnv;

/// `tracing` target for failures of the logging pipeline itself.
pub const FALLBACK_TARGET: &str = "log_pipeline_fallback";

/// Installs the global subscriber: an stderr fmt layer (JSON lines in
/// production) plus, when given, an [`EmitterLayer`] feeding the pipeline.
///
/// `RUST_LOG` overrides the environment's default filter.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(env: AppEnv, emitter: Option<LogEmitter>) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env.default_log_filter()));

    let json = env == AppEnv::Production;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(emitter.map(EmitterLayer::new))
        .try_init()
}
