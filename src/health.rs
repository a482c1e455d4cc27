//! Dependency health checks.
//!
//! Each backing service implements [`HealthProbe`]. [`check`] runs every
//! probe concurrently with a per-probe timeout and folds the results into
//! a [`HealthReport`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;

use crate::db::{Connection, Connector, EngineRegistry, Role};
use crate::error::InfraError;
use crate::logging::LogTransport;

/// Time a single probe may take before it is reported as down.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A dependency that can be checked for liveness.
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    /// Name reported in the health payload.
    fn name(&self) -> &'static str;

    /// Performs one liveness round trip.
    async fn probe(&self) -> Result<(), InfraError>;
}

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The dependency answered.
    Up,
    /// The dependency failed or timed out.
    Down,
}

/// Per-dependency entry of a [`HealthReport`].
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    /// Probe name.
    pub name: &'static str,
    /// Probe outcome.
    pub status: HealthStatus,
    /// Round-trip time of the probe.
    pub latency_ms: u64,
}

/// Aggregated health of all dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `true` only if every dependency is up.
    pub healthy: bool,
    /// One entry per probe, in probe order.
    pub dependencies: Vec<DependencyHealth>,
}

/// Runs every probe concurrently with [`PROBE_TIMEOUT`].
pub async fn check(probes: &[Arc<dyn HealthProbe>]) -> HealthReport {
    check_with_timeout(probes, PROBE_TIMEOUT).await
}

/// Runs every probe concurrently, treating any probe slower than
/// `timeout` as down.
pub async fn check_with_timeout(probes: &[Arc<dyn HealthProbe>], timeout: Duration) -> HealthReport {
    let dependencies = join_all(probes.iter().map(|probe| async move {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, probe.probe()).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let status = match outcome {
            Ok(Ok(())) => HealthStatus::Up,
            Ok(Err(e)) => {
                tracing::warn!(dependency = probe.name(), error = %e, "health probe failed");
                HealthStatus::Down
            }
            Err(_) => {
                tracing::warn!(dependency = probe.name(), ?timeout, "health probe timed out");
                HealthStatus::Down
            }
        };
        DependencyHealth {
            name: probe.name(),
            status,
            latency_ms,
        }
    }))
    .await;

    HealthReport {
        healthy: dependencies.iter().all(|d| d.status == HealthStatus::Up),
        dependencies,
    }
}

#[async_trait]
impl<C: Connector> HealthProbe for EngineRegistry<C> {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn probe(&self) -> Result<(), InfraError> {
        let engine = self.get_engine(Role::Primary).await?;
        let mut conn = engine.pool().acquire().await?;
        conn.ping().await
    }
}

/// Health probe for the log transport.
#[derive(Debug, Clone)]
pub struct TransportProbe(pub Arc<dyn LogTransport>);

#[async_trait]
impl HealthProbe for TransportProbe {
    fn name(&self) -> &'static str {
        "cache_queue"
    }

    async fn probe(&self) -> Result<(), InfraError> {
        self.0.ping().await
    }
}
