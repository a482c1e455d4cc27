//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::health::HealthProbe;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Dependency probes reported by `GET /health`.
    pub probes: Arc<[Arc<dyn HealthProbe>]>,
}

impl AppState {
    /// Builds state from a set of probes.
    #[must_use]
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self {
            probes: probes.into(),
        }
    }
}
