//! service-infra entry point.
//!
//! Wires the engine registry and the log pipeline, then serves the health
//! endpoint until Ctrl-C.

use anyhow::Context as _;
use tower_http::trace::TraceLayer;

use service_infra::api;
use service_infra::app_state::AppState;
use service_infra::config::InfraConfig;
use service_infra::logging;
use service_infra::runtime::Infrastructure;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InfraConfig::from_env().context("loading configuration")?;

    let infra = Infrastructure::start(&config).await;
    logging::init_tracing(config.env, Some(infra.pipeline().emitter().clone()))
        .context("installing tracing subscriber")?;
    if !infra.uses_shared_queue() {
        tracing::warn!("redis unavailable; buffering logs until it is reachable");
    }
    tracing::info!(addr = %config.listen_addr, env = ?config.env, "starting service-infra");

    let app = api::build_router()
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(infra.health_probes()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("shutting down");
    infra.shutdown().await;
    Ok(())
}
