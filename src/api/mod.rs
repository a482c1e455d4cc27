//! HTTP surface: route handlers and router composition.

pub mod handlers;

use axum::Router;

use crate::app_state::AppState;

/// Builds the router with every endpoint.
pub fn build_router() -> Router<AppState> {
    Router::new().merge(handlers::system::routes())
}
