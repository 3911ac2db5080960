//! HookGuard API
//!
//! HTTP endpoints for:
//! - Inbound webhooks (`POST /webhooks/:provider_id`)
//! - Gateway health (`GET /health`)
//! - Provider health and incidents (`/api/health/providers`, `/api/incidents`)
//! - Operator disable/enable (`/api/providers/:provider_id/...`)
//! - Observer WebSocket (`GET /ws`)

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use hg_broadcast::RealtimeBroadcastHub;
use hg_coordinator::WebhookCoordinator;
use hg_health::ServiceHealthRegistry;

pub mod error;
pub mod monitoring;
pub mod webhooks;
pub mod ws;

pub use error::{ApiError, ApiFailure};

/// Transport ceiling; per-provider limits are enforced by the coordinator
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<WebhookCoordinator>,
    pub health: Arc<ServiceHealthRegistry>,
    pub hub: Arc<RealtimeBroadcastHub>,
}

impl AppState {
    pub fn new(coordinator: Arc<WebhookCoordinator>) -> Self {
        Self {
            health: coordinator.health().clone(),
            hub: coordinator.hub().clone(),
            coordinator,
        }
    }
}

/// Create the full router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/:provider_id", post(webhooks::receive_webhook))
        .route("/health", get(monitoring::gateway_health))
        .route("/api/health/providers", get(monitoring::provider_statuses))
        .route("/api/incidents", get(monitoring::list_incidents))
        .route("/api/providers/:provider_id/disable", post(monitoring::disable_provider))
        .route("/api/providers/:provider_id/enable", post(monitoring::enable_provider))
        .route("/ws", get(ws::observer_socket))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
