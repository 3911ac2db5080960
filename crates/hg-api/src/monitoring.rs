//! Health, incident and operator endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use hg_broadcast::HubStats;
use hg_common::{Incident, ServiceHealthStatus};
use hg_coordinator::PoolStats;

use crate::error::ApiFailure;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHealthResponse {
    /// UP while accepting webhooks, DRAINING during shutdown
    pub status: &'static str,
    pub version: &'static str,
    pub in_pipeline: usize,
    pub pending_retries: u32,
    pub pools: Vec<PoolStats>,
    pub observers: HubStats,
    pub open_incidents: usize,
}

/// GET /health
pub async fn gateway_health(State(state): State<AppState>) -> (StatusCode, Json<GatewayHealthResponse>) {
    let running = state.coordinator.is_running();
    let body = GatewayHealthResponse {
        status: if running { "UP" } else { "DRAINING" },
        version: env!("CARGO_PKG_VERSION"),
        in_pipeline: state.coordinator.in_pipeline_count(),
        pending_retries: state.coordinator.pending_retries(),
        pools: state.coordinator.pool_stats(),
        observers: state.hub.stats(),
        open_incidents: state.health.open_incidents().len(),
    };
    let status = if running { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

/// GET /api/health/providers
pub async fn provider_statuses(State(state): State<AppState>) -> Json<Vec<ServiceHealthStatus>> {
    Json(state.health.all_statuses().await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentFilter {
    #[default]
    Open,
    Closed,
    All,
}

#[derive(Debug, Default, Deserialize)]
pub struct IncidentsQuery {
    #[serde(default)]
    pub state: IncidentFilter,
}

/// GET /api/incidents?state=open|closed|all
pub async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<IncidentsQuery>,
) -> Json<Vec<Incident>> {
    let incidents = match query.state {
        IncidentFilter::Open => state.health.open_incidents(),
        IncidentFilter::Closed => state.health.closed_incidents(),
        IncidentFilter::All => {
            let mut all = state.health.open_incidents();
            all.extend(state.health.closed_incidents());
            all
        }
    };
    Json(incidents)
}

#[derive(Debug, Default, Deserialize)]
pub struct OperatorQuery {
    pub actor: Option<String>,
}

/// POST /api/providers/:provider_id/disable
pub async fn disable_provider(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(query): Query<OperatorQuery>,
) -> Result<Json<ServiceHealthStatus>, ApiFailure> {
    let actor = query.actor.unwrap_or_else(|| "api".to_string());
    info!(provider_id = %provider_id, actor = %actor, "Disable requested");
    Ok(Json(state.health.disable(&provider_id, &actor).await?))
}

/// POST /api/providers/:provider_id/enable
pub async fn enable_provider(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(query): Query<OperatorQuery>,
) -> Result<Json<ServiceHealthStatus>, ApiFailure> {
    let actor = query.actor.unwrap_or_else(|| "api".to_string());
    info!(provider_id = %provider_id, actor = %actor, "Enable requested");
    Ok(Json(state.health.enable(&provider_id, &actor).await?))
}
