//! HTTP API for health checks, Prometheus metrics and resource groups

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use governor_lib::{
    health::{ComponentStatus, HealthRegistry},
    GovernanceError, GroupDefinition, GroupRegistry, GroupUpdate, StatsAggregator,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub registry: Arc<GroupRegistry>,
    pub stats: Arc<StatsAggregator>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        registry: Arc<GroupRegistry>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            health_registry,
            registry,
            stats,
        }
    }
}

/// Registry errors rendered as JSON with a matching status code
struct ApiError(GovernanceError);

impl From<GovernanceError> for ApiError {
    fn from(e: GovernanceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GovernanceError::InvalidDefinition(_) | GovernanceError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            GovernanceError::NotFound(_) => StatusCode::NOT_FOUND,
            GovernanceError::DuplicateName(_)
            | GovernanceError::CapacityExceeded { .. }
            | GovernanceError::OverAllocated { .. } => StatusCode::CONFLICT,
            GovernanceError::Rejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            GovernanceError::MutationConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

/// Returns 200 while operational, 503 once a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct GroupQuery {
    name: Option<String>,
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GroupQuery>,
) -> impl IntoResponse {
    Json(state.registry.get(query.name.as_deref()))
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(name_or_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .registry
        .get(Some(&name_or_id))
        .into_iter()
        .next()
        .ok_or(GovernanceError::NotFound(name_or_id))?;
    Ok(Json(group))
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(def): Json<GroupDefinition>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state.registry.create(def).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(name_or_id): Path<String>,
    Json(update): Json<GroupUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .registry
        .get(Some(&name_or_id))
        .into_iter()
        .next()
        .map(|group| group.id)
        .ok_or(GovernanceError::NotFound(name_or_id))?;
    Ok(Json(state.registry.update(&id, update).await?))
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(name_or_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.delete(Some(&name_or_id)).await?))
}

async fn delete_all_groups(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.delete(None).await?))
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            "/groups",
            get(list_groups).post(create_group).delete(delete_all_groups),
        )
        .route(
            "/groups/:name_or_id",
            get(get_group).put(update_group).delete(delete_group),
        )
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
