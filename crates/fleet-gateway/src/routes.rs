use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use fleet_core::{AgentDescriptor, AgentStatus};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

const DEFAULT_FETCH_LIMIT: usize = 10;

/// Health check; never behind auth.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "fleet"}))
}

/// Fleet-wide counters.
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.agent_stats())
}

/// Every registered agent.
pub async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.agents())
}

/// Register or re-register an agent. Responds 201 with the stored agent.
pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(descriptor): Json<AgentDescriptor>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state.orchestrator.register_agent(descriptor).await?;
    info!(agent_id = %agent.id, transport = %agent.transport, "Agent registered over HTTP");
    Ok((StatusCode::CREATED, Json(agent)))
}

/// Remove an agent; its open assignments go back to the pending queue.
pub async fn unregister_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state.orchestrator.unregister_agent(&agent_id).await?;
    Ok(Json(agent))
}

/// Optional heartbeat body.
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatBody {
    /// Status the agent reports about itself.
    #[serde(default)]
    pub status: Option<AgentStatus>,
}

/// An empty body is a plain liveness ping.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let hb = if body.iter().all(u8::is_ascii_whitespace) {
        HeartbeatBody::default()
    } else {
        serde_json::from_slice::<HeartbeatBody>(&body)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let agent = state.orchestrator.heartbeat(&agent_id, hb.status).await?;
    Ok(Json(agent))
}

/// Query for [`fetch_tasks`].
#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    /// Maximum envelopes to return.
    pub limit: Option<usize>,
}

/// Drain up to `limit` queued payloads for a polling agent.
pub async fn fetch_tasks(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(q): Query<FetchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_FETCH_LIMIT);
    let envelopes = state.orchestrator.fetch_tasks(&agent_id, limit)?;
    Ok(Json(envelopes))
}

/// Body is the agent's raw Sentinel reply.
pub async fn submit_response(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .orchestrator
        .process_agent_response(&body, &agent_id)
        .await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}
