use crate::middleware::{auth_middleware, AuthConfig};
use crate::routes;
use crate::ws::ws_handler;
use axum::{
    middleware as axum_mw,
    routing::{delete, get, post},
    Router,
};
use fleet_orchestrator::Orchestrator;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    /// The engine every handler talks to.
    pub orchestrator: Arc<Orchestrator>,
}

/// The agent-facing gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth.
    pub fn build(orchestrator: Arc<Orchestrator>) -> Router {
        Self::build_with_auth(orchestrator, AuthConfig::default())
    }

    /// Build the gateway. `/health` stays reachable without a key.
    pub fn build_with_auth(orchestrator: Arc<Orchestrator>, auth: AuthConfig) -> Router {
        let state = Arc::new(AppState { orchestrator });

        let api = Router::new()
            .route("/stats", get(routes::stats))
            .route(
                "/agents",
                get(routes::list_agents).post(routes::register_agent),
            )
            .route("/agents/{id}", delete(routes::unregister_agent))
            .route("/agents/{id}/heartbeat", post(routes::heartbeat))
            .route("/agents/{id}/tasks", get(routes::fetch_tasks))
            .route("/agents/{id}/responses", post(routes::submit_response))
            .route("/agents/{id}/ws", get(ws_handler))
            .with_state(state);

        let api = if auth.is_enabled() {
            api.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            api
        };

        Router::new()
            .route("/health", get(routes::health))
            .merge(api)
    }
}
