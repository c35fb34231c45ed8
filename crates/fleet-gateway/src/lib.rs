//! Agent-facing HTTP and WebSocket surface for a Fleet orchestrator.
//!
//! Agents register, heartbeat, poll queued task payloads and report their
//! Sentinel responses over plain HTTP. Push-notify and persistent-socket
//! agents additionally hold a WebSocket open to receive tasks as they are
//! dispatched.

/// Mapping of orchestrator errors to HTTP responses.
pub mod error;
/// Bearer API-key authentication.
pub mod middleware;
/// REST handlers.
pub mod routes;
/// Router assembly and shared state.
pub mod server;
/// WebSocket sessions for push and socket agents.
pub mod ws;

pub use error::ApiError;
pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
