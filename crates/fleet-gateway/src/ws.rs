use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use fleet_core::{AgentStatus, FleetError, TransportKind};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Control frames an agent may send instead of a Sentinel reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Heartbeat {
        #[serde(default)]
        status: Option<AgentStatus>,
    },
}

/// Open a live connection for a push-notify or persistent-socket agent.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state
        .orchestrator
        .agent(&agent_id)
        .ok_or_else(|| FleetError::NotFound(format!("agent '{agent_id}' is not registered")))?;
    if !matches!(
        agent.transport,
        TransportKind::PushNotify | TransportKind::PersistentSocket
    ) {
        return Err(FleetError::Validation(format!(
            "agent '{agent_id}' uses the {} transport, which takes no live connection",
            agent.transport
        ))
        .into());
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, agent_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, agent_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let address = match state.orchestrator.attach_connection(&agent_id, tx.clone()) {
        Ok(address) => address,
        Err(e) => {
            warn!(agent_id = %agent_id, error = %e, "Rejected live connection");
            let frame = serde_json::json!({"type": "error", "error": e.to_string()});
            let _ = ws_sender.send(Message::Text(frame.to_string().into())).await;
            return;
        }
    };
    info!(agent_id = %agent_id, address = %address, "WebSocket connected");

    let welcome = serde_json::json!({
        "type": "connected",
        "agent_id": agent_id,
        "address": address,
    });
    let _ = tx.send(welcome.to_string());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let orchestrator = state.orchestrator.clone();
    let recv_agent = agent_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = handle_frame(&orchestrator, &recv_agent, text.as_str()).await;
                    if tx.send(reply.to_string()).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.orchestrator.detach_connection(&agent_id, &address);
    info!(agent_id = %agent_id, address = %address, "WebSocket disconnected");
}

async fn handle_frame(
    orchestrator: &fleet_orchestrator::Orchestrator,
    agent_id: &str,
    text: &str,
) -> serde_json::Value {
    if let Ok(ControlFrame::Heartbeat { status }) = serde_json::from_str::<ControlFrame>(text) {
        return match orchestrator.heartbeat(agent_id, status).await {
            Ok(agent) => serde_json::json!({"type": "heartbeat_ack", "status": agent.status}),
            Err(e) => serde_json::json!({"type": "error", "error": e.to_string()}),
        };
    }
    match orchestrator.process_agent_response(text, agent_id).await {
        Ok(outcome) => serde_json::json!({"type": "ack", "outcome": outcome}),
        Err(e) => serde_json::json!({
            "type": "error",
            "kind": e.kind(),
            "error": e.to_string(),
        }),
    }
}
