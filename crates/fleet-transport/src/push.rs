use crate::connection::ConnectionHub;
use crate::mailbox::Mailbox;
use crate::transport::{AgentEndpoint, Delivery, DeliveryStrategy, Envelope};
use async_trait::async_trait;
use std::sync::Arc;

/// Durable delivery into the agent's mailbox.
pub struct QueueDelivery {
    mailbox: Arc<Mailbox>,
}

impl QueueDelivery {
    /// Strategy queueing into `mailbox`.
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl DeliveryStrategy for QueueDelivery {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn deliver(&self, _endpoint: &AgentEndpoint, envelope: &Envelope) -> Delivery {
        self.mailbox.enqueue(envelope.clone());
        Delivery::Queued
    }
}

/// Notification over the agent's attached push session.
///
/// Pushes only a wake-up notice; the payload itself stays in the mailbox.
pub struct SessionPush {
    sessions: Arc<ConnectionHub>,
}

impl SessionPush {
    /// Strategy pushing over `sessions`.
    pub fn new(sessions: Arc<ConnectionHub>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeliveryStrategy for SessionPush {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn deliver(&self, endpoint: &AgentEndpoint, envelope: &Envelope) -> Delivery {
        let address = endpoint.address.as_deref().unwrap_or(&endpoint.agent_id);
        let notice = serde_json::json!({
            "type": "task_available",
            "delivery_id": envelope.id,
            "agent_id": envelope.agent_id,
        });
        match self.sessions.push(address, &notice.to_string()) {
            Ok(()) => Delivery::Delivered("session"),
            Err(e) => Delivery::Failed(e),
        }
    }
}

/// Full payload push over the agent's persistent socket.
pub struct SocketPush {
    sockets: Arc<ConnectionHub>,
}

impl SocketPush {
    /// Strategy pushing over `sockets`.
    pub fn new(sockets: Arc<ConnectionHub>) -> Self {
        Self { sockets }
    }
}

#[async_trait]
impl DeliveryStrategy for SocketPush {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn deliver(&self, endpoint: &AgentEndpoint, envelope: &Envelope) -> Delivery {
        let address = endpoint.address.as_deref().unwrap_or(&endpoint.agent_id);
        let frame = serde_json::json!({
            "type": "task",
            "delivery_id": envelope.id,
            "payload": envelope.payload,
        });
        match self.sockets.push(address, &frame.to_string()) {
            Ok(()) => Delivery::Delivered("socket"),
            Err(e) => Delivery::Failed(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_core::{AgentStatus, TransportKind};
    use tokio::sync::mpsc;

    fn endpoint(kind: TransportKind, address: Option<&str>) -> AgentEndpoint {
        AgentEndpoint {
            agent_id: "a1".into(),
            transport: kind,
            address: address.map(String::from),
            callback_secret: None,
            status: AgentStatus::Available,
            last_heartbeat: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_queue_delivery_enqueues() {
        let mailbox = Arc::new(Mailbox::new());
        let q = QueueDelivery::new(mailbox.clone());
        let out = q
            .deliver(&endpoint(TransportKind::LocalQueue, None), &Envelope::new("a1", "x"))
            .await;
        assert_eq!(out, Delivery::Queued);
        assert_eq!(mailbox.pending("a1"), 1);
    }

    #[tokio::test]
    async fn test_session_push_sends_notice_without_payload() {
        let hub = ConnectionHub::new("session");
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach("sess-9", tx);

        let push = SessionPush::new(hub);
        let out = push
            .deliver(
                &endpoint(TransportKind::PushNotify, Some("sess-9")),
                &Envelope::new("a1", "secret payload"),
            )
            .await;
        assert_eq!(out, Delivery::Delivered("session"));

        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "task_available");
        assert!(msg.get("payload").is_none());
    }

    #[tokio::test]
    async fn test_socket_push_carries_payload() {
        let hub = ConnectionHub::new("socket");
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach("a1", tx);

        let push = SocketPush::new(hub);
        let out = push
            .deliver(
                &endpoint(TransportKind::PersistentSocket, None),
                &Envelope::new("a1", "TASK_ID: t1"),
            )
            .await;
        assert_eq!(out, Delivery::Delivered("socket"));

        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["payload"], "TASK_ID: t1");
    }

    #[tokio::test]
    async fn test_socket_push_without_connection_fails() {
        let push = SocketPush::new(ConnectionHub::new("socket"));
        let out = push
            .deliver(
                &endpoint(TransportKind::PersistentSocket, Some("gone")),
                &Envelope::new("a1", "x"),
            )
            .await;
        assert!(!out.is_success());
    }
}
