use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Open push connections keyed by address (session id or socket id).
///
/// The gateway attaches a connection when an agent opens a WebSocket and
/// detaches it when the socket closes; delivery strategies push into it.
pub struct ConnectionHub {
    label: &'static str,
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ConnectionHub {
    /// Empty hub; `label` names it in logs.
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Register a connection, replacing any previous one at the same address.
    pub fn attach(&self, address: impl Into<String>, tx: mpsc::UnboundedSender<String>) {
        let address = address.into();
        tracing::info!(hub = self.label, address = %address, "Connection attached");
        self.connections.write().insert(address, tx);
    }

    /// Drop the connection registered under `address`.
    pub fn detach(&self, address: &str) {
        if self.connections.write().remove(address).is_some() {
            tracing::info!(hub = self.label, address = %address, "Connection detached");
        }
    }

    /// Whether a live connection exists at `address`.
    pub fn is_open(&self, address: &str) -> bool {
        self.connections
            .read()
            .get(address)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Push a message to the connection at `address`.
    pub fn push(&self, address: &str, message: &str) -> Result<(), String> {
        let tx = self
            .connections
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| format!("no open {} at '{address}'", self.label))?;
        if tx.send(message.to_string()).is_err() {
            self.detach(address);
            return Err(format!("{} '{address}' is closed", self.label));
        }
        Ok(())
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Drop every connection; receivers observe end-of-stream.
    pub fn close_all(&self) {
        let drained: Vec<String> = self.connections.write().drain().map(|(k, _)| k).collect();
        if !drained.is_empty() {
            tracing::info!(hub = self.label, count = drained.len(), "Closed all connections");
        }
    }
}
