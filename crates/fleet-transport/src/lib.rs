//! Task delivery across heterogeneous agent transports.
//!
//! Provides a uniform send/receive/reachability contract over four transport
//! kinds, each backed by an ordered [`DeliveryPlan`] of strategies. A live
//! push failing never fails a send on its own: the per-agent [`Mailbox`] is the
//! durable fallback every plan ends in.
//!
//! # Main types
//!
//! - [`Dispatcher`] — Resolves an agent's transport and runs its delivery plan.
//! - [`Mailbox`] — Per-agent outbound queue and inbound response queue.
//! - [`ConnectionHub`] — Open push sessions or sockets keyed by address.
//! - [`HttpCallbackDelivery`] — Signed HTTP POST to an agent's callback URL.
//! - [`AgentDirectory`] — Read-only view of agent endpoints the dispatcher routes on.

/// Open push connections (sessions and sockets).
pub mod connection;
/// Dispatcher and per-transport delivery plans.
pub mod dispatcher;
/// HTTP callback delivery and payload signing.
pub mod http_callback;
/// Per-agent mailboxes.
pub mod mailbox;
/// Push strategies for sessions and sockets.
pub mod push;
/// Transport contract types.
pub mod transport;

pub use connection::ConnectionHub;
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use http_callback::{sign_payload, verify_signature, CallbackBody, HttpCallbackDelivery};
pub use mailbox::Mailbox;
pub use push::{QueueDelivery, SessionPush, SocketPush};
pub use transport::{
    AgentDirectory, AgentEndpoint, Delivery, DeliveryPlan, DeliveryStrategy, Envelope, PlanStep,
    StepMode,
};
