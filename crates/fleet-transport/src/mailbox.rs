use crate::transport::Envelope;
use fleet_core::{FleetError, FleetResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Slot {
    outbound: VecDeque<Envelope>,
    inbound: VecDeque<String>,
    notify: Arc<Notify>,
}

/// Per-agent outbound task queue plus inbound response queue.
///
/// Outbound envelopes wait here until the agent fetches them; raw agent
/// replies wait here until the dispatcher's `receive` consumes them. A slot
/// exists only while something was enqueued for or pushed by the agent and
/// is removed by [`Mailbox::clear`].
#[derive(Default)]
pub struct Mailbox {
    slots: Mutex<HashMap<String, Slot>>,
    /// Signalled whenever a response is pushed, for receivers that found no slot.
    arrivals: Notify,
}

impl Mailbox {
    /// Empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an envelope for its agent to fetch.
    pub fn enqueue(&self, envelope: Envelope) {
        let mut slots = self.slots.lock();
        slots
            .entry(envelope.agent_id.clone())
            .or_default()
            .outbound
            .push_back(envelope);
    }

    /// Take up to `limit` pending envelopes for `agent_id`, oldest first.
    pub fn fetch(&self, agent_id: &str, limit: usize) -> Vec<Envelope> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(agent_id) else {
            return Vec::new();
        };
        let n = limit.min(slot.outbound.len());
        slot.outbound.drain(..n).collect()
    }

    /// Store a raw response from the agent and wake one waiting receiver.
    pub fn push_response(&self, agent_id: &str, raw: impl Into<String>) {
        let notify = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(agent_id.to_string()).or_default();
            slot.inbound.push_back(raw.into());
            slot.notify.clone()
        };
        notify.notify_one();
        self.arrivals.notify_waiters();
    }

    /// Wait up to `timeout` for the next response from `agent_id`.
    ///
    /// Fails with `Transport` when the agent's slot is cleared while waiting.
    pub async fn next_response(&self, agent_id: &str, timeout: Duration) -> FleetResult<String> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let mut had_slot = false;
        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let slot_notify = {
                let mut slots = self.slots.lock();
                match slots.get_mut(agent_id) {
                    Some(slot) => {
                        if let Some(raw) = slot.inbound.pop_front() {
                            return Ok(raw);
                        }
                        had_slot = true;
                        Some(slot.notify.clone())
                    }
                    None if had_slot => {
                        return Err(FleetError::Transport(format!(
                            "mailbox for agent '{agent_id}' is closed"
                        )));
                    }
                    None => None,
                }
            };

            let woken = async {
                match slot_notify {
                    Some(notify) => notify.notified().await,
                    None => arrival.await,
                }
            };
            let expired = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, woken).await.is_err(),
                None => {
                    woken.await;
                    false
                }
            };
            if expired {
                return Err(FleetError::Timeout(format!(
                    "no response from agent '{agent_id}' within {}ms",
                    timeout.as_millis()
                )));
            }
        }
    }

    /// Drop the agent's slot with everything queued in it. Waiting receivers
    /// fail with a closed error.
    pub fn clear(&self, agent_id: &str) -> usize {
        let Some(slot) = self.slots.lock().remove(agent_id) else {
            return 0;
        };
        slot.notify.notify_waiters();
        slot.notify.notify_one();
        slot.outbound.len()
    }

    /// Agents that currently have a slot.
    pub fn agent_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of envelopes waiting to be fetched by `agent_id`.
    pub fn pending(&self, agent_id: &str) -> usize {
        self.slots
            .lock()
            .get(agent_id)
            .map_or(0, |slot| slot.outbound.len())
    }
}
