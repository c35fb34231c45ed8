use crate::registry::AgentRegistry;
use chrono::{DateTime, Utc};
use fleet_core::AgentStatus;
use std::time::Duration;
use tracing::{debug, warn};

/// Misses beyond this no longer widen the tolerance.
pub const MAX_BACKOFF_STEPS: u32 = 5;

const BACKOFF_BASE: f64 = 1.5;

/// Silence tolerated before a sweep counts a miss:
/// `interval × multiplier × 1.5^min(missed, 5)`, saturating at `Duration::MAX`.
pub fn adaptive_timeout(interval: Duration, multiplier: f64, missed: u32) -> Duration {
    let steps = missed.min(MAX_BACKOFF_STEPS) as i32;
    let secs = interval.as_secs_f64() * multiplier * BACKOFF_BASE.powi(steps);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Heartbeat tolerance settings.
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    /// Expected heartbeat period.
    pub interval: Duration,
    /// Slack factor on the period.
    pub tolerance_multiplier: f64,
    /// Missed sweeps before ejection.
    pub max_missed: u32,
}

impl LivenessPolicy {
    /// Allowed silence after `missed` misses.
    pub fn timeout_for(&self, missed: u32) -> Duration {
        adaptive_timeout(self.interval, self.tolerance_multiplier, missed)
    }
}

/// An agent a sweep just took offline.
#[derive(Debug, Clone, PartialEq)]
pub struct Ejection {
    /// Ejected agent.
    pub agent_id: String,
    /// Tasks the agent held when it went offline.
    pub held_tasks: Vec<String>,
    /// Sweeps missed at ejection.
    pub missed: u32,
}

/// Periodic heartbeat check over the registry.
pub struct LivenessMonitor {
    policy: LivenessPolicy,
}

impl LivenessMonitor {
    /// Monitor applying `policy`.
    pub fn new(policy: LivenessPolicy) -> Self {
        Self { policy }
    }

    /// Active policy.
    pub fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    /// Count a miss for every silent agent and take offline those that
    /// reached the limit. Their miss counters reset on ejection.
    pub fn sweep(&self, registry: &AgentRegistry, now: DateTime<Utc>) -> Vec<Ejection> {
        let mut ejected = Vec::new();
        for handle in registry.handles() {
            let mut agent = handle.lock();
            if agent.status == AgentStatus::Offline {
                continue;
            }
            let silent = agent.heartbeat_age(now).to_std().unwrap_or_default();
            let tolerance = self.policy.timeout_for(agent.missed_heartbeats);
            if silent <= tolerance {
                continue;
            }

            agent.missed_heartbeats += 1;
            debug!(
                agent_id = %agent.id,
                missed = agent.missed_heartbeats,
                silent_secs = silent.as_secs(),
                tolerance_secs = tolerance.as_secs(),
                "Heartbeat missed"
            );
            if agent.missed_heartbeats >= self.policy.max_missed {
                let missed = agent.missed_heartbeats;
                agent.status = AgentStatus::Offline;
                agent.missed_heartbeats = 0;
                warn!(agent_id = %agent.id, missed, held = agent.current_tasks.len(), "Agent marked offline");
                ejected.push(Ejection {
                    agent_id: agent.id.clone(),
                    held_tasks: agent.current_tasks.clone(),
                    missed,
                });
            }
        }
        ejected
    }
}
