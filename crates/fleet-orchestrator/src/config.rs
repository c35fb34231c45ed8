use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for every interval, timeout and retention setting (one year).
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 3600;

/// Upper bound for `tolerance_multiplier`.
pub const MAX_TOLERANCE_MULTIPLIER: f64 = 100.0;

/// How the selector picks among eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Capability match first, then weighted scoring.
    #[default]
    CapabilityBased,
    /// First eligible agent in registration order.
    RoundRobin,
    /// Highest performance score, ignoring capabilities.
    PerformanceBased,
    /// Lowest load ratio, ignoring capabilities.
    LeastLoaded,
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SelectionStrategy::CapabilityBased => "capability_based",
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::PerformanceBased => "performance_based",
            SelectionStrategy::LeastLoaded => "least_loaded",
        };
        f.write_str(s)
    }
}

/// Orchestrator tuning. Every field has a default so partial TOML works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How the selector picks among candidates.
    pub selection_strategy: SelectionStrategy,
    /// Attempts allowed per task, including the first.
    pub max_retries: u32,
    /// Expected seconds between heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Slack applied to the heartbeat interval before an agent counts as missed.
    pub tolerance_multiplier: f64,
    /// Missed sweeps before an agent is marked offline.
    pub max_missed_heartbeats: u32,
    /// Heartbeat age beyond which a transport counts as unreachable.
    pub liveness_window_secs: u64,
    /// Monitor poll period in milliseconds.
    pub poll_interval_ms: u64,
    /// Execution timeout for a simple task; scaled by complexity.
    pub base_timeout_secs: u64,
    /// Seconds between pending queue drains.
    pub queue_drain_interval_secs: u64,
    /// How long finished execution results and closed assignments are kept.
    pub result_retention_secs: u64,
    /// Per-request timeout for HTTP callback delivery.
    pub http_callback_timeout_secs: u64,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            selection_strategy: SelectionStrategy::default(),
            max_retries: 3,
            heartbeat_interval_secs: 30,
            tolerance_multiplier: 2.0,
            max_missed_heartbeats: 3,
            liveness_window_secs: 90,
            poll_interval_ms: 2000,
            base_timeout_secs: 300,
            queue_drain_interval_secs: 10,
            result_retention_secs: 3600,
            http_callback_timeout_secs: 10,
            event_buffer: 256,
        }
    }
}

impl OrchestratorConfig {
    /// Reject values that would stall loops or disable retries entirely.
    pub fn validate(&self) -> FleetResult<()> {
        let secs_ok = |v: u64| v > 0 && v <= MAX_PERIOD_SECS;
        let checks: [(&str, bool); 11] = [
            ("max_retries", self.max_retries >= 1),
            ("heartbeat_interval_secs", secs_ok(self.heartbeat_interval_secs)),
            ("max_missed_heartbeats", self.max_missed_heartbeats >= 1),
            ("liveness_window_secs", secs_ok(self.liveness_window_secs)),
            (
                "poll_interval_ms",
                self.poll_interval_ms > 0 && self.poll_interval_ms / 1000 <= MAX_PERIOD_SECS,
            ),
            ("base_timeout_secs", secs_ok(self.base_timeout_secs)),
            ("queue_drain_interval_secs", secs_ok(self.queue_drain_interval_secs)),
            ("result_retention_secs", self.result_retention_secs <= MAX_PERIOD_SECS),
            ("http_callback_timeout_secs", self.http_callback_timeout_secs <= MAX_PERIOD_SECS),
            ("event_buffer", self.event_buffer > 0),
            (
                "tolerance_multiplier",
                self.tolerance_multiplier.is_finite()
                    && self.tolerance_multiplier > 0.0
                    && self.tolerance_multiplier <= MAX_TOLERANCE_MULTIPLIER,
            ),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(FleetError::Config(format!(
                    "orchestrator.{field} has an invalid value"
                )));
            }
        }
        Ok(())
    }

    /// `heartbeat_interval_secs` as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// `liveness_window_secs` as a duration.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    /// `poll_interval_ms` as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `base_timeout_secs` as a duration.
    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.base_timeout_secs)
    }

    /// `queue_drain_interval_secs` as a duration.
    pub fn queue_drain_interval(&self) -> Duration {
        Duration::from_secs(self.queue_drain_interval_secs)
    }

    /// `result_retention_secs` as a duration.
    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    /// `http_callback_timeout_secs` as a duration.
    pub fn http_callback_timeout(&self) -> Duration {
        Duration::from_secs(self.http_callback_timeout_secs)
    }
}
