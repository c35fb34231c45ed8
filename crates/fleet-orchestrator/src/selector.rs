use crate::capability::CapabilityMatcher;
use crate::config::SelectionStrategy;
use fleet_core::{Agent, AgentPerformance, FleetError, FleetResult, Task};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

const WEIGHT_LOAD: f64 = 0.40;
const WEIGHT_PERFORMANCE: f64 = 0.30;
const WEIGHT_RELEVANCE: f64 = 0.20;
const WEIGHT_AFFINITY: f64 = 0.10;

/// Performance score assumed for agents that have not finished a task yet.
const NEUTRAL_PERFORMANCE: f64 = 0.8;

/// An eligible agent plus the projects and epics of the work it holds.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The agent as registered.
    pub agent: Agent,
    /// Projects it is working in.
    pub projects: HashSet<String>,
    /// Epics it is working in.
    pub epics: HashSet<String>,
}

impl Candidate {
    /// Candidate with no open work.
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            projects: HashSet::new(),
            epics: HashSet::new(),
        }
    }
}

/// Why an agent was chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "score")]
pub enum SelectionReason {
    /// Highest weighted score among several capability matches.
    Scored(f64),
    /// The only capability match.
    SingleMatch,
    /// No capability match; lowest load ratio.
    LoadBalanced,
    /// Next agent in registration order.
    RoundRobin,
    /// Best success rate; carries the score.
    Performance(f64),
    /// Lowest load ratio.
    LeastLoaded,
}

/// The chosen agent and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    /// Chosen agent.
    pub agent_id: String,
    /// Why it was chosen.
    pub reason: SelectionReason,
}

impl Selection {
    /// Whether the choice was made on capability grounds and should be
    /// verified against the task type.
    pub fn is_capability_driven(&self) -> bool {
        matches!(
            self.reason,
            SelectionReason::Scored(_) | SelectionReason::SingleMatch
        )
    }
}

/// Picks the best agent for a task. Pure and deterministic over its inputs.
#[derive(Clone)]
pub struct Selector {
    strategy: SelectionStrategy,
    matcher: Arc<dyn CapabilityMatcher>,
}

impl Selector {
    /// Selector using `strategy`, with `matcher` for capability checks.
    pub fn new(strategy: SelectionStrategy, matcher: Arc<dyn CapabilityMatcher>) -> Self {
        Self { strategy, matcher }
    }

    /// Configured strategy.
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Capability matcher in use.
    pub fn matcher(&self) -> &Arc<dyn CapabilityMatcher> {
        &self.matcher
    }

    /// Choose among `candidates`, or `None` when none is eligible.
    ///
    /// Ineligible entries are ignored; ties go to the earliest registration.
    pub fn select(
        &self,
        task: &Task,
        project_id: Option<&str>,
        epic_id: Option<&str>,
        candidates: &[Candidate],
    ) -> Option<Selection> {
        let mut eligible: Vec<&Candidate> =
            candidates.iter().filter(|c| c.agent.is_eligible()).collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by_key(|c| c.agent.registration_seq);

        match self.strategy {
            SelectionStrategy::RoundRobin => Some(Selection {
                agent_id: eligible[0].agent.id.clone(),
                reason: SelectionReason::RoundRobin,
            }),
            SelectionStrategy::PerformanceBased => {
                let (best, score) = best_by(&eligible, |c| performance_score(&c.agent.performance));
                Some(Selection {
                    agent_id: best.agent.id.clone(),
                    reason: SelectionReason::Performance(score),
                })
            }
            SelectionStrategy::LeastLoaded => Some(Selection {
                agent_id: least_loaded(&eligible).agent.id.clone(),
                reason: SelectionReason::LeastLoaded,
            }),
            SelectionStrategy::CapabilityBased => {
                let matches: Vec<&Candidate> = eligible
                    .iter()
                    .copied()
                    .filter(|c| self.matcher.is_match(&c.agent.capabilities, task))
                    .collect();
                match matches.len() {
                    0 => Some(Selection {
                        agent_id: least_loaded(&eligible).agent.id.clone(),
                        reason: SelectionReason::LoadBalanced,
                    }),
                    1 => Some(Selection {
                        agent_id: matches[0].agent.id.clone(),
                        reason: SelectionReason::SingleMatch,
                    }),
                    _ => {
                        let (best, score) =
                            best_by(&matches, |c| self.score(c, task, project_id, epic_id));
                        Some(Selection {
                            agent_id: best.agent.id.clone(),
                            reason: SelectionReason::Scored(score),
                        })
                    }
                }
            }
        }
    }

    /// Weighted score of one candidate for `task`, in `[0, 1]`.
    pub fn score(
        &self,
        candidate: &Candidate,
        task: &Task,
        project_id: Option<&str>,
        epic_id: Option<&str>,
    ) -> f64 {
        let agent = &candidate.agent;
        let load = 1.0 - agent.load_ratio();
        let performance = performance_score(&agent.performance);
        let relevance = self.matcher.relevance(&agent.capabilities, task) / 100.0;
        let affinity = context_affinity(candidate, project_id, epic_id) / 100.0;

        WEIGHT_LOAD * load
            + WEIGHT_PERFORMANCE * performance
            + WEIGHT_RELEVANCE * relevance
            + WEIGHT_AFFINITY * affinity
    }

    /// Reject an agent whose capabilities do not cover `task`.
    pub fn verify(&self, agent: &Agent, task: &Task) -> FleetResult<()> {
        if self.matcher.is_match(&agent.capabilities, task) {
            Ok(())
        } else {
            Err(FleetError::Agent(format!(
                "agent '{}' cannot handle {} task '{}'",
                agent.id,
                task.task_type.as_str(),
                task.id
            )))
        }
    }
}

/// Blend of success rate and completion speed, in `[0, 1]`.
pub fn performance_score(perf: &AgentPerformance) -> f64 {
    if !perf.has_history() {
        return NEUTRAL_PERFORMANCE;
    }
    let hours = perf.average_completion_secs / 3600.0;
    let speed = 1.0 / (1.0 + hours);
    0.7 * perf.success_rate.clamp(0.0, 1.0) + 0.3 * speed
}

/// +30 when the agent already holds work from the same project, +20 for the
/// same epic.
fn context_affinity(candidate: &Candidate, project_id: Option<&str>, epic_id: Option<&str>) -> f64 {
    let mut score = 0.0;
    if project_id.is_some_and(|p| candidate.projects.contains(p)) {
        score += 30.0;
    }
    if epic_id.is_some_and(|e| candidate.epics.contains(e)) {
        score += 20.0;
    }
    f64::min(score, 100.0)
}

/// Highest `score`; the first of equals wins because the input is sorted by
/// registration and only a strictly greater score replaces the leader.
fn best_by<'a>(candidates: &[&'a Candidate], score: impl Fn(&Candidate) -> f64) -> (&'a Candidate, f64) {
    let mut best = candidates[0];
    let mut best_score = score(best);
    for &c in &candidates[1..] {
        let s = score(c);
        if s > best_score {
            best = c;
            best_score = s;
        }
    }
    (best, best_score)
}

fn least_loaded<'a>(candidates: &[&'a Candidate]) -> &'a Candidate {
    best_by(candidates, |c| -c.agent.load_ratio()).0
}
