#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use fleet_core::*;
use fleet_orchestrator::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval_ms: 10,
        ..OrchestratorConfig::default()
    }
}

fn ctx() -> ProjectContext {
    ProjectContext::new("storefront")
}

fn frontend(id: &str) -> Task {
    Task::new(id, format!("Build {id} page"), TaskType::Frontend)
}

fn done(task_id: &str) -> String {
    AgentResponse::new(task_id, ResponseStatus::Done).to_text()
}

fn assert_capacity_invariant(orch: &Orchestrator) {
    for agent in orch.agents() {
        assert!(
            agent.current_tasks.len() <= agent.max_concurrent_tasks,
            "{} over capacity",
            agent.id
        );
        if agent.status.is_online() {
            assert_eq!(
                agent.status == AgentStatus::Busy,
                agent.current_tasks.len() == agent.max_concurrent_tasks,
                "{} busy flag out of sync",
                agent.id
            );
        }
    }
}

async fn wait_for_envelopes(orch: &Orchestrator, agent_id: &str) -> Vec<fleet_transport::Envelope> {
    for _ in 0..200 {
        let fetched = orch.fetch_tasks(agent_id, 10).unwrap();
        if !fetched.is_empty() {
            return fetched;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no payload reached {agent_id}");
}

// ---------------------------------------------------------------------------
// 1. A busy fleet queues work and drains it when capacity frees up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_task_dispatched_after_completion() {
    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]).with_max_tasks(1))
        .await
        .unwrap();

    let first = orch.dispatch_task(frontend("t1"), ctx(), None).await.unwrap().unwrap();
    assert_eq!(first.agent_id, "a1");
    assert_eq!(orch.agent("a1").unwrap().status, AgentStatus::Busy);

    assert!(orch.dispatch_task(frontend("t2"), ctx(), None).await.unwrap().is_none());
    assert_eq!(orch.pending_tasks().len(), 1);
    assert_capacity_invariant(&orch);

    let outcome = orch.process_agent_response(&done("t1"), "a1").await.unwrap();
    assert_eq!(outcome, ResponseOutcome::Completed);

    let agent = orch.agent("a1").unwrap();
    assert_eq!(agent.current_tasks, vec!["t2"]);
    assert_eq!(agent.status, AgentStatus::Busy);
    assert!(orch.pending_tasks().is_empty());

    let payloads = orch.fetch_tasks("a1", 10).unwrap();
    assert_eq!(payloads.len(), 2);
    assert!(payloads[1].payload.contains("TASK_ID: t2"));

    orch.process_agent_response(&done("t2"), "a1").await.unwrap();
    assert_eq!(orch.agent("a1").unwrap().status, AgentStatus::Available);
    assert_capacity_invariant(&orch);
}

// ---------------------------------------------------------------------------
// 2. Equal candidates: the earliest registration wins
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tie_goes_to_first_registered() {
    let orch = Orchestrator::new(config()).unwrap();
    for id in ["a1", "a2"] {
        orch.register_agent(AgentDescriptor::new(id, vec![Capability::Frontend]).with_max_tasks(1))
            .await
            .unwrap();
    }

    let ticket = orch.assign_task(frontend("t1"), ctx(), None).unwrap().unwrap();
    assert_eq!(ticket.assignment.agent_id, "a1");

    let ticket = orch.assign_task(frontend("t2"), ctx(), None).unwrap().unwrap();
    assert_eq!(ticket.assignment.agent_id, "a2");
}

#[test]
fn selector_is_deterministic() {
    let registry = AgentRegistry::new();
    registry
        .register(AgentDescriptor::new("ui", vec![Capability::Frontend]).with_max_tasks(4))
        .unwrap();
    registry
        .register(AgentDescriptor::new("full", vec![Capability::Frontend, Capability::Backend]).with_max_tasks(2))
        .unwrap();
    registry
        .register(AgentDescriptor::new("any", vec![Capability::General]))
        .unwrap();
    assert!(registry.reserve("ui", "busy-1"));

    let selector = Selector::new(SelectionStrategy::CapabilityBased, Arc::new(KeywordMatcher));
    let task = frontend("t1").with_tags(vec!["react".into()]);
    let candidates: Vec<Candidate> = registry.list().into_iter().map(Candidate::new).collect();

    let first = selector.select(&task, Some("storefront"), None, &candidates).unwrap();
    for _ in 0..20 {
        assert_eq!(
            selector.select(&task, Some("storefront"), None, &candidates),
            Some(first.clone())
        );
    }
}

// ---------------------------------------------------------------------------
// 3. A silent agent goes offline and its work returns to the queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_agent_work_is_requeued() {
    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Backend]).with_max_tasks(2))
        .await
        .unwrap();
    let t1 = orch
        .dispatch_task(Task::new("t1", "Orders API", TaskType::Backend), ctx(), None)
        .await
        .unwrap()
        .unwrap();
    let t2 = orch
        .dispatch_task(Task::new("t2", "Billing API", TaskType::Backend), ctx(), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orch.agent("a1").unwrap().current_tasks.len(), 2);

    let start = orch.agent("a1").unwrap().last_heartbeat;
    let at = |secs: i64| start + chrono::Duration::seconds(secs);
    assert!(orch.sweep_liveness_at(at(61)).await.is_empty());
    assert!(orch.sweep_liveness_at(at(91)).await.is_empty());
    let ejected = orch.sweep_liveness_at(at(136)).await;
    assert_eq!(ejected.len(), 1);
    assert_eq!(ejected[0].missed, 3);

    let agent = orch.agent("a1").unwrap();
    assert_eq!(agent.status, AgentStatus::Offline);
    assert_eq!(agent.missed_heartbeats, 0);
    assert!(agent.current_tasks.is_empty());

    let pending: Vec<String> = orch
        .pending_tasks()
        .into_iter()
        .map(|e| e.item.task.id)
        .collect();
    assert_eq!(pending, vec!["t1", "t2"]);
    for id in [t1.id, t2.id] {
        let a = orch.assignment(id).unwrap();
        assert!(a.closed && a.requeued);
    }

    // Coming back picks the work up again.
    orch.heartbeat("a1", None).await.unwrap();
    assert!(orch.pending_tasks().is_empty());
    assert_eq!(orch.agent("a1").unwrap().current_tasks.len(), 2);
    assert_capacity_invariant(&orch);
}

// ---------------------------------------------------------------------------
// 4. An unreachable HTTP callback falls back to polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_callback_failure_falls_back_to_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(
        AgentDescriptor::new("hooked", vec![Capability::Testing])
            .with_transport(TransportKind::HttpCallback, Some(format!("{}/hook", server.uri())))
            .with_secret("s3cret"),
    )
    .await
    .unwrap();

    let runner = orch.clone();
    let execution = tokio::spawn(async move {
        runner
            .execute_task(
                Task::new("t1", "Regression suite", TaskType::Testing),
                ctx(),
                ExecutionOptions::default().with_timeout(Duration::from_secs(5)),
            )
            .await
    });

    let envelopes = wait_for_envelopes(&orch, "hooked").await;
    assert!(envelopes[0].payload.contains("TASK_ID: t1"));
    orch.submit_response("hooked", done("t1")).unwrap();

    let result = execution.await.unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.agent_id.as_deref(), Some("hooked"));
    assert!(!server.received_requests().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// 5. Invalid input fails fast without side effects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_task_id_is_rejected() {
    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Backend]))
        .await
        .unwrap();

    let result = orch
        .execute_task(
            Task::new("", "Nameless", TaskType::Backend),
            ctx(),
            ExecutionOptions::default(),
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error_kind, Some(ErrorKind::Validation));
    assert_eq!(result.attempts, 0);
    assert!(orch.assignments().is_empty());
    let agent = orch.agent("a1").unwrap();
    assert!(agent.current_tasks.is_empty());
    assert_eq!(agent.status, AgentStatus::Available);
}

// ---------------------------------------------------------------------------
// 6. Duplicate responses and the completion callback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_done_fires_callback_once() {
    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    orch.register_task_completion_callback("t1", move |completion| {
        assert!(completion.success);
        assert_eq!(completion.details.as_deref(), Some("merged"));
        seen.fetch_add(1, Ordering::SeqCst);
    });

    orch.dispatch_task(frontend("t1"), ctx(), None).await.unwrap();
    let reply = "TASK_ID: t1\nSTATUS: DONE\nDETAILS: merged\n";
    for _ in 0..3 {
        orch.process_agent_response(reply, "a1").await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.agent("a1").unwrap().performance.tasks_completed, 1);
}

// ---------------------------------------------------------------------------
// 7. Concurrent dispatch never overfills an agent
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_respects_capacity() {
    let orch = Orchestrator::new(config()).unwrap();
    for (id, max) in [("a1", 1), ("a2", 2), ("a3", 3)] {
        orch.register_agent(AgentDescriptor::new(id, vec![Capability::Frontend]).with_max_tasks(max))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.dispatch_task(frontend(&format!("t{i}")), ctx(), None).await })
        })
        .collect();
    let mut assigned = 0;
    for h in handles {
        if h.await.unwrap().unwrap().is_some() {
            assigned += 1;
        }
    }

    assert_eq!(assigned, 6);
    assert_eq!(orch.pending_tasks().len(), 6);
    assert_capacity_invariant(&orch);
    let stats = orch.agent_stats();
    assert_eq!(stats.tasks_in_flight, 6);
    assert_eq!(stats.busy_agents, 3);

    let open: Vec<String> = orch
        .assignments()
        .into_iter()
        .filter(|a| a.is_active())
        .map(|a| a.task_id)
        .collect();
    let unique: HashSet<&String> = open.iter().collect();
    assert_eq!(unique.len(), open.len());
}

// ---------------------------------------------------------------------------
// 8. Heartbeat tolerance widens monotonically and is capped
// ---------------------------------------------------------------------------

#[test]
fn backoff_is_non_decreasing() {
    let interval = Duration::from_secs(30);
    let timeouts: Vec<Duration> = (0..10).map(|k| adaptive_timeout(interval, 2.0, k)).collect();
    assert!(timeouts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(timeouts[5], timeouts[9]);
}

// ---------------------------------------------------------------------------
// 9. Status changes reach the external propagator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    tasks: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl StatusPropagator for Recorder {
    async fn propagate_status_change(&self, _: &str, _: AgentStatus, _: &str) -> FleetResult<()> {
        Err(FleetError::Transport("registry offline".into()))
    }

    async fn propagate_task_status_change(
        &self,
        _agent_id: &str,
        task_id: &str,
        status: &str,
        _source: &str,
    ) -> FleetResult<()> {
        self.tasks.lock().push((task_id.to_string(), status.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn task_status_changes_are_propagated() {
    let recorder = Arc::new(Recorder::default());
    let orch = Orchestrator::builder(config())
        .with_propagator(recorder.clone())
        .build()
        .unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]))
        .await
        .unwrap();
    orch.dispatch_task(frontend("t1"), ctx(), None).await.unwrap();
    orch.process_agent_response(&done("t1"), "a1").await.unwrap();

    for _ in 0..100 {
        if recorder.tasks.lock().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let seen = recorder.tasks.lock().clone();
    assert!(seen.contains(&("t1".to_string(), "assigned".to_string())));
    assert!(seen.contains(&("t1".to_string(), "completed".to_string())));
}

// ---------------------------------------------------------------------------
// 10. A failed push is retried on another agent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pushed_failure_moves_task_to_another_agent() {
    let orch = Orchestrator::new(config()).unwrap();
    for id in ["a1", "a2"] {
        orch.register_agent(AgentDescriptor::new(id, vec![Capability::Frontend]).with_max_tasks(1))
            .await
            .unwrap();
    }
    let assignment = orch.dispatch_task(frontend("t1"), ctx(), None).await.unwrap().unwrap();
    assert_eq!(assignment.agent_id, "a1");

    let reply = "TASK_ID: t1\nSTATUS: FAILED\nMESSAGE: build broke\n";
    let outcome = orch.process_agent_response(reply, "a1").await.unwrap();
    assert_eq!(outcome, ResponseOutcome::Retried);

    let retried = orch.assignment(assignment.id).unwrap();
    assert_eq!(retried.attempts, 2);
    // a1 now has a failure on record; a2 still scores as a fresh agent.
    assert_eq!(retried.agent_id, "a2");
    assert_eq!(retried.last_error.as_deref(), Some("agent reported failure: build broke"));
    assert!(orch.agent("a1").unwrap().current_tasks.is_empty());

    // The old agent can no longer answer for the task.
    let stale = orch.process_agent_response(&done("t1"), "a1").await.unwrap();
    assert_eq!(stale, ResponseOutcome::Ignored);
}

// ---------------------------------------------------------------------------
// 11. Re-registration cannot shrink capacity below the held load
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reregistration_below_held_load_is_rejected() {
    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]).with_max_tasks(3))
        .await
        .unwrap();
    for id in ["t1", "t2", "t3"] {
        orch.dispatch_task(frontend(id), ctx(), None).await.unwrap().unwrap();
    }

    let err = orch
        .register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]).with_max_tasks(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_capacity_invariant(&orch);

    let a1 = orch.agent("a1").unwrap();
    assert_eq!(a1.max_concurrent_tasks, 3);
    assert_eq!(a1.current_tasks.len(), 3);
    assert_eq!(a1.status, AgentStatus::Busy);
}

// ---------------------------------------------------------------------------
// 12. An agent that reports itself offline or in error gives its work back
// ---------------------------------------------------------------------------

#[tokio::test]
async fn self_reported_offline_requeues_work() {
    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]))
        .await
        .unwrap();
    let assignment = orch.dispatch_task(frontend("t1"), ctx(), None).await.unwrap().unwrap();

    let a1 = orch.heartbeat("a1", Some(AgentStatus::Offline)).await.unwrap();
    assert_eq!(a1.status, AgentStatus::Offline);
    assert!(a1.current_tasks.is_empty());
    let pending = orch.pending_tasks();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].item.task_id(), "t1");
    assert!(pending[0].requeued);
    assert!(orch.assignment(assignment.id).unwrap().closed);

    // Later sweeps leave the offline agent alone and the task queued.
    let later = chrono::Utc::now() + chrono::Duration::days(1);
    for _ in 0..10 {
        assert!(orch.sweep_liveness_at(later).await.is_empty());
    }
    assert_eq!(orch.pending_tasks().len(), 1);

    // Coming back picks the task up again.
    orch.heartbeat("a1", None).await.unwrap();
    assert!(orch.pending_tasks().is_empty());
    assert_eq!(orch.agent("a1").unwrap().current_tasks, vec!["t1"]);
    assert_capacity_invariant(&orch);
}

#[tokio::test]
async fn self_reported_error_requeues_to_healthy_agent() {
    let orch = Orchestrator::new(config()).unwrap();
    for id in ["a1", "a2"] {
        orch.register_agent(AgentDescriptor::new(id, vec![Capability::Frontend]))
            .await
            .unwrap();
    }
    let first = orch.dispatch_task(frontend("t1"), ctx(), None).await.unwrap().unwrap();
    assert_eq!(first.agent_id, "a1");

    let a1 = orch.heartbeat("a1", Some(AgentStatus::Error)).await.unwrap();
    assert_eq!(a1.status, AgentStatus::Error);
    assert!(a1.current_tasks.is_empty());

    // The drain after the requeue hands t1 to a2.
    assert!(orch.pending_tasks().is_empty());
    assert_eq!(orch.agent("a2").unwrap().current_tasks, vec!["t1"]);
    assert_capacity_invariant(&orch);
}

// ---------------------------------------------------------------------------
// 13. Extreme timeouts saturate instead of overflowing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn huge_execution_timeout_completes_normally() {
    let orch = Orchestrator::new(config()).unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]))
        .await
        .unwrap();

    let runner = orch.clone();
    let execution = tokio::spawn(async move {
        runner
            .execute_task(
                frontend("t1"),
                ctx(),
                ExecutionOptions::default().with_timeout(Duration::MAX),
            )
            .await
    });
    wait_for_envelopes(&orch, "a1").await;
    orch.submit_response("a1", done("t1")).unwrap();

    let result = execution.await.unwrap();
    assert!(result.success, "{result:?}");
}

#[tokio::test]
async fn unbounded_base_timeout_is_a_config_error() {
    let err = Orchestrator::new(OrchestratorConfig {
        base_timeout_secs: u64::MAX,
        ..config()
    })
    .err()
    .unwrap();
    assert!(matches!(err, FleetError::Config(_)));

    // The largest accepted base, scaled for a critical task, still assigns.
    let orch = Orchestrator::new(OrchestratorConfig {
        base_timeout_secs: fleet_orchestrator::config::MAX_PERIOD_SECS,
        ..config()
    })
    .unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]))
        .await
        .unwrap();
    let task = frontend("t1")
        .with_estimate(40.0)
        .with_priority(TaskPriority::Urgent)
        .with_dependencies(vec!["d1".into(), "d2".into(), "d3".into()]);
    let ticket = orch.assign_task(task, ctx(), None).unwrap().unwrap();
    assert!(ticket.assignment.expected_completion_at > ticket.assignment.assigned_at);
}

// ---------------------------------------------------------------------------
// 14. An id-less reply is not guessed when the agent holds several tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idless_reply_with_several_open_tasks_is_not_credited() {
    let orch = Orchestrator::new(OrchestratorConfig {
        max_retries: 1,
        ..config()
    })
    .unwrap();
    orch.register_agent(AgentDescriptor::new("a1", vec![Capability::Frontend]).with_max_tasks(2))
        .await
        .unwrap();

    let spawn = |id: &'static str| {
        let runner = orch.clone();
        tokio::spawn(async move {
            runner
                .execute_task(
                    frontend(id),
                    ctx(),
                    ExecutionOptions::default().with_timeout(Duration::from_millis(400)),
                )
                .await
        })
    };
    let first = spawn("t1");
    let second = spawn("t2");

    let mut delivered = 0;
    while delivered < 2 {
        delivered += wait_for_envelopes(&orch, "a1").await.len();
    }

    // Pushed directly it is refused as ambiguous.
    let err = orch.process_agent_response("STATUS: DONE", "a1").await.unwrap_err();
    assert!(matches!(err, FleetError::Protocol(_)));

    // Through the polled inbox it is dropped rather than credited to t1.
    orch.submit_response("a1", "STATUS: DONE").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    orch.submit_response("a1", done("t2")).unwrap();

    let r1 = first.await.unwrap();
    let r2 = second.await.unwrap();
    assert_eq!(r2.status, ExecutionStatus::Completed);
    assert_eq!(r1.status, ExecutionStatus::Timeout);
    assert!(!r1.success);
}
