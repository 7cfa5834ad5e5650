//! End-to-end coordination flows: objective decomposition, capability-based
//! distribution and timeout recovery, all over the in-memory directory and
//! a recording dispatch channel.

use std::sync::Arc;
use std::time::Duration;

use agentmesh::config::{DistributionConfig, MeshConfig, ScoringConfig};
use agentmesh::coordinator::Coordinator;
use agentmesh::decompose::{ComplexityClass, Priority, SubTaskStatus};
use agentmesh::directory::{AgentInfo, AgentStatus, InMemoryDirectory};
use agentmesh::dispatch::{NullMirror, RecordingChannel};
use agentmesh::distribution::{AssignmentStatus, TaskDistributor, TaskRequest};
use agentmesh::workflow::WorkflowStatus;

/// Opt-in log output: RUST_LOG=agentmesh=debug cargo test -- --nocapture
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn agent(id: &str, capabilities: &[&str]) -> AgentInfo {
    AgentInfo::new(
        id,
        capabilities.iter().map(|s| s.to_string()).collect(),
        AgentStatus::Idle,
    )
}

fn coordinator_rig() -> (Arc<Coordinator>, Arc<InMemoryDirectory>, Arc<RecordingChannel>) {
    let directory = InMemoryDirectory::shared();
    let channel = RecordingChannel::shared();
    let coordinator = Coordinator::new(
        MeshConfig::default(),
        directory.clone(),
        channel.clone(),
        Arc::new(NullMirror),
    );
    (coordinator, directory, channel)
}

/// Report success for every currently-assigned subtask of a workflow.
async fn complete_assigned(coordinator: &Arc<Coordinator>, workflow_id: &str) -> usize {
    let Some(decomposition) = coordinator.decomposer().get(workflow_id) else {
        return 0;
    };
    let mut completed = 0;
    for subtask in &decomposition.subtasks {
        if coordinator.distributor().task_status(&subtask.id) == Some(SubTaskStatus::Assigned) {
            coordinator
                .distributor()
                .report_completion(&subtask.id, true, 5_000)
                .await
                .unwrap();
            completed += 1;
        }
    }
    completed
}

#[tokio::test(start_paused = true)]
async fn governance_workshop_runs_to_completion_on_specialists() {
    init_tracing();
    let (coordinator, directory, _channel) = coordinator_rig();
    directory.upsert(agent(
        "data-specialist",
        &["assess-data-quality", "analyze-requirements", "analyze-data"],
    ));
    directory.upsert(agent(
        "infra-specialist",
        &["provision-infrastructure", "configure-environment"],
    ));
    directory.upsert(agent("planner", &["plan-workshop", "design-agenda"]));
    directory.upsert(agent(
        "facilitator",
        &["coordinate-participants", "schedule-sessions"],
    ));
    coordinator.start_background_loops();

    let workflow_id = coordinator
        .submit_objective(
            "run a data governance workshop for the platform team",
            ComplexityClass::Medium,
            Priority::Medium,
            vec![],
        )
        .await
        .unwrap();

    // Alternate distribution ticks with completion reports until the
    // dependency chain (analysis/infra -> planning -> coordination) drains.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        complete_assigned(&coordinator, &workflow_id).await;
        // Let the event pump feed completions into the executor.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = coordinator.workflow(&workflow_id).unwrap();
        if snapshot.status == WorkflowStatus::Completed {
            break;
        }
    }

    let snapshot = coordinator.workflow(&workflow_id).unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.completed, 4);
    assert_eq!(snapshot.failed, 0);

    // Capability match drives placement: the analysis step went to the
    // data specialist, planning to the planner.
    let decomposition = coordinator.decomposer().get(&workflow_id).unwrap();
    let analysis = decomposition.subtask_by_name("data-analysis").unwrap();
    assert_eq!(
        coordinator.distributor().assignment(&analysis.id).unwrap().agent_id,
        "data-specialist"
    );
    let planning = decomposition.subtask_by_name("planning").unwrap();
    assert_eq!(
        coordinator.distributor().assignment(&planning.id).unwrap().agent_id,
        "planner"
    );

    let metrics = coordinator.distributor().metrics();
    assert_eq!(metrics.tasks_completed, 4);
    assert_eq!(metrics.avg_completion_ms(), 5_000);
    coordinator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn timed_out_assignment_is_retried_on_a_healthier_agent() {
    init_tracing();
    let directory = InMemoryDirectory::shared();
    let channel = RecordingChannel::shared();
    let distributor = TaskDistributor::new(
        DistributionConfig::default(),
        ScoringConfig::default(),
        directory.clone(),
        channel.clone(),
        Arc::new(NullMirror),
    );
    directory.upsert(agent("agent-1", &["assess-data-quality"]));
    directory.upsert(agent("agent-2", &["assess-data-quality"]));

    distributor
        .submit(
            TaskRequest::new("t-1", "data-quality", Priority::Critical)
                .with_capabilities(["assess-data-quality"]),
        )
        .await
        .unwrap();
    let first_agent = distributor.assignment("t-1").unwrap().agent_id;

    // No completion report inside the 60s window.
    tokio::time::sleep(Duration::from_millis(61_000)).await;
    assert_eq!(distributor.metrics().timeouts, 1);
    assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Pending));
    assert!(
        distributor
            .assignment_log()
            .iter()
            .any(|a| a.status == AssignmentStatus::Failed)
    );

    // The negative sample drops the first agent out of the tie-break
    // window, so the retry lands on the other one.
    let dispatched = distributor.run_distribution_cycle().await;
    assert_eq!(dispatched, 1);
    let retry = distributor.assignment("t-1").unwrap();
    assert_eq!(retry.status, AssignmentStatus::Assigned);
    assert_ne!(retry.agent_id, first_agent);

    distributor
        .report_completion("t-1", true, 8_000)
        .await
        .unwrap();
    assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Completed));
    distributor.shutdown_timers();
}

#[tokio::test(start_paused = true)]
async fn work_waits_in_the_queue_until_an_agent_becomes_viable() {
    init_tracing();
    let (coordinator, directory, _channel) = coordinator_rig();
    coordinator.start_background_loops();

    let workflow_id = coordinator
        .submit_objective(
            "reticulate the splines",
            ComplexityClass::Medium,
            Priority::Medium,
            vec![],
        )
        .await
        .unwrap();

    // Several barren cycles with an empty pool: the task stays queued and
    // nothing fails.
    tokio::time::sleep(Duration::from_millis(10_000)).await;
    let snapshot = coordinator.workflow(&workflow_id).unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Running);
    assert_eq!(snapshot.failed, 0);
    assert_eq!(coordinator.distributor().queued_count(), 1);

    // An agent joins and the next cycle picks the task up.
    directory.upsert(agent("late-joiner", &["general-work"]));
    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(coordinator.distributor().queued_count(), 0);

    complete_assigned(&coordinator, &workflow_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        coordinator.workflow(&workflow_id).unwrap().status,
        WorkflowStatus::Completed
    );
    coordinator.shutdown();
}
