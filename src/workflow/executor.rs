//! Drives a decomposition through the distributor: dispatches the ready
//! set, advances on completion events and settles the workflow once every
//! branch is terminal or blocked.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decompose::{SubTask, TaskDecomposition};
use crate::distribution::{TaskDistributor, TaskEvent, TaskRequest};
use crate::error::{MeshError, Result};

use super::graph::{DagCounts, TaskDag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
}

/// Point-in-time view of one workflow.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub objective: String,
    pub status: WorkflowStatus,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct WorkflowRun {
    decomposition: TaskDecomposition,
    dag: TaskDag,
    status: WorkflowStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

pub struct WorkflowExecutor {
    distributor: Arc<TaskDistributor>,
    workflows: RwLock<HashMap<String, WorkflowRun>>,
    /// Subtask id to owning workflow id.
    task_index: RwLock<HashMap<String, String>>,
}

impl WorkflowExecutor {
    pub fn new(distributor: Arc<TaskDistributor>) -> Self {
        Self {
            distributor,
            workflows: RwLock::new(HashMap::new()),
            task_index: RwLock::new(HashMap::new()),
        }
    }

    /// Begin executing a decomposition; its workflow id is the
    /// decomposition id. Dispatches every subtask with no prerequisites.
    pub async fn start(&self, decomposition: &TaskDecomposition) -> Result<String> {
        let workflow_id = decomposition.id.clone();
        {
            let mut workflows = self.workflows.write();
            if workflows.contains_key(&workflow_id) {
                return Err(MeshError::Other(format!(
                    "workflow already started: {workflow_id}"
                )));
            }
            workflows.insert(
                workflow_id.clone(),
                WorkflowRun {
                    dag: TaskDag::from_decomposition(decomposition),
                    decomposition: decomposition.clone(),
                    status: WorkflowStatus::Running,
                    started_at: Utc::now(),
                    finished_at: None,
                },
            );
            let mut index = self.task_index.write();
            for subtask in &decomposition.subtasks {
                index.insert(subtask.id.clone(), workflow_id.clone());
            }
        }
        info!(
            workflow = %workflow_id,
            subtasks = decomposition.subtasks.len(),
            "workflow started"
        );
        self.dispatch_ready(&workflow_id).await;
        Ok(workflow_id)
    }

    /// Feed one distributor event into the owning workflow.
    pub async fn handle_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Dispatched { task_id, agent_id } => {
                self.with_workflow_of(task_id, |run| {
                    run.dag.mark_assigned(task_id, agent_id);
                });
            }
            TaskEvent::Started { task_id, .. } => {
                self.with_workflow_of(task_id, |run| {
                    run.dag.mark_in_progress(task_id);
                });
            }
            TaskEvent::Reassigned { task_id, to_agent, .. } => {
                self.with_workflow_of(task_id, |run| {
                    run.dag.mark_assigned(task_id, to_agent);
                });
            }
            TaskEvent::Completed { task_id, success, .. } => {
                self.finish_step(task_id, *success).await;
            }
            TaskEvent::TerminallyFailed { task_id } => {
                self.finish_step(task_id, false).await;
            }
        }
    }

    pub fn snapshot(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        self.workflows.read().get(workflow_id).map(|run| {
            let DagCounts {
                pending,
                running,
                completed,
                failed,
                blocked,
            } = run.dag.counts();
            WorkflowSnapshot {
                workflow_id: workflow_id.to_string(),
                objective: run.decomposition.objective.clone(),
                status: run.status,
                pending,
                running,
                completed,
                failed,
                blocked,
                started_at: run.started_at,
                finished_at: run.finished_at,
            }
        })
    }

    pub fn subtask(&self, workflow_id: &str, task_id: &str) -> Option<SubTask> {
        self.workflows
            .read()
            .get(workflow_id)
            .and_then(|run| run.dag.subtask(task_id).cloned())
    }

    pub fn running_workflows(&self) -> Vec<String> {
        self.workflows
            .read()
            .iter()
            .filter(|(_, run)| run.status == WorkflowStatus::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // Internal machinery.

    async fn finish_step(&self, task_id: &str, success: bool) {
        let workflow_id = {
            let Some(workflow_id) = self.task_index.read().get(task_id).cloned() else {
                return;
            };
            let mut workflows = self.workflows.write();
            let Some(run) = workflows.get_mut(&workflow_id) else {
                return;
            };
            run.dag.mark_finished(task_id, success, None);
            if !success {
                warn!(workflow = %workflow_id, task = task_id, "workflow step failed, blocking dependents");
            }
            workflow_id
        };
        self.dispatch_ready(&workflow_id).await;
        self.settle_if_done(&workflow_id);
    }

    /// Dispatch every newly-ready subtask of one workflow.
    async fn dispatch_ready(&self, workflow_id: &str) {
        let ready: Vec<(TaskRequest, String)> = {
            let workflows = self.workflows.read();
            let Some(run) = workflows.get(workflow_id) else {
                return;
            };
            run.dag
                .ready_set()
                .into_iter()
                .map(|subtask| {
                    let complexity =
                        (subtask.estimated_duration_minutes as f64 / 60.0).min(1.0);
                    (
                        TaskRequest::from_subtask(
                            subtask,
                            run.decomposition.priority,
                            complexity,
                        ),
                        subtask.id.clone(),
                    )
                })
                .collect()
        };
        let mut submission_failed = false;
        for (request, subtask_id) in ready {
            debug!(workflow = workflow_id, task = %subtask_id, "subtask ready");
            if let Some(run) = self.workflows.write().get_mut(workflow_id) {
                run.dag.mark_dispatched(&subtask_id);
            }
            if let Err(e) = self.distributor.submit(request).await {
                if e.is_recoverable() {
                    warn!(workflow = workflow_id, task = %subtask_id, error = %e, "subtask submission failed, retrying on the next ready pass");
                    if let Some(run) = self.workflows.write().get_mut(workflow_id) {
                        run.dag.clear_dispatched(&subtask_id);
                    }
                } else {
                    warn!(workflow = workflow_id, task = %subtask_id, error = %e, "subtask submission rejected, failing the step");
                    if let Some(run) = self.workflows.write().get_mut(workflow_id) {
                        run.dag.mark_finished(&subtask_id, false, None);
                    }
                    submission_failed = true;
                }
            }
        }
        if submission_failed {
            self.settle_if_done(workflow_id);
        }
    }

    fn settle_if_done(&self, workflow_id: &str) {
        let mut workflows = self.workflows.write();
        let Some(run) = workflows.get_mut(workflow_id) else {
            return;
        };
        if run.status == WorkflowStatus::Running && run.dag.is_settled() {
            run.status = WorkflowStatus::Completed;
            run.finished_at = Some(Utc::now());
            let counts = run.dag.counts();
            info!(
                workflow = workflow_id,
                completed = counts.completed,
                failed = counts.failed,
                blocked = counts.blocked,
                "workflow settled"
            );
        }
    }

    fn with_workflow_of(&self, task_id: &str, apply: impl FnOnce(&mut WorkflowRun)) {
        let Some(workflow_id) = self.task_index.read().get(task_id).cloned() else {
            return;
        };
        if let Some(run) = self.workflows.write().get_mut(&workflow_id) {
            apply(run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecompositionConfig, DistributionConfig, ScoringConfig};
    use crate::decompose::{ComplexityClass, Priority, TaskDecomposer};
    use crate::directory::{AgentInfo, AgentStatus, InMemoryDirectory};
    use crate::dispatch::{NullMirror, RecordingChannel};

    struct Rig {
        executor: WorkflowExecutor,
        distributor: Arc<TaskDistributor>,
        directory: Arc<InMemoryDirectory>,
        decomposer: TaskDecomposer,
    }

    fn rig() -> Rig {
        let directory = InMemoryDirectory::shared();
        let distributor = TaskDistributor::new(
            DistributionConfig::default(),
            ScoringConfig::default(),
            directory.clone(),
            RecordingChannel::shared(),
            Arc::new(NullMirror),
        );
        Rig {
            executor: WorkflowExecutor::new(distributor.clone()),
            distributor,
            directory,
            decomposer: TaskDecomposer::new(DecompositionConfig::default()),
        }
    }

    fn versatile_agent(id: &str) -> AgentInfo {
        AgentInfo::new(
            id,
            vec![
                "assess-data-quality".into(),
                "analyze-requirements".into(),
                "provision-infrastructure".into(),
                "plan-workshops".into(),
                "coordinate-sessions".into(),
                "collect-data".into(),
                "analyze-data".into(),
                "validate-findings".into(),
            ],
            AgentStatus::Idle,
        )
    }

    async fn drive_until_settled(rig: &Rig, workflow_id: &str, fail_task_suffix: Option<&str>) {
        // Pump dispatch cycles and synthetic completions until the
        // workflow stops moving.
        for _ in 0..16 {
            rig.distributor.run_distribution_cycle().await;
            let snapshot = rig.executor.snapshot(workflow_id).unwrap();
            if snapshot.status == WorkflowStatus::Completed {
                return;
            }
            // Complete whatever is currently assigned.
            let assigned: Vec<String> = rig
                .executor
                .workflows
                .read()
                .get(workflow_id)
                .map(|run| {
                    run.decomposition
                        .subtasks
                        .iter()
                        .filter(|t| {
                            rig.distributor.task_status(&t.id)
                                == Some(crate::decompose::SubTaskStatus::Assigned)
                        })
                        .map(|t| t.id.clone())
                        .collect()
                })
                .unwrap_or_default();
            for task_id in assigned {
                let success = !fail_task_suffix
                    .map(|suffix| task_id.ends_with(suffix))
                    .unwrap_or(false);
                rig.distributor
                    .report_completion(&task_id, success, 5_000)
                    .await
                    .unwrap();
                rig.executor
                    .handle_event(&TaskEvent::Completed {
                        task_id: task_id.clone(),
                        agent_id: "agent-1".into(),
                        success,
                        elapsed_ms: 5_000,
                    })
                    .await;
            }
        }
    }

    #[tokio::test]
    async fn workshop_workflow_runs_in_dependency_order() {
        let rig = rig();
        rig.directory.upsert(versatile_agent("agent-1"));
        let decomposition = rig
            .decomposer
            .decompose(
                "plan a governance workshop",
                ComplexityClass::Medium,
                Priority::Medium,
                vec![],
            )
            .unwrap();
        let workflow_id = rig.executor.start(&decomposition).await.unwrap();

        // Only the two root subtasks are submitted up front.
        let snapshot = rig.executor.snapshot(&workflow_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Running);
        assert_eq!(rig.distributor.queued_count(), 2);

        drive_until_settled(&rig, &workflow_id, None).await;

        let snapshot = rig.executor.snapshot(&workflow_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.completed, 4);
        assert_eq!(snapshot.failed, 0);
        assert!(snapshot.finished_at.is_some());
    }

    #[tokio::test]
    async fn failed_step_blocks_only_its_dependents() {
        let rig = rig();
        rig.directory.upsert(versatile_agent("agent-1"));
        let decomposition = rig
            .decomposer
            .decompose(
                "plan a governance workshop",
                ComplexityClass::Medium,
                Priority::Medium,
                vec![],
            )
            .unwrap();
        let workflow_id = rig.executor.start(&decomposition).await.unwrap();

        drive_until_settled(&rig, &workflow_id, Some(":infrastructure")).await;

        let snapshot = rig.executor.snapshot(&workflow_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        // data-analysis completes on the independent branch; planning and
        // coordination are blocked behind the failed infrastructure step.
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.blocked, 2);
    }

    #[tokio::test]
    async fn single_subtask_objective_completes_in_one_step() {
        let rig = rig();
        rig.directory.upsert(versatile_agent("agent-1"));
        let decomposition = rig
            .decomposer
            .decompose(
                "tidy the storage closet",
                ComplexityClass::Simple,
                Priority::Medium,
                vec![],
            )
            .unwrap();
        assert_eq!(decomposition.subtasks.len(), 1);
        let workflow_id = rig.executor.start(&decomposition).await.unwrap();

        drive_until_settled(&rig, &workflow_id, None).await;
        let snapshot = rig.executor.snapshot(&workflow_id).unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.completed, 1);
    }

    #[tokio::test]
    async fn started_report_moves_the_step_to_in_progress() {
        let rig = rig();
        rig.directory.upsert(versatile_agent("agent-1"));
        let decomposition = rig
            .decomposer
            .decompose(
                "tidy the storage closet",
                ComplexityClass::Simple,
                Priority::Medium,
                vec![],
            )
            .unwrap();
        let workflow_id = rig.executor.start(&decomposition).await.unwrap();
        rig.distributor.run_distribution_cycle().await;

        let task_id = decomposition.subtasks[0].id.clone();
        rig.distributor.report_started(&task_id).unwrap();
        rig.executor
            .handle_event(&TaskEvent::Started {
                task_id: task_id.clone(),
                agent_id: "agent-1".into(),
            })
            .await;

        let subtask = rig.executor.subtask(&workflow_id, &task_id).unwrap();
        assert_eq!(subtask.status, crate::decompose::SubTaskStatus::InProgress);
        assert_eq!(rig.executor.snapshot(&workflow_id).unwrap().running, 1);
    }

    #[tokio::test]
    async fn rejected_submission_fails_the_step_and_blocks_dependents() {
        let rig = rig();
        rig.directory.upsert(versatile_agent("agent-1"));
        let decomposition = rig
            .decomposer
            .decompose(
                "plan a governance workshop",
                ComplexityClass::Medium,
                Priority::Medium,
                vec![],
            )
            .unwrap();
        // Occupy the data-analysis id so the workflow's own submission is
        // rejected as a duplicate.
        let analysis_id = decomposition
            .subtasks
            .iter()
            .find(|t| t.name == "data-analysis")
            .unwrap()
            .id
            .clone();
        rig.distributor
            .submit(TaskRequest::new(&analysis_id, "occupier", Priority::Low))
            .await
            .unwrap();

        let workflow_id = rig.executor.start(&decomposition).await.unwrap();

        let snapshot = rig.executor.snapshot(&workflow_id).unwrap();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.blocked, 2);
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let rig = rig();
        let decomposition = rig
            .decomposer
            .decompose("draft a summary report", ComplexityClass::Medium, Priority::Medium, vec![])
            .unwrap();
        rig.executor.start(&decomposition).await.unwrap();
        assert!(rig.executor.start(&decomposition).await.is_err());
    }

    #[tokio::test]
    async fn unknown_task_events_are_ignored() {
        let rig = rig();
        rig.executor
            .handle_event(&TaskEvent::Completed {
                task_id: "nope".into(),
                agent_id: "agent-1".into(),
                success: true,
                elapsed_ms: 1,
            })
            .await;
        assert!(rig.executor.snapshot("nope").is_none());
    }
}
