use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{DistributionConfig, ScoringConfig};
use crate::decompose::{Priority, SubTaskStatus};
use crate::directory::{AgentDirectory, AgentInfo};
use crate::dispatch::{
    DispatchAction, DispatchChannel, StateMirror, TaskDispatch, mirror_record,
};
use crate::error::{MeshError, Result};
use crate::scoring::{
    AgentCapabilityScore, AgentLoad, CapabilityScorer, OutcomeSample, PerformanceTracker,
};
use crate::timer::TimerRegistry;

use super::queue::QueuedTask;
use super::types::{
    AssignmentStatus, DistributionMetrics, TaskAssignment, TaskEvent, TaskRequest,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct TaskState {
    request: TaskRequest,
    status: SubTaskStatus,
    retries: u32,
}

/// Owns the task queue and active assignments: picks the highest-priority
/// ready task, selects the best agent through the scorer with a
/// lowest-load tie-break, dispatches, monitors for timeout and rebalances
/// load across the pool.
pub struct TaskDistributor {
    config: DistributionConfig,
    scorer: CapabilityScorer,
    history: PerformanceTracker,
    directory: Arc<dyn AgentDirectory>,
    channel: Arc<dyn DispatchChannel>,
    mirror: Arc<dyn StateMirror>,
    queue: RwLock<Vec<QueuedTask>>,
    tasks: RwLock<HashMap<String, TaskState>>,
    /// Latest assignment per task id; superseded ones move to the log.
    assignments: RwLock<HashMap<String, TaskAssignment>>,
    assignment_log: RwLock<Vec<TaskAssignment>>,
    timers: TimerRegistry,
    metrics: RwLock<DistributionMetrics>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskDistributor {
    pub fn new(
        config: DistributionConfig,
        scoring: ScoringConfig,
        directory: Arc<dyn AgentDirectory>,
        channel: Arc<dyn DispatchChannel>,
        mirror: Arc<dyn StateMirror>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            history: PerformanceTracker::new(scoring.history_window),
            scorer: CapabilityScorer::new(scoring),
            config,
            directory,
            channel,
            mirror,
            queue: RwLock::new(Vec::new()),
            tasks: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            assignment_log: RwLock::new(Vec::new()),
            timers: TimerRegistry::new(),
            metrics: RwLock::new(DistributionMetrics::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Submit a task. Critical/High priority tasks are distributed
    /// immediately; everything else waits for the next cycle.
    pub async fn submit(self: &Arc<Self>, request: TaskRequest) -> Result<()> {
        {
            let mut tasks = self.tasks.write();
            if tasks.contains_key(&request.id) {
                return Err(MeshError::Other(format!(
                    "task already submitted: {}",
                    request.id
                )));
            }
            tasks.insert(
                request.id.clone(),
                TaskState {
                    request: request.clone(),
                    status: SubTaskStatus::Pending,
                    retries: 0,
                },
            );
        }
        self.metrics.write().tasks_submitted += 1;

        if request.priority.is_urgent() {
            match self.try_dispatch_now(&request).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!(task = %request.id, "no viable agent yet, queueing urgent task");
                }
                Err(e) => {
                    warn!(task = %request.id, error = %e, "immediate distribution failed, queueing");
                }
            }
        }
        self.queue.write().push(QueuedTask::new(request));
        Ok(())
    }

    /// Withdraw a still-queued task. In-flight assignments cannot be
    /// cancelled, only superseded by reassignment.
    pub fn withdraw(&self, task_id: &str) -> Result<TaskRequest> {
        let mut tasks = self.tasks.write();
        match tasks.get(task_id) {
            Some(state) if state.status == SubTaskStatus::Pending => {
                let request = state.request.clone();
                tasks.remove(task_id);
                drop(tasks);
                self.queue.write().retain(|q| q.request.id != task_id);
                info!(task = task_id, "task withdrawn from queue");
                Ok(request)
            }
            Some(state) => Err(MeshError::InvalidStateTransition {
                from: format!("{:?}", state.status),
                to: "withdrawn".into(),
                context: "only queued tasks can be withdrawn".into(),
            }),
            None => Err(MeshError::TaskNotFound(task_id.to_string())),
        }
    }

    /// One distribution pass over the queue in effective-priority order.
    /// Returns the number of tasks dispatched.
    pub async fn run_distribution_cycle(self: &Arc<Self>) -> usize {
        let agents = match self.directory.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "agent directory unavailable, skipping cycle");
                return 0;
            }
        };
        let mut loads = self.current_loads();

        let drained: Vec<QueuedTask> = {
            let mut queue = self.queue.write();
            let now = Utc::now();
            queue.sort_by_key(|t| {
                std::cmp::Reverse(t.effective_priority(now, self.config.deadline_soon_mins))
            });
            queue.drain(..).collect()
        };

        let mut kept = Vec::new();
        let mut dispatched = 0usize;
        for mut entry in drained {
            let still_pending = self
                .tasks
                .read()
                .get(&entry.request.id)
                .map(|s| s.status == SubTaskStatus::Pending)
                .unwrap_or(false);
            if !still_pending {
                continue;
            }

            match self.select_candidate(&entry.request, &agents, &loads) {
                Ok(chosen) => {
                    let agent_id = chosen.agent_id.clone();
                    let complexity = entry.request.complexity;
                    if self.dispatch(entry.request.clone(), chosen).await {
                        loads.entry(agent_id).or_default().active.push(complexity);
                        dispatched += 1;
                    }
                    // on a failed send the task was re-queued with a boost
                }
                Err(e) => {
                    entry.barren_cycles += 1;
                    if entry.barren_cycles == self.config.barren_cycle_warning {
                        warn!(
                            cycles = entry.barren_cycles,
                            error = %e,
                            "task starved across distribution cycles"
                        );
                    }
                    kept.push(entry);
                }
            }
        }
        self.queue.write().extend(kept);
        dispatched
    }

    /// The agent acknowledged the task and started working.
    pub fn report_started(&self, task_id: &str) -> Result<()> {
        let agent_id = {
            let mut assignments = self.assignments.write();
            match assignments.get_mut(task_id) {
                Some(a) if a.status == AssignmentStatus::Assigned => {
                    a.status = AssignmentStatus::InProgress;
                    a.agent_id.clone()
                }
                Some(a) if a.status == AssignmentStatus::InProgress => return Ok(()),
                Some(a) => {
                    return Err(MeshError::InvalidStateTransition {
                        from: format!("{:?}", a.status),
                        to: "in_progress".into(),
                        context: format!("task {task_id}"),
                    });
                }
                None => return Err(MeshError::TaskNotFound(task_id.to_string())),
            }
        };
        {
            let mut tasks = self.tasks.write();
            if let Some(state) = tasks.get_mut(task_id)
                && state.status == SubTaskStatus::Assigned
            {
                state.status = SubTaskStatus::InProgress;
            }
        }
        let _ = self.events.send(TaskEvent::Started {
            task_id: task_id.to_string(),
            agent_id,
        });
        Ok(())
    }

    /// Inbound completion report from the agent. Late or duplicate reports
    /// (after a timeout or a previous report) are no-ops.
    pub async fn report_completion(
        self: &Arc<Self>,
        task_id: &str,
        success: bool,
        elapsed_ms: u64,
    ) -> Result<()> {
        self.timers.cancel(&Self::timer_key(task_id));

        let finished = {
            let mut assignments = self.assignments.write();
            match assignments.get_mut(task_id) {
                Some(a) if a.status.is_active() => {
                    a.status = if success {
                        AssignmentStatus::Completed
                    } else {
                        AssignmentStatus::Failed
                    };
                    a.actual_completion = Some(Utc::now());
                    if success {
                        let estimated = self.config.assignment_timeout_ms as f64;
                        a.performance = Some((estimated / elapsed_ms.max(1) as f64).min(1.0));
                    }
                    Some(a.clone())
                }
                _ => None,
            }
        };
        let Some(assignment) = finished else {
            debug!(task = task_id, "late or duplicate completion report ignored");
            return Ok(());
        };

        let task_type = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(task_id) {
                Some(state) => {
                    state.status = if success {
                        SubTaskStatus::Completed
                    } else {
                        SubTaskStatus::Failed
                    };
                    state.request.task_type().to_string()
                }
                None => task_id.to_string(),
            }
        };
        self.history
            .record(&assignment.agent_id, OutcomeSample::new(success, elapsed_ms, task_type));

        {
            let mut metrics = self.metrics.write();
            if success {
                metrics.tasks_completed += 1;
                metrics.total_completion_ms += elapsed_ms;
            } else {
                metrics.tasks_failed += 1;
            }
        }
        info!(
            task = task_id,
            agent = %assignment.agent_id,
            success,
            elapsed_ms,
            "task completion recorded"
        );

        let _ = self.events.send(TaskEvent::Completed {
            task_id: task_id.to_string(),
            agent_id: assignment.agent_id.clone(),
            success,
            elapsed_ms,
        });
        mirror_record(
            self.mirror.as_ref(),
            "assignment",
            serde_json::to_value(&assignment).unwrap_or_default(),
        )
        .await;
        Ok(())
    }

    /// Rebalancing pass: move still-`Assigned` work off overloaded agents
    /// onto underloaded agents that score above the rebalance threshold.
    /// Returns the number of assignments moved.
    pub async fn run_rebalance_cycle(self: &Arc<Self>) -> usize {
        let agents = match self.directory.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "agent directory unavailable, skipping rebalance");
                return 0;
            }
        };
        let mut loads = self.current_loads();

        let factors: Vec<f64> = agents
            .iter()
            .map(|a| self.load_factor_of(&loads, &a.id))
            .collect();
        self.metrics.write().load_balance_score = 1.0 - variance(&factors);

        let overloaded: Vec<&AgentInfo> = agents
            .iter()
            .filter(|a| self.load_factor_of(&loads, &a.id) > self.config.overload_threshold)
            .collect();
        if overloaded.is_empty() {
            return 0;
        }

        let mut moved = 0usize;
        for agent in overloaded {
            let movable: Vec<String> = self
                .assignments
                .read()
                .values()
                .filter(|a| a.agent_id == agent.id && a.status == AssignmentStatus::Assigned)
                .map(|a| a.task_id.clone())
                .collect();

            for task_id in movable {
                // Load shifts as tasks move; re-check each iteration.
                if self.load_factor_of(&loads, &agent.id) <= self.config.overload_threshold {
                    break;
                }
                let Some(request) = self
                    .tasks
                    .read()
                    .get(&task_id)
                    .map(|s| s.request.clone())
                else {
                    continue;
                };

                let target = agents
                    .iter()
                    .filter(|a| {
                        a.id != agent.id
                            && self.load_factor_of(&loads, &a.id)
                                < self.config.underload_threshold
                    })
                    .map(|a| {
                        let load = loads.get(&a.id).cloned().unwrap_or_default();
                        self.scorer.score(a, &request, &load, &self.history)
                    })
                    .filter(|s| s.score > self.config.rebalance_min_score)
                    .max_by(|a, b| {
                        a.score
                            .partial_cmp(&b.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.agent_id.cmp(&a.agent_id))
                    });

                if let Some(chosen) = target {
                    let to_agent = chosen.agent_id.clone();
                    if self.reassign(&task_id, &request, chosen).await {
                        remove_one_assignment(&mut loads, &agent.id, request.complexity);
                        loads
                            .entry(to_agent)
                            .or_default()
                            .active
                            .push(request.complexity);
                        moved += 1;
                    }
                }
            }
        }
        moved
    }

    pub fn metrics(&self) -> DistributionMetrics {
        self.metrics.read().clone()
    }

    pub fn assignment(&self, task_id: &str) -> Option<TaskAssignment> {
        self.assignments.read().get(task_id).cloned()
    }

    pub fn assignment_log(&self) -> Vec<TaskAssignment> {
        self.assignment_log.read().clone()
    }

    pub fn task_status(&self, task_id: &str) -> Option<SubTaskStatus> {
        self.tasks.read().get(task_id).map(|s| s.status)
    }

    pub fn queued_count(&self) -> usize {
        self.queue.read().len()
    }

    pub fn performance_history(&self) -> &PerformanceTracker {
        &self.history
    }

    /// Load factors per agent from the current assignment snapshot.
    pub fn load_snapshot(&self) -> HashMap<String, f64> {
        let loads = self.current_loads();
        loads
            .iter()
            .map(|(id, load)| (id.clone(), load.load_factor(self.scorer.config())))
            .collect()
    }

    pub fn shutdown_timers(&self) {
        self.timers.cancel_all();
    }

    // Internal machinery.

    fn timer_key(task_id: &str) -> String {
        format!("task:{task_id}")
    }

    async fn try_dispatch_now(self: &Arc<Self>, request: &TaskRequest) -> Result<bool> {
        let agents = self.directory.list_agents().await?;
        let loads = self.current_loads();
        match self.select_candidate(request, &agents, &loads) {
            Ok(chosen) => Ok(self.dispatch(request.clone(), chosen).await),
            Err(e) => {
                debug!(task = %request.id, error = %e, "no viable agent for immediate distribution");
                Ok(false)
            }
        }
    }

    /// Viable candidates sorted by score, cut to the top pool; within the
    /// tie-break window of the best score, the least-loaded agent wins, so
    /// lightly-loaded capable agents are never starved by raw score alone.
    fn select_candidate(
        &self,
        request: &TaskRequest,
        agents: &[AgentInfo],
        loads: &HashMap<String, AgentLoad>,
    ) -> Result<AgentCapabilityScore> {
        let idle = AgentLoad::default();
        let mut best_seen = 0.0_f64;
        let mut viable = Vec::new();
        for agent in agents {
            let load = loads.get(&agent.id).unwrap_or(&idle);
            let score = self.scorer.score(agent, request, load, &self.history);
            if score.score > best_seen {
                best_seen = score.score;
            }
            if self.scorer.is_viable(&score) {
                viable.push(score);
            }
        }
        if viable.is_empty() {
            return Err(MeshError::NoViableAgent {
                task_id: request.id.clone(),
                best_score: best_seen,
            });
        }

        viable.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        viable.truncate(self.config.candidate_pool_size);

        let best = viable[0].score;
        let floor = best * (1.0 - self.config.tie_break_window);
        viable
            .into_iter()
            .filter(|s| s.score >= floor)
            .min_by(|a, b| {
                a.load_factor
                    .partial_cmp(&b.load_factor)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
            .ok_or(MeshError::NoViableAgent {
                task_id: request.id.clone(),
                best_score: best_seen,
            })
    }

    /// Create the assignment, notify the agent and arm the completion
    /// timeout. Returns false when the send failed and the task was
    /// re-queued.
    async fn dispatch(self: &Arc<Self>, request: TaskRequest, chosen: AgentCapabilityScore) -> bool {
        let now = Utc::now();
        let assignment = TaskAssignment {
            task_id: request.id.clone(),
            agent_id: chosen.agent_id.clone(),
            assigned_at: now,
            estimated_completion: now
                + chrono::Duration::milliseconds(self.config.assignment_timeout_ms as i64),
            status: AssignmentStatus::Assigned,
            actual_completion: None,
            performance: None,
            score: chosen.score,
        };
        {
            let mut assignments = self.assignments.write();
            if let Some(previous) = assignments.insert(request.id.clone(), assignment.clone()) {
                self.assignment_log.write().push(previous);
            }
        }
        if let Some(state) = self.tasks.write().get_mut(&request.id) {
            state.status = SubTaskStatus::Assigned;
        }
        self.metrics.write().tasks_dispatched += 1;
        info!(
            task = %request.id,
            agent = %chosen.agent_id,
            score = format!("{:.2}", chosen.score),
            load = format!("{:.2}", chosen.load_factor),
            "task dispatched"
        );

        let message = TaskDispatch::new(
            &request.id,
            DispatchAction::ExecuteTask,
            json!({
                "name": request.name,
                "description": request.description,
                "required_capabilities": request.required_capabilities,
                "priority": request.priority,
            }),
        );
        if let Err(e) = self.channel.send(&chosen.agent_id, message).await {
            warn!(task = %request.id, agent = %chosen.agent_id, error = %e, "dispatch send failed");
            self.fail_active_assignment(&request.id, 0);
            return false;
        }

        let weak = Arc::downgrade(self);
        let task_id = request.id.clone();
        self.timers.arm(
            &Self::timer_key(&request.id),
            Duration::from_millis(self.config.assignment_timeout_ms),
            move || async move {
                if let Some(distributor) = weak.upgrade() {
                    distributor.handle_assignment_timeout(&task_id);
                }
            },
        );

        let _ = self.events.send(TaskEvent::Dispatched {
            task_id: request.id.clone(),
            agent_id: chosen.agent_id,
        });
        mirror_record(
            self.mirror.as_ref(),
            "assignment",
            serde_json::to_value(&assignment).unwrap_or_default(),
        )
        .await;
        true
    }

    /// Completion deadline passed without a report: fail the assignment,
    /// record a negative sample at the timeout duration and re-queue the
    /// task with boosted priority (bounded by the retry cap).
    pub(crate) fn handle_assignment_timeout(self: &Arc<Self>, task_id: &str) {
        self.metrics.write().timeouts += 1;
        self.fail_active_assignment(task_id, self.config.assignment_timeout_ms);
    }

    fn fail_active_assignment(self: &Arc<Self>, task_id: &str, elapsed_ms: u64) {
        let failed = {
            let mut assignments = self.assignments.write();
            match assignments.get_mut(task_id) {
                Some(a) if a.status.is_active() => {
                    a.status = AssignmentStatus::Failed;
                    a.actual_completion = Some(Utc::now());
                    Some(a.clone())
                }
                _ => None,
            }
        };
        let Some(assignment) = failed else {
            return;
        };
        self.assignment_log.write().push(assignment.clone());

        if elapsed_ms > 0 {
            warn!(
                error = %MeshError::AssignmentTimeout {
                    task_id: task_id.to_string(),
                    agent_id: assignment.agent_id.clone(),
                    elapsed_ms,
                },
                "no completion report before the deadline"
            );
            let task_type = self
                .tasks
                .read()
                .get(task_id)
                .map(|s| s.request.task_type().to_string())
                .unwrap_or_else(|| task_id.to_string());
            self.history.record(
                &assignment.agent_id,
                OutcomeSample::new(false, elapsed_ms, task_type),
            );
        }

        let (terminal, request) = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(task_id) {
                Some(state) => {
                    state.retries += 1;
                    if state.retries > self.config.max_retries {
                        state.status = SubTaskStatus::Failed;
                        (true, None)
                    } else {
                        state.status = SubTaskStatus::Pending;
                        (false, Some(state.request.clone()))
                    }
                }
                None => (false, None),
            }
        };

        if terminal {
            warn!(error = %MeshError::MaxRetriesExceeded(task_id.to_string()), "task terminally failed");
            self.metrics.write().tasks_failed += 1;
            let _ = self.events.send(TaskEvent::TerminallyFailed {
                task_id: task_id.to_string(),
            });
        } else if let Some(request) = request {
            self.queue
                .write()
                .push(QueuedTask::boosted(request, Priority::High));
        }
    }

    async fn reassign(
        self: &Arc<Self>,
        task_id: &str,
        request: &TaskRequest,
        chosen: AgentCapabilityScore,
    ) -> bool {
        let from_agent = {
            let mut assignments = self.assignments.write();
            match assignments.get_mut(task_id) {
                Some(a) if a.status == AssignmentStatus::Assigned => {
                    a.status = AssignmentStatus::Reassigned;
                    let superseded = a.clone();
                    self.assignment_log.write().push(superseded.clone());
                    superseded.agent_id
                }
                _ => return false,
            }
        };
        self.timers.cancel(&Self::timer_key(task_id));
        self.metrics.write().reassignments += 1;
        info!(
            task = task_id,
            from = %from_agent,
            to = %chosen.agent_id,
            "rebalancing assignment"
        );

        let to_agent = chosen.agent_id.clone();
        let dispatched = self.dispatch(request.clone(), chosen).await;
        if dispatched {
            let _ = self.events.send(TaskEvent::Reassigned {
                task_id: task_id.to_string(),
                from_agent,
                to_agent,
            });
        }
        dispatched
    }

    fn current_loads(&self) -> HashMap<String, AgentLoad> {
        let assignments = self.assignments.read();
        let tasks = self.tasks.read();
        let mut loads: HashMap<String, AgentLoad> = HashMap::new();
        for assignment in assignments.values().filter(|a| a.status.is_active()) {
            let complexity = tasks
                .get(&assignment.task_id)
                .map(|s| s.request.complexity)
                .unwrap_or(0.5);
            loads
                .entry(assignment.agent_id.clone())
                .or_default()
                .active
                .push(complexity);
        }
        loads
    }

    fn load_factor_of(&self, loads: &HashMap<String, AgentLoad>, agent_id: &str) -> f64 {
        loads
            .get(agent_id)
            .map(|l| l.load_factor(self.scorer.config()))
            .unwrap_or(0.0)
    }
}

fn remove_one_assignment(loads: &mut HashMap<String, AgentLoad>, agent_id: &str, complexity: f64) {
    if let Some(load) = loads.get_mut(agent_id)
        && let Some(pos) = load.active.iter().position(|c| (c - complexity).abs() < 1e-9)
    {
        load.active.remove(pos);
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{AgentInfo, AgentStatus, InMemoryDirectory};
    use crate::dispatch::{NullMirror, RecordingChannel};

    fn agent(id: &str, capabilities: &[&str]) -> AgentInfo {
        AgentInfo::new(
            id,
            capabilities.iter().map(|s| s.to_string()).collect(),
            AgentStatus::Idle,
        )
    }

    fn harness(
        config: DistributionConfig,
    ) -> (Arc<TaskDistributor>, Arc<InMemoryDirectory>, Arc<RecordingChannel>) {
        let directory = InMemoryDirectory::shared();
        let channel = RecordingChannel::shared();
        let distributor = TaskDistributor::new(
            config,
            ScoringConfig::default(),
            directory.clone(),
            channel.clone(),
            Arc::new(NullMirror),
        );
        (distributor, directory, channel)
    }

    #[tokio::test]
    async fn urgent_tasks_dispatch_immediately() {
        let (distributor, directory, channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["assess-data-quality"]));

        let request = TaskRequest::new("t-1", "data-quality", Priority::Critical)
            .with_capabilities(["assess-data-quality"]);
        distributor.submit(request).await.unwrap();

        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Assigned));
        assert_eq!(channel.sent_to("agent-1").len(), 1);
        let assignment = distributor.assignment("t-1").unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Assigned);
        assert!(assignment.score > 0.3);
    }

    #[tokio::test]
    async fn medium_tasks_wait_for_the_cycle() {
        let (distributor, directory, channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["draft-report"]));

        let request = TaskRequest::new("t-1", "reporting", Priority::Medium)
            .with_capabilities(["draft-report"]);
        distributor.submit(request).await.unwrap();

        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Pending));
        assert!(channel.sent().is_empty());

        let dispatched = distributor.run_distribution_cycle().await;
        assert_eq!(dispatched, 1);
        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Assigned));
    }

    #[tokio::test]
    async fn cycle_orders_by_effective_priority() {
        let (distributor, directory, channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["analyze-data"]));

        for (id, priority) in [("low", Priority::Low), ("med", Priority::Medium)] {
            distributor
                .submit(
                    TaskRequest::new(id, "analysis", priority)
                        .with_capabilities(["analyze-data"]),
                )
                .await
                .unwrap();
        }
        distributor.run_distribution_cycle().await;

        // Both dispatch, but the medium-priority task is sent first.
        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.task_id, "med");
        assert_eq!(sent[1].1.task_id, "low");
    }

    #[tokio::test]
    async fn tie_break_prefers_least_loaded_agent() {
        let (distributor, directory, _channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["analyze-data"]));
        directory.upsert(agent("agent-2", &["analyze-data"]));

        distributor
            .submit(
                TaskRequest::new("t-1", "analysis", Priority::Critical)
                    .with_capabilities(["analyze-data"]),
            )
            .await
            .unwrap();
        let first = distributor.assignment("t-1").unwrap().agent_id;

        distributor
            .submit(
                TaskRequest::new("t-2", "analysis", Priority::Critical)
                    .with_capabilities(["analyze-data"]),
            )
            .await
            .unwrap();
        let second = distributor.assignment("t-2").unwrap().agent_id;

        // Identical scores, so the second task must go to the idle agent.
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn no_viable_agent_keeps_task_queued() {
        let (distributor, directory, _channel) = harness(DistributionConfig::default());
        directory.upsert(AgentInfo::new("agent-1", vec![], AgentStatus::Offline));

        distributor
            .submit(
                TaskRequest::new("t-1", "analysis", Priority::Medium)
                    .with_capabilities(["analyze-data"]),
            )
            .await
            .unwrap();

        assert_eq!(distributor.run_distribution_cycle().await, 0);
        assert_eq!(distributor.queued_count(), 1);
        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_requeues_with_boosted_priority_and_negative_sample() {
        let (distributor, directory, _channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["assess-data-quality"]));

        distributor
            .submit(
                TaskRequest::new("t-1", "data-quality", Priority::Critical)
                    .with_capabilities(["assess-data-quality"]),
            )
            .await
            .unwrap();
        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Assigned));

        // Past the 60s completion deadline.
        tokio::time::sleep(Duration::from_millis(61_000)).await;

        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Pending));
        assert_eq!(
            distributor.assignment("t-1").unwrap().status,
            AssignmentStatus::Failed
        );
        let queued = distributor.queued_count();
        assert_eq!(queued, 1);
        assert_eq!(distributor.metrics().timeouts, 1);

        // The acting agent records one failure at the timeout duration.
        let samples = distributor.performance_history().samples_for("agent-1");
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].success);
        assert_eq!(samples[0].completion_ms, 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_bounds_timeout_reassignment() {
        let mut config = DistributionConfig::default();
        config.max_retries = 1;
        let (distributor, directory, _channel) = harness(config);
        directory.upsert(agent("agent-1", &["assess-data-quality"]));

        distributor
            .submit(
                TaskRequest::new("t-1", "data-quality", Priority::Critical)
                    .with_capabilities(["assess-data-quality"]),
            )
            .await
            .unwrap();

        // First timeout: re-queued. Redistribute, then time out again.
        tokio::time::sleep(Duration::from_millis(61_000)).await;
        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Pending));
        distributor.run_distribution_cycle().await;
        tokio::time::sleep(Duration::from_millis(61_000)).await;

        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Failed));
        assert_eq!(distributor.metrics().tasks_failed, 1);
        assert_eq!(distributor.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_cancels_the_timeout_timer() {
        let (distributor, directory, _channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["assess-data-quality"]));

        distributor
            .submit(
                TaskRequest::new("t-1", "data-quality", Priority::Critical)
                    .with_capabilities(["assess-data-quality"]),
            )
            .await
            .unwrap();
        distributor.report_started("t-1").unwrap();
        distributor.report_completion("t-1", true, 12_000).await.unwrap();

        // A late timer fire must be a no-op.
        tokio::time::sleep(Duration::from_millis(120_000)).await;

        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Completed));
        assert_eq!(distributor.metrics().timeouts, 0);
        assert_eq!(distributor.metrics().tasks_completed, 1);
        assert_eq!(distributor.metrics().avg_completion_ms(), 12_000);
    }

    #[tokio::test]
    async fn duplicate_completion_reports_are_ignored() {
        let (distributor, directory, _channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["assess-data-quality"]));

        distributor
            .submit(
                TaskRequest::new("t-1", "data-quality", Priority::Critical)
                    .with_capabilities(["assess-data-quality"]),
            )
            .await
            .unwrap();
        distributor.report_completion("t-1", true, 10_000).await.unwrap();
        distributor.report_completion("t-1", false, 99_000).await.unwrap();

        assert_eq!(distributor.task_status("t-1"), Some(SubTaskStatus::Completed));
        let metrics = distributor.metrics();
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 0);
    }

    #[tokio::test]
    async fn withdraw_only_removes_queued_tasks() {
        let (distributor, directory, _channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["analyze-data"]));

        distributor
            .submit(TaskRequest::new("queued", "analysis", Priority::Low))
            .await
            .unwrap();
        distributor
            .submit(
                TaskRequest::new("flying", "analysis", Priority::Critical)
                    .with_capabilities(["analyze-data"]),
            )
            .await
            .unwrap();

        assert!(distributor.withdraw("queued").is_ok());
        assert!(distributor.task_status("queued").is_none());

        let err = distributor.withdraw("flying").unwrap_err();
        assert!(matches!(err, MeshError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn rebalance_moves_assigned_work_to_underloaded_agents() {
        let (distributor, directory, channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["analyze-data"]));

        // Four assignments pin agent-1's load factor at 1.0.
        for i in 0..4 {
            distributor
                .submit(
                    TaskRequest::new(format!("t-{i}"), "analysis", Priority::Critical)
                        .with_capabilities(["analyze-data"])
                        .with_complexity(0.5),
                )
                .await
                .unwrap();
        }
        assert!(distributor.load_snapshot()["agent-1"] > 0.8);

        // A fresh capable agent joins; rebalancing must hand work over.
        directory.upsert(agent("agent-2", &["analyze-data"]));
        channel.clear();
        let moved = distributor.run_rebalance_cycle().await;
        assert!(moved >= 1, "expected at least one reassignment, got {moved}");

        let log = distributor.assignment_log();
        assert!(log.iter().any(|a| a.status == AssignmentStatus::Reassigned));
        assert!(!channel.sent_to("agent-2").is_empty());

        // Invariant: once the cycle ends, no underloaded agent remains while
        // an overloaded one still holds assigned work.
        let loads = distributor.load_snapshot();
        let any_overloaded = loads.values().any(|&f| f > 0.8);
        let any_underloaded = directory
            .list_agents()
            .await
            .unwrap()
            .iter()
            .any(|a| loads.get(&a.id).copied().unwrap_or(0.0) < 0.3);
        assert!(!(any_overloaded && any_underloaded));
        let metrics = distributor.metrics();
        assert!(metrics.reassignments >= 1);
        assert!(metrics.load_balance_score <= 1.0);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let (distributor, directory, _channel) = harness(DistributionConfig::default());
        directory.upsert(agent("agent-1", &["analyze-data"]));

        let request = TaskRequest::new("t-1", "analysis", Priority::Low);
        distributor.submit(request.clone()).await.unwrap();
        assert!(distributor.submit(request).await.is_err());
    }
}
