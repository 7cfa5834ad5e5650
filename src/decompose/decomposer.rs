use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DecompositionConfig;
use crate::error::{MeshError, Result};

use super::templates::builtin_templates;
use super::types::{
    ComplexityClass, Priority, SubTask, TaskDecomposition, TaskDependency,
};

/// Turns objectives into dependency graphs of subtasks via keyword-matched
/// templates. Decompositions stay queryable by id for their workflow's
/// lifetime.
pub struct TaskDecomposer {
    config: DecompositionConfig,
    decompositions: RwLock<HashMap<String, TaskDecomposition>>,
}

impl TaskDecomposer {
    pub fn new(config: DecompositionConfig) -> Self {
        Self {
            config,
            decompositions: RwLock::new(HashMap::new()),
        }
    }

    pub fn decompose(
        &self,
        objective: &str,
        complexity: ComplexityClass,
        priority: Priority,
        constraints: Vec<String>,
    ) -> Result<TaskDecomposition> {
        if objective.trim().is_empty() {
            return Err(MeshError::InvalidObjective(
                "objective text is empty".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let short = &id[..8];
        let factor = self.duration_factor(complexity);

        let (subtasks, dependencies) = match builtin_templates()
            .iter()
            .find(|t| t.matches(objective))
        {
            Some(template) => {
                debug!(template = template.name, objective, "matched decomposition template");
                let subtasks: Vec<SubTask> = template
                    .steps
                    .iter()
                    .map(|step| {
                        SubTask::new(
                            format!("{}:{}", short, step.key),
                            step.name,
                            format!("{}: {}", step.description, objective),
                        )
                        .with_capabilities(step.capabilities.iter().copied())
                        .with_duration(scale_minutes(step.minutes, factor))
                    })
                    .collect();
                let dependencies = template
                    .edges
                    .iter()
                    .map(|(from, to, kind)| TaskDependency {
                        prerequisite: format!("{}:{}", short, from),
                        dependent: format!("{}:{}", short, to),
                        kind: *kind,
                    })
                    .collect();
                (subtasks, dependencies)
            }
            None => {
                debug!(objective, "no template matched, single-subtask decomposition");
                let subtask = SubTask::new(
                    format!("{}:objective", short),
                    "objective",
                    objective,
                )
                .with_duration(scale_minutes(60, factor));
                (vec![subtask], Vec::new())
            }
        };

        ensure_acyclic(&subtasks, &dependencies)?;

        let required_capabilities: BTreeSet<String> = subtasks
            .iter()
            .flat_map(|t| t.required_capabilities.iter().cloned())
            .collect();
        let estimated_total_minutes = critical_path_minutes(&subtasks, &dependencies);

        let decomposition = TaskDecomposition {
            id: id.clone(),
            objective: objective.to_string(),
            subtasks,
            dependencies,
            estimated_total_minutes,
            required_capabilities,
            priority,
            constraints,
        };

        info!(
            decomposition = %id,
            subtasks = decomposition.subtasks.len(),
            total_minutes = estimated_total_minutes,
            "objective decomposed"
        );
        self.decompositions
            .write()
            .insert(id, decomposition.clone());
        Ok(decomposition)
    }

    pub fn get(&self, id: &str) -> Option<TaskDecomposition> {
        self.decompositions.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<TaskDecomposition> {
        self.decompositions.read().values().cloned().collect()
    }

    fn duration_factor(&self, complexity: ComplexityClass) -> f64 {
        match complexity {
            ComplexityClass::Simple => self.config.simple_duration_factor,
            ComplexityClass::Medium => 1.0,
            ComplexityClass::Complex => self.config.complex_duration_factor,
        }
    }
}

fn scale_minutes(minutes: u32, factor: f64) -> u32 {
    ((minutes as f64 * factor).round() as u32).max(1)
}

/// Reject a decomposition whose dependency edges form a cycle (Kahn's
/// algorithm: if the topological sort cannot consume every node, a cycle
/// remains).
fn ensure_acyclic(subtasks: &[SubTask], dependencies: &[TaskDependency]) -> Result<()> {
    let mut indegree: HashMap<&str, usize> =
        subtasks.iter().map(|t| (t.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for dep in dependencies {
        if !indegree.contains_key(dep.prerequisite.as_str()) {
            return Err(MeshError::TaskNotFound(dep.prerequisite.clone()));
        }
        let Some(count) = indegree.get_mut(dep.dependent.as_str()) else {
            return Err(MeshError::TaskNotFound(dep.dependent.clone()));
        };
        *count += 1;
        dependents
            .entry(dep.prerequisite.as_str())
            .or_default()
            .push(dep.dependent.as_str());
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for &dependent in dependents.get(id).into_iter().flatten() {
            // Every dependent id was validated into the map above.
            if let Some(count) = indegree.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if visited == subtasks.len() {
        Ok(())
    } else {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|&(_, &d)| d > 0)
            .map(|(&id, _)| id)
            .collect();
        Err(MeshError::CycleDetected(stuck.join(", ")))
    }
}

/// Longest duration path through the DAG: parallel branches overlap, only
/// the critical path bounds the total.
fn critical_path_minutes(subtasks: &[SubTask], dependencies: &[TaskDependency]) -> u32 {
    let durations: HashMap<&str, u32> = subtasks
        .iter()
        .map(|t| (t.id.as_str(), t.estimated_duration_minutes))
        .collect();
    let prereqs: HashMap<&str, Vec<&str>> = dependencies.iter().fold(
        HashMap::new(),
        |mut acc, dep| {
            acc.entry(dep.dependent.as_str())
                .or_default()
                .push(dep.prerequisite.as_str());
            acc
        },
    );

    fn finish_time<'a>(
        id: &'a str,
        durations: &HashMap<&'a str, u32>,
        prereqs: &HashMap<&'a str, Vec<&'a str>>,
        memo: &mut HashMap<&'a str, u32>,
    ) -> u32 {
        if let Some(&cached) = memo.get(id) {
            return cached;
        }
        let start = prereqs
            .get(id)
            .into_iter()
            .flatten()
            .map(|p| finish_time(p, durations, prereqs, memo))
            .max()
            .unwrap_or(0);
        let finish = start + durations.get(id).copied().unwrap_or(0);
        memo.insert(id, finish);
        finish
    }

    let mut memo = HashMap::new();
    subtasks
        .iter()
        .map(|t| finish_time(t.id.as_str(), &durations, &prereqs, &mut memo))
        .max()
        .unwrap_or(0)
}
