//! Top-level assembly: owns every coordination component and schedules the
//! background loops (distribution, rebalancing, negotiation sweeps and
//! conflict detection) plus the event pump feeding workflow execution.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::decompose::{ComplexityClass, Priority, TaskDecomposer};
use crate::directory::AgentDirectory;
use crate::dispatch::{DispatchChannel, StateMirror};
use crate::distribution::TaskDistributor;
use crate::error::Result;
use crate::negotiation::{ConflictDetector, NegotiationEngine};
use crate::registry::CapabilityRegistry;
use crate::workflow::{WorkflowExecutor, WorkflowSnapshot};

pub struct Coordinator {
    config: MeshConfig,
    registry: CapabilityRegistry,
    decomposer: TaskDecomposer,
    distributor: Arc<TaskDistributor>,
    negotiations: Arc<NegotiationEngine>,
    conflicts: Arc<ConflictDetector>,
    executor: Arc<WorkflowExecutor>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        config: MeshConfig,
        directory: Arc<dyn AgentDirectory>,
        channel: Arc<dyn DispatchChannel>,
        mirror: Arc<dyn StateMirror>,
    ) -> Arc<Self> {
        let distributor = TaskDistributor::new(
            config.distribution.clone(),
            config.scoring.clone(),
            directory.clone(),
            channel.clone(),
            mirror.clone(),
        );
        let negotiations = NegotiationEngine::new(
            config.negotiation.clone(),
            directory.clone(),
            channel,
            mirror,
        );
        let conflicts = Arc::new(ConflictDetector::new(
            config.conflict.clone(),
            directory,
            negotiations.clone(),
        ));
        Arc::new(Self {
            registry: CapabilityRegistry::new(),
            decomposer: TaskDecomposer::new(config.decomposition.clone()),
            executor: Arc::new(WorkflowExecutor::new(distributor.clone())),
            distributor,
            negotiations,
            conflicts,
            config,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the periodic loops. Idempotent only in the sense that calling
    /// it twice doubles the loops, so callers do it once at startup.
    pub fn start_background_loops(self: &Arc<Self>) {
        let mut loops = self.loops.lock();

        let distributor = self.distributor.clone();
        let interval = Duration::from_millis(self.config.distribution.cycle_interval_ms);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let dispatched = distributor.run_distribution_cycle().await;
                if dispatched > 0 {
                    debug!(dispatched, "distribution cycle");
                }
            }
        }));

        let distributor = self.distributor.clone();
        let interval = Duration::from_millis(self.config.distribution.rebalance_interval_ms);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let moved = distributor.run_rebalance_cycle().await;
                if moved > 0 {
                    debug!(moved, "rebalance cycle");
                }
            }
        }));

        let negotiations = self.negotiations.clone();
        let interval = Duration::from_millis(self.config.negotiation.sweep_interval_ms);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                negotiations.run_timeout_sweep().await;
            }
        }));

        let conflicts = self.conflicts.clone();
        let interval = Duration::from_millis(self.config.conflict.scan_interval_ms);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                conflicts.run_conflict_scan().await;
            }
        }));

        let executor = self.executor.clone();
        let mut events = self.distributor.subscribe();
        loops.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => executor.handle_event(&event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event pump lagged behind the distributor");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        info!("coordination loops started");
    }

    /// Decompose an objective and start executing its workflow. Returns the
    /// workflow id for status queries.
    pub async fn submit_objective(
        &self,
        objective: &str,
        complexity: ComplexityClass,
        priority: Priority,
        constraints: Vec<String>,
    ) -> Result<String> {
        let decomposition = self
            .decomposer
            .decompose(objective, complexity, priority, constraints)?;
        self.register_decomposed_capabilities(&decomposition.required_capabilities);
        self.executor.start(&decomposition).await
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        self.executor.snapshot(workflow_id)
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn decomposer(&self) -> &TaskDecomposer {
        &self.decomposer
    }

    pub fn distributor(&self) -> &Arc<TaskDistributor> {
        &self.distributor
    }

    pub fn negotiations(&self) -> &Arc<NegotiationEngine> {
        &self.negotiations
    }

    pub fn conflicts(&self) -> &Arc<ConflictDetector> {
        &self.conflicts
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    /// Stop the loops and disarm every outstanding timer.
    pub fn shutdown(&self) {
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
        self.distributor.shutdown_timers();
        self.negotiations.shutdown_timers();
        info!("coordinator shut down");
    }

    fn register_decomposed_capabilities(&self, capabilities: &BTreeSet<String>) {
        for name in capabilities {
            if !self.registry.contains(name) {
                // Unknown capabilities get a neutral registration so later
                // decompositions can estimate complexity for them.
                let _ = self
                    .registry
                    .register(crate::registry::TaskCapability::new(name, 0.5, 30));
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
    }
}
