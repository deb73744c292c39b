//! The runtime facade: agent lifecycle, task submission, cache statistics,
//! events and persistence.
//!
//! Submission validates the task, reserves capacity through the
//! [`Scheduler`] and queues a job; it never waits for execution. Completions
//! come back from the [`ExecutionPool`] over a channel and are folded into
//! scheduling feedback and agent knowledge by a single processor task before
//! the submitter's [`TaskHandle`] resolves.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::errors::{SchedulingError, SnapshotError, TaskError};
use crate::domain::models::{
    Agent, AgentConstraints, AgentId, AgentStatus, AgentView, CacheStats, CapabilitySet, Config,
    FailureReason, Task, TaskId, TaskResult, TaskSpec, TaskState,
};
use crate::domain::ports::{SnapshotStore, TaskExecutor};
use crate::infrastructure::config::{ConfigError, ConfigLoader};
use crate::infrastructure::executors::SimulatedExecutor;
use crate::services::agent_registry::AgentRegistry;
use crate::services::cache_manager::CacheManager;
use crate::services::event_bus::{
    EventBus, EventBusConfig, EventPayload, ListenerHandle, RuntimeEvent, SequenceNumber,
};
use crate::services::execution_pool::{
    Completion, EnqueueError, ExecutionPool, Job, Outcome, SharedTaskState,
};
use crate::services::knowledge_transfer::LearningEngine;
use crate::services::load_predictor::LoadPredictor;
use crate::services::pattern_learner::{PatternRefineDaemon, RefineDaemonConfig, RefineHandle};
use crate::services::scheduler::Scheduler;
use crate::services::snapshot::{
    RuntimeSnapshot, SnapshotDaemon, SnapshotDaemonConfig, SnapshotDaemonHandle, SnapshotSource,
};

type Responder = oneshot::Sender<Result<TaskResult, TaskError>>;

struct InFlight {
    agent_id: AgentId,
    state: SharedTaskState,
    responder: Responder,
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    agent_id: Option<AgentId>,
    state: SharedTaskState,
    receiver: oneshot::Receiver<Result<TaskResult, TaskError>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The assigned agent; `None` if the task was never scheduled.
    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent_id
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Wait for the task's result.
    pub async fn wait(self) -> Result<TaskResult, TaskError> {
        self.receiver.await.unwrap_or(Err(TaskError::ShuttingDown))
    }

    fn resolved(task_id: TaskId, state: TaskState, error: TaskError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            task_id,
            agent_id: None,
            state: Arc::new(Mutex::new(state)),
            receiver: rx,
        }
    }
}

#[derive(Default)]
struct RuntimeCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    completion_ms: AtomicU64,
}

/// Point-in-time runtime counters and system metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub agents: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub events_published: u64,
    pub lagged_events: u64,
    /// Population variance of agent utilization (load / capacity).
    pub load_balance_variance: f64,
    /// Mean wall time of successful tasks, cache hits included.
    pub average_completion_ms: Option<f64>,
    pub knowledge_transfers: u64,
    /// See [`Scheduler::prediction_accuracy`].
    pub prediction_accuracy: Option<f64>,
    pub cache_hit_rate: f64,
}

/// Population variance of `values`; zero when empty.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

pub struct RuntimeBuilder {
    config: Config,
    executor: Option<Arc<dyn TaskExecutor>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl RuntimeBuilder {
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Store used by the periodic snapshot daemon when snapshots are enabled.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Validate the configuration and start the runtime. Must be called
    /// within a Tokio runtime.
    pub fn build(self) -> Result<Runtime, ConfigError> {
        ConfigLoader::validate(&self.config)?;
        let config = self.config;

        let event_bus = Arc::new(EventBus::new(EventBusConfig {
            channel_capacity: config.events.channel_capacity,
        }));
        let registry = Arc::new(AgentRegistry::new(config.scheduler.history_limit));
        let predictor = Arc::new(LoadPredictor::new(
            config.scheduler.predictor.clone(),
            config.scheduler.feedback_rate,
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&predictor),
            config.scheduler.clone(),
        ));
        let cache =
            Arc::new(CacheManager::new(config.cache.clone()).with_event_bus(Arc::clone(&event_bus)));
        let learning = Arc::new(
            LearningEngine::new(Arc::clone(&registry), config.learning.clone())
                .with_event_bus(Arc::clone(&event_bus)),
        );

        let refine_daemon = PatternRefineDaemon::new(
            cache.learner(),
            RefineDaemonConfig {
                interval: Duration::from_secs(config.cache.refine_interval_secs),
                iterations: config.cache.refine_iterations,
            },
        );
        let refine = refine_daemon.handle();
        tokio::spawn(refine_daemon.run());

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SimulatedExecutor::default()));
        let (completions_tx, completions_rx) = mpsc::channel(config.execution.queue_capacity.max(1));
        let pool = ExecutionPool::start(
            &config.execution,
            executor,
            Arc::clone(&cache),
            Arc::clone(&event_bus),
            completions_tx,
        );

        let in_flight = Arc::new(DashMap::new());
        let counters = Arc::new(RuntimeCounters::default());
        let processor = CompletionProcessor {
            scheduler: Arc::clone(&scheduler),
            learning: Arc::clone(&learning),
            event_bus: Arc::clone(&event_bus),
            in_flight: Arc::clone(&in_flight),
            counters: Arc::clone(&counters),
            transfers: Arc::new(Semaphore::new(config.learning.max_concurrent_rounds.max(1))),
        };
        let processor = tokio::spawn(processor.run(completions_rx));

        let runtime = Runtime {
            registry,
            scheduler,
            cache,
            learning,
            event_bus,
            in_flight,
            counters,
            pool: Mutex::new(Some(pool)),
            processor: Mutex::new(Some(processor)),
            refine,
            snapshots: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            config,
        };

        if runtime.config.snapshot.enabled {
            match self.snapshot_store {
                Some(store) => runtime.start_snapshot_daemon(store),
                None => warn!("snapshots enabled but no snapshot store configured"),
            }
        }

        info!(
            levels = runtime.config.cache.level_capacities.len(),
            max_concurrent = runtime.config.execution.max_concurrent,
            "runtime started"
        );
        Ok(runtime)
    }
}

pub struct Runtime {
    config: Config,
    registry: Arc<AgentRegistry>,
    scheduler: Arc<Scheduler>,
    cache: Arc<CacheManager>,
    learning: Arc<LearningEngine>,
    event_bus: Arc<EventBus>,
    in_flight: Arc<DashMap<TaskId, InFlight>>,
    counters: Arc<RuntimeCounters>,
    pool: Mutex<Option<ExecutionPool>>,
    processor: Mutex<Option<JoinHandle<()>>>,
    refine: RefineHandle,
    snapshots: Mutex<Option<SnapshotDaemonHandle>>,
    shutting_down: AtomicBool,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            executor: None,
            snapshot_store: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Register a new agent.
    pub fn spawn(
        &self,
        agent_type: impl Into<String>,
        capabilities: CapabilitySet,
        constraints: AgentConstraints,
    ) -> AgentId {
        let agent_type = agent_type.into();
        let id = self
            .scheduler
            .register(agent_type.clone(), capabilities.clone(), constraints);
        self.event_bus.publish(EventPayload::AgentSpawned {
            agent_id: id,
            agent_type,
            capabilities: capabilities.to_strings(),
        });
        id
    }

    /// Remove an agent. Tasks already running on it still complete, but their
    /// feedback is discarded.
    pub fn despawn(&self, agent_id: AgentId) -> Option<Agent> {
        let agent = self.scheduler.deregister(agent_id)?;
        self.event_bus
            .publish(EventPayload::AgentRemoved { agent_id });
        Some(agent)
    }

    /// Submit a task, returning submission failures directly.
    pub fn try_submit(&self, spec: TaskSpec) -> Result<TaskHandle, TaskError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(TaskError::ShuttingDown);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let task = match Task::from_spec(spec) {
            Ok(task) => task,
            Err(msg) => {
                let err = SchedulingError::InvalidTask(msg);
                self.reject(TaskId::new(), &err);
                return Err(err.into());
            }
        };

        self.event_bus.publish(EventPayload::TaskSubmitted {
            task_id: task.id,
            complexity: task.complexity,
            required: task.required.to_strings(),
        });

        let assignment = match self.scheduler.submit(&task) {
            Ok(assignment) => assignment,
            Err(err) => {
                self.reject(task.id, &err);
                return Err(err.into());
            }
        };
        let agent_id = assignment.agent_id;

        let Some((agent, critical)) = self
            .registry
            .with_agent(agent_id, |a| (AgentView::from(a), a.critical))
        else {
            let err = SchedulingError::AgentNotFound(agent_id);
            self.reject(task.id, &err);
            return Err(err.into());
        };

        self.event_bus.publish(EventPayload::TaskScheduled {
            task_id: task.id,
            agent_id,
            score: assignment.score,
            predicted_completion: assignment.predicted_completion,
        });

        let task_id = task.id;
        let state: SharedTaskState = Arc::new(Mutex::new(TaskState::Scheduled));
        let (responder, receiver) = oneshot::channel();
        self.in_flight.insert(
            task_id,
            InFlight {
                agent_id,
                state: Arc::clone(&state),
                responder,
            },
        );

        let job = Job {
            task,
            assignment,
            agent,
            critical,
            state: Arc::clone(&state),
        };
        let enqueued = match self.pool.lock().as_ref() {
            Some(pool) => pool.try_enqueue(job).map_err(|e| match e {
                EnqueueError::Full(_) => TaskError::Scheduling(SchedulingError::Overloaded {
                    task_id,
                    retry_after: Duration::from_millis(self.config.scheduler.retry_after_base_ms),
                }),
                EnqueueError::Closed(_) => TaskError::ShuttingDown,
            }),
            None => Err(TaskError::ShuttingDown),
        };

        if let Err(err) = enqueued {
            self.in_flight.remove(&task_id);
            self.scheduler.release(agent_id, task_id);
            *state.lock() = TaskState::Rejected;
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.event_bus.publish(EventPayload::TaskRejected {
                task_id,
                reason: err.reason(),
            });
            return Err(err);
        }

        Ok(TaskHandle {
            task_id,
            agent_id: Some(agent_id),
            state,
            receiver,
        })
    }

    /// Submit a task. Submission failures are delivered through the handle.
    pub fn submit_task(&self, spec: TaskSpec) -> TaskHandle {
        match self.try_submit(spec) {
            Ok(handle) => handle,
            Err(err) => {
                let state = match err.reason() {
                    FailureReason::DeadlineExceeded => TaskState::Failed,
                    _ => TaskState::Rejected,
                };
                let task_id = match &err {
                    TaskError::Scheduling(SchedulingError::NoCapableAgent { task_id, .. })
                    | TaskError::Scheduling(SchedulingError::Overloaded { task_id, .. })
                    | TaskError::Scheduling(SchedulingError::DeadlineExceeded { task_id, .. }) => {
                        *task_id
                    }
                    _ => TaskId::new(),
                };
                TaskHandle::resolved(task_id, state, err)
            }
        }
    }

    /// Withdraw a task that has not started executing.
    pub fn cancel(&self, task_id: TaskId) -> Result<(), TaskError> {
        let state = self
            .in_flight
            .get(&task_id)
            .map(|entry| Arc::clone(&entry.state))
            .ok_or(TaskError::NotCancellable(task_id))?;

        {
            let mut state = state.lock();
            if !state.can_transition_to(TaskState::Cancelled) {
                return Err(TaskError::NotCancellable(task_id));
            }
            *state = TaskState::Cancelled;
        }

        let Some((_, entry)) = self.in_flight.remove(&task_id) else {
            return Err(TaskError::NotCancellable(task_id));
        };
        self.scheduler.release(entry.agent_id, task_id);
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.event_bus.publish(EventPayload::TaskCancelled {
            task_id,
            agent_id: entry.agent_id,
        });
        let _ = entry.responder.send(Err(TaskError::Cancelled(task_id)));
        debug!(task_id = %task_id, "task cancelled");
        Ok(())
    }

    pub fn get_agent_status(&self, agent_id: AgentId) -> Option<AgentStatus> {
        self.scheduler.status(agent_id)
    }

    pub fn agents(&self) -> Vec<AgentStatus> {
        self.scheduler.statuses()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Run `handler` for each event matching `name` (`"*"`, `"task.*"` or an
    /// exact name).
    pub fn on_event<F>(&self, name: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(RuntimeEvent) + Send + Sync + 'static,
    {
        self.event_bus.on(name, handler)
    }

    pub fn emit(&self, name: impl Into<String>, data: serde_json::Value) -> SequenceNumber {
        self.event_bus.emit(name, data)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.event_bus.subscribe()
    }

    /// Encode agents, cache contents and learned centers.
    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let bytes = encode_snapshot(&self.registry, &self.cache)?;
        self.publish_snapshot_taken(bytes.len());
        Ok(bytes)
    }

    /// Replace agents and cache contents with a snapshot. Reservations are
    /// dropped; tasks still in flight finish but their feedback is ignored.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let snapshot = match RuntimeSnapshot::decode(bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "snapshot rejected");
                return Err(e);
            }
        };

        let agents = snapshot.agents.len();
        self.registry.reset(snapshot.next_agent_id);
        self.scheduler.reset_predictions();
        for mut agent in snapshot.agents {
            agent.clear_reservations();
            self.registry.insert(agent);
        }
        self.cache.restore(snapshot.cache);
        info!(agents, taken_at = %snapshot.taken_at, "runtime restored from snapshot");
        Ok(())
    }

    pub fn stats(&self) -> RuntimeStats {
        let utilization: Vec<f64> = self
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| self.registry.with_agent(id, Agent::utilization))
            .collect();
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let average_completion_ms = (completed > 0).then(|| {
            self.counters.completion_ms.load(Ordering::Relaxed) as f64 / completed as f64
        });

        RuntimeStats {
            agents: self.registry.len(),
            in_flight: self.in_flight.len(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed,
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            events_published: self.event_bus.current_sequence().0,
            lagged_events: self.event_bus.lagged_events(),
            load_balance_variance: variance(&utilization),
            average_completion_ms,
            knowledge_transfers: self.learning.transfer_count(),
            prediction_accuracy: self.scheduler.prediction_accuracy(),
            cache_hit_rate: self.cache.stats().hit_rate,
        }
    }

    /// Stop accepting work, finish queued and running tasks, and stop the
    /// background daemons.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("runtime shutting down");

        self.refine.stop();
        if let Some(snapshots) = self.snapshots.lock().take() {
            snapshots.stop();
        }

        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        let processor = self.processor.lock().take();
        if let Some(processor) = processor {
            if let Err(e) = processor.await {
                warn!(error = %e, "completion processor ended abnormally");
            }
        }
        info!("runtime stopped");
    }

    fn start_snapshot_daemon(&self, store: Arc<dyn SnapshotStore>) {
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        let event_bus = Arc::clone(&self.event_bus);
        let source: SnapshotSource = Arc::new(move || {
            let bytes = encode_snapshot(&registry, &cache)?;
            event_bus.publish(EventPayload::SnapshotTaken {
                bytes: bytes.len(),
                agents: registry.len(),
                cache_items: cache.len(),
            });
            Ok(bytes)
        });
        let daemon = SnapshotDaemon::new(
            source,
            store,
            SnapshotDaemonConfig {
                interval: Duration::from_secs(self.config.snapshot.interval_secs),
            },
        );
        *self.snapshots.lock() = Some(daemon.handle());
        tokio::spawn(daemon.run());
    }

    fn publish_snapshot_taken(&self, bytes: usize) {
        self.event_bus.publish(EventPayload::SnapshotTaken {
            bytes,
            agents: self.registry.len(),
            cache_items: self.cache.len(),
        });
    }

    fn reject(&self, task_id: TaskId, err: &SchedulingError) {
        let reason = err.reason();
        debug!(task_id = %task_id, reason = %reason, "task not scheduled");
        if reason == FailureReason::DeadlineExceeded {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.event_bus.publish(EventPayload::TaskFailed {
                task_id,
                agent_id: None,
                reason,
            });
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.event_bus
                .publish(EventPayload::TaskRejected { task_id, reason });
        }
    }
}

fn encode_snapshot(registry: &AgentRegistry, cache: &CacheManager) -> Result<Vec<u8>, SnapshotError> {
    RuntimeSnapshot::new(registry.next_id(), registry.snapshot(), cache.snapshot()).encode()
}

/// Reward for a completion: 100 for finishing within the estimate, scaled
/// down for overruns, 0 for failures.
pub fn completion_reward(outcome: &Outcome, estimated_secs: f64, actual: Duration) -> f64 {
    if !outcome.is_success() {
        return 0.0;
    }
    let actual_secs = actual.as_secs_f64();
    if estimated_secs <= 0.0 || actual_secs <= estimated_secs {
        100.0
    } else {
        100.0 * estimated_secs / actual_secs
    }
}

struct CompletionProcessor {
    scheduler: Arc<Scheduler>,
    learning: Arc<LearningEngine>,
    event_bus: Arc<EventBus>,
    in_flight: Arc<DashMap<TaskId, InFlight>>,
    counters: Arc<RuntimeCounters>,
    transfers: Arc<Semaphore>,
}

impl CompletionProcessor {
    async fn run(self, mut completions: mpsc::Receiver<Completion>) {
        while let Some(completion) = completions.recv().await {
            self.process(completion);
        }
        debug!("completion processor stopped");
    }

    fn process(&self, completion: Completion) {
        let Completion {
            task,
            agent_id,
            state,
            outcome,
            duration,
        } = completion;
        let success = outcome.is_success();

        if let Err(e) = self
            .scheduler
            .record_completion(agent_id, task.id, duration, success)
        {
            warn!(task_id = %task.id, error = %e, "completion feedback discarded");
        }

        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let result = match outcome.clone() {
            Outcome::Succeeded { output, from_cache } => {
                *state.lock() = TaskState::Completed;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .completion_ms
                    .fetch_add(duration_ms, Ordering::Relaxed);
                self.event_bus.publish(EventPayload::TaskCompleted {
                    task_id: task.id,
                    agent_id,
                    duration_ms,
                    from_cache,
                });
                Ok(TaskResult {
                    task_id: task.id,
                    agent_id,
                    output,
                    from_cache,
                    duration_ms,
                })
            }
            Outcome::Failed(reason) => {
                *state.lock() = TaskState::Failed;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.event_bus.publish(EventPayload::TaskFailed {
                    task_id: task.id,
                    agent_id: Some(agent_id),
                    reason: reason.clone(),
                });
                Err(TaskError::ExecutionFailed {
                    task_id: task.id,
                    agent_id,
                    reason,
                })
            }
        };

        self.learn(&task, agent_id, &outcome, duration);

        match self.in_flight.remove(&task.id) {
            Some((_, entry)) => {
                let _ = entry.responder.send(result);
            }
            None => debug!(task_id = %task.id, "no waiter for completed task"),
        }
    }

    fn learn(&self, task: &Task, agent_id: AgentId, outcome: &Outcome, duration: Duration) {
        let key = task.knowledge_key();
        let reward = completion_reward(outcome, task.estimated_duration, duration);
        let config = self.learning.config();

        let value = match self
            .learning
            .update_knowledge(agent_id, &key, reward, config.learning_rate)
        {
            Ok(value) => value,
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "knowledge update skipped");
                return;
            }
        };

        let learning = Arc::clone(&self.learning);
        let transfers = Arc::clone(&self.transfers);
        tokio::spawn(async move {
            let Ok(_permit) = transfers.acquire_owned().await else {
                return;
            };
            let config = learning.config();
            let peers = learning.peers_of(agent_id);
            if let Err(e) = learning.transfer_to_peers(
                agent_id,
                &peers,
                &key,
                value,
                config.transfer_rate,
                config.threshold,
            ) {
                warn!(agent_id = %agent_id, key = %key, error = %e, "knowledge propagation failed");
            }
        });
    }
}
