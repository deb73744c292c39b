//! Bounded worker pool that runs scheduled tasks.
//!
//! Jobs arrive on a bounded queue. A dispatcher takes a semaphore permit per
//! job and spawns it, so at most `max_concurrent` tasks execute at once.
//! Every executed job produces exactly one [`Completion`] on the completion
//! channel; jobs cancelled while queued produce none.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::models::{
    AgentId, AgentView, Assignment, CacheContext, CacheLookup, ExecutionConfig, FailureReason,
    Task, TaskState,
};
use crate::domain::ports::TaskExecutor;
use crate::services::cache_manager::CacheManager;
use crate::services::event_bus::{EventBus, EventPayload};

/// Task state shared between the submitter's handle and the worker.
pub type SharedTaskState = Arc<Mutex<TaskState>>;

/// A scheduled task waiting for a worker.
#[derive(Debug)]
pub struct Job {
    pub task: Task,
    pub assignment: Assignment,
    pub agent: AgentView,
    pub critical: bool,
    pub state: SharedTaskState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded {
        output: serde_json::Value,
        from_cache: bool,
    },
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Result of running one job.
#[derive(Debug)]
pub struct Completion {
    pub task: Task,
    pub agent_id: AgentId,
    pub state: SharedTaskState,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// Why a job could not be queued.
#[derive(Debug)]
pub enum EnqueueError {
    Full(Job),
    Closed(Job),
}

#[derive(Clone)]
struct Worker {
    executor: Arc<dyn TaskExecutor>,
    cache: Arc<CacheManager>,
    event_bus: Arc<EventBus>,
    completions: mpsc::Sender<Completion>,
}

pub struct ExecutionPool {
    jobs: mpsc::Sender<Job>,
    dispatcher: JoinHandle<()>,
}

impl ExecutionPool {
    /// Start the dispatcher. Must be called within a Tokio runtime.
    pub fn start(
        config: &ExecutionConfig,
        executor: Arc<dyn TaskExecutor>,
        cache: Arc<CacheManager>,
        event_bus: Arc<EventBus>,
        completions: mpsc::Sender<Completion>,
    ) -> Self {
        let (jobs, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = Worker {
            executor,
            cache,
            event_bus,
            completions,
        };
        let max_concurrent = config.max_concurrent.max(1);
        let dispatcher = tokio::spawn(dispatch(rx, worker, max_concurrent));
        info!(max_concurrent, queue_capacity = config.queue_capacity, "execution pool started");
        Self { jobs, dispatcher }
    }

    /// Queue a job without waiting. A full queue hands the job back.
    pub fn try_enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        self.jobs.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(job) => EnqueueError::Full(job),
            mpsc::error::TrySendError::Closed(job) => EnqueueError::Closed(job),
        })
    }

    /// Stop accepting jobs, run everything already queued, and wait for the
    /// running jobs to finish.
    pub async fn shutdown(self) {
        drop(self.jobs);
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "execution dispatcher ended abnormally");
        }
        info!("execution pool stopped");
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Job>, worker: Worker, max_concurrent: usize) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let worker = worker.clone();
        tokio::spawn(async move {
            let _permit = permit;
            worker.run(job).await;
        });
    }

    // Wait for in-flight jobs by reclaiming every permit.
    let permits = u32::try_from(max_concurrent).unwrap_or(u32::MAX);
    if semaphore.acquire_many(permits).await.is_err() {
        warn!("execution semaphore closed during shutdown");
    }
}

impl Worker {
    async fn run(&self, job: Job) {
        let expired = {
            let mut state = job.state.lock();
            if *state != TaskState::Scheduled {
                debug!(task_id = %job.task.id, state = %*state, "job skipped");
                return;
            }
            if job.task.is_past_deadline(Utc::now()) {
                *state = TaskState::Failed;
                true
            } else {
                *state = TaskState::Executing;
                false
            }
        };

        if expired {
            // Deadline passed in the queue. Report it so the reservation is released.
            debug!(task_id = %job.task.id, "deadline passed before execution");
            let completion = Completion {
                agent_id: job.agent.id,
                task: job.task,
                state: job.state,
                outcome: Outcome::Failed(FailureReason::DeadlineExceeded),
                duration: Duration::ZERO,
            };
            if self.completions.send(completion).await.is_err() {
                warn!("completion channel closed; result dropped");
            }
            return;
        }

        self.event_bus.publish(EventPayload::TaskStarted {
            task_id: job.task.id,
            agent_id: job.agent.id,
        });

        let started = Instant::now();
        let outcome = match job.task.time_remaining(Utc::now()) {
            Some(remaining) => match timeout(remaining, self.execute(&job)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(task_id = %job.task.id, "task exceeded its deadline");
                    Outcome::Failed(FailureReason::DeadlineExceeded)
                }
            },
            None => self.execute(&job).await,
        };

        let completion = Completion {
            agent_id: job.agent.id,
            task: job.task,
            state: job.state,
            outcome,
            duration: started.elapsed(),
        };
        if self.completions.send(completion).await.is_err() {
            warn!("completion channel closed; result dropped");
        }
    }

    async fn execute(&self, job: &Job) -> Outcome {
        let Some(key) = job.task.cache_key.as_deref() else {
            return self.invoke(job).await;
        };

        let context = CacheContext {
            agent_id: Some(job.agent.id),
            complexity: Some(job.task.complexity),
            priority: job.task.priority,
            critical: job.critical,
            time_bucket: None,
        };
        if let CacheLookup::Hit(output) = self.cache.get(key, &context) {
            debug!(task_id = %job.task.id, key, "served from cache");
            return Outcome::Succeeded {
                output,
                from_cache: true,
            };
        }

        // Stamp before running so a concurrent invalidation wins over this write.
        let stamp = self.cache.stamp();
        let outcome = self.invoke(job).await;
        if let Outcome::Succeeded { output, .. } = &outcome {
            self.cache.put_versioned(key, output.clone(), &context, stamp);
        }
        outcome
    }

    async fn invoke(&self, job: &Job) -> Outcome {
        match self.executor.execute(&job.agent, &job.task).await {
            Ok(output) => Outcome::Succeeded {
                output,
                from_cache: false,
            },
            Err(e) => {
                debug!(task_id = %job.task.id, agent_id = %job.agent.id, error = %e, "executor failed");
                Outcome::Failed(FailureReason::ExecutionError(format!("{e:#}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AgentId, CacheConfig, CapabilitySet, TaskSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, agent: &AgentView, task: &Task) -> anyhow::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if task.payload.get("fail").is_some() {
                anyhow::bail!("boom");
            }
            Ok(serde_json::json!({ "agent": agent.id.0 }))
        }
    }

    fn job(spec: TaskSpec) -> Job {
        let task = Task::from_spec(spec).unwrap();
        Job {
            assignment: Assignment {
                task_id: task.id,
                agent_id: AgentId(1),
                score: 1.0,
                reserved: task.estimated_duration,
                predicted_completion: task.estimated_duration,
                assigned_at: Utc::now(),
            },
            task,
            agent: AgentView {
                id: AgentId(1),
                agent_type: "worker".into(),
                capabilities: CapabilitySet::new(),
            },
            critical: false,
            state: Arc::new(Mutex::new(TaskState::Scheduled)),
        }
    }

    fn pool(delay: Duration) -> (ExecutionPool, Arc<CountingExecutor>, mpsc::Receiver<Completion>) {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
            delay,
        });
        let (tx, rx) = mpsc::channel(16);
        let pool = ExecutionPool::start(
            &ExecutionConfig::default(),
            executor.clone(),
            Arc::new(CacheManager::new(CacheConfig::default())),
            Arc::new(EventBus::default()),
            tx,
        );
        (pool, executor, rx)
    }

    #[tokio::test]
    async fn test_job_runs_and_completes() {
        let (pool, _, mut rx) = pool(Duration::ZERO);
        let job = job(TaskSpec::new(["x"], 0.1));
        let state = Arc::clone(&job.state);
        pool.try_enqueue(job).unwrap();

        let completion = rx.recv().await.unwrap();
        assert!(completion.outcome.is_success());
        assert_eq!(*state.lock(), TaskState::Executing);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_executor_error_becomes_failure() {
        let (pool, _, mut rx) = pool(Duration::ZERO);
        pool.try_enqueue(job(
            TaskSpec::new(["x"], 0.1).with_payload(serde_json::json!({ "fail": true })),
        ))
        .unwrap();

        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            completion.outcome,
            Outcome::Failed(FailureReason::ExecutionError(_))
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cached_output_skips_executor() {
        let (pool, executor, mut rx) = pool(Duration::ZERO);
        pool.try_enqueue(job(TaskSpec::new(["x"], 0.1).with_cache_key("route")))
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.outcome,
            Outcome::Succeeded {
                output: serde_json::json!({ "agent": 1 }),
                from_cache: false
            }
        );

        pool.try_enqueue(job(TaskSpec::new(["x"], 0.1).with_cache_key("route")))
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.outcome,
            Outcome::Succeeded {
                from_cache: true,
                ..
            }
        ));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_deadline_times_out_execution() {
        let (pool, _, mut rx) = pool(Duration::from_secs(5));
        let deadline = Utc::now() + chrono::Duration::milliseconds(50);
        pool.try_enqueue(job(TaskSpec::new(["x"], 0.1).with_deadline(deadline)))
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(
            completion.outcome,
            Outcome::Failed(FailureReason::DeadlineExceeded)
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_job_fails_without_running() {
        let (pool, executor, mut rx) = pool(Duration::ZERO);
        let deadline = Utc::now() - chrono::Duration::milliseconds(10);
        let job = job(
            TaskSpec::new(["x"], 0.1)
                .with_deadline(deadline)
                .with_cache_key("route"),
        );
        let state = Arc::clone(&job.state);
        pool.try_enqueue(job).unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(
            completion.outcome,
            Outcome::Failed(FailureReason::DeadlineExceeded)
        );
        assert_eq!(*state.lock(), TaskState::Failed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let (pool, executor, mut rx) = pool(Duration::ZERO);
        let job = job(TaskSpec::new(["x"], 0.1));
        *job.state.lock() = TaskState::Cancelled;
        pool.try_enqueue(job).unwrap();
        pool.shutdown().await;

        assert!(rx.recv().await.is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }
}
