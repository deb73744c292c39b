//! Invariants that must hold while many threads and tasks hit shared state.

mod common;

use cohort::domain::models::{CacheConfig, CacheContext, PredictorConfig, SchedulerConfig};
use cohort::services::{AgentRegistry, CacheManager, LoadPredictor, Scheduler};
use cohort::{AgentConstraints, AgentId, Config, SchedulingError, Task, TaskError, TaskSpec};
use common::{caps, runtime_with, spawn, ScriptedExecutor};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const EPSILON: f64 = 1e-9;

fn scheduler() -> Arc<Scheduler> {
    let config = SchedulerConfig::default();
    let registry = Arc::new(AgentRegistry::new(config.history_limit));
    let predictor = Arc::new(LoadPredictor::new(PredictorConfig::default(), 0.1));
    Arc::new(Scheduler::new(registry, predictor, config))
}

#[test]
fn test_concurrent_submissions_never_overcommit() {
    let scheduler = scheduler();
    let agents: Vec<AgentId> = (0..4)
        .map(|i| {
            scheduler.register(
                format!("worker-{i}"),
                caps(&["x"]),
                AgentConstraints::with_capacity(1.0),
            )
        })
        .collect();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let mut accepted = Vec::new();
                for _ in 0..50 {
                    let task = Task::from_spec(TaskSpec::new(["x"], 0.3)).unwrap();
                    match scheduler.submit(&task) {
                        Ok(assignment) => accepted.push(assignment),
                        Err(SchedulingError::Overloaded { .. }) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
                accepted
            })
        })
        .collect();

    let accepted: Vec<_> = threads
        .into_iter()
        .flat_map(|t| t.join().unwrap())
        .collect();

    // Each agent fits three 0.3 tasks and no more.
    assert_eq!(accepted.len(), agents.len() * 3);
    for id in &agents {
        let status = scheduler.status(*id).unwrap();
        assert!(status.load <= status.capacity + EPSILON);
        assert_eq!(status.active_tasks, 3);
    }

    for assignment in accepted {
        scheduler
            .record_completion(assignment.agent_id, assignment.task_id, Duration::from_millis(10), true)
            .unwrap();
    }
    for id in &agents {
        assert!(scheduler.status(*id).unwrap().load.abs() < EPSILON);
    }
}

#[test]
fn test_concurrent_cache_access_respects_capacity() {
    let cache = Arc::new(CacheManager::new(CacheConfig::uniform(3, 8)));
    let total_capacity = cache.config().total_capacity();

    let threads: Vec<_> = (0..6)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let ctx = CacheContext::for_agent(AgentId(t));
                for i in 0..200u64 {
                    let key = format!("key-{}", (i * 7 + t) % 40);
                    if i % 3 == 0 {
                        cache.put(&key, json!({ "writer": t, "i": i }), &ctx);
                    } else {
                        cache.get(&key, &ctx);
                    }
                    if i % 50 == 0 {
                        cache.invalidate(&key);
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.total_size() <= total_capacity);
    assert!(stats.levels.iter().all(|level| level.size <= level.capacity));
    assert_eq!(stats.total_size(), cache.len());
    assert_eq!(stats.hits + stats.misses, 6 * 133);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runtime_load_stays_within_capacity() {
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(5)));
    let runtime = Arc::new(runtime_with(Config::default(), executor));
    let agents: Vec<AgentId> = (0..3)
        .map(|_| spawn(&runtime, "worker", &["x", "y"], 1.0))
        .collect();

    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let runtime = Arc::clone(&runtime);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                for status in runtime.agents() {
                    assert!(status.load <= status.capacity + EPSILON);
                    assert!(status.load >= -EPSILON);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                let mut handles = Vec::new();
                let mut overloaded = 0;
                for _ in 0..25 {
                    match runtime.try_submit(TaskSpec::new(["x"], 0.25)) {
                        Ok(handle) => handles.push(handle),
                        Err(TaskError::Scheduling(SchedulingError::Overloaded { .. })) => {
                            overloaded += 1;
                            tokio::time::sleep(Duration::from_millis(2)).await;
                        }
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
                let mut completed = 0;
                for handle in handles {
                    handle.wait().await.unwrap();
                    completed += 1;
                }
                (completed, overloaded)
            })
        })
        .collect();

    let mut completed = 0;
    let mut overloaded = 0;
    for submitter in submitters {
        let (c, o) = submitter.await.unwrap();
        completed += c;
        overloaded += o;
    }
    done.store(true, Ordering::SeqCst);
    watcher.await.unwrap();

    assert_eq!(completed + overloaded, 100);
    for id in agents {
        let status = runtime.get_agent_status(id).unwrap();
        assert!(status.load.abs() < EPSILON);
        assert_eq!(status.active_tasks, 0);
    }
    runtime.shutdown().await;
}
