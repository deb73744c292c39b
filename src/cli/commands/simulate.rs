//! `cohort simulate`: seed agents, run a synthetic workload, report.

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use clap::Args;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::cli::load_config;
use crate::cli::output::{output, percent, CommandOutput};
use crate::cli::table::{list_table, render_list};
use crate::domain::errors::{SchedulingError, TaskError};
use crate::domain::models::{
    AgentConstraints, AgentSeed, AgentStatus, CacheStats, Complexity, Config, TaskSpec,
};
use crate::domain::ports::SnapshotStore;
use crate::infrastructure::executors::SimulatedExecutor;
use crate::infrastructure::logging::{LogConfig, LoggerImpl};
use crate::infrastructure::snapshot::FileSnapshotStore;
use crate::services::runtime::{Runtime, RuntimeStats, TaskHandle};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of tasks to submit
    #[arg(short, long, default_value = "50")]
    pub tasks: usize,

    /// Multiplier applied to each task's estimated duration when sleeping
    #[arg(long, default_value = "0.05")]
    pub time_scale: f64,

    /// Number of distinct cache keys the workload cycles through (0 disables caching)
    #[arg(long, default_value = "8")]
    pub cache_keys: usize,

    /// Make every Nth task fail (0 never fails)
    #[arg(long, default_value = "0")]
    pub fail_every: usize,

    /// Give up retrying an overloaded submission after this many milliseconds
    #[arg(long, default_value = "5000")]
    pub max_retry_ms: u64,

    /// Write a snapshot of the final state to this file
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, serde::Serialize)]
pub struct SimulationReport {
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub rejected: usize,
    pub cache_served: usize,
    pub elapsed_ms: u64,
    pub agents: Vec<AgentStatus>,
    pub cache: CacheStats,
    pub runtime: RuntimeStats,
    pub snapshot: Option<String>,
}

impl CommandOutput for SimulationReport {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!(
                "Simulated {} tasks in {}ms: {} completed ({} from cache), {} failed, {} rejected",
                self.tasks,
                self.elapsed_ms,
                self.completed,
                self.cache_served,
                self.failed,
                self.rejected
            ),
            String::new(),
        ];

        let mut table = list_table(&[
            "id",
            "type",
            "capabilities",
            "load",
            "predicted",
            "success",
            "knowledge",
        ]);
        for agent in &self.agents {
            table.add_row(vec![
                agent.id.to_string(),
                agent.agent_type.clone(),
                agent.capabilities.join(","),
                format!("{:.2}/{:.2}", agent.load, agent.capacity),
                format!("{:.2}", agent.predicted_load),
                agent
                    .success_rate
                    .map_or_else(|| "-".to_string(), percent),
                agent.knowledge_keys.to_string(),
            ]);
        }
        lines.push(render_list("agent", &table, self.agents.len()));
        lines.push(String::new());

        lines.push(format!(
            "Cache: hit rate {} ({} hits, {} misses, {} evictions)",
            percent(self.cache.hit_rate),
            self.cache.hits,
            self.cache.misses,
            self.cache.evictions
        ));
        for level in &self.cache.levels {
            lines.push(format!(
                "  L{}: {}/{}",
                level.level, level.size, level.capacity
            ));
        }

        let metrics = &self.runtime;
        lines.push(format!(
            "Load balance variance: {:.4}",
            metrics.load_balance_variance
        ));
        lines.push(format!(
            "Average completion: {}",
            metrics
                .average_completion_ms
                .map_or_else(|| "-".to_string(), |ms| format!("{ms:.1}ms"))
        ));
        lines.push(format!(
            "Knowledge transfers: {}",
            metrics.knowledge_transfers
        ));
        lines.push(format!(
            "Prediction accuracy: {}",
            metrics
                .prediction_accuracy
                .map_or_else(|| "-".to_string(), percent)
        ));
        if let Some(ref path) = self.snapshot {
            lines.push(format!("Snapshot written to {path}"));
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Agents used when the configuration seeds none.
pub fn default_seeds() -> Vec<AgentSeed> {
    let seed = |agent_type: &str, caps: &[&str], max_capacity: f64| AgentSeed {
        agent_type: agent_type.to_string(),
        capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
        max_capacity,
        critical: false,
        specialization: Default::default(),
    };
    vec![
        seed("navigator", &["route", "traffic"], 1.0),
        seed("sentinel", &["safety", "traffic"], 1.0),
        seed("forecaster", &["weather"], 1.0),
        seed("generalist", &["route", "safety", "weather"], 2.0),
    ]
}

/// Deterministic synthetic task `index` of the workload.
pub fn workload_task(index: usize, cache_keys: usize, fail_every: usize) -> TaskSpec {
    const SHAPES: [(&[&str], Complexity, f64); 5] = [
        (&["route"], Complexity::Simple, 0.1),
        (&["traffic"], Complexity::Medium, 0.2),
        (&["safety"], Complexity::Medium, 0.2),
        (&["weather"], Complexity::Simple, 0.1),
        (&["route", "safety"], Complexity::Complex, 0.4),
    ];
    let (caps, complexity, estimate) = SHAPES[index % SHAPES.len()];

    let mut spec = TaskSpec::new(caps.iter().copied(), estimate)
        .with_complexity(complexity)
        .with_priority(u8::try_from(index % 10 + 1).unwrap_or(5));
    if cache_keys > 0 {
        spec = spec.with_cache_key(format!("{}:{}", caps.join("+"), index % cache_keys));
    }
    if fail_every > 0 && (index + 1) % fail_every == 0 {
        spec = spec.with_payload(serde_json::json!({ "fail": true }));
    }
    spec
}

pub async fn execute(args: SimulateArgs, config_path: Option<PathBuf>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path.as_ref()).context("Failed to load configuration")?;
    let _logger = LoggerImpl::init(&LogConfig::from(&config.logging))?;

    let report = run(config, &args).await?;
    output(&report, json_mode);
    Ok(())
}

/// Run the simulation and build its report.
pub async fn run(config: Config, args: &SimulateArgs) -> Result<SimulationReport> {
    let seeds = if config.agents.is_empty() {
        default_seeds()
    } else {
        config.agents.clone()
    };

    let runtime = Runtime::builder(config)
        .executor(Arc::new(SimulatedExecutor::new(args.time_scale)))
        .build()
        .context("Failed to start runtime")?;

    for seed in &seeds {
        runtime.spawn(
            seed.agent_type.clone(),
            seed.capabilities.iter().map(String::as_str).collect(),
            AgentConstraints {
                max_capacity: seed.max_capacity,
                critical: seed.critical,
                specialization: seed.specialization.clone(),
            },
        );
    }
    info!(agents = seeds.len(), tasks = args.tasks, "simulation started");

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.tasks);
    let mut rejected = 0;
    for index in 0..args.tasks {
        let spec = workload_task(index, args.cache_keys, args.fail_every);
        match submit_with_retry(&runtime, spec, args.max_retry_ms).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                warn!(task = index, error = %e, "task rejected");
                rejected += 1;
            }
        }
    }

    let results = join_all(handles.into_iter().map(TaskHandle::wait)).await;
    let completed = results.iter().filter(|r| r.is_ok()).count();
    let cache_served = results
        .iter()
        .filter(|r| r.as_ref().is_ok_and(|result| result.from_cache))
        .count();
    let failed = results.len() - completed;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    runtime.shutdown().await;

    let snapshot = match &args.snapshot {
        Some(path) => {
            let bytes = runtime.snapshot().context("Failed to encode snapshot")?;
            FileSnapshotStore::new(path)
                .save(&bytes)
                .await
                .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
            Some(path.display().to_string())
        }
        None => None,
    };

    Ok(SimulationReport {
        tasks: args.tasks,
        completed,
        failed,
        rejected,
        cache_served,
        elapsed_ms,
        agents: runtime.agents(),
        cache: runtime.cache_stats(),
        runtime: runtime.stats(),
        snapshot,
    })
}

/// Submit, retrying with exponential backoff while every capable agent is
/// full. Other submission errors are returned immediately.
async fn submit_with_retry(
    runtime: &Runtime,
    spec: TaskSpec,
    max_retry_ms: u64,
) -> Result<TaskHandle, TaskError> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_interval(Duration::from_millis(500))
        .with_max_elapsed_time(Some(Duration::from_millis(max_retry_ms)))
        .build();

    backoff::future::retry(policy, || {
        let spec = spec.clone();
        async move {
            runtime.try_submit(spec).map_err(|err| match &err {
                TaskError::Scheduling(SchedulingError::Overloaded { .. }) => {
                    backoff::Error::transient(err)
                }
                _ => backoff::Error::permanent(err),
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_is_deterministic() {
        let a = workload_task(4, 8, 0);
        let b = workload_task(4, 8, 0);
        assert_eq!(a.required_capabilities, b.required_capabilities);
        assert_eq!(a.cache_key, b.cache_key);
        assert_eq!(a.complexity, Complexity::Complex);
    }

    #[test]
    fn test_fail_every() {
        assert!(workload_task(2, 0, 3).payload.get("fail").is_some());
        assert!(workload_task(3, 0, 3).payload.get("fail").is_none());
        assert!(workload_task(2, 0, 0).cache_key.is_none());
    }

    #[test]
    fn test_every_workload_shape_has_a_default_agent() {
        let seeds = default_seeds();
        for index in 0..5 {
            let spec = workload_task(index, 0, 0);
            assert!(seeds.iter().any(|seed| spec
                .required_capabilities
                .iter()
                .all(|cap| seed.capabilities.contains(cap))));
        }
    }

    #[tokio::test]
    async fn test_simulation_runs_to_completion() {
        let args = SimulateArgs {
            tasks: 20,
            time_scale: 0.0,
            cache_keys: 2,
            fail_every: 5,
            max_retry_ms: 5_000,
            snapshot: None,
        };
        let report = run(Config::default(), &args).await.unwrap();
        assert_eq!(report.completed + report.failed + report.rejected, 20);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.failed, 4);
        assert_eq!(report.agents.len(), 4);
        assert!(report.agents.iter().all(|a| a.load.abs() < 1e-9));

        assert_eq!(report.runtime.completed, 16);
        assert!(report.runtime.average_completion_ms.is_some());
        assert!(report.runtime.prediction_accuracy.is_some());
        assert!(report.runtime.load_balance_variance.abs() < 1e-9);

        let human = report.to_human();
        assert!(human.contains("Load balance variance: 0.0000"));
        assert!(human.contains("Prediction accuracy: "));
        assert!(report.to_json()["runtime"]["knowledge_transfers"].is_u64());
    }
}
