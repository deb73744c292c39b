//! Common test utilities for integration tests
//!
//! Shared fixtures for runtime, scheduler and cache tests.

#![allow(dead_code)]

use async_trait::async_trait;
use cohort::domain::models::{AgentView, Task};
use cohort::domain::ports::TaskExecutor;
use cohort::{AgentConstraints, AgentId, CapabilitySet, Config, Runtime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Build a capability set from string tags.
pub fn caps(tags: &[&str]) -> CapabilitySet {
    tags.iter().copied().collect()
}

/// Executor with a fixed delay that counts invocations and fails tasks whose
/// payload carries `"fail": true`.
#[derive(Default)]
pub struct ScriptedExecutor {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, agent: &AgentView, task: &Task) -> anyhow::Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if task.payload.get("fail").is_some() {
            anyhow::bail!("scripted failure");
        }
        Ok(serde_json::json!({ "agent": agent.id.0, "payload": task.payload }))
    }
}

/// Start a runtime with the given executor.
pub fn runtime_with(config: Config, executor: Arc<ScriptedExecutor>) -> Runtime {
    Runtime::builder(config)
        .executor(executor)
        .build()
        .expect("valid config")
}

/// Spawn an agent with default constraints and the given capacity.
pub fn spawn(runtime: &Runtime, agent_type: &str, tags: &[&str], capacity: f64) -> AgentId {
    runtime.spawn(agent_type, caps(tags), AgentConstraints::with_capacity(capacity))
}

/// Wait for a condition to be true with timeout
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
