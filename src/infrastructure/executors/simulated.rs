use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::domain::models::{AgentView, Task};
use crate::domain::ports::TaskExecutor;

/// Executor that stands in for real work: it sleeps for the task's estimated
/// duration (scaled) and echoes the payload back.
///
/// A payload of `{"fail": true}` makes the task fail, which lets simulations
/// exercise the failure feedback path.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    time_scale: f64,
}

impl SimulatedExecutor {
    /// `time_scale` multiplies each task's estimated duration; 0 runs instantly.
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale: time_scale.max(0.0),
        }
    }

    pub fn instant() -> Self {
        Self::new(0.0)
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, agent: &AgentView, task: &Task) -> Result<serde_json::Value> {
        let secs = task.estimated_duration * self.time_scale;
        if secs > 0.0 && secs.is_finite() {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }

        if task
            .payload
            .get("fail")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            bail!("simulated failure for task {}", task.id);
        }

        Ok(json!({
            "task_id": task.id,
            "agent_id": agent.id,
            "agent_type": agent.agent_type,
            "payload": task.payload,
        }))
    }
}
