use anyhow::Result;
use async_trait::async_trait;

use crate::domain::models::agent::AgentView;
use crate::domain::models::task::Task;

/// Port for running a task once the scheduler has placed it on an agent.
///
/// The runtime owns scheduling, caching and learning; an executor only does
/// the work. Returning `Err` fails the task with an execution error, it never
/// affects other tasks.
///
/// # Examples
///
/// ```no_run
/// use cohort::domain::models::{AgentView, Task};
/// use cohort::domain::ports::TaskExecutor;
/// use anyhow::Result;
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl TaskExecutor for Echo {
///     async fn execute(&self, _agent: &AgentView, task: &Task) -> Result<serde_json::Value> {
///         Ok(task.payload.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` as `agent`, producing its output.
    async fn execute(&self, agent: &AgentView, task: &Task) -> Result<serde_json::Value>;
}
