//! Cohort - adaptive multi-agent coordination runtime
//!
//! Cohort routes tasks to a dynamic population of agents and lets the
//! population get better at its work over time:
//!
//! - **Scheduling**: capable agents are scored on capability match, load,
//!   per-class performance and specialization; a load predictor folds the
//!   recent load trend into each agent's outlook.
//! - **Caching**: task outputs live in a multi-level cache whose placement is
//!   learned online from access patterns.
//! - **Learning**: each completion updates the agent's knowledge, which is
//!   then transferred to sufficiently similar peers.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and port traits
//! - **Service Layer** (`services`): scheduler, cache, learning engine, runtime
//! - **Infrastructure Layer** (`infrastructure`): config, logging, adapters
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```no_run
//! use cohort::{AgentConstraints, Config, Runtime, TaskSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::builder(Config::default()).build()?;
//!     runtime.spawn(
//!         "navigator",
//!         ["route", "traffic"].into_iter().collect(),
//!         AgentConstraints::default(),
//!     );
//!
//!     let result = runtime.submit_task(TaskSpec::new(["route"], 0.1)).wait().await?;
//!     println!("{} ran on {}", result.task_id, result.agent_id);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{LearningError, SchedulingError, SnapshotError, TaskError};
pub use domain::models::{
    Agent, AgentConstraints, AgentId, AgentStatus, CacheContext, CacheLookup, CacheStats,
    Capability, CapabilitySet, Complexity, Config, FailureReason, PropagationReport, Task, TaskId,
    TaskResult, TaskSpec, TaskState,
};
pub use domain::ports::{SnapshotStore, TaskExecutor};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{EventPayload, Runtime, RuntimeEvent, TaskHandle};
