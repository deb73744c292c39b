//! Task domain model.
//!
//! A task is a unit of work routed to exactly one agent. It is created per
//! submission, moves through [`TaskState`], and is dropped once its result
//! has been delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::agent::AgentId;
use super::capability::CapabilitySet;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Complexity class; also the key for per-class performance tracking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple = 1,
    #[default]
    Medium = 2,
    Complex = 3,
    VeryComplex = 4,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::VeryComplex => "very_complex",
        }
    }

    /// Numeric level, 1 (simple) through 4 (very complex).
    pub fn level(self) -> u8 {
        self as u8
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "simple" | "1" => Some(Self::Simple),
            "medium" | "2" => Some(Self::Medium),
            "complex" | "3" => Some(Self::Complex),
            "very_complex" | "very-complex" | "4" => Some(Self::VeryComplex),
            _ => None,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Submitted,
    /// Capacity reserved on an agent; waiting for a worker.
    Scheduled,
    Executing,
    Completed,
    Failed,
    /// Refused at submission (no capable agent, overloaded, invalid).
    Rejected,
    /// Withdrawn by the caller before execution started.
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }

    pub fn valid_transitions(&self) -> Vec<TaskState> {
        match self {
            Self::Submitted => vec![Self::Scheduled, Self::Rejected, Self::Failed],
            Self::Scheduled => vec![Self::Executing, Self::Cancelled, Self::Failed],
            Self::Executing => vec![Self::Completed, Self::Failed],
            Self::Completed | Self::Failed | Self::Rejected | Self::Cancelled => vec![],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured reason attached to failed or rejected tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    NoCapableAgent,
    Overloaded { retry_after_ms: u64 },
    DeadlineExceeded,
    InvalidTask(String),
    ExecutionError(String),
    Cancelled,
    ShuttingDown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapableAgent => write!(f, "no capable agent"),
            Self::Overloaded { retry_after_ms } => {
                write!(f, "overloaded (retry after {retry_after_ms}ms)")
            }
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::InvalidTask(msg) => write!(f, "invalid task: {msg}"),
            Self::ExecutionError(msg) => write!(f, "execution error: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ShuttingDown => write!(f, "runtime shutting down"),
        }
    }
}

/// Caller-supplied description of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Expected run time in seconds; also the capacity reserved on the agent.
    #[serde(default)]
    pub estimated_duration: f64,
    /// 1 (lowest) to 10 (highest); 0 means "use the default".
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Task domain vector for specialization matching; defaults to the required tags.
    #[serde(default)]
    pub domain: BTreeMap<String, f64>,
    /// Cache key for the task's output, if the output is cacheable.
    #[serde(default)]
    pub cache_key: Option<String>,
    /// Knowledge key the completion reward is recorded under.
    #[serde(default)]
    pub knowledge_key: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new<I, S>(capabilities: I, estimated_duration: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_capabilities: capabilities.into_iter().map(Into::into).collect(),
            estimated_duration,
            ..Default::default()
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_knowledge_key(mut self, key: impl Into<String>) -> Self {
        self.knowledge_key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;

/// A validated task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub required: CapabilitySet,
    pub complexity: Complexity,
    pub estimated_duration: f64,
    pub priority: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub domain: BTreeMap<String, f64>,
    pub cache_key: Option<String>,
    pub knowledge_key: Option<String>,
    pub payload: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Validate a spec into a task. Returns a human-readable reason on failure.
    pub fn from_spec(spec: TaskSpec) -> Result<Self, String> {
        if !spec.estimated_duration.is_finite() || spec.estimated_duration < 0.0 {
            return Err(format!(
                "estimated_duration must be a non-negative number, got {}",
                spec.estimated_duration
            ));
        }
        if spec.priority > MAX_PRIORITY {
            return Err(format!(
                "priority must be between 1 and {MAX_PRIORITY}, got {}",
                spec.priority
            ));
        }
        if let Some((name, _)) = spec.domain.iter().find(|(_, w)| !w.is_finite()) {
            return Err(format!("domain weight for '{name}' is not finite"));
        }

        Ok(Self {
            id: TaskId::new(),
            required: spec.required_capabilities.iter().map(String::as_str).collect(),
            complexity: spec.complexity,
            estimated_duration: spec.estimated_duration,
            priority: if spec.priority == 0 {
                DEFAULT_PRIORITY
            } else {
                spec.priority
            },
            deadline: spec.deadline,
            domain: spec.domain,
            cache_key: spec.cache_key,
            knowledge_key: spec.knowledge_key,
            payload: spec.payload,
            submitted_at: Utc::now(),
        })
    }

    /// Domain vector used for specialization matching.
    pub fn domain_vector(&self) -> BTreeMap<String, f64> {
        if !self.domain.is_empty() {
            return self.domain.clone();
        }
        self.required
            .iter()
            .map(|c| (c.as_str().to_string(), 1.0))
            .collect()
    }

    /// Key the completion reward is learned under: `<complexity>:<required count>`
    /// unless the caller chose one.
    pub fn knowledge_key(&self) -> String {
        self.knowledge_key
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.complexity, self.required.len()))
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Time left before the deadline, if one is set. Zero once it has passed.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Result of a successful scheduling decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub score: f64,
    /// Capacity reserved on the agent.
    pub reserved: f64,
    /// Expected completion time in seconds given the agent's predicted load.
    pub predicted_completion: f64,
    pub assigned_at: DateTime<Utc>,
}

/// Output of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub output: serde_json::Value,
    pub from_cache: bool,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_state_transitions() {
        assert!(TaskState::Submitted.can_transition_to(TaskState::Scheduled));
        assert!(TaskState::Submitted.can_transition_to(TaskState::Failed));
        assert!(TaskState::Scheduled.can_transition_to(TaskState::Cancelled));
        assert!(!TaskState::Executing.can_transition_to(TaskState::Cancelled));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Failed));
        assert!(TaskState::Rejected.is_terminal());
        assert!(!TaskState::Scheduled.is_terminal());
    }

    #[test]
    fn test_from_spec_defaults_priority() {
        let task = Task::from_spec(TaskSpec::new(["x"], 0.2)).unwrap();
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.required.len(), 1);
    }

    #[test]
    fn test_from_spec_rejects_bad_duration_and_priority() {
        assert!(Task::from_spec(TaskSpec::new(["x"], -1.0)).is_err());
        assert!(Task::from_spec(TaskSpec::new(["x"], f64::NAN)).is_err());
        assert!(Task::from_spec(TaskSpec::new(["x"], 1.0).with_priority(11)).is_err());
    }

    #[test]
    fn test_domain_vector_defaults_to_required_tags() {
        let task = Task::from_spec(TaskSpec::new(["traffic", "safety"], 0.1)).unwrap();
        let domain = task.domain_vector();
        assert_eq!(domain.len(), 2);
        assert_eq!(domain.get("traffic"), Some(&1.0));
    }

    #[test]
    fn test_default_knowledge_key() {
        let task = Task::from_spec(
            TaskSpec::new(["traffic", "safety"], 0.1).with_complexity(Complexity::Complex),
        )
        .unwrap();
        assert_eq!(task.knowledge_key(), "complex:2");

        let keyed = Task::from_spec(TaskSpec::new(["x"], 0.1).with_knowledge_key("route")).unwrap();
        assert_eq!(keyed.knowledge_key(), "route");
    }

    #[test]
    fn test_deadline_checks() {
        let now = Utc::now();
        let past = Task::from_spec(TaskSpec::new(["x"], 0.1).with_deadline(now - ChronoDuration::seconds(1)))
            .unwrap();
        assert!(past.is_past_deadline(now));
        assert_eq!(past.time_remaining(now), Some(Duration::ZERO));

        let open = Task::from_spec(TaskSpec::new(["x"], 0.1)).unwrap();
        assert!(!open.is_past_deadline(now));
        assert!(open.time_remaining(now).is_none());
    }

    #[test]
    fn test_complexity_parsing() {
        assert_eq!(Complexity::from_str("very-complex"), Some(Complexity::VeryComplex));
        assert_eq!(Complexity::from_str("3"), Some(Complexity::Complex));
        assert_eq!(Complexity::Simple.level(), 1);
        assert!(Complexity::from_str("huge").is_none());
    }
}
