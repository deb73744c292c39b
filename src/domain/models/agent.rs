use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use super::capability::CapabilitySet;
use super::task::{Complexity, TaskId};

/// Neutral starting weight for class performance and specialization scores.
pub const NEUTRAL_WEIGHT: f64 = 0.5;

/// Agent identifier. Assigned in spawn order, so lower ids are older agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Spawn-time constraints for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConstraints {
    /// Total capacity available for reservations.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: f64,
    /// Critical agents' cached artifacts are weighted as more important.
    #[serde(default)]
    pub critical: bool,
    /// Initial specialization vector.
    #[serde(default)]
    pub specialization: BTreeMap<String, f64>,
}

impl Default for AgentConstraints {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            critical: false,
            specialization: BTreeMap::new(),
        }
    }
}

impl AgentConstraints {
    pub fn with_capacity(max_capacity: f64) -> Self {
        Self {
            max_capacity,
            ..Default::default()
        }
    }
}

fn default_max_capacity() -> f64 {
    1.0
}

/// Capacity held on an agent for one scheduled or executing task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub amount: f64,
    pub complexity: Complexity,
    pub required: CapabilitySet,
    pub reserved_at: DateTime<Utc>,
}

/// One entry of an agent's bounded performance history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub task_id: TaskId,
    pub success: bool,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Agent entity.
///
/// # Invariants
///
/// - `current_load` equals the sum of `reservations` amounts.
/// - `current_load <= max_capacity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: CapabilitySet,
    pub current_load: f64,
    pub max_capacity: f64,
    #[serde(default)]
    pub reservations: BTreeMap<TaskId, Reservation>,
    #[serde(default)]
    pub performance_history: VecDeque<PerformanceSample>,
    pub history_limit: usize,
    /// EMA success weight per complexity class.
    #[serde(default)]
    pub class_performance: BTreeMap<Complexity, f64>,
    #[serde(default)]
    pub knowledge_base: BTreeMap<String, f64>,
    #[serde(default)]
    pub specialization: BTreeMap<String, f64>,
    #[serde(default)]
    pub critical: bool,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        agent_type: impl Into<String>,
        capabilities: CapabilitySet,
        constraints: AgentConstraints,
        history_limit: usize,
    ) -> Self {
        Self {
            id,
            agent_type: agent_type.into(),
            capabilities,
            current_load: 0.0,
            max_capacity: constraints.max_capacity.max(0.0),
            reservations: BTreeMap::new(),
            performance_history: VecDeque::new(),
            history_limit: history_limit.max(1),
            class_performance: BTreeMap::new(),
            knowledge_base: BTreeMap::new(),
            specialization: constraints.specialization,
            critical: constraints.critical,
            created_at: Utc::now(),
        }
    }

    /// Fraction of capacity in use, in `[0, 1]`. Zero-capacity agents report full.
    pub fn utilization(&self) -> f64 {
        if self.max_capacity <= 0.0 {
            return 1.0;
        }
        (self.current_load / self.max_capacity).clamp(0.0, 1.0)
    }

    pub fn available_capacity(&self) -> f64 {
        (self.max_capacity - self.current_load).max(0.0)
    }

    pub fn can_accept(&self, amount: f64) -> bool {
        self.current_load + amount <= self.max_capacity + f64::EPSILON
    }

    /// Reserve capacity for a task. Returns false, leaving the agent untouched,
    /// if the reservation would exceed `max_capacity` or already exists.
    pub fn reserve(&mut self, task_id: TaskId, reservation: Reservation) -> bool {
        if self.reservations.contains_key(&task_id) || !self.can_accept(reservation.amount) {
            return false;
        }
        self.current_load += reservation.amount;
        self.reservations.insert(task_id, reservation);
        true
    }

    /// Release a task's reservation, returning it if it existed.
    pub fn release(&mut self, task_id: TaskId) -> Option<Reservation> {
        let reservation = self.reservations.remove(&task_id)?;
        self.current_load = self.reservations.values().map(|r| r.amount).sum();
        Some(reservation)
    }

    /// Drop all reservations. Used on restore, where in-flight work is gone.
    pub fn clear_reservations(&mut self) {
        self.reservations.clear();
        self.current_load = 0.0;
    }

    pub fn record_performance(&mut self, sample: PerformanceSample) {
        self.performance_history.push_back(sample);
        while self.performance_history.len() > self.history_limit {
            self.performance_history.pop_front();
        }
    }

    /// Success rate over the most recent `window` samples, `None` without history.
    pub fn recent_success_rate(&self, window: usize) -> Option<f64> {
        if self.performance_history.is_empty() || window == 0 {
            return None;
        }
        let recent: Vec<_> = self.performance_history.iter().rev().take(window).collect();
        let successes = recent.iter().filter(|s| s.success).count();
        Some(successes as f64 / recent.len() as f64)
    }

    pub fn class_weight(&self, complexity: Complexity) -> f64 {
        self.class_performance
            .get(&complexity)
            .copied()
            .unwrap_or(NEUTRAL_WEIGHT)
    }

    /// Apply `w ← (1-γ)w + γ·feedback` to the class weight and to every
    /// required capability's specialization score.
    pub fn apply_feedback(
        &mut self,
        complexity: Complexity,
        required: &CapabilitySet,
        feedback: f64,
        gamma: f64,
    ) -> f64 {
        let updated = ema(self.class_weight(complexity), feedback, gamma);
        self.class_performance.insert(complexity, updated);

        for capability in required.iter() {
            let entry = self
                .specialization
                .entry(capability.as_str().to_string())
                .or_insert(NEUTRAL_WEIGHT);
            *entry = ema(*entry, feedback, gamma);
        }
        updated
    }

    /// Knowledge value for `key`; unknown keys read as 0.0.
    pub fn knowledge(&self, key: &str) -> f64 {
        self.knowledge_base.get(key).copied().unwrap_or(0.0)
    }
}

fn ema(current: f64, feedback: f64, gamma: f64) -> f64 {
    (1.0 - gamma) * current + gamma * feedback
}

/// Read-only view of an agent for callers outside the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: AgentId,
    pub agent_type: String,
    pub load: f64,
    pub capacity: f64,
    pub capabilities: Vec<String>,
    pub recent_performance: Vec<PerformanceSample>,
    pub success_rate: Option<f64>,
    pub predicted_load: f64,
    pub active_tasks: usize,
    pub knowledge_keys: usize,
}

impl AgentStatus {
    pub fn from_agent(agent: &Agent, predicted_load: f64) -> Self {
        Self {
            id: agent.id,
            agent_type: agent.agent_type.clone(),
            load: agent.current_load,
            capacity: agent.max_capacity,
            capabilities: agent.capabilities.to_strings(),
            recent_performance: agent.performance_history.iter().cloned().collect(),
            success_rate: agent.recent_success_rate(agent.history_limit),
            predicted_load,
            active_tasks: agent.reservations.len(),
            knowledge_keys: agent.knowledge_base.len(),
        }
    }
}

/// The information a task executor gets about the agent running its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: CapabilitySet,
}

impl From<&Agent> for AgentView {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            agent_type: agent.agent_type.clone(),
            capabilities: agent.capabilities.clone(),
        }
    }
}
