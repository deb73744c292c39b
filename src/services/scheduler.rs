//! Adaptive task scheduler with load prediction.
//!
//! Candidate score:
//! `w_c·capability_match + w_l·load_factor + w_p·performance_factor + w_s·specialization_factor`
//!
//! Scoring works on per-agent snapshots taken one lock at a time. The chosen
//! agent is then locked and its capacity reserved atomically; if that agent
//! filled up in between, the next candidate in rank order is tried.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::errors::{SchedulingError, SchedulingResult};
use crate::domain::models::{
    Agent, AgentConstraints, AgentId, AgentStatus, Assignment, CapabilitySet, MatchPolicy,
    PerformanceSample, Reservation, SchedulerConfig, Task, TaskId, NEUTRAL_WEIGHT,
};
use crate::services::agent_registry::AgentRegistry;
use crate::services::load_predictor::LoadPredictor;
use crate::services::similarity::cosine_similarity;

/// Score breakdown for one capable agent.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub agent_id: AgentId,
    pub score: f64,
    pub current_load: f64,
    pub capability_match: f64,
    pub load_factor: f64,
    pub performance_factor: f64,
    pub specialization_factor: f64,
}

/// What a completion changed on the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub success: bool,
    /// Class performance weight after feedback, if the reservation was still held.
    pub class_weight: Option<f64>,
    pub predicted_load: f64,
}

pub struct Scheduler {
    registry: Arc<AgentRegistry>,
    predictor: Arc<LoadPredictor>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        predictor: Arc<LoadPredictor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            predictor,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn register(
        &self,
        agent_type: impl Into<String>,
        capabilities: CapabilitySet,
        constraints: AgentConstraints,
    ) -> AgentId {
        let agent_type = agent_type.into();
        let id = self
            .registry
            .register(agent_type.clone(), capabilities, constraints);
        info!(agent_id = %id, agent_type = %agent_type, "agent registered");
        id
    }

    /// Remove an agent. Its reservations disappear with it.
    pub fn deregister(&self, agent_id: AgentId) -> Option<Agent> {
        let handle = self.registry.remove(agent_id)?;
        self.predictor.remove(agent_id);
        let agent = handle.lock().clone();
        info!(agent_id = %agent_id, active_tasks = agent.reservations.len(), "agent deregistered");
        Some(agent)
    }

    /// Whether `agent` may be assigned `task` at all, ignoring current load.
    pub fn is_capable(&self, agent: &Agent, task: &Task) -> bool {
        if agent.max_capacity + f64::EPSILON < task.estimated_duration {
            return false;
        }
        match self.config.match_policy {
            MatchPolicy::Strict => task.required.is_subset_of(&agent.capabilities),
            MatchPolicy::Partial => {
                task.required.is_empty() || task.required.intersects(&agent.capabilities)
            }
        }
    }

    /// Score a capable agent for a task.
    pub fn score(&self, agent: &Agent, task: &Task) -> CandidateScore {
        let capability_match = agent.capabilities.coverage_of(&task.required);
        let load_factor = 1.0 - agent.utilization();
        let performance_factor = agent.class_weight(task.complexity);
        let specialization_factor = if agent.specialization.is_empty() {
            NEUTRAL_WEIGHT
        } else {
            cosine_similarity(&task.domain_vector(), &agent.specialization).clamp(0.0, 1.0)
        };

        let w = &self.config.weights;
        let score = w.capability * capability_match
            + w.load * load_factor
            + w.performance * performance_factor
            + w.specialization * specialization_factor;

        CandidateScore {
            agent_id: agent.id,
            score,
            current_load: agent.current_load,
            capability_match,
            load_factor,
            performance_factor,
            specialization_factor,
        }
    }

    /// Capable agents ranked best first: score descending, then current load
    /// ascending, then agent id ascending.
    pub fn rank_candidates(&self, task: &Task) -> Vec<CandidateScore> {
        let mut candidates: Vec<CandidateScore> = self
            .registry
            .handles()
            .into_iter()
            .filter_map(|(_, handle)| {
                let agent = handle.lock();
                self.is_capable(&agent, task)
                    .then(|| self.score(&agent, task))
            })
            .collect();

        candidates.sort_by(compare_candidates);
        candidates
    }

    /// Assign `task` to the best capable agent with room for it.
    pub fn submit(&self, task: &Task) -> SchedulingResult<Assignment> {
        self.check_deadline(task)?;

        let candidates = self.rank_candidates(task);
        if candidates.is_empty() {
            debug!(task_id = %task.id, required = %task.required, "no capable agent");
            return Err(SchedulingError::NoCapableAgent {
                task_id: task.id,
                required: task.required.clone(),
            });
        }

        for candidate in &candidates {
            let Some(handle) = self.registry.get(candidate.agent_id) else {
                continue;
            };

            let utilization = {
                let mut agent = handle.lock();
                self.check_deadline(task)?;

                let reservation = Reservation {
                    amount: task.estimated_duration,
                    complexity: task.complexity,
                    required: task.required.clone(),
                    reserved_at: Utc::now(),
                };
                if !agent.reserve(task.id, reservation) {
                    continue;
                }
                agent.utilization()
            };

            let predicted = self.predictor.observe(candidate.agent_id, utilization);
            debug!(
                task_id = %task.id,
                agent_id = %candidate.agent_id,
                score = candidate.score,
                predicted_load = predicted,
                "task assigned"
            );

            return Ok(Assignment {
                task_id: task.id,
                agent_id: candidate.agent_id,
                score: candidate.score,
                reserved: task.estimated_duration,
                predicted_completion: task.estimated_duration * (1.0 + predicted),
                assigned_at: Utc::now(),
            });
        }

        let retry_after = self.retry_after(&candidates);
        debug!(task_id = %task.id, retry_after_ms = retry_after.as_millis() as u64, "all capable agents at capacity");
        Err(SchedulingError::Overloaded {
            task_id: task.id,
            retry_after,
        })
    }

    /// Release a task's reservation without recording an outcome.
    pub fn release(&self, agent_id: AgentId, task_id: TaskId) -> Option<Reservation> {
        let handle = self.registry.get(agent_id)?;
        let (reservation, utilization) = {
            let mut agent = handle.lock();
            let reservation = agent.release(task_id);
            (reservation, agent.utilization())
        };
        if reservation.is_some() {
            self.predictor.observe(agent_id, utilization);
        }
        reservation
    }

    /// Release the task's reservation and fold its outcome into the agent's
    /// performance weights and load prediction.
    pub fn record_completion(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        duration: Duration,
        success: bool,
    ) -> SchedulingResult<CompletionRecord> {
        let handle = self
            .registry
            .get(agent_id)
            .ok_or(SchedulingError::AgentNotFound(agent_id))?;

        let feedback = if success { 1.0 } else { 0.0 };
        let (reservation, class_weight, utilization) = {
            let mut agent = handle.lock();
            let reservation = agent.release(task_id);
            let class_weight = reservation.as_ref().map(|r| {
                agent.apply_feedback(r.complexity, &r.required, feedback, self.config.feedback_rate)
            });
            agent.record_performance(PerformanceSample {
                task_id,
                success,
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                recorded_at: Utc::now(),
            });
            (reservation, class_weight, agent.utilization())
        };

        match &reservation {
            Some(r) => self
                .predictor
                .record_duration(agent_id, r.amount, duration.as_secs_f64()),
            None => warn!(
                agent_id = %agent_id,
                task_id = %task_id,
                "completion recorded without an active reservation"
            ),
        }
        let predicted_load = self.predictor.observe(agent_id, utilization);

        Ok(CompletionRecord {
            agent_id,
            task_id,
            success,
            class_weight,
            predicted_load,
        })
    }

    /// How closely load predictions tracked the utilization observed next.
    pub fn prediction_accuracy(&self) -> Option<f64> {
        self.predictor.accuracy()
    }

    /// Forget all load history, e.g. after the agent set was replaced.
    pub fn reset_predictions(&self) {
        self.predictor.clear();
    }

    pub fn status(&self, agent_id: AgentId) -> Option<AgentStatus> {
        let predicted = self.predictor.predicted(agent_id);
        self.registry
            .with_agent(agent_id, |agent| AgentStatus::from_agent(agent, predicted))
    }

    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.registry
            .ids()
            .into_iter()
            .filter_map(|id| self.status(id))
            .collect()
    }

    fn check_deadline(&self, task: &Task) -> SchedulingResult<()> {
        match task.deadline {
            Some(deadline) if deadline <= Utc::now() => Err(SchedulingError::DeadlineExceeded {
                task_id: task.id,
                deadline,
            }),
            _ => Ok(()),
        }
    }

    /// Back-off hint: grows with the least-loaded candidate's predicted load
    /// and with a rising load trend.
    fn retry_after(&self, candidates: &[CandidateScore]) -> Duration {
        let (predicted, trend) = candidates
            .iter()
            .map(|c| self.predictor.forecast(c.agent_id))
            .fold((f64::INFINITY, 0.0_f64), |(p, t), f| {
                (p.min(f.predicted), t.max(f.trend))
            });
        let predicted = if predicted.is_finite() { predicted } else { 1.0 };

        let base = self.config.retry_after_base_ms as f64;
        let ms = base * (1.0 + predicted) * (1.0 + trend.max(0.0));
        let ms = ms.clamp(base, self.config.retry_after_max_ms.max(1) as f64);
        Duration::from_millis(ms as u64)
    }
}

fn compare_candidates(a: &CandidateScore, b: &CandidateScore) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.current_load.total_cmp(&b.current_load))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Complexity, PredictorConfig, TaskSpec};
    use chrono::Duration as ChronoDuration;

    fn scheduler() -> Scheduler {
        let config = SchedulerConfig::default();
        let registry = Arc::new(AgentRegistry::new(config.history_limit));
        let predictor = Arc::new(LoadPredictor::new(PredictorConfig::default(), 0.1));
        Scheduler::new(registry, predictor, config)
    }

    fn spawn(s: &Scheduler, caps: &[&str], capacity: f64) -> AgentId {
        s.register(
            "worker",
            caps.iter().copied().collect(),
            AgentConstraints::with_capacity(capacity),
        )
    }

    fn task(caps: &[&str], est: f64) -> Task {
        Task::from_spec(TaskSpec::new(caps.iter().copied(), est)).unwrap()
    }

    #[test]
    fn test_strict_policy_requires_subset() {
        let s = scheduler();
        let a = spawn(&s, &["x", "y"], 1.0);
        let b = spawn(&s, &["y", "z"], 1.0);
        spawn(&s, &["z"], 1.0);

        let assignment = s.submit(&task(&["y"], 0.1)).unwrap();
        assert!(assignment.agent_id == a || assignment.agent_id == b);

        let err = s.submit(&task(&["x", "z"], 0.1)).unwrap_err();
        assert!(matches!(err, SchedulingError::NoCapableAgent { .. }));
    }

    #[test]
    fn test_partial_policy_admits_overlap() {
        let mut config = SchedulerConfig::default();
        config.match_policy = MatchPolicy::Partial;
        let registry = Arc::new(AgentRegistry::default());
        let predictor = Arc::new(LoadPredictor::new(PredictorConfig::default(), 0.1));
        let s = Scheduler::new(registry, predictor, config);
        let a = spawn(&s, &["x"], 1.0);

        let assignment = s.submit(&task(&["x", "z"], 0.1)).unwrap();
        assert_eq!(assignment.agent_id, a);
    }

    #[test]
    fn test_ties_break_on_load_then_id() {
        let s = scheduler();
        let a = spawn(&s, &["x"], 1.0);
        let b = spawn(&s, &["x"], 1.0);

        // Identical fresh agents: lowest id wins.
        let first = s.submit(&task(&["x"], 0.5)).unwrap();
        assert_eq!(first.agent_id, a);

        // a is now more loaded, so b scores higher.
        let second = s.submit(&task(&["x"], 0.5)).unwrap();
        assert_eq!(second.agent_id, b);
    }

    #[test]
    fn test_overloaded_when_all_full() {
        let s = scheduler();
        spawn(&s, &["x"], 1.0);
        s.submit(&task(&["x"], 1.0)).unwrap();

        let err = s.submit(&task(&["x"], 0.5)).unwrap_err();
        assert!(err.is_retryable());
        let retry_after = err.retry_after().unwrap();
        assert!(retry_after >= Duration::from_millis(s.config().retry_after_base_ms));
        assert!(retry_after <= Duration::from_millis(s.config().retry_after_max_ms));
    }

    #[test]
    fn test_too_large_task_has_no_capable_agent() {
        let s = scheduler();
        spawn(&s, &["x"], 1.0);
        let err = s.submit(&task(&["x"], 2.0)).unwrap_err();
        assert!(matches!(err, SchedulingError::NoCapableAgent { .. }));
    }

    #[test]
    fn test_past_deadline_consumes_nothing() {
        let s = scheduler();
        let a = spawn(&s, &["x"], 1.0);
        let spec = TaskSpec::new(["x"], 0.5).with_deadline(Utc::now() - ChronoDuration::seconds(1));
        let err = s.submit(&Task::from_spec(spec).unwrap()).unwrap_err();
        assert!(matches!(err, SchedulingError::DeadlineExceeded { .. }));
        assert_eq!(s.status(a).unwrap().load, 0.0);
    }

    #[test]
    fn test_completion_releases_and_updates_weights() {
        let s = scheduler();
        let a = spawn(&s, &["x"], 1.0);
        let t = Task::from_spec(TaskSpec::new(["x"], 0.5).with_complexity(Complexity::Complex)).unwrap();
        let assignment = s.submit(&t).unwrap();
        assert!(assignment.predicted_completion >= t.estimated_duration);
        assert!((s.status(a).unwrap().load - 0.5).abs() < 1e-12);

        let record = s
            .record_completion(a, t.id, Duration::from_millis(500), true)
            .unwrap();
        assert!((record.class_weight.unwrap() - 0.55).abs() < 1e-12);

        let status = s.status(a).unwrap();
        assert_eq!(status.load, 0.0);
        assert_eq!(status.success_rate, Some(1.0));
        assert_eq!(status.active_tasks, 0);
    }

    #[test]
    fn test_failure_lowers_class_weight() {
        let s = scheduler();
        let a = spawn(&s, &["x"], 1.0);
        let t = task(&["x"], 0.2);
        s.submit(&t).unwrap();
        let record = s
            .record_completion(a, t.id, Duration::from_millis(100), false)
            .unwrap();
        assert!((record.class_weight.unwrap() - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_release_rolls_back() {
        let s = scheduler();
        let a = spawn(&s, &["x"], 1.0);
        let t = task(&["x"], 0.7);
        s.submit(&t).unwrap();
        assert!(s.release(a, t.id).is_some());
        assert_eq!(s.status(a).unwrap().load, 0.0);
        assert!(s.release(a, t.id).is_none());
    }

    #[test]
    fn test_unknown_agent_completion() {
        let s = scheduler();
        let err = s
            .record_completion(AgentId(99), TaskId::new(), Duration::ZERO, true)
            .unwrap_err();
        assert_eq!(err, SchedulingError::AgentNotFound(AgentId(99)));
    }

    #[test]
    fn test_score_prefers_better_performer() {
        let s = scheduler();
        let a = spawn(&s, &["x"], 1.0);
        let b = spawn(&s, &["x"], 1.0);
        s.registry.with_agent_mut(a, |agent| {
            agent.class_performance.insert(Complexity::Medium, 0.1);
        });
        s.registry.with_agent_mut(b, |agent| {
            agent.class_performance.insert(Complexity::Medium, 0.9);
        });

        let ranked = s.rank_candidates(&task(&["x"], 0.1));
        assert_eq!(ranked[0].agent_id, b);
        assert_eq!(ranked[1].agent_id, a);
        assert!((ranked[0].performance_factor - 0.9).abs() < 1e-12);
    }
}
