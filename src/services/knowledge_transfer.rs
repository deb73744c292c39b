//! Collaborative learning: per-agent knowledge and transfer to similar peers.
//!
//! Local update: `new = (old·(100-lr) + reward·lr) / 100`, computed as
//! `old + (reward-old)·lr/100` so a zero rate leaves the value untouched.
//! Propagation applies the local update first, then moves every sufficiently
//! similar peer toward the source's new value at
//! `transfer_rate · similarity / 100`.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::errors::LearningError;
use crate::domain::models::{
    AgentId, KnowledgeTransferRecord, LearningConfig, PropagationReport, SkipReason, TransferSkip,
};
use crate::services::agent_registry::{AgentHandle, AgentRegistry};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::similarity::{AgentProfile, SimilarityEngine};

/// Move `old` toward `target` by `rate` percent.
pub fn interpolate(old: f64, target: f64, rate: f64) -> f64 {
    old + (target - old) * (rate / 100.0)
}

fn check_rate(name: &'static str, value: f64) -> Result<(), LearningError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(LearningError::InvalidRate { name, value })
    }
}

fn check_finite(name: &'static str, value: f64) -> Result<(), LearningError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(LearningError::NonFinite { name, value })
    }
}

pub struct LearningEngine {
    registry: Arc<AgentRegistry>,
    similarity: SimilarityEngine,
    config: LearningConfig,
    event_bus: Option<Arc<EventBus>>,
    transfers: AtomicU64,
}

impl LearningEngine {
    pub fn new(registry: Arc<AgentRegistry>, config: LearningConfig) -> Self {
        Self {
            registry,
            similarity: SimilarityEngine::new(config.similarity.clone()),
            config,
            event_bus: None,
            transfers: AtomicU64::new(0),
        }
    }

    /// Set the event bus for publishing knowledge events.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Peer updates applied since startup.
    pub fn transfer_count(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Current knowledge value; unknown keys read as 0.0.
    pub fn knowledge(&self, agent_id: AgentId, key: &str) -> Result<f64, LearningError> {
        self.registry
            .with_agent(agent_id, |agent| agent.knowledge(key))
            .ok_or(LearningError::AgentNotFound(agent_id))
    }

    /// Similarity of two registered agents in `[0, 100]`.
    pub fn similarity(&self, a: AgentId, b: AgentId) -> Result<f64, LearningError> {
        let pa = self.profile(a)?;
        let pb = self.profile(b)?;
        Ok(self.similarity.similarity(&pa, &pb))
    }

    /// Apply the local update and return the new value.
    pub fn update_knowledge(
        &self,
        agent_id: AgentId,
        key: &str,
        reward: f64,
        learning_rate: f64,
    ) -> Result<f64, LearningError> {
        check_rate("learning_rate", learning_rate)?;
        check_finite("reward", reward)?;
        let value = self
            .registry
            .with_agent_mut(agent_id, |agent| {
                let value = interpolate(agent.knowledge(key), reward, learning_rate);
                agent.knowledge_base.insert(key.to_string(), value);
                value
            })
            .ok_or(LearningError::AgentNotFound(agent_id))?;

        debug!(agent_id = %agent_id, key, reward, value, "knowledge updated");
        self.publish(EventPayload::KnowledgeUpdated {
            agent_id,
            key: key.to_string(),
            value,
        });
        Ok(value)
    }

    /// Local update followed by transfer to similar peers.
    #[allow(clippy::too_many_arguments)]
    pub fn propagate(
        &self,
        agent_id: AgentId,
        peers: &[AgentId],
        key: &str,
        reward: f64,
        learning_rate: f64,
        transfer_rate: f64,
        threshold: f64,
    ) -> Result<PropagationReport, LearningError> {
        check_rate("transfer_rate", transfer_rate)?;
        let source_value = self.update_knowledge(agent_id, key, reward, learning_rate)?;
        self.transfer_to_peers(agent_id, peers, key, source_value, transfer_rate, threshold)
    }

    /// Propagate with the configured rates to every other registered agent.
    pub fn propagate_to_all(
        &self,
        agent_id: AgentId,
        key: &str,
        reward: f64,
    ) -> Result<PropagationReport, LearningError> {
        let peers = self.peers_of(agent_id);
        self.propagate(
            agent_id,
            &peers,
            key,
            reward,
            self.config.learning_rate,
            self.config.transfer_rate,
            self.config.threshold,
        )
    }

    /// Move similar peers toward `value` without touching the source.
    ///
    /// Peers at or above `threshold` are ranked by similarity (ties by id)
    /// and at most `max_fanout` of them are updated. Unknown peers are
    /// skipped and reported; they never fail the call.
    pub fn transfer_to_peers(
        &self,
        source: AgentId,
        peers: &[AgentId],
        key: &str,
        value: f64,
        transfer_rate: f64,
        threshold: f64,
    ) -> Result<PropagationReport, LearningError> {
        check_rate("transfer_rate", transfer_rate)?;
        check_finite("value", value)?;
        let source_profile = self.profile(source)?;

        let mut report = PropagationReport {
            source_value: value,
            ..Default::default()
        };

        let unique: BTreeSet<AgentId> = peers.iter().copied().filter(|id| *id != source).collect();
        let mut eligible: Vec<(AgentId, f64, AgentHandle)> = Vec::new();
        for peer in unique {
            let Some(handle) = self.registry.get(peer) else {
                self.skip(&mut report, source, peer, key, SkipReason::Unreachable);
                continue;
            };
            let profile = AgentProfile::from_agent(&handle.lock(), self.config.performance_window);
            let sim = self.similarity.similarity(&source_profile, &profile);
            if sim >= threshold {
                eligible.push((peer, sim, handle));
            } else {
                report.below_threshold += 1;
            }
        }

        eligible.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let overflow = if eligible.len() > self.config.max_fanout {
            eligible.split_off(self.config.max_fanout)
        } else {
            Vec::new()
        };
        for (peer, _, _) in overflow {
            self.skip(&mut report, source, peer, key, SkipReason::FanoutLimit);
        }

        for (peer, sim, handle) in eligible {
            let effective_rate = transfer_rate * sim / 100.0;
            let new_value = {
                let mut agent = handle.lock();
                let new_value = interpolate(agent.knowledge(key), value, effective_rate);
                agent.knowledge_base.insert(key.to_string(), new_value);
                new_value
            };

            let record = KnowledgeTransferRecord {
                source,
                target: peer,
                key: key.to_string(),
                value: new_value,
                similarity: sim,
                effective_rate,
                timestamp: Utc::now(),
            };
            debug!(source = %source, target = %peer, key, similarity = sim, value = new_value, "knowledge transferred");
            self.publish(EventPayload::KnowledgeTransferred(record.clone()));
            report.transfers.push(record);
        }
        self.transfers
            .fetch_add(report.transfers.len() as u64, Ordering::Relaxed);

        Ok(report)
    }

    /// Every registered agent other than `agent_id`.
    pub fn peers_of(&self, agent_id: AgentId) -> Vec<AgentId> {
        self.registry
            .ids()
            .into_iter()
            .filter(|id| *id != agent_id)
            .collect()
    }

    fn profile(&self, agent_id: AgentId) -> Result<AgentProfile, LearningError> {
        self.registry
            .with_agent(agent_id, |agent| {
                AgentProfile::from_agent(agent, self.config.performance_window)
            })
            .ok_or(LearningError::AgentNotFound(agent_id))
    }

    fn skip(
        &self,
        report: &mut PropagationReport,
        source: AgentId,
        target: AgentId,
        key: &str,
        reason: SkipReason,
    ) {
        warn!(source = %source, target = %target, key, reason = %reason, "knowledge transfer skipped");
        self.publish(EventPayload::KnowledgeTransferSkipped {
            source,
            target,
            key: key.to_string(),
            reason: reason.clone(),
        });
        report.skipped.push(TransferSkip { target, reason });
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(bus) = &self.event_bus {
            bus.publish(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AgentConstraints;

    fn engine() -> (Arc<AgentRegistry>, LearningEngine) {
        let registry = Arc::new(AgentRegistry::default());
        let engine = LearningEngine::new(Arc::clone(&registry), LearningConfig::default());
        (registry, engine)
    }

    fn spawn(registry: &AgentRegistry, caps: &[&str]) -> AgentId {
        registry.register("worker", caps.iter().copied().collect(), AgentConstraints::default())
    }

    #[test]
    fn test_interpolate() {
        assert_eq!(interpolate(0.0, 100.0, 50.0), 50.0);
        assert_eq!(interpolate(42.0, 100.0, 0.0), 42.0);
        assert_eq!(interpolate(0.0, 100.0, 100.0), 100.0);
    }

    #[test]
    fn test_local_update_from_absent_key() {
        let (registry, engine) = engine();
        let a = spawn(&registry, &["x"]);
        assert_eq!(engine.knowledge(a, "k").unwrap(), 0.0);
        assert_eq!(engine.update_knowledge(a, "k", 100.0, 50.0).unwrap(), 50.0);
        assert_eq!(engine.knowledge(a, "k").unwrap(), 50.0);
    }

    #[test]
    fn test_rates_are_validated() {
        let (registry, engine) = engine();
        let a = spawn(&registry, &["x"]);
        assert!(matches!(
            engine.update_knowledge(a, "k", 1.0, 101.0),
            Err(LearningError::InvalidRate { .. })
        ));
        assert!(matches!(
            engine.propagate(a, &[], "k", 1.0, 10.0, -1.0, 50.0),
            Err(LearningError::InvalidRate { .. })
        ));
    }

    #[test]
    fn test_non_finite_reward_is_rejected() {
        let (registry, engine) = engine();
        let a = spawn(&registry, &["x"]);
        let b = spawn(&registry, &["x"]);
        engine.update_knowledge(a, "k", 80.0, 50.0).unwrap();

        for reward in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                engine.update_knowledge(a, "k", reward, 50.0),
                Err(LearningError::NonFinite { name: "reward", .. })
            ));
        }
        assert!(matches!(
            engine.transfer_to_peers(a, &[b], "k", f64::NAN, 50.0, 0.0),
            Err(LearningError::NonFinite { name: "value", .. })
        ));
        assert_eq!(engine.knowledge(a, "k").unwrap(), 40.0);
        assert_eq!(engine.knowledge(b, "k").unwrap(), 0.0);
    }

    #[test]
    fn test_transfer_count_tracks_applied_updates() {
        let (registry, engine) = engine();
        let a = spawn(&registry, &["x"]);
        let b = spawn(&registry, &["x"]);
        let c = spawn(&registry, &["x"]);
        assert_eq!(engine.transfer_count(), 0);

        engine.transfer_to_peers(a, &[b, c], "k", 100.0, 50.0, 0.0).unwrap();
        engine.transfer_to_peers(a, &[b], "k", 100.0, 50.0, 101.0).unwrap();
        assert_eq!(engine.transfer_count(), 2);
    }

    #[test]
    fn test_propagation_reaches_similar_peer_only() {
        let (registry, engine) = engine();
        let a = spawn(&registry, &["traffic", "safety"]);
        let twin = spawn(&registry, &["traffic", "safety"]);
        let stranger = spawn(&registry, &["weather"]);

        let report = engine
            .propagate(a, &[twin, stranger], "route", 100.0, 50.0, 50.0, 70.0)
            .unwrap();

        assert_eq!(report.source_value, 50.0);
        assert_eq!(report.transfers.len(), 1);
        assert_eq!(report.transfers[0].target, twin);
        assert_eq!(report.below_threshold, 1);
        // twin similarity 70 => rate 35 toward 50
        assert!((engine.knowledge(twin, "route").unwrap() - 17.5).abs() < 1e-9);
        assert_eq!(engine.knowledge(stranger, "route").unwrap(), 0.0);
    }

    #[test]
    fn test_threshold_above_range_changes_no_peer() {
        let (registry, engine) = engine();
        let a = spawn(&registry, &["x"]);
        let b = spawn(&registry, &["x"]);
        let report = engine
            .propagate(a, &[b], "k", 100.0, 50.0, 100.0, 101.0)
            .unwrap();
        assert!(report.is_noop());
        assert_eq!(engine.knowledge(b, "k").unwrap(), 0.0);
        assert_eq!(engine.knowledge(a, "k").unwrap(), 50.0);
    }

    #[test]
    fn test_unknown_peer_is_skipped() {
        let (registry, engine) = engine();
        let a = spawn(&registry, &["x"]);
        let report = engine
            .propagate(a, &[AgentId(404), a], "k", 100.0, 10.0, 50.0, 0.0)
            .unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::Unreachable);
        assert!((engine.knowledge(a, "k").unwrap() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_fanout_cap() {
        let registry = Arc::new(AgentRegistry::default());
        let config = LearningConfig {
            max_fanout: 2,
            ..Default::default()
        };
        let engine = LearningEngine::new(Arc::clone(&registry), config);
        let a = spawn(&registry, &["x"]);
        let peers: Vec<AgentId> = (0..4).map(|_| spawn(&registry, &["x"])).collect();

        let report = engine
            .transfer_to_peers(a, &peers, "k", 100.0, 50.0, 0.0)
            .unwrap();
        assert_eq!(report.transfers.len(), 2);
        // Equal similarity: lowest ids win.
        assert_eq!(report.transfers[0].target, peers[0]);
        assert_eq!(report.transfers[1].target, peers[1]);
        assert_eq!(report.skipped.len(), 2);
        assert!(report
            .skipped
            .iter()
            .all(|s| s.reason == SkipReason::FanoutLimit));
    }

    #[test]
    fn test_unknown_source_fails() {
        let (_registry, engine) = engine();
        assert_eq!(
            engine.update_knowledge(AgentId(1), "k", 1.0, 10.0),
            Err(LearningError::AgentNotFound(AgentId(1)))
        );
    }
}
