//! Concurrent agent registry.
//!
//! Agents live behind one mutex each so the scheduler and the learning engine
//! can work on different agents in parallel. Callers clone the handle out of
//! the map before locking it, and never hold two agent locks at once.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::models::{Agent, AgentConstraints, AgentId, CapabilitySet};

/// Shared, individually locked agent.
pub type AgentHandle = Arc<Mutex<Agent>>;

pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentHandle>,
    next_id: AtomicU64,
    history_limit: usize,
}

impl AgentRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            agents: DashMap::new(),
            next_id: AtomicU64::new(1),
            history_limit,
        }
    }

    /// Create and register a new agent, returning its id.
    pub fn register(
        &self,
        agent_type: impl Into<String>,
        capabilities: CapabilitySet,
        constraints: AgentConstraints,
    ) -> AgentId {
        let id = AgentId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let agent = Agent::new(id, agent_type, capabilities, constraints, self.history_limit);
        self.agents.insert(id, Arc::new(Mutex::new(agent)));
        id
    }

    /// Insert an existing agent (used by restore). Later registrations never
    /// reuse its id.
    pub fn insert(&self, agent: Agent) {
        let id = agent.id;
        self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
        self.agents.insert(id, Arc::new(Mutex::new(agent)));
    }

    pub fn remove(&self, id: AgentId) -> Option<AgentHandle> {
        self.agents.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: AgentId) -> Option<AgentHandle> {
        self.agents.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.agents.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Handles for every agent, ordered by id. The map is not borrowed once
    /// this returns, so the handles can be locked freely.
    pub fn handles(&self) -> Vec<(AgentId, AgentHandle)> {
        let mut handles: Vec<(AgentId, AgentHandle)> = self
            .agents
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        handles.sort_unstable_by_key(|(id, _)| *id);
        handles
    }

    /// Run `f` against one agent under its lock.
    pub fn with_agent<R>(&self, id: AgentId, f: impl FnOnce(&Agent) -> R) -> Option<R> {
        let handle = self.get(id)?;
        let agent = handle.lock();
        Some(f(&agent))
    }

    /// Run `f` against one agent under its lock, allowing mutation.
    pub fn with_agent_mut<R>(&self, id: AgentId, f: impl FnOnce(&mut Agent) -> R) -> Option<R> {
        let handle = self.get(id)?;
        let mut agent = handle.lock();
        Some(f(&mut agent))
    }

    /// Point-in-time copies of every agent, ordered by id.
    pub fn snapshot(&self) -> Vec<Agent> {
        self.handles()
            .into_iter()
            .map(|(_, handle)| handle.lock().clone())
            .collect()
    }

    /// The id the next registration will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Remove every agent and continue numbering from at least `next_id`.
    pub fn reset(&self, next_id: u64) {
        self.agents.clear();
        self.next_id.store(next_id.max(1), Ordering::SeqCst);
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> CapabilitySet {
        tags.iter().copied().collect()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = AgentRegistry::default();
        let a = registry.register("a", caps(&["x"]), AgentConstraints::default());
        let b = registry.register("b", caps(&["y"]), AgentConstraints::default());
        assert!(a < b);
        assert_eq!(registry.ids(), vec![a, b]);
    }

    #[test]
    fn test_remove_does_not_recycle_ids() {
        let registry = AgentRegistry::default();
        let a = registry.register("a", caps(&["x"]), AgentConstraints::default());
        assert!(registry.remove(a).is_some());
        let b = registry.register("b", caps(&["x"]), AgentConstraints::default());
        assert_ne!(a, b);
        assert!(!registry.contains(a));
    }

    #[test]
    fn test_insert_advances_next_id() {
        let registry = AgentRegistry::default();
        let agent = Agent::new(AgentId(41), "restored", caps(&["x"]), AgentConstraints::default(), 5);
        registry.insert(agent);
        let next = registry.register("new", caps(&["x"]), AgentConstraints::default());
        assert_eq!(next, AgentId(42));
    }

    #[test]
    fn test_with_agent_mut() {
        let registry = AgentRegistry::default();
        let id = registry.register("a", caps(&["x"]), AgentConstraints::default());
        registry.with_agent_mut(id, |agent| agent.knowledge_base.insert("k".into(), 3.0));
        assert_eq!(registry.with_agent(id, |agent| agent.knowledge("k")), Some(3.0));
        assert!(registry.with_agent(AgentId(999), |_| ()).is_none());
    }
}
