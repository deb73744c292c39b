//! Pairwise agent similarity on a 0-100 scale.
//!
//! `100 · (w_c·jaccard(capabilities) + w_p·performance_closeness + w_s·cosine(specialization))`
//! with the weights normalised to sum to one. Missing history or an empty
//! specialization vector contributes a neutral 0.5 for its term.

use std::collections::BTreeMap;

use crate::domain::models::{Agent, AgentId, CapabilitySet, SimilarityWeights, NEUTRAL_WEIGHT};

/// Cosine of two sparse vectors keyed by dimension name. Zero when either
/// vector has zero norm.
pub fn cosine_similarity(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(key, x)| b.get(key).map(|y| x * y))
        .sum();
    let norm_a = a.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.values().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// The parts of an agent similarity looks at, copied out under the agent's
/// lock so comparisons never hold two locks.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub id: AgentId,
    pub capabilities: CapabilitySet,
    pub success_rate: Option<f64>,
    pub specialization: BTreeMap<String, f64>,
}

impl AgentProfile {
    pub fn from_agent(agent: &Agent, performance_window: usize) -> Self {
        Self {
            id: agent.id,
            capabilities: agent.capabilities.clone(),
            success_rate: agent.recent_success_rate(performance_window),
            specialization: agent.specialization.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityEngine {
    weights: SimilarityWeights,
}

impl SimilarityEngine {
    pub fn new(weights: SimilarityWeights) -> Self {
        Self { weights }
    }

    /// Similarity in `[0, 100]`; symmetric in its arguments.
    pub fn similarity(&self, a: &AgentProfile, b: &AgentProfile) -> f64 {
        let capability = a.capabilities.jaccard(&b.capabilities);

        let performance = match (a.success_rate, b.success_rate) {
            (Some(pa), Some(pb)) => 1.0 - (pa - pb).abs(),
            _ => NEUTRAL_WEIGHT,
        };

        let specialization = if a.specialization.is_empty() || b.specialization.is_empty() {
            NEUTRAL_WEIGHT
        } else {
            cosine_similarity(&a.specialization, &b.specialization).clamp(0.0, 1.0)
        };

        let w = &self.weights;
        let total = w.capability + w.performance + w.specialization;
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = w.capability * capability
            + w.performance * performance
            + w.specialization * specialization;
        (100.0 * weighted / total).clamp(0.0, 100.0)
    }
}
