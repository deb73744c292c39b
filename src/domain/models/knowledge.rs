//! Knowledge transfer records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::agent::AgentId;

/// One applied transfer from a source agent to a peer. Transient: used for
/// events and audit, never stored in agent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeTransferRecord {
    pub source: AgentId,
    pub target: AgentId,
    pub key: String,
    /// The target's value after the transfer.
    pub value: f64,
    pub similarity: f64,
    pub effective_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Why a peer did not receive a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The peer is no longer registered.
    Unreachable,
    /// Similarity ranked the peer beyond the fan-out cap.
    FanoutLimit,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => f.write_str("unreachable"),
            Self::FanoutLimit => f.write_str("fan-out limit"),
        }
    }
}

/// Informational record of a skipped transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSkip {
    pub target: AgentId,
    pub reason: SkipReason,
}

/// Summary of one propagation round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationReport {
    /// Source agent's value after its local update.
    pub source_value: f64,
    pub transfers: Vec<KnowledgeTransferRecord>,
    pub skipped: Vec<TransferSkip>,
    /// Peers evaluated but below the similarity threshold.
    pub below_threshold: usize,
}

impl PropagationReport {
    pub fn is_noop(&self) -> bool {
        self.transfers.is_empty()
    }
}
