//! Hierarchical cache data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;
use super::task::{Complexity, MAX_PRIORITY};

/// Access context supplied with every cache operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheContext {
    pub agent_id: Option<AgentId>,
    pub complexity: Option<Complexity>,
    /// Priority of the task producing or reading the item (1-10, 0 = unknown).
    #[serde(default)]
    pub priority: u8,
    /// Whether the requesting agent is marked critical.
    #[serde(default)]
    pub critical: bool,
    /// Hour-of-day bucket (0-23). `None` uses the current UTC hour.
    pub time_bucket: Option<u8>,
}

impl CacheContext {
    pub fn for_agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_time_bucket(mut self, bucket: u8) -> Self {
        self.time_bucket = Some(bucket);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Importance in `[0, 1]` from priority, boosted for critical agents.
    pub fn importance(&self) -> f64 {
        let base = f64::from(self.priority.min(MAX_PRIORITY)) / f64::from(MAX_PRIORITY);
        let boost = if self.critical { 0.5 } else { 0.0 };
        (base + boost).min(1.0)
    }
}

/// A cached value with its placement and scoring metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    pub key: String,
    pub value: serde_json::Value,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    /// Logical access clock at the last access; used for recency scoring.
    pub last_tick: u64,
    pub pattern_score: f64,
    pub level: usize,
    /// Write stamp; the highest stamp wins concurrent writes.
    pub version: u64,
    pub importance: f64,
}

/// Outcome of a cache lookup. A miss is an expected signal, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(serde_json::Value),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss => None,
        }
    }
}

/// Outcome of a cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { level: usize, evicted: Vec<String> },
    /// A write with a newer version stamp already holds the key.
    Superseded { current_version: u64 },
    /// The cache has no capacity; nothing is stored.
    Bypassed,
}

/// Per-level occupancy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelStats {
    pub level: usize,
    pub capacity: usize,
    pub size: usize,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub levels: Vec<LevelStats>,
}

impl CacheStats {
    pub fn total_size(&self) -> usize {
        self.levels.iter().map(|l| l.size).sum()
    }
}
