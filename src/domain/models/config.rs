use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration structure for Cohort
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Task scheduling and load prediction
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Hierarchical cache and pattern learner
    #[serde(default)]
    pub cache: CacheConfig,

    /// Knowledge update and propagation
    #[serde(default)]
    pub learning: LearningConfig,

    /// Execution pool sizing
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Event bus
    #[serde(default)]
    pub events: EventsConfig,

    /// Periodic snapshots
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Agents spawned at startup by the CLI
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
}

/// How an agent's capabilities must relate to a task's requirements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Every required capability must be present.
    #[default]
    Strict,
    /// Any overlap makes an agent a candidate.
    Partial,
}

/// Candidate scoring weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub capability: f64,
    pub load: f64,
    pub performance: f64,
    pub specialization: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: 0.4,
            load: 0.3,
            performance: 0.2,
            specialization: 0.1,
        }
    }
}

impl ScoringWeights {
    pub fn as_array(&self) -> [f64; 4] {
        [self.capability, self.load, self.performance, self.specialization]
    }
}

/// Load predictor parameters: `L' = (1-α)L + αP + β·trend`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub alpha: f64,
    pub beta: f64,
    /// Number of recent utilization observations used for the trend.
    pub window: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            beta: 0.1,
            window: 10,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub weights: ScoringWeights,
    pub predictor: PredictorConfig,
    /// EMA rate for completion feedback.
    pub feedback_rate: f64,
    /// Performance samples kept per agent.
    pub history_limit: usize,
    pub match_policy: MatchPolicy,
    pub retry_after_base_ms: u64,
    pub retry_after_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            predictor: PredictorConfig::default(),
            feedback_rate: 0.1,
            history_limit: 20,
            match_policy: MatchPolicy::Strict,
            retry_after_base_ms: 250,
            retry_after_max_ms: 30_000,
        }
    }
}

/// Eviction score weights: `w1·recency + w2·frequency + w3·pattern + w4·importance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionWeights {
    pub recency: f64,
    pub frequency: f64,
    pub pattern: f64,
    pub importance: f64,
}

impl Default for EvictionWeights {
    fn default() -> Self {
        Self {
            recency: 0.25,
            frequency: 0.25,
            pattern: 0.25,
            importance: 0.25,
        }
    }
}

impl EvictionWeights {
    pub fn as_array(&self) -> [f64; 4] {
        [self.recency, self.frequency, self.pattern, self.importance]
    }
}

/// Hierarchical cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity of each level; the list length is the number of levels.
    pub level_capacities: Vec<usize>,
    /// Number of pattern cluster centers (K).
    pub clusters: usize,
    /// Online center update rate (γ).
    pub center_rate: f64,
    /// Width of one level's band of nearest-center distance.
    pub level_span: f64,
    /// Recent feature vectors retained by the learner.
    pub feature_window: usize,
    pub eviction: EvictionWeights,
    /// Number of key lock stripes.
    pub key_shards: usize,
    /// Seconds between batch refinements of the centers over the recent window.
    pub refine_interval_secs: u64,
    /// Lloyd iterations per refinement.
    pub refine_iterations: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            level_capacities: vec![128, 256, 512],
            clusters: 4,
            center_rate: 0.1,
            level_span: 0.25,
            feature_window: 100,
            eviction: EvictionWeights::default(),
            key_shards: 16,
            refine_interval_secs: 30,
            refine_iterations: 3,
        }
    }
}

impl CacheConfig {
    /// Convenience for tests and small deployments: `levels` levels of `capacity` each.
    pub fn uniform(levels: usize, capacity: usize) -> Self {
        Self {
            level_capacities: vec![capacity; levels],
            ..Default::default()
        }
    }

    pub fn total_capacity(&self) -> usize {
        self.level_capacities.iter().sum()
    }
}

/// Similarity term weights; the weighted sum is scaled to `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub capability: f64,
    pub performance: f64,
    pub specialization: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            capability: 0.4,
            performance: 0.3,
            specialization: 0.3,
        }
    }
}

/// Knowledge learning configuration. Rates and threshold are on a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub learning_rate: f64,
    pub transfer_rate: f64,
    pub threshold: f64,
    /// Maximum peers updated per propagation round.
    pub max_fanout: usize,
    /// Maximum propagation rounds in flight.
    pub max_concurrent_rounds: usize,
    /// Window of recent outcomes compared for performance closeness.
    pub performance_window: usize,
    pub similarity: SimilarityWeights,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 10.0,
            transfer_rate: 50.0,
            threshold: 70.0,
            max_fanout: 8,
            max_concurrent_rounds: 16,
            performance_window: 10,
            similarity: SimilarityWeights::default(),
        }
    }
}

/// Execution pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_capacity: 1024,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Periodic snapshot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub path: String,
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: ".cohort/snapshot.json".to_string(),
            interval_secs: 300,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Log file rotation: daily, hourly or never
    #[serde(default = "default_log_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_log_rotation(),
        }
    }
}

/// An agent to spawn at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSeed {
    pub agent_type: String,
    pub capabilities: Vec<String>,
    #[serde(default = "default_seed_capacity")]
    pub max_capacity: f64,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub specialization: BTreeMap<String, f64>,
}

const fn default_seed_capacity() -> f64 {
    1.0
}
