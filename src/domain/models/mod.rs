pub mod agent;
pub mod cache;
pub mod capability;
pub mod config;
pub mod knowledge;
pub mod task;

pub use agent::{
    Agent, AgentConstraints, AgentId, AgentStatus, AgentView, PerformanceSample, Reservation,
    NEUTRAL_WEIGHT,
};
pub use cache::{CacheContext, CacheItem, CacheLookup, CacheStats, LevelStats, PutOutcome};
pub use capability::{Capability, CapabilitySet};
pub use config::{
    AgentSeed, CacheConfig, Config, EventsConfig, EvictionWeights, ExecutionConfig,
    LearningConfig, LoggingConfig, MatchPolicy, PredictorConfig, SchedulerConfig,
    ScoringWeights, SimilarityWeights, SnapshotConfig,
};
pub use knowledge::{KnowledgeTransferRecord, PropagationReport, SkipReason, TransferSkip};
pub use task::{
    Assignment, Complexity, FailureReason, Task, TaskId, TaskResult, TaskSpec, TaskState,
    DEFAULT_PRIORITY, MAX_PRIORITY,
};
