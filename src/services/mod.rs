//! Service layer: scheduling, caching, learning and the runtime that ties
//! them together.

pub mod agent_registry;
pub mod cache_manager;
pub mod event_bus;
pub mod execution_pool;
pub mod knowledge_transfer;
pub mod load_predictor;
pub mod pattern_learner;
pub mod runtime;
pub mod scheduler;
pub mod similarity;
pub mod snapshot;

pub use agent_registry::{AgentHandle, AgentRegistry};
pub use cache_manager::{CacheManager, CacheSnapshot, WriteStamp};
pub use event_bus::{
    EventBus, EventBusConfig, EventCategory, EventPayload, EventSeverity, ListenerHandle,
    RuntimeEvent, SequenceNumber,
};
pub use execution_pool::{Completion, ExecutionPool, Job, Outcome};
pub use knowledge_transfer::{interpolate, LearningEngine};
pub use load_predictor::{LoadForecast, LoadPredictor};
pub use pattern_learner::{PatternLearner, PatternRefineDaemon, RefineHandle};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStats, TaskHandle};
pub use scheduler::{CandidateScore, CompletionRecord, Scheduler};
pub use similarity::{AgentProfile, SimilarityEngine};
pub use snapshot::{RuntimeSnapshot, SnapshotDaemon, SnapshotDaemonHandle, SNAPSHOT_SCHEMA_VERSION};
