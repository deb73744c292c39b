//! Port trait definitions (Hexagonal Architecture)
//!
//! - TaskExecutor: runs a scheduled task on behalf of an agent
//! - SnapshotStore: persists opaque runtime snapshots

pub mod snapshot_store;
pub mod task_executor;

pub use snapshot_store::SnapshotStore;
pub use task_executor::TaskExecutor;
