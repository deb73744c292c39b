//! Domain layer for the Cohort coordination runtime
//!
//! Core models, error types and the ports the runtime drives.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{LearningError, SchedulingError, SnapshotError, TaskError};
